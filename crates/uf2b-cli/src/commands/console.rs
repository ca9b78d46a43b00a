//! Console command - board output

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uf2b_client::Controller;

use crate::output::OutputContext;

const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Print what the board wrote to its console, optionally following it
pub async fn console(controller: &dyn Controller, follow: bool, ctx: &OutputContext) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    if follow {
        ctx.info("Press Ctrl+C to stop");
        let r = running.clone();
        ctrlc::set_handler(move || {
            r.store(false, Ordering::SeqCst);
        })?;
    }

    loop {
        let output = controller
            .board_output()
            .await
            .context("Failed to read board output")?;
        let drained = !output.is_empty();
        for line in output.lines() {
            println!("board: {}", line);
        }

        if !follow || !running.load(Ordering::SeqCst) {
            break;
        }
        // Keep draining without delay while the buffer has content
        if !drained {
            tokio::time::sleep(FOLLOW_INTERVAL).await;
        }
    }

    Ok(())
}
