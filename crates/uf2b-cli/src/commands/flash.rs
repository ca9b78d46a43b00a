//! Flash command - write one image to a range of ports

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use uf2b_client::{
    Controller, DeviceRange, DeviceStage, FirmwareImage, FlashEvent, FlashSequencer, RebootMode,
};

use crate::output::{OutcomeRow, OutputContext};

/// Flash firmware to every device in `range`
///
/// Returns the number of devices that failed.
pub async fn flash(
    sequencer: &FlashSequencer,
    controller: &dyn Controller,
    file_path: &Path,
    range: DeviceRange,
    reboot: bool,
    ctx: &OutputContext,
) -> Result<usize> {
    ctx.info(&format!("Reading firmware from {}...", file_path.display()));
    let bytes = std::fs::read(file_path)
        .with_context(|| format!("Failed to read firmware file: {}", file_path.display()))?;
    let name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.display().to_string());
    let image = FirmwareImage::new(name, bytes).context("Invalid firmware image")?;

    ctx.info(&format!(
        "Firmware size: {} bytes, {} patch offset(s)",
        image.len(),
        image.patch_offsets().len()
    ));
    if !image.is_uf2() {
        ctx.warn("Warning: file does not look like a UF2 image");
    }

    let pb = if ctx.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(range.len() as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );

    let mut events = sequencer.subscribe();
    let run = sequencer.run(&image, range);
    tokio::pin!(run);

    let report = loop {
        tokio::select! {
            report = &mut run => break report.context("Flash run failed")?,
            event = events.recv() => match event {
                Ok(event) => render_event(&event, &pb, ctx),
                Err(RecvError::Lagged(skipped)) => {
                    pb.suspend(|| ctx.warn(&format!("({} events skipped)", skipped)));
                }
                Err(RecvError::Closed) => {}
            },
        }
    };
    while let Ok(event) = events.try_recv() {
        render_event(&event, &pb, ctx);
    }
    pb.finish_and_clear();

    let rows: Vec<OutcomeRow> = report.outcomes.iter().map(OutcomeRow::from).collect();
    ctx.print(&rows);

    let failed = report.failed();
    if failed == 0 {
        ctx.success(&format!("\nFlashed {} device(s)", report.succeeded()));
    } else {
        ctx.error(&format!(
            "\n{} of {} device(s) failed",
            failed,
            report.outcomes.len()
        ));
    }

    if reboot {
        ctx.info("Send soft-reboot command");
        controller
            .reboot(RebootMode::Application)
            .await
            .context("Failed to reboot controller")?;
    }

    Ok(failed)
}

fn render_event(event: &FlashEvent, pb: &ProgressBar, ctx: &OutputContext) {
    match event {
        FlashEvent::StageChanged { device, stage } => {
            pb.set_message(format!("USB {}: {}", device, stage));
            if *stage == DeviceStage::Selecting {
                pb.suspend(|| ctx.log(&format!("Select device {}", device)));
            }
        }
        FlashEvent::StatusObserved { device, code } => {
            pb.suspend(|| ctx.log(&format!("USB {}: {}", device, code)));
        }
        FlashEvent::Patched { device, offsets } => {
            pb.suspend(|| {
                ctx.log(&format!(
                    "Patched {} offset(s) with device id {}",
                    offsets, device
                ))
            });
        }
        FlashEvent::Uploaded { device, bytes } => {
            pb.suspend(|| ctx.log(&format!("USB {}: sent {} bytes", device, bytes)));
        }
        FlashEvent::DeviceFlashed { device, elapsed_ms } => {
            pb.inc(1);
            pb.suspend(|| {
                ctx.log(&format!(
                    "USB {}: flashed in {:.1}s",
                    device,
                    *elapsed_ms as f64 / 1000.0
                ))
            });
        }
        FlashEvent::DeviceFailed {
            device, reason, ..
        } => {
            pb.inc(1);
            pb.suspend(|| {
                ctx.error(&format!(
                    "Unable to flash device at USB port {}: {}",
                    device, reason
                ))
            });
        }
        FlashEvent::SlowRequest {
            request,
            queued_ms,
            elapsed_ms,
            ..
        } => {
            pb.suspend(|| {
                ctx.log(&format!(
                    "slow {} request (queued {}ms, took {}ms)",
                    request, queued_ms, elapsed_ms
                ))
            });
        }
        FlashEvent::RunStarted { .. } | FlashEvent::RunFinished { .. } => {}
    }
}
