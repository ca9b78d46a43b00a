//! Reboot command

use anyhow::{Context, Result};
use uf2b_client::{Controller, RebootMode};

use crate::output::OutputContext;

/// Reboot the controller, optionally into its bootloader
pub async fn reboot(controller: &dyn Controller, bootsel: bool, ctx: &OutputContext) -> Result<()> {
    let mode = if bootsel {
        RebootMode::Bootsel
    } else {
        RebootMode::Application
    };

    controller
        .reboot(mode)
        .await
        .context("Failed to reboot controller")?;

    if bootsel {
        ctx.success("Controller rebooting into BOOTSEL");
    } else {
        ctx.success("Controller rebooting");
    }
    Ok(())
}
