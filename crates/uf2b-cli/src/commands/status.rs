//! Status command - one poll of every port

use anyhow::{Context, Result};
use uf2b_client::{Controller, Request};

use crate::output::{DeviceStatusRow, OutputContext};

/// Print the status of every port
pub async fn status(controller: &dyn Controller, ctx: &OutputContext) -> Result<()> {
    let snapshot = controller
        .execute(&Request::Status)
        .await
        .context("Failed to read controller status")?;

    let rows: Vec<DeviceStatusRow> = snapshot
        .iter()
        .map(|(device, code)| DeviceStatusRow::new(device, code))
        .collect();
    ctx.print(&rows);

    Ok(())
}
