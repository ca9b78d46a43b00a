//! UF2 batch flasher client
//!
//! Orchestrates flashing one firmware image onto a bank of USB targets behind
//! a batch flasher controller. The controller only offers a polled status
//! array, so this crate builds the synchronisation on top of it:
//!
//! - [`RequestSerializer`]: one request in flight at a time, slow ones reported
//! - [`StatusChannel`]: scheduled or on-demand polling into the registry
//! - [`WaitRegistry`]: waits on a device reaching a condition, with deadlines
//! - [`FlashSequencer`]: the per-device select, BOOTSEL, upload, verify loop
//!
//! # Example
//!
//! ```rust,no_run
//! use uf2b_client::{DeviceRange, FlashConfig, FlashSequencer};
//! use uf2b_core::FirmwareImage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FlashConfig::builder("http://192.168.1.52").build();
//!     let sequencer = FlashSequencer::connect(config)?;
//!
//!     let image = FirmwareImage::new("app.uf2", std::fs::read("app.uf2")?)?;
//!     let report = sequencer.run(&image, DeviceRange::new(0, 8)).await?;
//!     println!("{} flashed, {} failed", report.succeeded(), report.failed());
//!     Ok(())
//! }
//! ```
//!
//! # Testing
//!
//! The `testing` module provides a scripted controller and an HTTP server
//! exposing it:
//!
//! ```rust,ignore
//! use uf2b_client::testing::{mock_router, MockBoard, TestServer};
//!
//! let board = Arc::new(MockBoard::new(4));
//! let server = TestServer::start(mock_router(board.clone())).await?;
//! ```

mod channel;
mod config;
mod controller;
mod error;
mod events;
mod registry;
mod sequencer;
mod serializer;
pub mod testing;

pub use channel::{PollPause, StatusChannel};
pub use config::{
    ConfigError, ConnectionConfig, DeviceRange, DevicesConfig, EndpointsConfig, FlashConfig,
    FlashConfigBuilder, TimeoutsConfig,
};
pub use controller::{Controller, HttpController, RebootMode, Request};
pub use error::{FlashError, Result};
pub use events::{EventBus, FlashEvent};
pub use registry::{WaitOutcome, WaitRegistry};
pub use sequencer::{DeviceOutcome, DeviceStage, FailureCause, FlashReport, FlashSequencer};
pub use serializer::RequestSerializer;

// Re-export core types for convenience
pub use uf2b_core::{
    DeviceState, FirmwareImage, PatchOffset, StatusCode, StatusSnapshot, WaitCondition,
};
