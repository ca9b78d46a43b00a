//! Batch flash orchestration
//!
//! A run walks a contiguous range of ports one after the other:
//!
//! 1. Clear every port and wait until port 0 reports `DEVICE_UNKNOWN`
//! 2. Per device: select it, follow it through BOOTSEL into mass-storage mode,
//!    stamp the image with the port index, upload, wait for the flash to land
//! 3. Deselect every port
//!
//! A failing device is recorded and the run moves on to the next one; only the
//! initial clear is fatal. Background status polling is paused for the
//! duration of the run and resumed afterwards, whatever the outcome.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use uf2b_core::{DeviceState, FirmwareImage, StatusCode, WaitCondition};

use crate::channel::StatusChannel;
use crate::config::{DeviceRange, FlashConfig, TimeoutsConfig};
use crate::controller::{Controller, HttpController, Request};
use crate::error::{FlashError, Result};
use crate::events::{EventBus, FlashEvent};
use crate::registry::WaitRegistry;
use crate::serializer::RequestSerializer;

/// Where a device is in its flash sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStage {
    Idle,
    Selecting,
    AwaitingSelected,
    AwaitingBootselRequest,
    AwaitingBootselComplete,
    AwaitingFlashRequest,
    Uploading,
    AwaitingFlashComplete,
    Done,
    Error,
}

impl fmt::Display for DeviceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Selecting => "selecting",
            Self::AwaitingSelected => "awaiting selection",
            Self::AwaitingBootselRequest => "awaiting BOOTSEL request",
            Self::AwaitingBootselComplete => "awaiting BOOTSEL",
            Self::AwaitingFlashRequest => "awaiting mass storage",
            Self::Uploading => "uploading",
            Self::AwaitingFlashComplete => "flashing",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Why a device failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The device raised its error flag
    Protocol { code: StatusCode },
    /// A wait ran out of time
    TimedOut { message: String },
    /// The controller could not be reached or answered garbage
    Transport { message: String },
}

impl From<&FlashError> for FailureCause {
    fn from(err: &FlashError) -> Self {
        match err {
            FlashError::Protocol { code, .. } => Self::Protocol { code: *code },
            FlashError::TimedOut { message, .. } => Self::TimedOut {
                message: message.clone(),
            },
            other => Self::Transport {
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol { code } => write!(f, "Unexpected status code: {}", code),
            Self::TimedOut { message } => f.write_str(message),
            Self::Transport { message } => f.write_str(message),
        }
    }
}

/// Result for one device of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceOutcome {
    pub device: usize,
    /// `Done` on success, otherwise the stage the device failed in
    pub stage: DeviceStage,
    pub elapsed_ms: u64,
    pub failure: Option<FailureCause>,
}

impl DeviceOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Summary of a flash run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlashReport {
    pub range: DeviceRange,
    pub outcomes: Vec<DeviceOutcome>,
}

impl FlashReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn get(&self, device: usize) -> Option<&DeviceOutcome> {
        self.outcomes.iter().find(|o| o.device == device)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Clears the active-run flag when a run ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives flash runs against one controller
pub struct FlashSequencer {
    channel: StatusChannel,
    events: EventBus,
    timeouts: TimeoutsConfig,
    capacity: usize,
    running: AtomicBool,
}

impl FlashSequencer {
    /// Wire a sequencer around `controller`
    ///
    /// The controller and the configuration must agree on the number of
    /// ports, and the board may have at most 255 of them so every index fits
    /// the stamped byte.
    pub fn new(controller: Arc<dyn Controller>, config: &FlashConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.devices.capacity;
        if controller.capacity() != capacity {
            return Err(FlashError::Config(format!(
                "controller reports {} ports, configuration expects {}",
                controller.capacity(),
                capacity
            )));
        }

        let events = EventBus::new();
        let serializer = Arc::new(RequestSerializer::new(
            controller,
            config.timeouts.slow_request(),
            events.clone(),
        ));
        let registry = Arc::new(WaitRegistry::new(capacity));
        let channel = StatusChannel::new(
            serializer,
            registry,
            config.timeouts.poll_period(),
            events.clone(),
        );

        Ok(Self {
            channel,
            events,
            timeouts: config.timeouts.clone(),
            capacity,
            running: AtomicBool::new(false),
        })
    }

    /// Sequencer talking HTTP to the controller at `config.connection.base_url`
    pub fn connect(config: FlashConfig) -> Result<Self> {
        let controller = HttpController::new(config.clone())?;
        Self::new(Arc::new(controller), &config)
    }

    pub fn channel(&self) -> &StatusChannel {
        &self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlashEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flash `image` onto every device in `range`
    ///
    /// Fails only when the run cannot start: another run is active, the
    /// range does not fit the board, or the ports could not be cleared.
    /// Per-device failures are reported in the returned [`FlashReport`].
    #[instrument(skip(self, image), fields(image = image.name()))]
    pub async fn run(&self, image: &FirmwareImage, range: DeviceRange) -> Result<FlashReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FlashError::Busy);
        }
        let _running = RunGuard(&self.running);

        if range.is_empty() || range.end > self.capacity {
            return Err(FlashError::InvalidDevice {
                device: range.end.saturating_sub(1).max(range.start),
                capacity: self.capacity,
            });
        }

        let _pause = self.channel.pause();
        let mut image = image.clone();

        if !image.is_uf2() {
            warn!("{} does not look like a UF2 image", image.name());
        }
        info!(
            "Flashing {} ({} bytes, {} patch offsets) to devices {}",
            image.name(),
            image.len(),
            image.patch_offsets().len(),
            range
        );
        self.events.emit(FlashEvent::RunStarted {
            image: image.name().to_string(),
            bytes: image.len(),
            patch_offsets: image.patch_offsets().len(),
            range,
        });

        self.clear().await?;

        let mut outcomes = Vec::with_capacity(range.len());
        for device in range.iter() {
            let started = Instant::now();
            let mut stage = DeviceStage::Idle;
            let result = self.flash_device(&mut image, device, &mut stage).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    info!("Device {} flashed in {} ms", device, elapsed_ms);
                    self.events.emit(FlashEvent::DeviceFlashed { device, elapsed_ms });
                    outcomes.push(DeviceOutcome {
                        device,
                        stage: DeviceStage::Done,
                        elapsed_ms,
                        failure: None,
                    });
                }
                Err(e) => {
                    error!("Device {} failed while {}: {}", device, stage, e);
                    self.events.emit(FlashEvent::StageChanged {
                        device,
                        stage: DeviceStage::Error,
                    });
                    self.events.emit(FlashEvent::DeviceFailed {
                        device,
                        stage,
                        reason: e.to_string(),
                    });
                    outcomes.push(DeviceOutcome {
                        device,
                        stage,
                        elapsed_ms,
                        failure: Some(FailureCause::from(&e)),
                    });
                }
            }
        }

        if let Err(e) = self.channel.submit(Request::Select { device: self.capacity }).await {
            warn!("Failed to deselect devices after run: {}", e);
        }

        let report = FlashReport { range, outcomes };
        info!(
            "Run finished: {} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        );
        self.events.emit(FlashEvent::RunFinished {
            succeeded: report.succeeded(),
            failed: report.failed(),
        });
        Ok(report)
    }

    /// Power down every port and wait for the board to settle
    async fn clear(&self) -> Result<()> {
        self.channel
            .submit(Request::Select {
                device: self.capacity,
            })
            .await?;
        self.channel
            .wait_for(
                0,
                WaitCondition::exactly(DeviceState::Unknown),
                self.timeouts.clear(),
                "Timeout while clearing USB status",
            )
            .await?;
        Ok(())
    }

    async fn flash_device(
        &self,
        image: &mut FirmwareImage,
        device: usize,
        stage: &mut DeviceStage,
    ) -> Result<()> {
        self.enter(device, stage, DeviceStage::Selecting);
        self.channel.submit(Request::Select { device }).await?;

        self.enter(device, stage, DeviceStage::AwaitingSelected);
        self.await_state(
            device,
            DeviceState::Selected,
            self.timeouts.select(),
            "Timeout while waiting for device selection",
        )
        .await?;

        self.enter(device, stage, DeviceStage::AwaitingBootselRequest);
        self.await_state(
            device,
            DeviceState::BootselRequest,
            self.timeouts.cdc(),
            "Timeout while waiting for BOOTSEL request",
        )
        .await?;

        self.enter(device, stage, DeviceStage::AwaitingBootselComplete);
        self.await_state(
            device,
            DeviceState::BootselComplete,
            self.timeouts.cdc(),
            "Timeout while waiting for BOOTSEL completion",
        )
        .await?;

        self.enter(device, stage, DeviceStage::AwaitingFlashRequest);
        self.await_state(
            device,
            DeviceState::FlashRequest,
            self.timeouts.msc(),
            "Timeout while waiting for mass storage",
        )
        .await?;

        self.enter(device, stage, DeviceStage::Uploading);
        let index = u8::try_from(device).map_err(|_| FlashError::InvalidDevice {
            device,
            capacity: self.capacity,
        })?;
        image.stamp(index);
        self.events.emit(FlashEvent::Patched {
            device,
            offsets: image.patch_offsets().len(),
        });

        let bytes = Bytes::copy_from_slice(image.as_bytes());
        let len = bytes.len();
        self.channel
            .submit(Request::Upload {
                device,
                image: bytes,
            })
            .await?;
        self.events.emit(FlashEvent::Uploaded { device, bytes: len });
        tokio::time::sleep(self.timeouts.settle()).await;

        self.enter(device, stage, DeviceStage::AwaitingFlashComplete);
        self.await_state(
            device,
            DeviceState::FlashComplete,
            self.timeouts.flash(),
            "Timeout while waiting for flash completion",
        )
        .await?;

        self.enter(device, stage, DeviceStage::Done);
        Ok(())
    }

    async fn await_state(
        &self,
        device: usize,
        state: DeviceState,
        timeout: std::time::Duration,
        message: &str,
    ) -> Result<StatusCode> {
        self.channel
            .wait_for(device, WaitCondition::reached(state), timeout, message)
            .await
    }

    fn enter(&self, device: usize, current: &mut DeviceStage, next: DeviceStage) {
        *current = next;
        self.events.emit(FlashEvent::StageChanged {
            device,
            stage: next,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fault, MockBoard};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use uf2b_core::PLACEHOLDER_WORD;

    fn image() -> FirmwareImage {
        let mut bytes = vec![0u8; 1024];
        bytes[40..44].copy_from_slice(&PLACEHOLDER_WORD.to_le_bytes());
        FirmwareImage::new("app.uf2", bytes).unwrap()
    }

    fn sequencer(board: &Arc<MockBoard>) -> FlashSequencer {
        let config = FlashConfig::builder("http://mock")
            .capacity(board.capacity())
            .build();
        FlashSequencer::new(board.clone(), &config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_flash_two_devices() {
        let board = Arc::new(MockBoard::new(2));
        let sequencer = sequencer(&board);

        let report = sequencer.run(&image(), DeviceRange::all(2)).await.unwrap();
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.get(1).unwrap().stage, DeviceStage::Done);

        // Each upload carries its own port index at the placeholder
        let uploads = board.uploads();
        assert_eq!(uploads.len(), 2);
        assert_eq!(&uploads[0].1[40..44], &[0, 0, 0, 0]);
        assert_eq!(uploads[1].0, 1);
        assert_eq!(&uploads[1].1[40..44], &[1, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_device_does_not_stop_run() {
        let board = Arc::new(MockBoard::new(8));
        board.inject(
            5,
            Fault::Report {
                at: DeviceState::BootselRequest,
                code: StatusCode(0x13),
            },
        );
        let sequencer = sequencer(&board);

        let report = sequencer
            .run(&image(), DeviceRange::new(5, 7))
            .await
            .unwrap();

        let failed = report.get(5).unwrap();
        assert_eq!(
            failed.failure,
            Some(FailureCause::Protocol {
                code: StatusCode(0x13)
            })
        );
        assert!(report.get(6).unwrap().is_success());
        assert_eq!(report.failed(), 1);
        assert_eq!(board.uploads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_device_times_out() {
        let board = Arc::new(MockBoard::new(4));
        board.inject(
            2,
            Fault::Stall {
                at: DeviceState::BootselRequest,
            },
        );
        let sequencer = sequencer(&board);

        let report = sequencer
            .run(&image(), DeviceRange::new(1, 4))
            .await
            .unwrap();

        let stalled = report.get(2).unwrap();
        assert_eq!(stalled.stage, DeviceStage::AwaitingBootselComplete);
        assert!(matches!(stalled.failure, Some(FailureCause::TimedOut { .. })));
        assert!(report.get(1).unwrap().is_success());
        assert!(report.get(3).unwrap().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_already_in_mass_storage_skips_bootsel() {
        let board = Arc::new(MockBoard::new(2).booting_to_mass_storage());
        let sequencer = sequencer(&board);

        let report = sequencer
            .run(&image(), DeviceRange::new(1, 2))
            .await
            .unwrap();
        assert!(report.get(1).unwrap().is_success());
        assert_eq!(board.uploads().len(), 1);

        let log = board.request_log();
        let selected = log.iter().position(|r| r == "select 1").unwrap();
        let uploaded = log.iter().position(|r| r.starts_with("upload")).unwrap();
        assert_eq!(uploaded, selected + 1, "unexpected requests: {:?}", log);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_busy() {
        let board = Arc::new(MockBoard::new(2));
        let sequencer = sequencer(&board);
        let image = image();

        let first = sequencer.run(&image, DeviceRange::all(2));
        let second = async {
            tokio::task::yield_now().await;
            sequencer.run(&image, DeviceRange::all(2)).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok());
        assert!(matches!(second, Err(FlashError::Busy)));
        assert!(!sequencer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_resumes_after_run() {
        let board = Arc::new(MockBoard::new(2));
        let sequencer = sequencer(&board);
        sequencer.channel().start(Duration::from_millis(245));

        sequencer.run(&image(), DeviceRange::single(0).unwrap()).await.unwrap();
        assert!(sequencer.channel().is_running());
        sequencer.channel().stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_clear_is_fatal_and_resumes_polling() {
        let board = Arc::new(MockBoard::new(2));
        board.hold_after_clear(StatusCode(0x01));
        let sequencer = sequencer(&board);
        sequencer.channel().start(Duration::from_millis(245));

        let err = sequencer
            .run(&image(), DeviceRange::all(2))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::TimedOut { device: 0, .. }));
        assert!(board.uploads().is_empty());
        assert!(sequencer.channel().is_running());
        sequencer.channel().stop();
    }

    #[tokio::test]
    async fn test_range_must_fit_board() {
        let board = Arc::new(MockBoard::new(4));
        let sequencer = sequencer(&board);
        let err = sequencer
            .run(&image(), DeviceRange::new(2, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::InvalidDevice { capacity: 4, .. }));
        assert!(board.request_log().is_empty());
    }

    #[test]
    fn test_capacity_mismatch_rejected() {
        let board = Arc::new(MockBoard::new(4));
        let config = FlashConfig::builder("http://mock").capacity(8).build();
        assert!(matches!(
            FlashSequencer::new(board, &config),
            Err(FlashError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_follow_stages() {
        let board = Arc::new(MockBoard::new(1));
        let sequencer = sequencer(&board);
        let mut rx = sequencer.subscribe();

        sequencer.run(&image(), DeviceRange::single(0).unwrap()).await.unwrap();

        let mut stages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let FlashEvent::StageChanged { stage, .. } = event {
                stages.push(stage);
            }
        }
        assert_eq!(
            stages,
            vec![
                DeviceStage::Selecting,
                DeviceStage::AwaitingSelected,
                DeviceStage::AwaitingBootselRequest,
                DeviceStage::AwaitingBootselComplete,
                DeviceStage::AwaitingFlashRequest,
                DeviceStage::Uploading,
                DeviceStage::AwaitingFlashComplete,
                DeviceStage::Done,
            ]
        );
    }
}
