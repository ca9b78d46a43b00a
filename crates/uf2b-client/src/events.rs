//! Run progress events
//!
//! Every observable step of a flash run is published on a broadcast channel so
//! front ends can render a console log or progress bar without the
//! orchestration knowing about them.

use serde::Serialize;
use tokio::sync::broadcast;

use uf2b_core::StatusCode;

use crate::config::DeviceRange;
use crate::sequencer::DeviceStage;

/// Capacity of the event channel; slow subscribers lag rather than block
const EVENT_BUFFER: usize = 256;

/// Something that happened during a flash run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlashEvent {
    RunStarted {
        image: String,
        bytes: usize,
        patch_offsets: usize,
        range: DeviceRange,
    },
    StageChanged {
        device: usize,
        stage: DeviceStage,
    },
    StatusObserved {
        device: usize,
        code: StatusCode,
    },
    Patched {
        device: usize,
        offsets: usize,
    },
    Uploaded {
        device: usize,
        bytes: usize,
    },
    DeviceFlashed {
        device: usize,
        elapsed_ms: u64,
    },
    DeviceFailed {
        device: usize,
        stage: DeviceStage,
        reason: String,
    },
    SlowRequest {
        request: &'static str,
        device: Option<usize>,
        queued_ms: u64,
        elapsed_ms: u64,
    },
    RunFinished {
        succeeded: usize,
        failed: usize,
    },
}

impl FlashEvent {
    /// Device the event concerns, if any
    pub fn device(&self) -> Option<usize> {
        match self {
            Self::StageChanged { device, .. }
            | Self::StatusObserved { device, .. }
            | Self::Patched { device, .. }
            | Self::Uploaded { device, .. }
            | Self::DeviceFlashed { device, .. }
            | Self::DeviceFailed { device, .. } => Some(*device),
            Self::SlowRequest { device, .. } => *device,
            Self::RunStarted { .. } | Self::RunFinished { .. } => None,
        }
    }
}

/// Fan-out of [`FlashEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FlashEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: FlashEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlashEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
