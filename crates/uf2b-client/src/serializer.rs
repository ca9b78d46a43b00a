//! One-at-a-time access to the controller
//!
//! The controller firmware serves a single HTTP connection at a time and
//! degrades badly when requests pile up. All traffic therefore goes through a
//! [`RequestSerializer`], which holds a FIFO-fair lock for the duration of
//! each request and reports requests that waited or ran too long.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{trace, warn};

use uf2b_core::StatusSnapshot;

use crate::controller::{Controller, Request};
use crate::error::Result;
use crate::events::{EventBus, FlashEvent};

pub struct RequestSerializer {
    controller: Arc<dyn Controller>,
    gate: Mutex<()>,
    slow_threshold: Duration,
    events: EventBus,
}

impl RequestSerializer {
    pub fn new(controller: Arc<dyn Controller>, slow_threshold: Duration, events: EventBus) -> Self {
        Self {
            controller,
            gate: Mutex::new(()),
            slow_threshold,
            events,
        }
    }

    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    /// Run `request` once every earlier request has finished
    ///
    /// Transport errors are returned unchanged; nothing is retried.
    pub async fn enqueue(&self, request: Request) -> Result<StatusSnapshot> {
        let queued_at = Instant::now();
        let _turn = self.gate.lock().await;

        let started_at = Instant::now();
        let queued = started_at - queued_at;
        let result = self.controller.execute(&request).await;
        let elapsed = started_at.elapsed();

        trace!(
            request = request.kind(),
            queued_ms = queued.as_millis() as u64,
            elapsed_ms = elapsed.as_millis() as u64,
            "request finished"
        );

        if queued > self.slow_threshold || elapsed > self.slow_threshold {
            let device = request.device();
            warn!(
                request = request.kind(),
                device = ?device,
                queued_ms = queued.as_millis() as u64,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow controller request"
            );
            self.events.emit(FlashEvent::SlowRequest {
                request: request.kind(),
                device,
                queued_ms: queued.as_millis() as u64,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        result
    }
}
