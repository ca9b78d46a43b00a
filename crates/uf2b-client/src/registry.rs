//! Conditional waits on device status
//!
//! The controller never pushes state changes; a flash run instead registers
//! a waiter ("device 5 reached BOOTSEL_COMPLETE within 2s") and every new
//! status snapshot is checked against the pending waiters. The registry owns
//! the last-known snapshot and the pending list behind one lock, so
//! evaluation, expiry and cancellation can never interleave.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use uf2b_core::{Check, SnapshotError, StatusCode, StatusSnapshot, WaitCondition};

use crate::error::{FlashError, Result};

/// How a waiter was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied(StatusCode),
    Rejected(StatusCode),
    TimedOut,
}

struct Waiter {
    id: u64,
    device: usize,
    condition: WaitCondition,
    deadline: Instant,
    tx: oneshot::Sender<WaitOutcome>,
}

struct RegistryState {
    snapshot: StatusSnapshot,
    pending: Vec<Waiter>,
    next_id: u64,
}

/// Pending waiters plus the snapshot they are evaluated against
pub struct WaitRegistry {
    capacity: usize,
    state: Mutex<RegistryState>,
}

impl WaitRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(RegistryState {
                snapshot: StatusSnapshot::unknown(capacity),
                pending: Vec::new(),
                next_id: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Last snapshot handed to [`publish`](Self::publish)
    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.lock().snapshot.clone()
    }

    /// Number of waiters still pending
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Replace the snapshot and resolve every waiter it decides
    ///
    /// Waiters are evaluated in registration order. A waiter whose deadline
    /// has passed resolves as timed out whatever the snapshot says. A snapshot
    /// sized for a different board is rejected and changes nothing.
    pub fn publish(&self, snapshot: StatusSnapshot) -> Result<()> {
        if snapshot.capacity() != self.capacity {
            return Err(SnapshotError::LengthMismatch {
                expected: self.capacity,
                actual: snapshot.capacity(),
            }
            .into());
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        let waiters = std::mem::take(&mut state.pending);

        for waiter in waiters {
            if waiter.tx.is_closed() {
                continue;
            }
            let outcome = if now >= waiter.deadline {
                WaitOutcome::TimedOut
            } else {
                let code = snapshot.get(waiter.device).unwrap_or(StatusCode::UNKNOWN);
                match waiter.condition.check(code) {
                    Check::Satisfied(code) => WaitOutcome::Satisfied(code),
                    Check::Failed(code) => WaitOutcome::Rejected(code),
                    Check::Pending => {
                        state.pending.push(waiter);
                        continue;
                    }
                }
            };
            trace!(device = waiter.device, ?outcome, "waiter resolved");
            let _ = waiter.tx.send(outcome);
        }

        state.snapshot = snapshot;
        Ok(())
    }

    /// Wait until `device` meets `condition`, or fail after `timeout`
    ///
    /// The current snapshot is checked first, so an already satisfied
    /// condition resolves without another poll. A raised error flag on the
    /// device rejects the wait with [`FlashError::Protocol`] whatever the
    /// condition.
    pub async fn wait(
        &self,
        device: usize,
        condition: WaitCondition,
        timeout: Duration,
        message: &str,
    ) -> Result<StatusCode> {
        let deadline = Instant::now() + timeout;

        let (id, mut rx) = {
            let mut state = self.state.lock();
            let code = state
                .snapshot
                .get(device)
                .ok_or(FlashError::InvalidDevice {
                    device,
                    capacity: self.capacity,
                })?;

            match condition.check(code) {
                Check::Satisfied(code) => return Ok(code),
                Check::Failed(code) => return Err(FlashError::Protocol { device, code }),
                Check::Pending => {}
            }
            if timeout.is_zero() {
                return Err(FlashError::TimedOut {
                    device,
                    message: message.to_string(),
                });
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.pending.push(Waiter {
                id,
                device,
                condition,
                deadline,
                tx,
            });
            (id, rx)
        };
        debug!(device, %condition, ?timeout, "waiting");

        let _guard = CancelOnDrop { registry: self, id };
        let outcome = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => return Err(FlashError::Abandoned { device }),
            Err(_) => {
                if self.cancel(id) {
                    WaitOutcome::TimedOut
                } else {
                    // A snapshot resolved the waiter between expiry and cancel
                    match rx.try_recv() {
                        Ok(outcome) => outcome,
                        Err(_) => return Err(FlashError::Abandoned { device }),
                    }
                }
            }
        };

        match outcome {
            WaitOutcome::Satisfied(code) => Ok(code),
            WaitOutcome::Rejected(code) => Err(FlashError::Protocol { device, code }),
            WaitOutcome::TimedOut => Err(FlashError::TimedOut {
                device,
                message: message.to_string(),
            }),
        }
    }

    /// Remove a pending waiter; false when it was already resolved
    fn cancel(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        match state.pending.iter().position(|w| w.id == id) {
            Some(index) => {
                state.pending.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Drops the waiter when its future is abandoned mid-wait
struct CancelOnDrop<'a> {
    registry: &'a WaitRegistry,
    id: u64,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.cancel(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uf2b_core::DeviceState;

    fn snapshot(codes: &[u8]) -> StatusSnapshot {
        StatusSnapshot::from_codes(codes.to_vec(), codes.len()).unwrap()
    }

    #[tokio::test]
    async fn test_already_satisfied_resolves_immediately() {
        let registry = WaitRegistry::new(2);
        registry.publish(snapshot(&[0x01, 0x00])).unwrap();

        let code = registry
            .wait(0, WaitCondition::reached(DeviceState::Selected), Duration::from_secs(1), "select")
            .await
            .unwrap();
        assert_eq!(code, StatusCode(0x01));
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_resolves_on_later_snapshot() {
        let registry = Arc::new(WaitRegistry::new(2));
        registry.publish(snapshot(&[0x00, 0x00])).unwrap();

        let waiting = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .wait(0, WaitCondition::MinOrdinal(1), Duration::from_secs(5), "select")
                    .await
            })
        };
        while registry.pending() == 0 {
            tokio::task::yield_now().await;
        }

        registry.publish(snapshot(&[0x01, 0x00])).unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), StatusCode(0x01));
    }

    #[tokio::test]
    async fn test_error_flag_rejects_wait() {
        let registry = WaitRegistry::new(8);
        registry.publish(snapshot(&[0, 0, 0, 0, 0, 0x13, 0, 0])).unwrap();

        let err = registry
            .wait(5, WaitCondition::MinOrdinal(2), Duration::from_secs(2), "bootsel")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FlashError::Protocol {
                device: 5,
                code: StatusCode(0x13)
            }
        ));
    }

    #[tokio::test]
    async fn test_zero_timeout_times_out() {
        let registry = WaitRegistry::new(2);
        let err = registry
            .wait(1, WaitCondition::MinOrdinal(1), Duration::ZERO, "Timeout while waiting")
            .await
            .unwrap_err();
        match err {
            FlashError::TimedOut { device, message } => {
                assert_eq!(device, 1);
                assert_eq!(message, "Timeout while waiting");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_without_snapshots() {
        let registry = WaitRegistry::new(2);
        let err = registry
            .wait(0, WaitCondition::MinOrdinal(1), Duration::from_millis(300), "select")
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::TimedOut { device: 0, .. }));
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_device_out_of_range() {
        let registry = WaitRegistry::new(4);
        let err = tokio_test::block_on(registry.wait(
            4,
            WaitCondition::MinOrdinal(1),
            Duration::from_secs(1),
            "select",
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            FlashError::InvalidDevice {
                device: 4,
                capacity: 4
            }
        ));
    }

    #[tokio::test]
    async fn test_waiters_resolve_once() {
        let registry = Arc::new(WaitRegistry::new(2));
        let waiting = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .wait(1, WaitCondition::mounted(0x40), Duration::from_secs(5), "msc")
                    .await
            })
        };
        while registry.pending() == 0 {
            tokio::task::yield_now().await;
        }

        registry.publish(snapshot(&[0x00, 0x48])).unwrap();
        // The waiter is gone; a later error code changes nothing
        registry.publish(snapshot(&[0x00, 0x13])).unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), StatusCode(0x48));
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_dropped_wait_is_removed() {
        let registry = WaitRegistry::new(2);
        {
            let wait = registry.wait(0, WaitCondition::MinOrdinal(1), Duration::from_secs(5), "x");
            tokio::pin!(wait);
            assert!(futures::poll!(wait.as_mut()).is_pending());
            assert_eq!(registry.pending(), 1);
        }
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_publish_replaces_snapshot() {
        let registry = WaitRegistry::new(2);
        assert_eq!(registry.snapshot(), StatusSnapshot::unknown(2));
        registry.publish(snapshot(&[0x09, 0x01])).unwrap();
        assert_eq!(registry.snapshot().get(0), Some(StatusCode(0x09)));
    }

    #[tokio::test]
    async fn test_wrong_length_snapshot_rejected() {
        let registry = WaitRegistry::new(4);
        registry.publish(snapshot(&[0x01, 0x00, 0x00, 0x00])).unwrap();

        let err = registry.publish(snapshot(&[0x01])).unwrap_err();
        assert!(matches!(
            err,
            FlashError::Snapshot(SnapshotError::LengthMismatch {
                expected: 4,
                actual: 1
            })
        ));
        assert_eq!(registry.snapshot().capacity(), 4);
        assert_eq!(registry.snapshot().get(0), Some(StatusCode(0x01)));

        let code = registry
            .wait(2, WaitCondition::exactly(DeviceState::Unknown), Duration::from_secs(1), "clear")
            .await
            .unwrap();
        assert_eq!(code, StatusCode::UNKNOWN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_snapshot_cannot_satisfy_expired_waiter() {
        let registry = WaitRegistry::new(2);
        let wait = registry.wait(0, WaitCondition::MinOrdinal(2), Duration::from_secs(1), "bootsel");
        tokio::pin!(wait);
        assert!(futures::poll!(wait.as_mut()).is_pending());

        tokio::time::advance(Duration::from_secs(2)).await;
        registry.publish(snapshot(&[0x02, 0x00])).unwrap();

        let err = wait.await.unwrap_err();
        assert!(matches!(err, FlashError::TimedOut { device: 0, .. }));
        assert_eq!(registry.pending(), 0);
    }
}
