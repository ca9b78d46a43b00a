//! Status polling
//!
//! [`StatusChannel`] turns the controller's pull-only status endpoint into a
//! stream of snapshots for the [`WaitRegistry`]. It can poll on a schedule in
//! the background, and it folds the status array every select or upload
//! answers with into the same path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use uf2b_core::{StatusCode, StatusSnapshot, WaitCondition};

use crate::controller::Request;
use crate::error::Result;
use crate::events::{EventBus, FlashEvent};
use crate::registry::WaitRegistry;
use crate::serializer::RequestSerializer;

struct Poller {
    handle: JoinHandle<()>,
    period: Duration,
}

struct ChannelInner {
    serializer: Arc<RequestSerializer>,
    registry: Arc<WaitRegistry>,
    period: Duration,
    events: EventBus,
    poller: Mutex<Option<Poller>>,
}

/// Shared handle to the status poller
#[derive(Clone)]
pub struct StatusChannel {
    inner: Arc<ChannelInner>,
}

impl StatusChannel {
    pub fn new(
        serializer: Arc<RequestSerializer>,
        registry: Arc<WaitRegistry>,
        period: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                serializer,
                registry,
                period,
                events,
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<WaitRegistry> {
        &self.inner.registry
    }

    pub fn serializer(&self) -> &Arc<RequestSerializer> {
        &self.inner.serializer
    }

    /// Default period used by [`wait_for`](Self::wait_for)
    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Most recent snapshot, polled or folded
    pub fn last_snapshot(&self) -> StatusSnapshot {
        self.inner.registry.snapshot()
    }

    /// Fetch the status array once and publish it
    pub async fn poll(&self) -> Result<StatusSnapshot> {
        self.submit(Request::Status).await
    }

    /// Send any request and publish the status array it answers with
    pub async fn submit(&self, request: Request) -> Result<StatusSnapshot> {
        let snapshot = self.inner.serializer.enqueue(request).await?;
        self.inner.registry.publish(snapshot.clone())?;
        Ok(snapshot)
    }

    /// Start polling every `period`, replacing a running loop
    pub fn start(&self, period: Duration) {
        let serializer = self.inner.serializer.clone();
        let registry = self.inner.registry.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let published = serializer
                    .enqueue(Request::Status)
                    .await
                    .and_then(|snapshot| registry.publish(snapshot));
                if let Err(e) = published {
                    warn!("Status poll failed: {}", e);
                }
            }
        });

        let previous = self.inner.poller.lock().replace(Poller { handle, period });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        debug!(?period, "status polling started");
    }

    /// Stop the background loop, returning its period if it was running
    pub fn stop(&self) -> Option<Duration> {
        let poller = self.inner.poller.lock().take()?;
        poller.handle.abort();
        debug!("status polling stopped");
        Some(poller.period)
    }

    pub fn is_running(&self) -> bool {
        self.inner.poller.lock().is_some()
    }

    /// Stop background polling until the returned guard is dropped
    ///
    /// The loop only restarts if it was running when paused.
    pub fn pause(&self) -> PollPause {
        PollPause {
            channel: self.clone(),
            resume: self.stop(),
        }
    }

    /// Wait on the registry while polling at the channel period
    ///
    /// Used while background polling is paused, so a waiter still sees fresh
    /// snapshots. A poll in flight never delays the deadline. Poll failures
    /// are logged and retried on the next tick.
    pub async fn wait_for(
        &self,
        device: usize,
        condition: WaitCondition,
        timeout: Duration,
        message: &str,
    ) -> Result<StatusCode> {
        let wait = self.inner.registry.wait(device, condition, timeout, message);
        tokio::pin!(wait);

        let mut ticker = interval(self.inner.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = self.last_snapshot().get(device);
        let mut in_flight: Option<PollFuture<'_>> = None;

        loop {
            tokio::select! {
                biased;
                result = &mut wait => return result,
                Some(polled) = finish(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    match polled {
                        Ok(snapshot) => {
                            let code = snapshot.get(device);
                            if code != last {
                                if let Some(code) = code {
                                    self.inner.events.emit(FlashEvent::StatusObserved { device, code });
                                }
                                last = code;
                            }
                        }
                        Err(e) => warn!(device, "Status poll failed: {}", e),
                    }
                }
                _ = ticker.tick(), if in_flight.is_none() => {
                    in_flight = Some(Box::pin(self.poll()));
                }
            }
        }
    }
}

type PollFuture<'a> = Pin<Box<dyn Future<Output = Result<StatusSnapshot>> + Send + 'a>>;

async fn finish(poll: &mut Option<PollFuture<'_>>) -> Option<Result<StatusSnapshot>> {
    match poll {
        Some(poll) => Some(poll.await),
        None => None,
    }
}

/// Resumes background polling on drop
pub struct PollPause {
    channel: StatusChannel,
    resume: Option<Duration>,
}

impl Drop for PollPause {
    fn drop(&mut self) {
        if let Some(period) = self.resume.take() {
            info!("Resuming status polling");
            self.channel.start(period);
        }
    }
}
