use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ChannelControl, SessionId};

/// Periodic liveness check bound to one session.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveMonitor {
    interval: Duration,
}

impl KeepAliveMonitor {
    /// A zero interval disables the monitor.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Run until `done` is cancelled. Keepalive failures are logged and the loop keeps going;
    /// a dead transport ends the session through the connection close path.
    pub fn spawn(
        self,
        session_id: SessionId,
        control: Arc<dyn ChannelControl>,
        done: CancellationToken,
    ) -> Option<JoinHandle<u64>> {
        if !self.is_enabled() {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            let mut sent = 0u64;
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        // A keepalive stuck on a stalled transport must not hold up teardown.
                        let reply = tokio::select! {
                            _ = done.cancelled() => break,
                            reply = control.keepalive() => reply,
                        };
                        match reply {
                            Ok(()) => sent += 1,
                            Err(e) => warn!(session_id = %session_id, error = %e, "Keepalive failed"),
                        }
                    }
                }
            }
            debug!(session_id = %session_id, sent, "Keepalive monitor stopped");
            sent
        }))
    }
}
