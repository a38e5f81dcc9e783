//! Background heartbeat checker

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ServerRegistry;
use crate::config::HeartbeatConfig;

/// Source of "now" for sweeps
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Periodically demotes servers whose heartbeats stopped
pub struct HeartbeatChecker {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatChecker {
    /// Start sweeping `registry` every `policy.probe_interval`
    pub fn spawn(registry: Arc<ServerRegistry>, policy: HeartbeatConfig) -> Self {
        Self::spawn_with_clock(registry, policy, Arc::new(Utc::now))
    }

    /// Same as [`HeartbeatChecker::spawn`] with an explicit clock
    pub fn spawn_with_clock(
        registry: Arc<ServerRegistry>,
        policy: HeartbeatConfig,
        clock: Clock,
    ) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(
                Instant::now() + policy.probe_interval,
                policy.probe_interval,
            );
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                probe_interval_secs = policy.probe_interval.as_secs(),
                timeout_secs = policy.timeout.as_secs(),
                offline_threshold_secs = policy.offline_threshold.as_secs(),
                "Heartbeat checker started"
            );

            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = interval.tick() => {
                        let report = registry.sweep(clock(), &policy);
                        if !report.is_empty() {
                            debug!(?report, "Heartbeat sweep applied transitions");
                        }
                    }
                }
            }

            info!("Heartbeat checker stopped");
        });

        Self {
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Whether the checker task is still running
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Cancel the task and wait for it to exit
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Heartbeat checker task failed");
            }
        }
    }
}

impl Drop for HeartbeatChecker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
