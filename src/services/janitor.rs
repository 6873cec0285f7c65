use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::services::collaborators::SessionStore;
use crate::services::processor::Ledgers;

#[derive(Debug, Clone, Copy)]
pub struct JanitorConfig {
    pub interval: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

/// What one sweep removed. `sessions_removed` is `None` when the session
/// store step failed or no store is attached.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub retries_removed: usize,
    pub completions_removed: usize,
    pub sessions_removed: Option<u64>,
}

/// Periodic cleanup of stale ledger entries and expired sessions.
pub struct Janitor {
    config: JanitorConfig,
    ledgers: Ledgers,
    sessions: Option<Arc<dyn SessionStore>>,
}

impl Janitor {
    pub fn new(
        config: JanitorConfig,
        ledgers: Ledgers,
        sessions: Option<Arc<dyn SessionStore>>,
    ) -> Self {
        Self {
            config,
            ledgers,
            sessions,
        }
    }

    /// Run every cleanup step once. A failing step is logged and does not
    /// prevent the others from running.
    pub async fn sweep_once(&self) -> SweepReport {
        let now = Instant::now();
        let retries_removed = self.ledgers.retries.sweep(now);
        let completions_removed = self.ledgers.completions.sweep(now);

        let sessions_removed = match &self.sessions {
            None => None,
            Some(store) => match AssertUnwindSafe(store.cleanup_expired())
                .catch_unwind()
                .await
            {
                Ok(Ok(count)) => Some(count),
                Ok(Err(e)) => {
                    error!(error = %e, "Expired session cleanup failed");
                    None
                }
                Err(_) => {
                    error!("Expired session cleanup panicked");
                    None
                }
            },
        };

        let report = SweepReport {
            retries_removed,
            completions_removed,
            sessions_removed,
        };
        if retries_removed + completions_removed > 0 || sessions_removed.unwrap_or(0) > 0 {
            info!(
                retries_removed,
                completions_removed,
                sessions_removed = sessions_removed.unwrap_or(0),
                "Janitor sweep removed stale entries"
            );
        } else {
            debug!("Janitor sweep found nothing to remove");
        }
        report
    }

    /// Start sweeping every `interval` on a background task.
    pub fn spawn(self) -> JanitorHandle {
        let stop = Arc::new(Notify::new());
        let signal = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; sweep only after a full interval.
            ticker.tick().await;

            info!(interval_secs = self.config.interval.as_secs(), "Janitor started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    _ = signal.notified() => break,
                }
            }
            info!("Janitor stopped");
        });

        JanitorHandle { stop, handle }
    }
}

pub struct JanitorHandle {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl JanitorHandle {
    pub async fn stop(self) {
        self.stop.notify_one();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Janitor task ended abnormally");
        }
    }
}
