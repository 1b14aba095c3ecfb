use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{limiter::RateLimiter, safety::SafetyGate};

/// Entries removed by sweeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Limiter records purged.
    pub limiter_records: usize,
    /// Dedup hashes expired.
    pub dedup_entries: usize,
}

impl SweepReport {
    fn absorb(&mut self, other: Self) {
        self.limiter_records += other.limiter_records;
        self.dedup_entries += other.dedup_entries;
    }
}

/// Periodic purge of expired limiter records and dedup hashes.
#[derive(Debug)]
pub struct MaintenanceTask;

impl MaintenanceTask {
    /// Sweeps once.
    #[must_use]
    pub fn sweep(limiter: &RateLimiter, safety: &SafetyGate) -> SweepReport {
        SweepReport {
            limiter_records: limiter.cleanup(),
            dedup_entries: safety.sweep(),
        }
    }

    /// Spawns a background sweep every `every`. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(limiter: Arc<RateLimiter>, safety: Arc<SafetyGate>, every: Duration) -> MaintenanceHandle {
        let (tx, mut rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            let mut total = SweepReport::default();
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        let report = Self::sweep(&limiter, &safety);
                        if report == SweepReport::default() {
                            debug!("maintenance sweep found nothing to purge");
                        } else {
                            info!(
                                limiter_records = report.limiter_records,
                                dedup_entries = report.dedup_entries,
                                "maintenance sweep purged expired state"
                            );
                        }
                        total.absorb(report);
                    }
                }
            }
            total
        });
        MaintenanceHandle {
            shutdown: Some(tx),
            join,
        }
    }
}

/// Handle to a running maintenance task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<SweepReport>,
}

impl MaintenanceHandle {
    /// Stops the task and returns everything it purged.
    pub async fn shutdown(mut self) -> SweepReport {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.join).await.unwrap_or_default()
    }
}
