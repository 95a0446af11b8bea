//! Database maintenance: retention pruning and WAL checkpoints.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::WritePool;
use super::repositories::{EventRepository, NotificationRepository};
use super::time::now_ms;

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between maintenance runs (default: 1 hour).
    pub interval: Duration,
    /// Terminal notifications and processed events older than this are deleted (default: 30).
    pub retention_days: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            retention_days: 30,
        }
    }
}

/// What one maintenance run removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub notifications_pruned: u64,
    pub events_pruned: u64,
}

/// Periodic pruning of rows past the retention window.
///
/// Only terminal notifications are pruned. `pending` and `retrying` rows are
/// never touched regardless of age.
pub struct MaintenanceScheduler {
    events: Arc<dyn EventRepository>,
    notifications: Arc<dyn NotificationRepository>,
    write_pool: WritePool,
    config: MaintenanceConfig,
}

impl MaintenanceScheduler {
    pub fn new(
        events: Arc<dyn EventRepository>,
        notifications: Arc<dyn NotificationRepository>,
        write_pool: WritePool,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            events,
            notifications,
            write_pool,
            config,
        }
    }

    /// Start the maintenance loop. It stops when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Maintenance scheduler shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.run_maintenance().await {
                            tracing::error!("Maintenance error: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Run all maintenance tasks once.
    pub async fn run_maintenance(&self) -> crate::Result<MaintenanceReport> {
        let retention = chrono::Duration::days(i64::from(self.config.retention_days));
        let cutoff = now_ms() - retention.num_milliseconds();

        // Notifications first so their events become unreferenced.
        let notifications_pruned = self.notifications.prune_terminal_before(cutoff).await?;
        let events_pruned = self.events.prune_processed_before(cutoff).await?;

        if notifications_pruned > 0 || events_pruned > 0 {
            tracing::info!(
                notifications_pruned,
                events_pruned,
                retention_days = self.config.retention_days,
                "Pruned old dispatch rows"
            );
        }

        let (busy, log_frames, checkpointed): (i32, i32, i32) =
            sqlx::query_as("PRAGMA wal_checkpoint(PASSIVE)")
                .fetch_one(&self.write_pool)
                .await?;
        tracing::debug!(busy, log_frames, checkpointed, "WAL checkpoint");

        Ok(MaintenanceReport {
            notifications_pruned,
            events_pruned,
        })
    }
}
