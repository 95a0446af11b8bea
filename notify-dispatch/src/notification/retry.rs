//! Retry sweep.
//!
//! Every sweep interval: list due notifications (retrying and past
//! `next_retry_at`, or pending with no live claim), claim each with a
//! conditional update, then attempt the claimed rows concurrently. A row a
//! concurrent sweep claimed first is skipped.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatcher::{AttemptTally, Dispatcher};
use crate::Result;
use crate::database::repositories::NotificationRepository;
use crate::database::time::now_ms;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub claimed: usize,
    pub attempts: AttemptTally,
}

pub struct RetryScheduler {
    dispatcher: Arc<Dispatcher>,
    notifications: Arc<dyn NotificationRepository>,
}

impl RetryScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, notifications: Arc<dyn NotificationRepository>) -> Self {
        Self {
            dispatcher,
            notifications,
        }
    }

    /// Run a single sweep.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let config = self.dispatcher.config();
        let now = now_ms();
        let due = self
            .notifications
            .list_due(now, config.sweep_batch_size)
            .await?;

        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let token = Uuid::new_v4().to_string();
        let until = self.dispatcher.lease_until(now);
        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            match self.notifications.claim(&id, &token, now, until).await {
                Ok(true) => claimed.push(id),
                Ok(false) => debug!(notification_id = %id, "Claimed by another sweep"),
                Err(e) => warn!(notification_id = %id, error = %e, "Failed to claim notification"),
            }
        }
        report.claimed = claimed.len();

        let outcomes = join_all(claimed.iter().map(|id| self.dispatcher.attempt(id, &token))).await;
        for (id, outcome) in claimed.iter().zip(&outcomes) {
            if let Err(e) = outcome {
                error!(notification_id = %id, error = %e, "Retry attempt failed");
            }
        }
        report.attempts = AttemptTally::from_outcomes(&outcomes);

        info!(
            due = report.due,
            claimed = report.claimed,
            sent = report.attempts.sent,
            retrying = report.attempts.retrying,
            failed = report.attempts.failed,
            "Retry sweep finished"
        );
        Ok(report)
    }

    /// Start the sweep loop. It stops when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.dispatcher.config().sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Retry scheduler shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "Retry sweep error");
                        }
                    }
                }
            }
        })
    }
}
