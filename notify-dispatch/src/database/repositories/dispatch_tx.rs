//! Transactional operations for the dispatch pipeline.
//!
//! These methods operate within an existing transaction and do NOT commit.
//! The caller is responsible for committing or rolling back.

use sqlx::SqliteConnection;

use crate::Result;
use crate::database::models::{NotificationDbModel, NotificationLogDbModel, NotificationStatus};

/// Column values written by one recorded attempt.
#[derive(Debug, Clone)]
pub struct AttemptUpdate {
    pub status: NotificationStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub attempted_at: i64,
    pub next_retry_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub external_id: Option<String>,
    pub last_error: Option<String>,
}

pub struct DispatchTxOps;

impl DispatchTxOps {
    /// Flip `processed` on an event. Returns false if it was already processed.
    pub async fn mark_event_processed(
        tx: &mut SqliteConnection,
        event_id: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE domain_event SET processed = 1, processed_at = ? WHERE id = ? AND processed = 0",
        )
        .bind(now)
        .bind(event_id)
        .execute(tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a notification. Returns false if `(event_id, subscription_id)` already exists.
    pub async fn insert_notification(
        tx: &mut SqliteConnection,
        n: &NotificationDbModel,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO notification (
                id, event_id, subscription_id, tenant_id, event_type, channel_kind,
                channel_config, recipient, title, body, channel_metadata, status,
                attempts, max_attempts, last_attempt_at, next_retry_at, sent_at,
                failed_at, cancelled_at, external_id, last_error, claim_token,
                claimed_until, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&n.id)
        .bind(&n.event_id)
        .bind(&n.subscription_id)
        .bind(n.tenant_id)
        .bind(&n.event_type)
        .bind(&n.channel_kind)
        .bind(&n.channel_config)
        .bind(&n.recipient)
        .bind(&n.title)
        .bind(&n.body)
        .bind(&n.channel_metadata)
        .bind(&n.status)
        .bind(n.attempts)
        .bind(n.max_attempts)
        .bind(n.last_attempt_at)
        .bind(n.next_retry_at)
        .bind(n.sent_at)
        .bind(n.failed_at)
        .bind(n.cancelled_at)
        .bind(&n.external_id)
        .bind(&n.last_error)
        .bind(&n.claim_token)
        .bind(n.claimed_until)
        .bind(n.created_at)
        .bind(n.updated_at)
        .execute(tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_log(tx: &mut SqliteConnection, log: &NotificationLogDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_log (
                id, notification_id, attempt, status_at_attempt, message, error_details, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.notification_id)
        .bind(log.attempt)
        .bind(&log.status_at_attempt)
        .bind(&log.message)
        .bind(&log.error_details)
        .bind(log.created_at)
        .execute(tx)
        .await?;
        Ok(())
    }

    /// Write an attempt outcome if `claim_token` still owns a non-terminal row.
    /// Releases the claim. Returns false if the row was cancelled or re-claimed.
    pub async fn apply_attempt(
        tx: &mut SqliteConnection,
        id: &str,
        claim_token: &str,
        update: &AttemptUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notification
            SET status = ?,
                attempts = ?,
                max_attempts = ?,
                last_attempt_at = ?,
                next_retry_at = ?,
                sent_at = COALESCE(?, sent_at),
                failed_at = COALESCE(?, failed_at),
                external_id = COALESCE(?, external_id),
                last_error = ?,
                claim_token = NULL,
                claimed_until = NULL,
                updated_at = ?
            WHERE id = ?
              AND claim_token = ?
              AND status IN ('pending', 'retrying')
              AND attempts < ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.attempts)
        .bind(update.max_attempts)
        .bind(update.attempted_at)
        .bind(update.next_retry_at)
        .bind(update.sent_at)
        .bind(update.failed_at)
        .bind(&update.external_id)
        .bind(&update.last_error)
        .bind(update.attempted_at)
        .bind(id)
        .bind(claim_token)
        .bind(update.attempts)
        .execute(tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a pending/retrying notification to `cancelled`. Returns false if it
    /// was already terminal or missing.
    pub async fn cancel_notification(
        tx: &mut SqliteConnection,
        id: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notification
            SET status = 'cancelled',
                cancelled_at = ?,
                next_retry_at = NULL,
                claim_token = NULL,
                claimed_until = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Ids of non-terminal notifications created from a subscription.
    pub async fn open_notification_ids_for_subscription(
        tx: &mut SqliteConnection,
        subscription_id: &str,
    ) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id FROM notification
            WHERE subscription_id = ? AND status IN ('pending', 'retrying')
            ORDER BY id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(tx)
        .await?;
        Ok(ids)
    }

    pub async fn current_status(
        tx: &mut SqliteConnection,
        id: &str,
    ) -> Result<Option<NotificationStatus>> {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM notification WHERE id = ?")
            .bind(id)
            .fetch_optional(tx)
            .await?;
        status.as_deref().map(NotificationStatus::parse).transpose()
    }
}
