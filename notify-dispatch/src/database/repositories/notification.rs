//! Notification repository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use super::dispatch_tx::{AttemptUpdate, DispatchTxOps};
use crate::database::models::{
    NotificationDbModel, NotificationFilters, NotificationLogDbModel, NotificationStats,
    NotificationStatus, PaginatedResponse, PaginationParams,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::{WritePool, begin_immediate};
use crate::{Error, Result};

/// Result of writing an attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The row took the new state.
    Applied,
    /// The row changed underneath the attempt (cancelled or re-claimed);
    /// only the log row was written.
    Discarded { current: Option<NotificationStatus> },
}

/// Notification repository trait.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<NotificationDbModel>;

    async fn list(
        &self,
        filters: &NotificationFilters,
        pagination: &PaginationParams,
    ) -> Result<PaginatedResponse<NotificationDbModel>>;

    async fn logs(&self, notification_id: &str) -> Result<Vec<NotificationLogDbModel>>;

    async fn stats(&self, tenant_id: Option<i64>) -> Result<NotificationStats>;

    /// Mark the event processed and insert its notifications in one transaction.
    ///
    /// Fails with `ConcurrencyConflict` if the event was already processed.
    /// Returns the rows actually inserted.
    async fn create_for_event(
        &self,
        event_id: &str,
        notifications: &[NotificationDbModel],
    ) -> Result<Vec<NotificationDbModel>>;

    /// Insert a standalone notification (direct send).
    async fn insert(&self, notification: &NotificationDbModel) -> Result<()>;

    /// Ids of notifications that are due and not held by a live claim:
    /// `retrying` with `next_retry_at <= now`, or `pending` (orphaned).
    async fn list_due(&self, now_ms: i64, limit: u32) -> Result<Vec<String>>;

    /// Take an exclusive lease on a due notification. Returns false if another
    /// worker holds it or it is no longer due.
    async fn claim(&self, id: &str, token: &str, now_ms: i64, until_ms: i64) -> Result<bool>;

    /// Extend a claim held by `token` to `until_ms`. Returns false if the row
    /// was re-claimed, cancelled or finished in the meantime.
    async fn renew_claim(
        &self,
        id: &str,
        token: &str,
        now_ms: i64,
        until_ms: i64,
    ) -> Result<bool>;

    /// Persist an attempt outcome and its log row atomically.
    async fn record_attempt(
        &self,
        id: &str,
        claim_token: &str,
        update: &AttemptUpdate,
        log: &NotificationLogDbModel,
    ) -> Result<RecordOutcome>;

    /// `pending`/`retrying` -> `cancelled` with a log row.
    async fn cancel(&self, id: &str, reason: &str) -> Result<NotificationDbModel>;

    /// Delete terminal notifications (and their logs) last updated before `cutoff_ms`.
    async fn prune_terminal_before(&self, cutoff_ms: i64) -> Result<u64>;
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

fn filter_clause(filters: &NotificationFilters) -> String {
    let mut conditions: Vec<&str> = Vec::new();
    if filters.tenant_id.is_some() {
        conditions.push("tenant_id = ?");
    }
    if filters.event_type.is_some() {
        conditions.push("event_type = ?");
    }
    if filters.channel_kind.is_some() {
        conditions.push("channel_kind = ?");
    }
    if filters.status.is_some() {
        conditions.push("status = ?");
    }
    if filters.created_from.is_some() {
        conditions.push("created_at >= ?");
    }
    if filters.created_to.is_some() {
        conditions.push("created_at < ?");
    }

    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

macro_rules! bind_filters {
    ($query:expr, $filters:expr) => {{
        let mut query = $query;
        if let Some(tenant_id) = $filters.tenant_id {
            query = query.bind(tenant_id);
        }
        if let Some(event_type) = &$filters.event_type {
            query = query.bind(event_type.clone());
        }
        if let Some(kind) = $filters.channel_kind {
            query = query.bind(kind.as_str());
        }
        if let Some(status) = $filters.status {
            query = query.bind(status.as_str());
        }
        if let Some(from) = $filters.created_from {
            query = query.bind(from);
        }
        if let Some(to) = $filters.created_to {
            query = query.bind(to);
        }
        query
    }};
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn get(&self, id: &str) -> Result<NotificationDbModel> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notification WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn list(
        &self,
        filters: &NotificationFilters,
        pagination: &PaginationParams,
    ) -> Result<PaginatedResponse<NotificationDbModel>> {
        let where_clause = filter_clause(filters);
        let limit = pagination.effective_limit();

        let sql = format!(
            "SELECT * FROM notification {} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            where_clause
        );
        let query = bind_filters!(sqlx::query_as::<_, NotificationDbModel>(&sql), filters);
        let items = query
            .bind(limit)
            .bind(pagination.offset)
            .fetch_all(&self.pool)
            .await?;

        let count_sql = format!("SELECT COUNT(*) FROM notification {}", where_clause);
        let count_query = bind_filters!(sqlx::query_scalar::<_, i64>(&count_sql), filters);
        let total = count_query.fetch_one(&self.pool).await?;

        Ok(PaginatedResponse::new(
            items,
            total as u64,
            limit,
            pagination.offset,
        ))
    }

    async fn logs(&self, notification_id: &str) -> Result<Vec<NotificationLogDbModel>> {
        let logs = sqlx::query_as::<_, NotificationLogDbModel>(
            "SELECT * FROM notification_log WHERE notification_id = ? ORDER BY created_at, id",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    async fn stats(&self, tenant_id: Option<i64>) -> Result<NotificationStats> {
        let rows: Vec<(String, i64)> = match tenant_id {
            Some(tenant_id) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM notification WHERE tenant_id = ? GROUP BY status",
                )
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM notification GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut stats = NotificationStats::default();
        for (status, count) in rows {
            stats.add(NotificationStatus::parse(&status)?, count as u64);
        }
        Ok(stats)
    }

    async fn create_for_event(
        &self,
        event_id: &str,
        notifications: &[NotificationDbModel],
    ) -> Result<Vec<NotificationDbModel>> {
        retry_on_sqlite_busy("create_notifications_for_event", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            if !DispatchTxOps::mark_event_processed(&mut tx, event_id, now_ms()).await? {
                tx.rollback().await?;
                return Err(Error::conflict("Event", event_id));
            }

            let mut created = Vec::with_capacity(notifications.len());
            for n in notifications {
                if DispatchTxOps::insert_notification(&mut tx, n).await? {
                    created.push(n.clone());
                } else {
                    debug!(
                        event_id = %event_id,
                        subscription_id = ?n.subscription_id,
                        "Notification already exists for event/subscription pair"
                    );
                }
            }

            tx.commit().await?;
            Ok(created)
        })
        .await
    }

    async fn insert(&self, notification: &NotificationDbModel) -> Result<()> {
        retry_on_sqlite_busy("insert_notification", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            if !DispatchTxOps::insert_notification(&mut tx, notification).await? {
                tx.rollback().await?;
                return Err(Error::validation(format!(
                    "Notification {} already exists",
                    notification.id
                )));
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn list_due(&self, now_ms: i64, limit: u32) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id FROM notification
            WHERE ((status = 'retrying' AND next_retry_at <= ?) OR status = 'pending')
              AND (claimed_until IS NULL OR claimed_until <= ?)
            ORDER BY COALESCE(next_retry_at, created_at), id
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn claim(&self, id: &str, token: &str, now_ms: i64, until_ms: i64) -> Result<bool> {
        retry_on_sqlite_busy("claim_notification", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification
                SET claim_token = ?, claimed_until = ?, updated_at = ?
                WHERE id = ?
                  AND ((status = 'retrying' AND next_retry_at <= ?) OR status = 'pending')
                  AND (claimed_until IS NULL OR claimed_until <= ?)
                "#,
            )
            .bind(token)
            .bind(until_ms)
            .bind(now_ms)
            .bind(id)
            .bind(now_ms)
            .bind(now_ms)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn renew_claim(
        &self,
        id: &str,
        token: &str,
        now_ms: i64,
        until_ms: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("renew_notification_claim", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification
                SET claimed_until = ?, updated_at = ?
                WHERE id = ?
                  AND claim_token = ?
                  AND status IN ('pending', 'retrying')
                "#,
            )
            .bind(until_ms)
            .bind(now_ms)
            .bind(id)
            .bind(token)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn record_attempt(
        &self,
        id: &str,
        claim_token: &str,
        update: &AttemptUpdate,
        log: &NotificationLogDbModel,
    ) -> Result<RecordOutcome> {
        retry_on_sqlite_busy("record_notification_attempt", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            let applied = DispatchTxOps::apply_attempt(&mut tx, id, claim_token, update).await?;
            let outcome = if applied {
                DispatchTxOps::insert_log(&mut tx, log).await?;
                RecordOutcome::Applied
            } else {
                let current = DispatchTxOps::current_status(&mut tx, id).await?;
                if let Some(status) = current {
                    let mut discarded = log.clone();
                    discarded.status_at_attempt = status.as_str().to_string();
                    discarded.message =
                        format!("Outcome discarded ({}): {}", update.status, log.message);
                    DispatchTxOps::insert_log(&mut tx, &discarded).await?;
                }
                RecordOutcome::Discarded { current }
            };

            tx.commit().await?;
            Ok(outcome)
        })
        .await
    }

    async fn cancel(&self, id: &str, reason: &str) -> Result<NotificationDbModel> {
        retry_on_sqlite_busy("cancel_notification", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            if !DispatchTxOps::cancel_notification(&mut tx, id, now_ms()).await? {
                let current = DispatchTxOps::current_status(&mut tx, id).await?;
                tx.rollback().await?;
                return Err(match current {
                    Some(status) => Error::invalid_transition(status, NotificationStatus::Cancelled),
                    None => Error::not_found("Notification", id),
                });
            }

            let log = NotificationLogDbModel::new(
                id,
                0,
                NotificationStatus::Cancelled,
                format!("Cancelled: {}", reason),
                None,
            );
            DispatchTxOps::insert_log(&mut tx, &log).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        self.get(id).await
    }

    async fn prune_terminal_before(&self, cutoff_ms: i64) -> Result<u64> {
        retry_on_sqlite_busy("prune_terminal_notifications", || async {
            let result = sqlx::query(
                r#"
                DELETE FROM notification
                WHERE status IN ('sent', 'failed', 'cancelled')
                  AND updated_at < ?
                "#,
            )
            .bind(cutoff_ms)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
