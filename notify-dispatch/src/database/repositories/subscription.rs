//! Subscription repository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use super::dispatch_tx::DispatchTxOps;
use crate::database::models::{NotificationLogDbModel, NotificationStatus, SubscriptionDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::{WritePool, begin_immediate};
use crate::{Error, Result};

/// Subscription repository trait.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn create(&self, sub: &SubscriptionDbModel) -> Result<()>;
    async fn get(&self, id: &str) -> Result<SubscriptionDbModel>;
    async fn update(&self, sub: &SubscriptionDbModel) -> Result<()>;
    async fn set_active(&self, id: &str, active: bool) -> Result<()>;
    /// Delete a subscription and cancel its in-flight notifications in one
    /// transaction. Returns the number of cancelled notifications.
    async fn delete(&self, id: &str) -> Result<u64>;
    async fn list_by_tenant(&self, tenant_id: i64) -> Result<Vec<SubscriptionDbModel>>;
    /// Active subscriptions for `(tenant_id, event_type)`, ordered by id.
    async fn list_active_for(
        &self,
        tenant_id: i64,
        event_type: &str,
    ) -> Result<Vec<SubscriptionDbModel>>;
}

/// SQLx implementation of SubscriptionRepository.
pub struct SqlxSubscriptionRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxSubscriptionRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl SubscriptionRepository for SqlxSubscriptionRepository {
    async fn create(&self, sub: &SubscriptionDbModel) -> Result<()> {
        retry_on_sqlite_busy("create_subscription", || async {
            sqlx::query(
                r#"
                INSERT INTO subscription (
                    id, tenant_id, user_id, event_type, channel_kind, channel_config,
                    filter, active, max_attempts, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&sub.id)
            .bind(sub.tenant_id)
            .bind(&sub.user_id)
            .bind(&sub.event_type)
            .bind(&sub.channel_kind)
            .bind(&sub.channel_config)
            .bind(&sub.filter)
            .bind(sub.active)
            .bind(sub.max_attempts)
            .bind(sub.created_at)
            .bind(sub.updated_at)
            .execute(&self.write_pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<SubscriptionDbModel> {
        sqlx::query_as::<_, SubscriptionDbModel>("SELECT * FROM subscription WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Subscription", id))
    }

    async fn update(&self, sub: &SubscriptionDbModel) -> Result<()> {
        let result = retry_on_sqlite_busy("update_subscription", || async {
            Ok(sqlx::query(
                r#"
                UPDATE subscription
                SET user_id = ?, event_type = ?, channel_config = ?, filter = ?,
                    active = ?, max_attempts = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&sub.user_id)
            .bind(&sub.event_type)
            .bind(&sub.channel_config)
            .bind(&sub.filter)
            .bind(sub.active)
            .bind(sub.max_attempts)
            .bind(sub.updated_at)
            .bind(&sub.id)
            .execute(&self.write_pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Subscription", &sub.id));
        }
        Ok(())
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let result = retry_on_sqlite_busy("set_subscription_active", || async {
            Ok(
                sqlx::query("UPDATE subscription SET active = ?, updated_at = ? WHERE id = ?")
                    .bind(active)
                    .bind(now_ms())
                    .bind(id)
                    .execute(&self.write_pool)
                    .await?,
            )
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Subscription", id));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<u64> {
        retry_on_sqlite_busy("delete_subscription", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            let now = now_ms();

            let open = DispatchTxOps::open_notification_ids_for_subscription(&mut tx, id).await?;
            let mut cancelled = 0u64;
            for notification_id in &open {
                if DispatchTxOps::cancel_notification(&mut tx, notification_id, now).await? {
                    let log = NotificationLogDbModel::new(
                        notification_id,
                        0,
                        NotificationStatus::Cancelled,
                        "Cancelled: subscription deleted",
                        None,
                    );
                    DispatchTxOps::insert_log(&mut tx, &log).await?;
                    cancelled += 1;
                }
            }

            let result = sqlx::query("DELETE FROM subscription WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(Error::not_found("Subscription", id));
            }

            tx.commit().await?;
            debug!(subscription_id = %id, cancelled, "Deleted subscription");
            Ok(cancelled)
        })
        .await
    }

    async fn list_by_tenant(&self, tenant_id: i64) -> Result<Vec<SubscriptionDbModel>> {
        let subs = sqlx::query_as::<_, SubscriptionDbModel>(
            "SELECT * FROM subscription WHERE tenant_id = ? ORDER BY id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn list_active_for(
        &self,
        tenant_id: i64,
        event_type: &str,
    ) -> Result<Vec<SubscriptionDbModel>> {
        let subs = sqlx::query_as::<_, SubscriptionDbModel>(
            r#"
            SELECT * FROM subscription
            WHERE tenant_id = ? AND event_type = ? AND active = 1
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }
}
