//! Domain event repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::EventDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::WritePool;
use crate::{Error, Result};

/// Event repository trait.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn insert(&self, event: &EventDbModel) -> Result<()>;
    async fn get(&self, id: &str) -> Result<EventDbModel>;
    /// Oldest unprocessed events first.
    async fn list_unprocessed(&self, limit: u32) -> Result<Vec<EventDbModel>>;
    async fn count_unprocessed(&self) -> Result<u64>;
    /// Delete processed events older than `cutoff_ms` that no notification references.
    async fn prune_processed_before(&self, cutoff_ms: i64) -> Result<u64>;
}

/// SQLx implementation of EventRepository.
pub struct SqlxEventRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxEventRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl EventRepository for SqlxEventRepository {
    async fn insert(&self, event: &EventDbModel) -> Result<()> {
        retry_on_sqlite_busy("insert_event", || async {
            sqlx::query(
                r#"
                INSERT INTO domain_event (
                    id, tenant_id, event_type, source_id, payload, metadata,
                    processed, processed_at, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.id)
            .bind(event.tenant_id)
            .bind(&event.event_type)
            .bind(&event.source_id)
            .bind(&event.payload)
            .bind(&event.metadata)
            .bind(event.processed)
            .bind(event.processed_at)
            .bind(event.created_at)
            .execute(&self.write_pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<EventDbModel> {
        sqlx::query_as::<_, EventDbModel>("SELECT * FROM domain_event WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Event", id))
    }

    async fn list_unprocessed(&self, limit: u32) -> Result<Vec<EventDbModel>> {
        let events = sqlx::query_as::<_, EventDbModel>(
            "SELECT * FROM domain_event WHERE processed = 0 ORDER BY created_at, id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn count_unprocessed(&self) -> Result<u64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM domain_event WHERE processed = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn prune_processed_before(&self, cutoff_ms: i64) -> Result<u64> {
        retry_on_sqlite_busy("prune_processed_events", || async {
            let result = sqlx::query(
                r#"
                DELETE FROM domain_event
                WHERE processed = 1
                  AND processed_at < ?
                  AND NOT EXISTS (SELECT 1 FROM notification n WHERE n.event_id = domain_event.id)
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
