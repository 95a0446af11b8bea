//! Persistence layer for notification dispatch.
//!
//! SQLite through sqlx: connection pools, embedded migrations, models,
//! repositories, and the maintenance task that prunes old rows.

pub mod maintenance;
pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

pub use maintenance::{MaintenanceConfig, MaintenanceScheduler};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Serialized write pool type alias (max_connections=1).
pub type WritePool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Default cache size (negative means KiB, so this is ~16MB).
const DEFAULT_CACHE_SIZE_KB: i32 = -16000;

/// Default WAL auto-checkpoint threshold in pages.
const DEFAULT_WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

/// Limit WAL size growth (bytes).
const DEFAULT_JOURNAL_SIZE_LIMIT_BYTES: i64 = 64 * 1024 * 1024;

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {}",
        DEFAULT_WAL_AUTOCHECKPOINT_PAGES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "PRAGMA journal_size_limit = {}",
        DEFAULT_JOURNAL_SIZE_LIMIT_BYTES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!("PRAGMA cache_size = {}", DEFAULT_CACHE_SIZE_KB))
        .execute(&mut *conn)
        .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn ensure_wal_mode(pool: &DbPool, pool_name: &str) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?;
    let mode: String = row.get(0);
    if mode != "wal" && mode != "memory" {
        tracing::warn!(
            "{}_journal_mode was '{}', expected 'wal'; re-setting",
            pool_name,
            mode
        );
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true))
}

/// Read pool size derived from the available CPU cores, capped at 10.
pub fn default_read_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(DEFAULT_POOL_SIZE)
}

/// Initialize a read pool with WAL mode and the per-connection pragmas.
///
/// # Arguments
/// * `database_url` - SQLite database URL (e.g., "sqlite:notify.db?mode=rwc")
/// * `max_connections` - Maximum number of connections in the pool
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    ensure_wal_mode(&pool, "read_pool").await?;

    tracing::info!(
        "Database pool initialized with WAL mode, {} max connections",
        max_connections
    );

    Ok(pool)
}

/// Initialize the read pool with the default size.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, default_read_pool_size()).await
}

/// Initialize a serialized write pool with `max_connections = 1`.
///
/// Every `BEGIN IMMEDIATE` transaction goes through this pool so only one
/// connection ever competes for the SQLite write lock. Never acquire from the
/// write pool while an [`ImmediateTransaction`] is held on the same task.
pub async fn init_write_pool(database_url: &str) -> Result<WritePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(60))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    ensure_wal_mode(&pool, "write_pool").await?;

    tracing::info!("Write pool initialized with 1 max connection (serialized writes)");

    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> crate::Result<()> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Read and write pools opened against the same database file.
#[derive(Clone)]
pub struct Database {
    pub pool: DbPool,
    pub write_pool: WritePool,
}

impl Database {
    /// Open both pools and apply pending migrations.
    pub async fn open(database_url: &str) -> crate::Result<Self> {
        let write_pool = init_write_pool(database_url).await?;
        run_migrations(&write_pool).await?;
        let pool = init_pool(database_url).await?;
        Ok(Self { pool, write_pool })
    }
}

pub async fn begin_immediate(pool: &WritePool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction::new(conn))
}

/// Wrapper for a manual immediate transaction.
///
/// `BEGIN IMMEDIATE` takes the write lock up front, so two transactions never
/// deadlock trying to upgrade from a shared read lock.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub fn new(conn: sqlx::pool::PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        // An unfinished transaction must not go back to the pool mid-BEGIN.
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("t.db").display());
        let db = Database::open(&url).await.unwrap();

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(result.0, "wal");

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&db.pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"domain_event"));
        assert!(names.contains(&"notification"));
        assert!(names.contains(&"notification_log"));
        assert!(names.contains(&"subscription"));
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("t.db").display());
        let db = Database::open(&url).await.unwrap();

        {
            let mut tx = begin_immediate(&db.write_pool).await.unwrap();
            sqlx::query(
                "INSERT INTO domain_event (id, tenant_id, event_type, created_at) VALUES ('e1', 1, 'x', 0)",
            )
            .execute(&mut *tx)
            .await
            .unwrap();
        }

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM domain_event")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
