//! SQLite connection pools for the execution store.
//!
//! Execution saves are compare-and-swap updates. Routing every write through
//! a one-connection pool serializes the version check with the write, while
//! reads fan out over a read-only pool. The database runs in WAL mode so
//! readers never block the writer.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "HOPFLOW_DATA_DIR";

const DATABASE_FILE: &str = "hopflow.db";

/// Tuning for [`DatabasePool::open`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Upper bound on concurrent read connections.
    pub read_connections: u32,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            read_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Read and write handles onto one database file.
#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only connections for queries.
    pub reader: SqlitePool,
    /// The single connection every mutation goes through.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// [`DatabasePool::open`] with default settings.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::open(database_url, &PoolSettings::default()).await
    }

    /// Connect, bring the schema up to date, then open the read side.
    pub async fn open(database_url: &str, settings: &PoolSettings) -> Result<Self, sqlx::Error> {
        let options = connect_options(database_url, settings)?;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        // Readers are read-only and cannot create tables, so migrate first.
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(settings.read_connections.max(1))
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(
            database_url,
            read_connections = settings.read_connections,
            "execution store database opened"
        );
        Ok(Self { reader, writer })
    }

    /// Close both pools, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

fn connect_options(
    database_url: &str,
    settings: &PoolSettings,
) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(settings.busy_timeout))
}

/// `HOPFLOW_DATA_DIR`, falling back to `~/.hopflow`.
pub fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".hopflow")
        })
}

/// URL of the database file inside [`data_dir`].
pub fn default_database_url() -> String {
    format!("sqlite://{}", data_dir().join(DATABASE_FILE).display())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp(settings: &PoolSettings) -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join(DATABASE_FILE).display());
        let pool = DatabasePool::open(&url, settings).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_schema_is_migrated_on_open() {
        let (_dir, pool) = open_temp(&PoolSettings::default()).await;
        for table in ["workflow_executions", "outbox_messages"] {
            let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&pool.reader)
                .await
                .unwrap();
            assert_eq!(count, 0, "{table} should start empty");
        }
    }

    #[tokio::test]
    async fn test_writer_runs_in_wal_and_reader_is_read_only() {
        let (_dir, pool) = open_temp(&PoolSettings::default()).await;

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert!(mode.eq_ignore_ascii_case("wal"));

        let denied = sqlx::query("DELETE FROM workflow_executions")
            .execute(&pool.reader)
            .await;
        assert!(denied.is_err());
    }

    #[tokio::test]
    async fn test_settings_bound_the_read_side() {
        let settings = PoolSettings {
            read_connections: 0,
            ..PoolSettings::default()
        };
        let (_dir, pool) = open_temp(&settings).await;
        assert_eq!(pool.reader.options().get_max_connections(), 1);
        assert_eq!(pool.writer.options().get_max_connections(), 1);

        pool.close().await;
        assert!(pool.reader.is_closed() && pool.writer.is_closed());
    }

    #[test]
    fn test_default_url_points_into_data_dir() {
        let url = default_database_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with(DATABASE_FILE));
    }
}
