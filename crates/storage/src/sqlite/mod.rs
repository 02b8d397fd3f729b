use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqliteQuerySnafu, StorageResult,
};
use super::{BoxFuture, KvStore};

/// Pool size for file databases. WAL lets these readers run next to the
/// single writer.
const FILE_POOL_CONNECTIONS: u32 = 4;

/// Key-value backend on a SQLite pool.
///
/// File databases run in WAL mode, so a read of one key never waits on a
/// write to another.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(5_000));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives exactly as long as its connection.
        let max_connections = if in_memory { 1 } else { FILE_POOL_CONNECTIONS };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(
            database_url = %database_url,
            max_connections,
            "opened sqlite key-value store"
        );
        Ok(Self { pool, database_url })
    }

    pub async fn in_memory() -> StorageResult<Self> {
        Self::open(":memory:").await
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl KvStore for SqliteStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move {
            sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-get",
                    key: key.to_string(),
                })
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(unix_timestamp_seconds())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-set",
                key: key.to_string(),
            })?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM kv_entries WHERE key = ?1")
                .bind(key)
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-remove",
                    key: key.to_string(),
                })?;
            Ok(())
        })
    }
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
