// SQLite Connection Pool Setup

use crate::error::map_sqlx_error;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tessera_core::error::{AppError, Result};
use tracing::info;

/// Only the storage actor talks to the database, one statement at a time
const MAX_CONNECTIONS: u32 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Create SQLite connection pool with WAL mode
///
/// Accepts a `sqlite:` URL or a plain file path; missing files (and their
/// parent directory) are created. The single connection is kept open for the
/// pool's lifetime so `sqlite::memory:` databases survive between queries.
pub async fn create_pool(database: &str) -> Result<SqlitePool> {
    let options = if database.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(database).map_err(map_sqlx_error)?
    } else {
        ensure_parent_dir(database)?;
        SqliteConnectOptions::new().filename(database)
    };

    let options = options
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .min_connections(MAX_CONNECTIONS)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(map_sqlx_error)?;

    info!(database = database, "SQLite pool ready");
    Ok(pool)
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    match std::path::Path::new(path).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir).map_err(|e| {
            AppError::Database(format!("Cannot create database directory {}: {}", dir.display(), e))
        }),
        _ => Ok(()),
    }
}
