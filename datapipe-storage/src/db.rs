use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use crate::error::StorageError;
use crate::schema;

pub type SqlitePool = Pool<Sqlite>;

/// Open (or create) the queue store at `path` and make sure the schema
/// exists. WAL + busy-timeout so concurrent managers and inspection
/// CLIs can attach to the same file.
pub async fn open_pool(path: &Path, create_if_missing: bool) -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create_if_missing)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    for statement in schema::ALL {
        sqlx::query(statement).execute(&pool).await?;
    }

    Ok(pool)
}
