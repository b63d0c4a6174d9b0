//! Relational snapshot of a group's metadata log.
//!
//! The NDJSON log is copied into `<group>/0metadata.sqlite`, table `data`,
//! keyed by artifact file name. A later record for the same file replaces
//! the earlier one.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{info, instrument};

use crate::output::{MetadataRecord, OutputError, OutputStore};

/// File name of each group's snapshot database.
pub const SNAPSHOT_FILE: &str = "0metadata.sqlite";

/// Connections wait this long on a locked database (5s).
const BUSY_TIMEOUT_MS: u64 = 5000;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS data (
    filename TEXT PRIMARY KEY,
    id TEXT NOT NULL,
    title TEXT NOT NULL,
    web_url TEXT NOT NULL,
    created_at TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    uri TEXT NOT NULL
)";

const UPSERT_ROW: &str = "INSERT OR REPLACE INTO data
    (filename, id, title, web_url, created_at, mime_type, uri)
    VALUES (?, ?, ?, ?, ?, ?, ?)";

/// Snapshot errors.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The database could not be opened or written.
    #[error("snapshot database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The metadata log could not be read.
    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Writes `group`'s metadata log into its snapshot database.
///
/// Returns the database path and the number of rows written.
///
/// # Errors
///
/// [`SnapshotError`] when the log cannot be read or the database written.
#[instrument(skip(store))]
pub async fn convert_metadata_log(
    store: &OutputStore,
    group: &str,
) -> Result<(PathBuf, usize), SnapshotError> {
    let records = store.read_metadata_records(group).await?;
    let db_path = store.prepare_document_path(group, SNAPSHOT_FILE).await?;
    let pool = open(&db_path).await?;

    let written = write_records(&pool, &records).await;
    pool.close().await;
    let written = written?;

    info!(group, rows = written, path = %db_path.display(), "metadata snapshot written");
    Ok((db_path, written))
}

/// Opens (creating if needed) a snapshot database in WAL mode.
///
/// # Errors
///
/// [`SnapshotError::Database`] when the file cannot be opened.
pub async fn open(db_path: &Path) -> Result<SqlitePool, SnapshotError> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS));
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    sqlx::query(CREATE_TABLE).execute(&pool).await?;
    Ok(pool)
}

async fn write_records(pool: &SqlitePool, records: &[MetadataRecord]) -> Result<usize, SnapshotError> {
    let mut tx = pool.begin().await?;
    for record in records {
        sqlx::query(UPSERT_ROW)
            .bind(record.file_name())
            .bind(&record.id)
            .bind(&record.struct_data.title)
            .bind(&record.struct_data.web_url)
            .bind(&record.struct_data.created_at)
            .bind(&record.content.mime_type)
            .bind(&record.content.uri)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(records.len())
}
