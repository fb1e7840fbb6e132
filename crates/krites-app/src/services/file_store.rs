//! Content-addressed document store.
//!
//! Bytes are keyed by their SHA-256 hex digest. Storing the same content
//! twice is a no-op on disk and in the database, whatever filename or source
//! URL the later copy arrives under.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::db::records::FileRecord;
use crate::db::{current_timestamp_ms, DbError, ReviewDb};
use crate::paths::{AppPaths, PathError};

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("failed to write stored file for hash `{file_hash}`: {source}")]
    Write {
        file_hash: String,
        #[source]
        source: std::io::Error,
    },
}

/// SHA-256 hex digest of a byte buffer.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Persist document bytes into the store and register the file row. Returns
/// the stored [`FileRecord`]; for already-known content this is the original
/// row, untouched.
pub async fn persist(
    db: &ReviewDb,
    paths: &AppPaths,
    bytes: &[u8],
    filename: &str,
    source_url: Option<&str>,
) -> Result<FileRecord, FileStoreError> {
    let file_hash = content_hash(bytes);
    let local_path = paths.stored_file_path(&file_hash)?;

    if local_path.exists() {
        debug!(
            file_hash = %file_hash,
            stage = "file_store",
            "content already stored; skipping write"
        );
    } else {
        tokio::fs::write(&local_path, bytes)
            .await
            .map_err(|source| FileStoreError::Write {
                file_hash: file_hash.clone(),
                source,
            })?;
        info!(
            file_hash = %file_hash,
            size_bytes = bytes.len(),
            stage = "file_store",
            "stored new document"
        );
    }

    let record = FileRecord {
        file_hash: file_hash.clone(),
        filename: filename.to_string(),
        source_url: source_url.map(str::to_string),
        size_bytes: bytes.len() as u64,
        local_path: local_path.display().to_string(),
        created_at_ms: current_timestamp_ms(),
    };
    Ok(db.upsert_file(&record)?)
}
