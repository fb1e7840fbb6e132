//! LMDB-backed persistence for files, model records, and task rows.
//!
//! One environment, one named database per record family. Every mutation runs
//! inside a single short-lived write transaction so status transitions and
//! reconciliation merges are atomic at the row level.

pub mod records;
pub mod tasks;

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str, Unit};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::paths::{AppPaths, PathError};

const ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB

/// Separator between the file hash and model number in appearance keys.
/// Neither side may contain it: hashes are hex, model numbers are trimmed
/// printable part numbers.
pub(crate) const APPEARANCE_SEP: char = '\x1f';

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{kind} `{key}` not found")]
    NotFound { kind: &'static str, key: String },
}

/// Handle over the review database. Cheap to clone; the environment is shared.
#[derive(Debug, Clone)]
pub struct ReviewDb {
    env: Env,
    files: Database<Str, Bytes>,
    models: Database<Str, Bytes>,
    appearances: Database<Str, Unit>,
    download_tasks: Database<Str, Bytes>,
    extraction_tasks: Database<Str, Bytes>,
}

impl ReviewDb {
    pub fn open(paths: &AppPaths) -> Result<Self, DbError> {
        let path = paths.lmdb_env_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(8);
        options.map_size(ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let files = env.create_database(&mut wtxn, Some("files"))?;
        let models = env.create_database(&mut wtxn, Some("models"))?;
        let appearances = env.create_database(&mut wtxn, Some("appearances"))?;
        let download_tasks = env.create_database(&mut wtxn, Some("download-tasks"))?;
        let extraction_tasks = env.create_database(&mut wtxn, Some("extraction-tasks"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            files,
            models,
            appearances,
            download_tasks,
            extraction_tasks,
        })
    }

    pub(crate) fn env(&self) -> &Env {
        &self.env
    }

    pub(crate) fn files_db(&self) -> Database<Str, Bytes> {
        self.files
    }

    pub(crate) fn models_db(&self) -> Database<Str, Bytes> {
        self.models
    }

    pub(crate) fn appearances_db(&self) -> Database<Str, Unit> {
        self.appearances
    }

    pub(crate) fn download_tasks_db(&self) -> Database<Str, Bytes> {
        self.download_tasks
    }

    pub(crate) fn extraction_tasks_db(&self) -> Database<Str, Bytes> {
        self.extraction_tasks
    }
}

pub(crate) fn encode_doc<T: Serialize>(value: &T) -> Result<Vec<u8>, DbError> {
    Ok(encode_to_vec(value, config::standard())?)
}

pub(crate) fn decode_doc<T: DeserializeOwned>(raw: &[u8]) -> Result<T, DbError> {
    let (value, _) = decode_from_slice::<T, _>(raw, config::standard())?;
    Ok(value)
}

pub(crate) fn get_doc<T: DeserializeOwned>(
    db: Database<Str, Bytes>,
    rtxn: &RoTxn<'_>,
    key: &str,
) -> Result<Option<T>, DbError> {
    match db.get(rtxn, key)? {
        Some(raw) => Ok(Some(decode_doc(raw)?)),
        None => Ok(None),
    }
}

pub(crate) fn put_doc<T: Serialize>(
    db: Database<Str, Bytes>,
    wtxn: &mut RwTxn<'_>,
    key: &str,
    value: &T,
) -> Result<(), DbError> {
    let encoded = encode_doc(value)?;
    db.put(wtxn, key, encoded.as_slice())?;
    Ok(())
}

pub fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}
