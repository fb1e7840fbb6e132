//! Filesystem path helpers for the workspace root (store, extractions, LMDB).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Container providing filesystem paths for the application. In production this
/// is rooted at the configured workspace directory; tests construct custom
/// instances under a tempdir.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under the platform data directory.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs =
            ProjectDirs::from("dev", "krites", "krites").ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// Base workspace directory.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// LMDB environment directory (`.../lmdb`).
    pub fn lmdb_env_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb"])
    }

    /// Directory holding stored documents (`.../store`).
    pub fn store_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["store"])
    }

    /// Path for a stored document identified by its content hash.
    pub fn stored_file_path(&self, file_hash: &str) -> Result<PathBuf, PathError> {
        let mut path = self.store_dir()?;
        path.push(format!("{file_hash}.pdf"));
        Ok(path)
    }

    /// Directory holding extraction artifacts (`.../extractions`).
    pub fn extractions_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["extractions"])
    }

    /// Deterministic artifact path for one file's extraction output.
    pub fn extraction_artifact_path(&self, file_hash: &str) -> Result<PathBuf, PathError> {
        let mut path = self.extractions_dir()?;
        path.push(format!("{file_hash}.json"));
        Ok(path)
    }

    /// Directory for cookie jars produced by external bootstrap tools.
    pub fn cookies_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["cookies"])
    }

    /// Cookie-jar file for one site.
    pub fn cookie_jar_path(&self, site: &str) -> Result<PathBuf, PathError> {
        let mut path = self.cookies_dir()?;
        path.push(format!("{}_cookies.txt", site.trim().to_ascii_lowercase()));
        Ok(path)
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(PathError::CreateDir {
                path: path.to_path_buf(),
                source: err,
            });
        }
    }
    Ok(path.to_path_buf())
}
