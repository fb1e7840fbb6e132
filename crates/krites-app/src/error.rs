//! Application-level error type shared by the binary.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::db::DbError;
use crate::paths::PathError;
use crate::pipeline::extract::ExtractError;
use crate::services::downloader::DownloadError;
use crate::services::extractor::ExtractorError;
use crate::services::file_store::FileStoreError;
use crate::services::provider::ProviderError;
use crate::services::session::SessionError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    FileStore(#[from] FileStoreError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
