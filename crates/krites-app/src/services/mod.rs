//! IO-bound services: HTTP sessions, the document store, worker pools, and
//! the LLM provider client. Pure transforms live in `crate::pipeline`.

pub mod downloader;
pub mod extractor;
pub mod file_store;
pub mod pricing;
pub mod provider;
pub mod session;

pub use downloader::{DownloadError, DownloadWorker};
pub use extractor::{ExtractionWorker, ExtractorError};
pub use file_store::{content_hash, FileStoreError};
pub use pricing::compute_cost_usd;
pub use provider::{
    ExtractionProvider, OpenAiProvider, ProviderError, ProviderResponse, TokenUsage,
};
pub use session::{SessionError, SiteSessionManager};
