//! End-to-end extraction of one stored file: enumerate model numbers, pull
//! specifications in batches, write the artifact, reconcile the database.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use crate::db::tasks::{ExtractionMode, ServiceTier};
use crate::db::{DbError, ReviewDb};
use crate::paths::{AppPaths, PathError};
use crate::pipeline::item::{ExtractionArtifact, RawModelItem};
use crate::pipeline::reconcile::reconcile_item;
use crate::services::pricing::compute_cost_usd;
use crate::services::provider::{ExtractionProvider, ProviderError, TokenUsage};

const EXTRACTION_BATCH_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("file `{file_hash}` is not registered")]
    FileMissing { file_hash: String },
    #[error("failed to write artifact {path}: {source}")]
    WriteArtifact {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionOutcomeStatus {
    Succeeded,
    /// The artifact already existed and `force_rerun` was not set; nothing
    /// was spent and nothing was touched.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub status: ExtractionOutcomeStatus,
    pub out_path: PathBuf,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    /// Model the provider reports having served, when any call went out.
    pub model: Option<String>,
    pub service_tier: Option<ServiceTier>,
    /// Model numbers merged into the database, in extraction order.
    pub model_numbers: Vec<String>,
}

/// Run the full extraction protocol for one stored file.
///
/// The document is uploaded once and the provider reference reused across
/// the enumeration call and every batch; the upload is deleted on the way
/// out whether or not the run succeeded. With `force_rerun` the file's
/// appearance links are rebuilt from scratch; model records themselves are
/// never deleted here.
pub async fn run_extraction(
    db: &ReviewDb,
    paths: &AppPaths,
    provider: &dyn ExtractionProvider,
    file_hash: &str,
    force_rerun: bool,
    mode: ExtractionMode,
) -> Result<ExtractionOutcome, ExtractError> {
    let file = db
        .get_file(file_hash)?
        .ok_or_else(|| ExtractError::FileMissing {
            file_hash: file_hash.to_string(),
        })?;
    let out_path = paths.extraction_artifact_path(file_hash)?;

    if !force_rerun && out_path.exists() {
        info!(
            file_hash,
            stage = "extract_skip",
            "artifact already exists; skipping"
        );
        return Ok(ExtractionOutcome {
            status: ExtractionOutcomeStatus::Skipped,
            out_path,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            model: None,
            service_tier: None,
            model_numbers: Vec::new(),
        });
    }

    let file_id = provider
        .upload_document(std::path::Path::new(&file.local_path), &file.filename)
        .await?;
    let result = run_protocol(db, provider, &file_id, file_hash, force_rerun, mode, &out_path).await;

    // Uploaded documents are billable storage; always try to clean up.
    if let Err(err) = provider.delete_document(&file_id).await {
        warn!(
            file_hash,
            error = %err,
            stage = "extract_cleanup",
            "failed to delete uploaded document"
        );
    }
    result
}

async fn run_protocol(
    db: &ReviewDb,
    provider: &dyn ExtractionProvider,
    file_id: &str,
    file_hash: &str,
    force_rerun: bool,
    mode: ExtractionMode,
    out_path: &std::path::Path,
) -> Result<ExtractionOutcome, ExtractError> {
    let mut usage = TokenUsage::default();
    let mut actual_model: Option<String> = None;
    let mut actual_tier: Option<ServiceTier> = None;

    // A failed call degrades to an empty result rather than aborting the
    // run; partial output still lands in the artifact.
    let model_list = match provider.list_models(file_id).await {
        Ok(enumerated) => {
            usage.accumulate(enumerated.usage);
            actual_model = enumerated.model.or(actual_model);
            actual_tier = enumerated.service_tier.or(actual_tier);
            enumerated.payload.models
        }
        Err(err) => {
            warn!(
                file_hash,
                error = %err,
                stage = "extract_enumerate",
                "model enumeration failed"
            );
            Vec::new()
        }
    };
    info!(
        file_hash,
        models = model_list.len(),
        stage = "extract_enumerate",
        "enumerated model numbers"
    );

    let mut merged: Vec<RawModelItem> = Vec::new();
    for batch in model_list.chunks(EXTRACTION_BATCH_SIZE) {
        match provider.extract_models(file_id, batch).await {
            Ok(extracted) => {
                usage.accumulate(extracted.usage);
                actual_model = extracted.model.or(actual_model);
                actual_tier = extracted.service_tier.or(actual_tier);
                merged.extend(extracted.payload);
            }
            Err(err) => {
                warn!(
                    file_hash,
                    batch_size = batch.len(),
                    error = %err,
                    stage = "extract_batch",
                    "batch extraction failed"
                );
            }
        }
    }

    let artifact = ExtractionArtifact::new(file_hash, merged);
    let encoded = serde_json::to_vec_pretty(&artifact)?;
    tokio::fs::write(out_path, encoded)
        .await
        .map_err(|source| ExtractError::WriteArtifact {
            path: out_path.display().to_string(),
            source,
        })?;

    if force_rerun {
        let removed = db.clear_file_appearances(file_hash)?;
        info!(
            file_hash,
            removed,
            stage = "extract_rerun",
            "cleared stale appearance links"
        );
    }

    let mut model_numbers = Vec::new();
    for item in &artifact.models {
        if let Some(model_number) = reconcile_item(db, file_hash, item)? {
            model_numbers.push(model_number);
        }
    }

    let cost_usd = match &actual_model {
        Some(model) => compute_cost_usd(
            model,
            usage.input_tokens,
            usage.cached_input_tokens,
            usage.output_tokens,
            actual_tier,
            mode,
        ),
        None => 0.0,
    };
    info!(
        file_hash,
        merged = model_numbers.len(),
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        cost_usd,
        stage = "extract_done",
        "extraction completed"
    );

    Ok(ExtractionOutcome {
        status: ExtractionOutcomeStatus::Succeeded,
        out_path: out_path.to_path_buf(),
        usage,
        cost_usd,
        model: actual_model,
        service_tier: actual_tier,
        model_numbers,
    })
}
