use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use krites_app::config;
use krites_app::db::ReviewDb;
use krites_app::error::AppError;
use krites_app::paths::AppPaths;
use krites_app::services::{
    DownloadWorker, ExtractionWorker, OpenAiProvider, SiteSessionManager,
};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load()?;
    let paths = AppPaths::new(&cfg.workspace.path)?;
    let db = ReviewDb::open(&paths)?;
    info!(
        workspace = %cfg.workspace.path.display(),
        sites = cfg.sites.len(),
        "review database opened"
    );

    let sessions = Arc::new(SiteSessionManager::new(paths.clone(), cfg.sites.clone()));
    let provider = Arc::new(OpenAiProvider::from_env(None)?);

    let downloader = Arc::new(DownloadWorker::new(
        db.clone(),
        paths.clone(),
        Arc::clone(&sessions),
        cfg.workers.download_concurrency,
    ));
    let extractor = Arc::new(ExtractionWorker::new(
        db.clone(),
        paths.clone(),
        provider,
        cfg.workers.extraction_concurrency,
    ));

    downloader.start().await;
    extractor.start().await;
    info!("workers running; press ctrl-c to shut down");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    // Extractions first: they are the expensive in-flight work the bounded
    // wait protects. Downloads are cheap to abandon and retry.
    let timeout = Duration::from_secs(cfg.workers.shutdown_timeout_secs);
    extractor.stop(false, timeout).await;
    downloader.stop(false).await;
    sessions.close_all_sessions().await;

    info!("shutdown complete");
    Ok(())
}
