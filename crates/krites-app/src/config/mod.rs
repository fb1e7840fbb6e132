//! Configuration loading: workspace root, worker sizing, and site profiles.

use std::collections::HashMap;
use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

const CONFIG_FILE: &str = "config/krites";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub workspace: WorkspaceConfig,
    pub workers: WorkerConfig,
    /// Vendor site profiles keyed by site identifier.
    #[serde(default)]
    pub sites: HashMap<String, SiteProfile>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub download_concurrency: usize,
    pub extraction_concurrency: usize,
    /// Bounded wait for in-flight extractions during shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

/// How a site's HTTP session acquires the cookies its download URLs require.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SiteBootstrap {
    /// Issue one priming GET against the base URL so the server can set
    /// session cookies on a pre-seeded jar.
    Prime,
    /// Run an external command that writes a Netscape cookie-jar file, then
    /// load it.
    CookieTool { command: Vec<String> },
    /// No cookie bootstrap needed.
    Plain,
}

/// Opaque per-site configuration record: values, not behavior.
#[derive(Debug, Deserialize, Clone)]
pub struct SiteProfile {
    pub base_url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Statically configured cookies seeded into the jar before any request.
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    pub bootstrap: SiteBootstrap,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_workspace = default_workspace_path()?;
    let builder = Config::builder()
        .set_default(
            "workspace.path",
            default_workspace.to_string_lossy().to_string(),
        )?
        .set_default("workers.download_concurrency", 3)?
        .set_default("workers.extraction_concurrency", 1)?
        .set_default("workers.shutdown_timeout_secs", 5)?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("KRITES").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "krites", "krites").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_workspace_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}
