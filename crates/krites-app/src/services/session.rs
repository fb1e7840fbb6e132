//! Per-site HTTP session management for the download pipeline.
//!
//! Each vendor site gets one lazily created [`reqwest::Client`] whose cookie
//! jar is bootstrapped according to the site's configured strategy. Sessions
//! are cached for the life of the manager and torn down at shutdown.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{SiteBootstrap, SiteProfile};
use crate::paths::{AppPaths, PathError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COOKIE_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session profile configured for site `{site}`")]
    UnknownSite { site: String },
    #[error("invalid base url `{url}` for site `{site}`")]
    InvalidBaseUrl { site: String, url: String },
    #[error("invalid header `{name}` for site `{site}`")]
    InvalidHeader { site: String, name: String },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("cookie tool for site `{site}` failed: {reason}")]
    CookieTool { site: String, reason: String },
    #[error("failed to read cookie jar {path}: {source}")]
    CookieJarRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lazily builds and caches one HTTP client per configured site.
pub struct SiteSessionManager {
    paths: AppPaths,
    profiles: HashMap<String, SiteProfile>,
    clients: Mutex<HashMap<String, Client>>,
}

impl SiteSessionManager {
    pub fn new(paths: AppPaths, profiles: HashMap<String, SiteProfile>) -> Self {
        Self {
            paths,
            profiles,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Client for downloads without a site profile. Default headers only, no
    /// cookie bootstrap.
    pub fn plain_client(&self) -> Result<Client, SessionError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(client)
    }

    /// Get or create the session client for one site. The cache lock is held
    /// across lookup and creation so concurrent downloads for the same site
    /// never bootstrap twice.
    pub async fn client_for(&self, site: &str) -> Result<Client, SessionError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(site) {
            return Ok(client.clone());
        }

        let profile = self
            .profiles
            .get(site)
            .ok_or_else(|| SessionError::UnknownSite {
                site: site.to_string(),
            })?;
        let client = self.bootstrap_session(site, profile).await?;
        clients.insert(site.to_string(), client.clone());
        Ok(client)
    }

    /// Drop one cached session. No-op when the site has no live session.
    pub async fn close_session(&self, site: &str) {
        let mut clients = self.clients.lock().await;
        if clients.remove(site).is_some() {
            info!(site, stage = "session_close", "closed site session");
        }
    }

    /// Drop every cached session. Called during shutdown.
    pub async fn close_all_sessions(&self) {
        let mut clients = self.clients.lock().await;
        let count = clients.len();
        clients.clear();
        if count > 0 {
            info!(count, stage = "session_close", "closed all site sessions");
        }
    }

    async fn bootstrap_session(
        &self,
        site: &str,
        profile: &SiteProfile,
    ) -> Result<Client, SessionError> {
        let base_url =
            Url::parse(&profile.base_url).map_err(|_| SessionError::InvalidBaseUrl {
                site: site.to_string(),
                url: profile.base_url.clone(),
            })?;
        let headers = build_headers(site, &profile.headers)?;

        let jar = Arc::new(Jar::default());
        for (name, value) in &profile.cookies {
            jar.add_cookie_str(&format!("{name}={value}"), &base_url);
        }

        match &profile.bootstrap {
            SiteBootstrap::CookieTool { command } => {
                let jar_path = self.paths.cookie_jar_path(site)?;
                if !jar_path.exists() {
                    run_cookie_tool(site, command).await?;
                }
                load_netscape_jar(&jar, &jar_path, &base_url)?;
            }
            SiteBootstrap::Prime | SiteBootstrap::Plain => {}
        }

        let client = Client::builder()
            .default_headers(headers)
            .cookie_provider(Arc::clone(&jar))
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        if profile.bootstrap == SiteBootstrap::Prime {
            // The priming GET lets the server stamp session cookies onto the
            // seeded jar. A failed prime is not fatal: the download itself may
            // still succeed, or fail with a clearer error.
            match client.get(base_url.clone()).send().await {
                Ok(response) => {
                    debug!(
                        site,
                        stage = "session_prime",
                        status = response.status().as_u16(),
                        "primed site session"
                    );
                }
                Err(err) => {
                    warn!(
                        site,
                        stage = "session_prime",
                        error = %err,
                        "priming request failed; continuing with seeded jar"
                    );
                }
            }
        }

        info!(site, stage = "session_open", "site session ready");
        Ok(client)
    }
}

fn build_headers(site: &str, raw: &HashMap<String, String>) -> Result<HeaderMap, SessionError> {
    let mut headers = HeaderMap::new();
    for (name, value) in raw {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| SessionError::InvalidHeader {
                site: site.to_string(),
                name: name.clone(),
            })?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| SessionError::InvalidHeader {
                site: site.to_string(),
                name: name.clone(),
            })?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

async fn run_cookie_tool(site: &str, command: &[String]) -> Result<(), SessionError> {
    let Some((program, args)) = command.split_first() else {
        return Err(SessionError::CookieTool {
            site: site.to_string(),
            reason: "empty command".to_string(),
        });
    };
    info!(site, stage = "cookie_tool", program = %program, "running cookie bootstrap tool");

    let run = Command::new(program).args(args).output();
    let output = tokio::time::timeout(COOKIE_TOOL_TIMEOUT, run)
        .await
        .map_err(|_| SessionError::CookieTool {
            site: site.to_string(),
            reason: format!("timed out after {}s", COOKIE_TOOL_TIMEOUT.as_secs()),
        })?
        .map_err(|err| SessionError::CookieTool {
            site: site.to_string(),
            reason: err.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SessionError::CookieTool {
            site: site.to_string(),
            reason: format!("exit status {}: {}", output.status, stderr.trim()),
        });
    }
    Ok(())
}

/// Load a Netscape-format cookie jar into the reqwest jar. Lines are
/// tab-separated with at least seven fields; fields six and seven carry the
/// cookie name and value.
fn load_netscape_jar(jar: &Jar, path: &Path, base_url: &Url) -> Result<(), SessionError> {
    let contents = std::fs::read_to_string(path).map_err(|source| SessionError::CookieJarRead {
        path: path.display().to_string(),
        source,
    })?;

    let mut loaded = 0_usize;
    for line in contents.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            continue;
        }
        let name = fields[5].trim();
        let value = fields[6].trim();
        if name.is_empty() {
            continue;
        }
        jar.add_cookie_str(&format!("{name}={value}"), base_url);
        loaded += 1;
    }
    debug!(
        path = %path.display(),
        loaded,
        stage = "cookie_jar_load",
        "loaded cookies from jar file"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn manager_with(profiles: HashMap<String, SiteProfile>) -> (TempDir, SiteSessionManager) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        (temp, SiteSessionManager::new(paths, profiles))
    }

    #[tokio::test]
    async fn unknown_site_is_an_error() {
        let (_temp, manager) = manager_with(HashMap::new());
        let err = manager.client_for("nonesuch").await.expect_err("no profile");
        assert!(matches!(err, SessionError::UnknownSite { ref site } if site == "nonesuch"));
    }

    #[tokio::test]
    async fn plain_bootstrap_creates_and_caches_client() {
        let mut profiles = HashMap::new();
        profiles.insert(
            "acme".to_string(),
            SiteProfile {
                base_url: "https://acme.example.com/".to_string(),
                headers: HashMap::from([(
                    "User-Agent".to_string(),
                    "krites/0.1".to_string(),
                )]),
                cookies: HashMap::new(),
                bootstrap: SiteBootstrap::Plain,
            },
        );
        let (_temp, manager) = manager_with(profiles);

        manager.client_for("acme").await.expect("first client");
        manager.client_for("acme").await.expect("cached client");
        assert_eq!(manager.clients.lock().await.len(), 1);

        manager.close_session("acme").await;
        manager.close_session("acme").await; // idempotent
        assert!(manager.clients.lock().await.is_empty());
    }

    #[tokio::test]
    async fn cookie_tool_bootstrap_reads_existing_jar() {
        let mut profiles = HashMap::new();
        profiles.insert(
            "vendor".to_string(),
            SiteProfile {
                base_url: "https://vendor.example.com/".to_string(),
                headers: HashMap::new(),
                cookies: HashMap::new(),
                bootstrap: SiteBootstrap::CookieTool {
                    command: vec!["false".to_string()],
                },
            },
        );
        let (_temp, manager) = manager_with(profiles);

        // Pre-existing jar file means the tool is never run.
        let jar_path = manager.paths.cookie_jar_path("vendor").expect("path");
        let mut file = std::fs::File::create(&jar_path).expect("create jar");
        writeln!(file, "# Netscape HTTP Cookie File").expect("write");
        writeln!(
            file,
            "vendor.example.com\tFALSE\t/\tTRUE\t0\tsessionid\tabc123"
        )
        .expect("write");
        writeln!(file, "malformed line without tabs").expect("write");

        manager.client_for("vendor").await.expect("client builds");
    }

    #[tokio::test]
    async fn cookie_tool_failure_is_fatal() {
        let mut profiles = HashMap::new();
        profiles.insert(
            "vendor".to_string(),
            SiteProfile {
                base_url: "https://vendor.example.com/".to_string(),
                headers: HashMap::new(),
                cookies: HashMap::new(),
                bootstrap: SiteBootstrap::CookieTool {
                    command: vec!["false".to_string()],
                },
            },
        );
        let (_temp, manager) = manager_with(profiles);

        let err = manager.client_for("vendor").await.expect_err("tool fails");
        assert!(matches!(err, SessionError::CookieTool { .. }));
    }
}
