//! Download worker pool: fetches datasheet URLs through per-site sessions and
//! lands the bytes in the content-addressed store.
//!
//! Tasks live as rows in the review database; the in-memory queue only
//! carries task ids. A task is attempted up to three times with a short
//! linear backoff before it is marked failed, and failed tasks can be
//! re-queued explicitly.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::db::tasks::{DownloadStatus, DownloadTask};
use crate::db::{current_timestamp_ms, DbError, ReviewDb};
use crate::paths::AppPaths;
use crate::services::file_store::{self, FileStoreError};
use crate::services::session::{SessionError, SiteSessionManager};

const QUEUE_CAPACITY: usize = 1024;
const MAX_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(600);
const FALLBACK_FILENAME: &str = "datasheet";
const DISCARDED_BY_SHUTDOWN: &str = "discarded by shutdown before starting";
const MAX_FILENAME_CHARS: usize = 180;
const MAX_FILENAME_BASE_CHARS: usize = 160;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] FileStoreError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("invalid download url `{url}`")]
    InvalidUrl { url: String },
    #[error("download worker is not running")]
    NotRunning,
    #[error("task `{task_id}` is {status:?}, only failed tasks can be retried")]
    NotRetryable {
        task_id: String,
        status: DownloadStatus,
    },
    #[error("server returned status {status}")]
    HttpStatus { status: StatusCode },
    #[error("server returned an empty body")]
    EmptyBody,
}

enum QueueItem {
    Task(String),
    Stop,
}

/// Pool of download workers sharing one task queue.
pub struct DownloadWorker {
    db: ReviewDb,
    paths: AppPaths,
    sessions: Arc<SiteSessionManager>,
    concurrency: usize,
    tx: Mutex<Option<mpsc::Sender<QueueItem>>>,
    rx: Mutex<Option<Arc<Mutex<mpsc::Receiver<QueueItem>>>>>,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl DownloadWorker {
    pub fn new(
        db: ReviewDb,
        paths: AppPaths,
        sessions: Arc<SiteSessionManager>,
        concurrency: usize,
    ) -> Self {
        debug_assert!(concurrency > 0);
        Self {
            db,
            paths,
            sessions,
            concurrency,
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            workers: Mutex::new(None),
        }
    }

    /// Spawn the worker pool. Calling start on a running pool is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut tx_slot = self.tx.lock().await;
        if tx_slot.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel::<QueueItem>(QUEUE_CAPACITY);
        let shared_rx = Arc::new(Mutex::new(rx));

        let mut join_set = JoinSet::new();
        for worker_idx in 0..self.concurrency {
            let this = Arc::clone(self);
            let rx = Arc::clone(&shared_rx);
            join_set.spawn(async move { this.run_worker(worker_idx, rx).await });
        }

        *tx_slot = Some(tx);
        *self.rx.lock().await = Some(shared_rx);
        *self.workers.lock().await = Some(join_set);
        info!(
            workers = self.concurrency,
            stage = "download_start",
            "download worker pool started"
        );
    }

    /// Create a queued task row and hand it to the pool.
    pub async fn enqueue(
        &self,
        source_url: &str,
        site: Option<String>,
    ) -> Result<DownloadTask, DownloadError> {
        Url::parse(source_url).map_err(|_| DownloadError::InvalidUrl {
            url: source_url.to_string(),
        })?;
        let task = DownloadTask::new(source_url, site);
        self.db.create_download_task(&task)?;
        self.push(QueueItem::Task(task.task_id.clone())).await?;
        debug!(
            task_id = %task.task_id,
            url = %task.source_url,
            stage = "download_enqueue",
            "queued download task"
        );
        Ok(task)
    }

    /// Re-queue a failed task. The row's error and run timestamps are cleared
    /// before it goes back on the queue.
    pub async fn retry(&self, task_id: &str) -> Result<DownloadTask, DownloadError> {
        let current = self
            .db
            .get_download_task(task_id)?
            .ok_or(DbError::NotFound {
                kind: "download task",
                key: task_id.to_string(),
            })?;
        if current.status != DownloadStatus::Failed {
            return Err(DownloadError::NotRetryable {
                task_id: task_id.to_string(),
                status: current.status,
            });
        }
        let task = self
            .db
            .update_download_task(task_id, DownloadTask::reset_for_retry)?;
        self.push(QueueItem::Task(task_id.to_string())).await?;
        info!(task_id, stage = "download_retry", "re-queued failed download");
        Ok(task)
    }

    /// Stop the pool. With `drain` the queue is worked to completion first;
    /// without it, queued tasks are failed with a shutdown error so `retry`
    /// can re-queue them later, and workers exit after the task in hand.
    pub async fn stop(&self, drain: bool) {
        let Some(tx) = self.tx.lock().await.take() else {
            return;
        };

        if drain {
            for _ in 0..self.concurrency {
                // Sentinels sit behind queued work, so the queue drains first.
                let _ = tx.send(QueueItem::Stop).await;
            }
        }
        drop(tx);

        if !drain {
            if let Some(rx) = self.rx.lock().await.take() {
                let mut guard = rx.lock().await;
                let mut discarded = 0_usize;
                while let Ok(item) = guard.try_recv() {
                    let QueueItem::Task(task_id) = item else {
                        continue;
                    };
                    let result = self.db.update_download_task(&task_id, |t| {
                        if t.status == DownloadStatus::Queued {
                            t.status = DownloadStatus::Failed;
                            t.error = Some(DISCARDED_BY_SHUTDOWN.to_string());
                            t.completed_at_ms = Some(current_timestamp_ms());
                        }
                    });
                    if let Err(err) = result {
                        warn!(task_id = %task_id, error = %err, stage = "download_stop", "failed to mark discarded task");
                    }
                    discarded += 1;
                }
                if discarded > 0 {
                    info!(
                        discarded,
                        stage = "download_stop",
                        "failed queued downloads for later retry"
                    );
                }
            }
        }

        if let Some(mut join_set) = self.workers.lock().await.take() {
            while join_set.join_next().await.is_some() {}
        }
        self.rx.lock().await.take();
        info!(stage = "download_stop", "download worker pool stopped");
    }

    async fn push(&self, item: QueueItem) -> Result<(), DownloadError> {
        let guard = self.tx.lock().await;
        let tx = guard.as_ref().ok_or(DownloadError::NotRunning)?;
        tx.send(item).await.map_err(|_| DownloadError::NotRunning)
    }

    async fn run_worker(&self, worker_idx: usize, rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>) {
        loop {
            let item = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            match item {
                Some(QueueItem::Task(task_id)) => {
                    self.process_task(worker_idx, &task_id).await;
                }
                Some(QueueItem::Stop) | None => {
                    debug!(
                        worker = worker_idx,
                        stage = "download_worker_exit",
                        "download worker terminating"
                    );
                    break;
                }
            }
        }
    }

    async fn process_task(&self, worker_idx: usize, task_id: &str) {
        let task = match self.db.get_download_task(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id, stage = "download_task", "queued task row missing");
                return;
            }
            Err(err) => {
                warn!(task_id, error = %err, stage = "download_task", "failed to load task");
                return;
            }
        };
        if !matches!(task.status, DownloadStatus::Queued | DownloadStatus::Failed) {
            debug!(
                task_id,
                status = ?task.status,
                stage = "download_task",
                "skipping task no longer runnable"
            );
            return;
        }

        if let Err(err) = self.db.update_download_task(task_id, |t| {
            t.status = DownloadStatus::Running;
            t.error = None;
            t.started_at_ms = Some(current_timestamp_ms());
        }) {
            warn!(task_id, error = %err, stage = "download_task", "failed to mark task running");
            return;
        }
        info!(
            worker = worker_idx,
            task_id,
            url = %task.source_url,
            stage = "download_run",
            "downloading"
        );

        let mut last_error = String::new();
        for attempt in 0..=MAX_RETRIES {
            match self.fetch_and_store(&task).await {
                Ok(file_hash) => {
                    let result = self.db.update_download_task(task_id, |t| {
                        t.status = DownloadStatus::Success;
                        t.file_hash = Some(file_hash.clone());
                        t.completed_at_ms = Some(current_timestamp_ms());
                    });
                    if let Err(err) = result {
                        warn!(task_id, error = %err, stage = "download_task", "failed to record success");
                    } else {
                        info!(
                            task_id,
                            file_hash = %file_hash,
                            stage = "download_done",
                            "download succeeded"
                        );
                    }
                    return;
                }
                Err(err) => {
                    last_error = error_chain(&err);
                    warn!(
                        task_id,
                        attempt = attempt + 1,
                        error = %last_error,
                        stage = "download_attempt",
                        "download attempt failed"
                    );
                    if attempt < MAX_RETRIES {
                        sleep(RETRY_BACKOFF * (attempt + 1)).await;
                    }
                }
            }
        }

        let result = self.db.update_download_task(task_id, |t| {
            t.status = DownloadStatus::Failed;
            t.error = Some(last_error.clone());
            t.completed_at_ms = Some(current_timestamp_ms());
        });
        if let Err(err) = result {
            warn!(task_id, error = %err, stage = "download_task", "failed to record failure");
        }
    }

    async fn fetch_and_store(&self, task: &DownloadTask) -> Result<String, DownloadError> {
        let client = match &task.site {
            Some(site) => self.sessions.client_for(site).await?,
            None => self.sessions.plain_client()?,
        };
        let url = Url::parse(&task.source_url).map_err(|_| DownloadError::InvalidUrl {
            url: task.source_url.clone(),
        })?;

        let response = client.get(url.clone()).send().await?;
        if response.status() != StatusCode::OK {
            return Err(DownloadError::HttpStatus {
                status: response.status(),
            });
        }
        if response.content_length() == Some(0) {
            return Err(DownloadError::EmptyBody);
        }

        let content_disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(DownloadError::EmptyBody);
        }

        let filename = guess_filename(
            content_disposition.as_deref(),
            &url,
            content_type.as_deref(),
        );
        let record = file_store::persist(
            &self.db,
            &self.paths,
            &bytes,
            &filename,
            Some(task.source_url.as_str()),
        )
        .await?;
        Ok(record.file_hash)
    }
}

/// Error text with the full source chain, outermost first. Stored on the
/// task row so an exhausted download keeps its underlying cause.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}

/// Best-effort filename for a downloaded document: Content-Disposition wins,
/// then URL hints, then a generic fallback. A `.pdf` extension is added when
/// the server declared a PDF body and the name has no extension.
fn guess_filename(content_disposition: Option<&str>, url: &Url, content_type: Option<&str>) -> String {
    let raw = content_disposition
        .and_then(filename_from_content_disposition)
        .or_else(|| filename_from_url(url))
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string());

    let mut name = sanitize_filename(&raw);
    let is_pdf = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("pdf"))
        .unwrap_or(false);
    if is_pdf && !name.contains('.') {
        name.push_str(".pdf");
    }
    name
}

fn cd_ext_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)filename\*\s*=\s*utf-8''([^;]+)"#).unwrap())
}

fn cd_quoted_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)filename\s*=\s*"([^"]+)""#).unwrap())
}

fn cd_bare_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)filename\s*=\s*([^;"]+)"#).unwrap())
}

/// Parse a filename out of a Content-Disposition header. The RFC 5987
/// `filename*` form takes precedence over the quoted and bare forms.
fn filename_from_content_disposition(value: &str) -> Option<String> {
    if let Some(caps) = cd_ext_regex().captures(value) {
        let decoded = percent_decode_str(caps[1].trim())
            .decode_utf8()
            .ok()?
            .to_string();
        if !decoded.trim().is_empty() {
            return Some(decoded);
        }
    }
    if let Some(caps) = cd_quoted_regex().captures(value) {
        let name = caps[1].trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    if let Some(caps) = cd_bare_regex().captures(value) {
        let name = caps[1].trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    None
}

const URL_NAME_KEYS: [&str; 4] = ["filename", "file", "name", "download"];

fn filename_from_url(url: &Url) -> Option<String> {
    for (key, value) in url.query_pairs() {
        if URL_NAME_KEYS.contains(&key.as_ref()) && !value.trim().is_empty() {
            return Some(value.trim().to_string());
        }
    }
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let decoded = percent_decode_str(segment).decode_utf8().ok()?.to_string();
    if decoded.trim().is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// Reduce an arbitrary name to something safe to put in the store: basename
/// only, printable characters, bounded length with the extension preserved.
fn sanitize_filename(raw: &str) -> String {
    let basename = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw);
    let cleaned: String = basename.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        return "file".to_string();
    }

    if trimmed.chars().count() <= MAX_FILENAME_CHARS {
        return trimmed.to_string();
    }
    match trimmed.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() && ext.chars().count() <= 16 => {
            let capped: String = base.chars().take(MAX_FILENAME_BASE_CHARS).collect();
            format!("{capped}.{ext}")
        }
        _ => trimmed.chars().take(MAX_FILENAME_CHARS).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("url parses")
    }

    #[test]
    fn content_disposition_rfc5987_wins() {
        let header = r#"attachment; filename="plain.pdf"; filename*=UTF-8''sch%C3%B6n.pdf"#;
        assert_eq!(
            filename_from_content_disposition(header).as_deref(),
            Some("schön.pdf")
        );
    }

    #[test]
    fn content_disposition_quoted_and_bare() {
        assert_eq!(
            filename_from_content_disposition(r#"attachment; filename="dc converter.pdf""#)
                .as_deref(),
            Some("dc converter.pdf")
        );
        assert_eq!(
            filename_from_content_disposition("inline; filename=px100.pdf").as_deref(),
            Some("px100.pdf")
        );
        assert_eq!(filename_from_content_disposition("attachment"), None);
    }

    #[test]
    fn url_query_keys_take_precedence_over_path() {
        let u = url("https://example.com/dl/123?file=px-100.pdf");
        assert_eq!(filename_from_url(&u).as_deref(), Some("px-100.pdf"));

        let u = url("https://example.com/files/px-200.pdf");
        assert_eq!(filename_from_url(&u).as_deref(), Some("px-200.pdf"));

        let u = url("https://example.com/");
        assert_eq!(filename_from_url(&u), None);
    }

    #[test]
    fn pdf_extension_added_when_content_type_is_pdf() {
        let u = url("https://example.com/dl?download=px100");
        assert_eq!(
            guess_filename(None, &u, Some("application/pdf")),
            "px100.pdf"
        );
        assert_eq!(guess_filename(None, &u, Some("text/html")), "px100");
    }

    #[test]
    fn fallback_filename_when_nothing_matches() {
        let u = url("https://example.com/");
        assert_eq!(guess_filename(None, &u, Some("application/pdf")), "datasheet.pdf");
    }

    #[test]
    fn sanitize_strips_paths_and_control_chars() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir\\evil.pdf"), "evil.pdf");
        assert_eq!(sanitize_filename("bad\u{0}name.pdf"), "badname.pdf");
        assert_eq!(sanitize_filename("  ...  "), "file");
    }

    #[test]
    fn sanitize_caps_length_preserving_extension() {
        let long = format!("{}.pdf", "a".repeat(300));
        let sanitized = sanitize_filename(&long);
        assert!(sanitized.ends_with(".pdf"));
        assert_eq!(sanitized.chars().count(), MAX_FILENAME_BASE_CHARS + 4);
    }

    #[test]
    fn error_chain_keeps_underlying_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = DownloadError::Store(FileStoreError::Write {
            file_hash: "aa11".to_string(),
            source: io,
        });
        let chain = error_chain(&err);
        assert!(chain.contains("aa11"));
        assert!(chain.contains("disk full"));
    }

    #[tokio::test]
    async fn running_transition_clears_stale_error() {
        use crate::db::ReviewDb;
        use crate::paths::AppPaths;
        use std::collections::HashMap;
        use tempfile::TempDir;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.pdf"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 stub".to_vec()),
            )
            .mount(&server)
            .await;

        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let db = ReviewDb::open(&paths).expect("open db");
        let sessions = Arc::new(SiteSessionManager::new(paths.clone(), HashMap::new()));
        let worker = DownloadWorker::new(db.clone(), paths, sessions, 1);

        let mut task = DownloadTask::new(format!("{}/a.pdf", server.uri()), None);
        task.error = Some("stale failure".to_string());
        db.create_download_task(&task).expect("create");

        worker.process_task(0, &task.task_id).await;

        let row = db
            .get_download_task(&task.task_id)
            .expect("get")
            .expect("row");
        assert_eq!(row.status, DownloadStatus::Success);
        assert!(row.error.is_none(), "stale error survives the run");
    }
}
