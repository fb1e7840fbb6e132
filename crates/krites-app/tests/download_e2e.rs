//! End-to-end tests for the download worker pool.
//!
//! Uses wiremock to simulate vendor servers: a successful download lands in
//! the content-addressed store, a persistently failing URL exhausts the
//! retry budget, and a failed task can be re-queued via `retry`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use krites_app::config::{SiteBootstrap, SiteProfile};
use krites_app::db::tasks::DownloadStatus;
use krites_app::db::ReviewDb;
use krites_app::paths::AppPaths;
use krites_app::services::{content_hash, DownloadWorker, SiteSessionManager};

const PDF_BODY: &[u8] = b"%PDF-1.4\nfake datasheet body\n%%EOF";

struct Harness {
    _temp: TempDir,
    paths: AppPaths,
    db: ReviewDb,
    worker: Arc<DownloadWorker>,
}

async fn start_worker(profiles: HashMap<String, SiteProfile>) -> Harness {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("paths");
    let db = ReviewDb::open(&paths).expect("open db");
    let sessions = Arc::new(SiteSessionManager::new(paths.clone(), profiles));
    let worker = Arc::new(DownloadWorker::new(db.clone(), paths.clone(), sessions, 2));
    worker.start().await;
    Harness {
        _temp: temp,
        paths,
        db,
        worker,
    }
}

async fn wait_for_terminal(db: &ReviewDb, task_id: &str) -> DownloadStatus {
    for _ in 0..200 {
        let task = db
            .get_download_task(task_id)
            .expect("get task")
            .expect("task row");
        if matches!(task.status, DownloadStatus::Success | DownloadStatus::Failed) {
            return task.status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("task {task_id} never reached a terminal status");
}

#[tokio::test]
async fn successful_download_lands_in_store() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/datasheets/px-100.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(PDF_BODY)
                .insert_header("content-type", "application/pdf")
                .insert_header(
                    "content-disposition",
                    r#"attachment; filename="px-100.pdf""#,
                ),
        )
        .mount(&server)
        .await;

    let harness = start_worker(HashMap::new()).await;
    let task = harness
        .worker
        .enqueue(&format!("{}/datasheets/px-100.pdf", server.uri()), None)
        .await
        .expect("enqueue");

    let status = wait_for_terminal(&harness.db, &task.task_id).await;
    assert_eq!(status, DownloadStatus::Success);

    let task = harness
        .db
        .get_download_task(&task.task_id)
        .expect("get")
        .expect("row");
    let file_hash = task.file_hash.expect("file hash recorded");
    assert_eq!(file_hash, content_hash(PDF_BODY));

    let record = harness
        .db
        .get_file(&file_hash)
        .expect("get file")
        .expect("file row");
    assert_eq!(record.filename, "px-100.pdf");
    assert_eq!(record.size_bytes, PDF_BODY.len() as u64);

    let stored = harness.paths.stored_file_path(&file_hash).expect("path");
    assert_eq!(std::fs::read(stored).expect("read stored"), PDF_BODY);

    harness.worker.stop(true).await;
}

#[tokio::test]
async fn failing_url_exhausts_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken.pdf"))
        .respond_with(ResponseTemplate::new(500))
        // One initial attempt plus two retries, never more.
        .expect(3)
        .mount(&server)
        .await;

    let harness = start_worker(HashMap::new()).await;
    let task = harness
        .worker
        .enqueue(&format!("{}/broken.pdf", server.uri()), None)
        .await
        .expect("enqueue");

    let status = wait_for_terminal(&harness.db, &task.task_id).await;
    assert_eq!(status, DownloadStatus::Failed);

    let task = harness
        .db
        .get_download_task(&task.task_id)
        .expect("get")
        .expect("row");
    assert!(task.error.expect("error recorded").contains("500"));
    assert!(task.file_hash.is_none());

    harness.worker.stop(true).await;
    server.verify().await;
}

#[tokio::test]
async fn empty_body_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/empty.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(Vec::new()))
        .mount(&server)
        .await;

    let harness = start_worker(HashMap::new()).await;
    let task = harness
        .worker
        .enqueue(&format!("{}/empty.pdf", server.uri()), None)
        .await
        .expect("enqueue");

    let status = wait_for_terminal(&harness.db, &task.task_id).await;
    assert_eq!(status, DownloadStatus::Failed);

    harness.worker.stop(true).await;
}

#[tokio::test]
async fn retry_requeues_a_failed_task() {
    let server = MockServer::start().await;
    // First round: always 500. Scoped mock dropped before the retry round.
    {
        let _guard = Mock::given(method("GET"))
            .and(path("/flaky.pdf"))
            .respond_with(ResponseTemplate::new(500))
            .mount_as_scoped(&server)
            .await;

        let harness = start_worker(HashMap::new()).await;
        let task = harness
            .worker
            .enqueue(&format!("{}/flaky.pdf", server.uri()), None)
            .await
            .expect("enqueue");
        assert_eq!(
            wait_for_terminal(&harness.db, &task.task_id).await,
            DownloadStatus::Failed
        );

        // Second round: server recovered.
        drop(_guard);
        Mock::given(method("GET"))
            .and(path("/flaky.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(PDF_BODY)
                    .insert_header("content-type", "application/pdf"),
            )
            .mount(&server)
            .await;

        let requeued = harness.worker.retry(&task.task_id).await.expect("retry");
        assert_eq!(requeued.status, DownloadStatus::Queued);
        assert!(requeued.error.is_none());

        assert_eq!(
            wait_for_terminal(&harness.db, &task.task_id).await,
            DownloadStatus::Success
        );

        // Only failed tasks can be retried.
        let err = harness
            .worker
            .retry(&task.task_id)
            .await
            .expect_err("success is not retryable");
        assert!(err.to_string().contains("only failed tasks"));

        harness.worker.stop(true).await;
    }
}

#[tokio::test]
async fn non_drain_stop_fails_queued_tasks_for_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(PDF_BODY)
                .insert_header("content-type", "application/pdf")
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&server)
        .await;

    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("paths");
    let db = ReviewDb::open(&paths).expect("open db");
    let sessions = Arc::new(SiteSessionManager::new(paths.clone(), HashMap::new()));
    let worker = Arc::new(DownloadWorker::new(db.clone(), paths, sessions, 1));
    worker.start().await;

    let first = worker
        .enqueue(&format!("{}/slow.pdf", server.uri()), None)
        .await
        .expect("enqueue first");
    let second = worker
        .enqueue(&format!("{}/slow.pdf", server.uri()), None)
        .await
        .expect("enqueue second");

    // With one worker, the second task sits in the queue while the first is
    // mid-request.
    let mut first_running = false;
    for _ in 0..200 {
        let status = db
            .get_download_task(&first.task_id)
            .expect("get")
            .expect("row")
            .status;
        if status == DownloadStatus::Running {
            first_running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(first_running, "first task never started");

    worker.stop(false).await;

    // The in-flight task ran to completion; the queued one failed with a
    // retryable shutdown error.
    assert_eq!(
        db.get_download_task(&first.task_id)
            .expect("get")
            .expect("row")
            .status,
        DownloadStatus::Success
    );
    let stranded = db
        .get_download_task(&second.task_id)
        .expect("get")
        .expect("row");
    assert_eq!(stranded.status, DownloadStatus::Failed);
    assert!(stranded
        .error
        .expect("error recorded")
        .contains("shutdown"));

    worker.start().await;
    let requeued = worker.retry(&second.task_id).await.expect("retry");
    assert_eq!(requeued.status, DownloadStatus::Queued);
    assert_eq!(
        wait_for_terminal(&db, &second.task_id).await,
        DownloadStatus::Success
    );
    worker.stop(true).await;
}

#[tokio::test]
async fn site_profile_session_serves_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dl/123"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(PDF_BODY)
                .insert_header("content-type", "application/pdf"),
        )
        .mount(&server)
        .await;

    let mut profiles = HashMap::new();
    profiles.insert(
        "acme".to_string(),
        SiteProfile {
            base_url: format!("{}/", server.uri()),
            headers: HashMap::from([("User-Agent".to_string(), "krites/0.1".to_string())]),
            cookies: HashMap::new(),
            bootstrap: SiteBootstrap::Plain,
        },
    );
    let harness = start_worker(profiles).await;

    let task = harness
        .worker
        .enqueue(
            &format!("{}/dl/123?filename=px-300.pdf", server.uri()),
            Some("acme".to_string()),
        )
        .await
        .expect("enqueue");
    assert_eq!(
        wait_for_terminal(&harness.db, &task.task_id).await,
        DownloadStatus::Success
    );

    let file_hash = harness
        .db
        .get_download_task(&task.task_id)
        .expect("get")
        .expect("row")
        .file_hash
        .expect("hash");
    let record = harness
        .db
        .get_file(&file_hash)
        .expect("get file")
        .expect("file row");
    assert_eq!(record.filename, "px-300.pdf");

    harness.worker.stop(true).await;
}
