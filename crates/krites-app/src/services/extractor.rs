//! Extraction worker pool with cancellation-aware shutdown.
//!
//! Queue items are `(task_id, force_rerun)`. Each accepted task executes in
//! its own spawned task so shutdown can bounded-wait the in-flight set via a
//! registry of completion signals. Every final status write goes through
//! `finish_extraction`, which never overwrites a canceled row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::db::tasks::{ExtractionMode, ExtractionStatus, ExtractionTask, ServiceTier};
use crate::db::{current_timestamp_ms, DbError, ReviewDb};
use crate::paths::AppPaths;
use crate::pipeline::extract::{run_extraction, ExtractionOutcomeStatus};
use crate::services::provider::ExtractionProvider;

const QUEUE_CAPACITY: usize = 1024;
const CANCELED_BEFORE_START: &str = "canceled before start due to shutdown";
const ABORTED_BY_SHUTDOWN: &str = "aborted by shutdown (timed out waiting)";

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error(transparent)]
    Db(#[from] DbError),
}

enum QueueItem {
    Task { task_id: String, force_rerun: bool },
    Stop,
}

/// Pool of extraction workers sharing one task queue.
pub struct ExtractionWorker {
    db: ReviewDb,
    paths: AppPaths,
    provider: Arc<dyn ExtractionProvider>,
    concurrency: usize,
    shutting_down: AtomicBool,
    tx: Mutex<Option<mpsc::Sender<QueueItem>>>,
    rx: Mutex<Option<Arc<Mutex<mpsc::Receiver<QueueItem>>>>>,
    workers: Mutex<Option<JoinSet<()>>>,
    /// Completion signal per in-flight task. The sender side flips to true
    /// when the execution finishes, however it finishes.
    inflight: Mutex<HashMap<String, watch::Receiver<bool>>>,
}

impl ExtractionWorker {
    pub fn new(
        db: ReviewDb,
        paths: AppPaths,
        provider: Arc<dyn ExtractionProvider>,
        concurrency: usize,
    ) -> Self {
        debug_assert!(concurrency > 0);
        Self {
            db,
            paths,
            provider,
            concurrency,
            shutting_down: AtomicBool::new(false),
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            workers: Mutex::new(None),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the worker pool. Calling start on a running pool is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut tx_slot = self.tx.lock().await;
        if tx_slot.is_some() {
            return;
        }
        self.shutting_down.store(false, Ordering::SeqCst);
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
            stage = "extract_start",
            "extraction worker pool started"
        );
    }

    /// Create the queued task row and hand it to the pool. During shutdown
    /// the row is still created as an audit record but never queued; it is
    /// reconciled to canceled on the spot.
    pub async fn enqueue(
        &self,
        file_hash: &str,
        force_rerun: bool,
        mode: ExtractionMode,
        service_tier: Option<ServiceTier>,
    ) -> Result<ExtractionTask, ExtractorError> {
        let mut task = ExtractionTask::new(file_hash);
        task.mode = mode;
        task.service_tier = service_tier;
        self.db.create_extraction_task(&task)?;

        if self.shutting_down.load(Ordering::SeqCst) {
            self.db.cancel_extraction_if(
                &task.task_id,
                &[ExtractionStatus::Queued],
                CANCELED_BEFORE_START,
            )?;
            let task = self
                .db
                .get_extraction_task(&task.task_id)?
                .ok_or(DbError::NotFound {
                    kind: "extraction task",
                    key: task.task_id.clone(),
                })?;
            warn!(
                task_id = %task.task_id,
                file_hash,
                stage = "extract_enqueue",
                "enqueued during shutdown; row recorded as canceled"
            );
            return Ok(task);
        }

        let guard = self.tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            let item = QueueItem::Task {
                task_id: task.task_id.clone(),
                force_rerun,
            };
            if tx.send(item).await.is_err() {
                warn!(
                    task_id = %task.task_id,
                    stage = "extract_enqueue",
                    "queue closed; row left queued"
                );
            }
        } else {
            warn!(
                task_id = %task.task_id,
                stage = "extract_enqueue",
                "worker not running; row left queued"
            );
        }
        debug!(
            task_id = %task.task_id,
            file_hash,
            force_rerun,
            stage = "extract_enqueue",
            "queued extraction task"
        );
        Ok(task)
    }

    /// Stop the pool. With `drain` the queue runs to completion. Otherwise:
    /// queued rows are marked canceled without starting, in-flight
    /// executions get up to `timeout` to finish, and whatever is still
    /// running is recorded as canceled. The underlying execution is not
    /// killed; the absorbing canceled status keeps its late write out.
    pub async fn stop(&self, drain: bool, timeout: Duration) {
        let Some(tx) = self.tx.lock().await.take() else {
            return;
        };

        if drain {
            // The flag stays clear so workers keep executing the queue; the
            // sentinels sit behind the remaining work.
            for _ in 0..self.concurrency {
                let _ = tx.send(QueueItem::Stop).await;
            }
            drop(tx);
            if let Some(mut join_set) = self.workers.lock().await.take() {
                while join_set.join_next().await.is_some() {}
            }
            self.shutting_down.store(true, Ordering::SeqCst);
        } else {
            self.shutting_down.store(true, Ordering::SeqCst);
            drop(tx);
            self.cancel_all_queued().await;
            self.await_inflight_with_timeout(timeout).await;
            if let Some(mut join_set) = self.workers.lock().await.take() {
                // Worker loops may still be awaiting executions that
                // overstayed the timeout; their rows are already canceled.
                join_set.abort_all();
            }
            self.sweep_queued_rows();
        }

        self.rx.lock().await.take();
        self.inflight.lock().await.clear();
        info!(stage = "extract_stop", "extraction worker pool stopped");
    }

    async fn cancel_all_queued(&self) {
        let Some(rx) = self.rx.lock().await.take() else {
            return;
        };
        let mut guard = rx.lock().await;
        let mut canceled = 0_usize;
        while let Ok(item) = guard.try_recv() {
            if let QueueItem::Task { task_id, .. } = item {
                match self.db.cancel_extraction_if(
                    &task_id,
                    &[ExtractionStatus::Queued],
                    CANCELED_BEFORE_START,
                ) {
                    Ok(true) => canceled += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, stage = "extract_stop", "failed to cancel queued task");
                    }
                }
            }
        }
        if canceled > 0 {
            info!(
                canceled,
                stage = "extract_stop",
                "canceled queued extraction tasks"
            );
        }
    }

    /// Reconcile queued rows that never went through the channel drain:
    /// items a worker dequeued and skipped after the flag was set, and rows
    /// created while the pool was not accepting work.
    fn sweep_queued_rows(&self) {
        let queued = match self
            .db
            .list_extraction_tasks_by_status(ExtractionStatus::Queued, None)
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, stage = "extract_stop", "failed to list queued rows for sweep");
                return;
            }
        };
        let mut canceled = 0_usize;
        for row in queued {
            match self.db.cancel_extraction_if(
                &row.task_id,
                &[ExtractionStatus::Queued],
                CANCELED_BEFORE_START,
            ) {
                Ok(true) => canceled += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(task_id = %row.task_id, error = %err, stage = "extract_stop", "failed to sweep queued row");
                }
            }
        }
        if canceled > 0 {
            info!(
                canceled,
                stage = "extract_stop",
                "swept queued extraction rows to canceled"
            );
        }
    }

    async fn await_inflight_with_timeout(&self, timeout: Duration) {
        let snapshot: Vec<(String, watch::Receiver<bool>)> = {
            let inflight = self.inflight.lock().await;
            inflight
                .iter()
                .map(|(id, rx)| (id.clone(), rx.clone()))
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for (task_id, mut done_rx) in snapshot {
            if *done_rx.borrow() {
                continue;
            }
            let waited = tokio::time::timeout_at(deadline, done_rx.changed()).await;
            let finished = match waited {
                Ok(_) => *done_rx.borrow(),
                Err(_) => false,
            };
            if !finished {
                match self.db.cancel_extraction_if(
                    &task_id,
                    &[ExtractionStatus::Running],
                    ABORTED_BY_SHUTDOWN,
                ) {
                    Ok(true) => {
                        warn!(
                            task_id = %task_id,
                            stage = "extract_stop",
                            "in-flight extraction exceeded shutdown timeout; recorded as canceled"
                        );
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, stage = "extract_stop", "failed to cancel in-flight task");
                    }
                }
            }
        }
    }

    async fn run_worker(self: Arc<Self>, worker_idx: usize, rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>) {
        loop {
            let item = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            match item {
                Some(QueueItem::Task {
                    task_id,
                    force_rerun,
                }) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        // Leave the row for the shutdown sweep.
                        continue;
                    }
                    self.process_task(worker_idx, task_id, force_rerun).await;
                }
                Some(QueueItem::Stop) | None => {
                    debug!(
                        worker = worker_idx,
                        stage = "extract_worker_exit",
                        "extraction worker terminating"
                    );
                    break;
                }
            }
        }
    }

    async fn process_task(self: &Arc<Self>, worker_idx: usize, task_id: String, force_rerun: bool) {
        let task = match self.db.get_extraction_task(&task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %task_id, stage = "extract_task", "queued task row missing");
                return;
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, stage = "extract_task", "failed to load task");
                return;
            }
        };
        if !matches!(
            task.status,
            ExtractionStatus::Queued | ExtractionStatus::Failed
        ) {
            debug!(
                task_id = %task_id,
                status = ?task.status,
                stage = "extract_task",
                "skipping task no longer runnable"
            );
            return;
        }
        let Some(file_hash) = task.file_hash.clone() else {
            let result = self.db.finish_extraction(&task_id, |t| {
                t.status = ExtractionStatus::Failed;
                t.error = Some("task has no file hash".to_string());
                t.completed_at_ms = Some(current_timestamp_ms());
            });
            if let Err(err) = result {
                warn!(task_id = %task_id, error = %err, stage = "extract_task", "failed to record failure");
            }
            return;
        };

        if let Err(err) = self.db.update_extraction_task(&task_id, |t| {
            t.status = ExtractionStatus::Running;
            t.started_at_ms = Some(current_timestamp_ms());
        }) {
            warn!(task_id = %task_id, error = %err, stage = "extract_task", "failed to mark task running");
            return;
        }
        info!(
            worker = worker_idx,
            task_id = %task_id,
            file_hash = %file_hash,
            stage = "extract_run",
            "running extraction"
        );

        let (done_tx, done_rx) = watch::channel(false);
        self.inflight
            .lock()
            .await
            .insert(task_id.clone(), done_rx);

        // Separate execution context: the worker awaits the handle, while
        // shutdown watches the registry instead of this loop.
        let this = Arc::clone(self);
        let exec_task_id = task_id.clone();
        let mode = task.mode;
        let handle = tokio::spawn(async move {
            let outcome = run_extraction(
                &this.db,
                &this.paths,
                this.provider.as_ref(),
                &file_hash,
                force_rerun,
                mode,
            )
            .await;
            this.record_outcome(&exec_task_id, outcome).await;
        });

        if let Err(err) = handle.await {
            warn!(task_id = %task_id, error = %err, stage = "extract_task", "extraction execution aborted");
            let result = self.db.finish_extraction(&task_id, |t| {
                t.status = ExtractionStatus::Failed;
                t.error = Some(format!("execution aborted: {err}"));
                t.completed_at_ms = Some(current_timestamp_ms());
            });
            if let Err(err) = result {
                warn!(task_id = %task_id, error = %err, stage = "extract_task", "failed to record abort");
            }
        }
        let _ = done_tx.send(true);
        self.inflight.lock().await.remove(&task_id);
    }

    async fn record_outcome(
        &self,
        task_id: &str,
        outcome: Result<crate::pipeline::extract::ExtractionOutcome, crate::pipeline::extract::ExtractError>,
    ) {
        let write = match outcome {
            Ok(outcome) => self.db.finish_extraction(task_id, |t| {
                t.status = match outcome.status {
                    ExtractionOutcomeStatus::Succeeded => ExtractionStatus::Succeeded,
                    // Duplicate requests are absorbed as canceled no-ops.
                    ExtractionOutcomeStatus::Skipped => ExtractionStatus::Canceled,
                };
                t.response_path = Some(outcome.out_path.display().to_string());
                t.cost_usd = Some(outcome.cost_usd);
                t.input_tokens = Some(outcome.usage.input_tokens);
                t.cached_input_tokens = Some(outcome.usage.cached_input_tokens);
                t.output_tokens = Some(outcome.usage.output_tokens);
                t.prompt_tokens =
                    Some(outcome.usage.input_tokens + outcome.usage.cached_input_tokens);
                t.completion_tokens = Some(outcome.usage.output_tokens);
                t.model = outcome.model.clone().or(t.model.take());
                t.service_tier = outcome.service_tier.or(t.service_tier);
                t.completed_at_ms = Some(current_timestamp_ms());
            }),
            Err(err) => self.db.finish_extraction(task_id, |t| {
                t.status = ExtractionStatus::Failed;
                t.error = Some(err.to_string());
                t.completed_at_ms = Some(current_timestamp_ms());
            }),
        };
        match write {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    task_id,
                    stage = "extract_task",
                    "task canceled during execution; result discarded"
                );
            }
            Err(err) => {
                warn!(task_id, error = %err, stage = "extract_task", "failed to record outcome");
            }
        }
    }
}
