//! Task rows for the download and extraction pipelines.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{current_timestamp_ms, decode_doc, get_doc, put_doc, DbError, ReviewDb};

/// Lifecycle state of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Running,
    Success,
    Failed,
}

/// One request to fetch a URL into a stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub task_id: String,
    pub source_url: String,
    pub site: Option<String>,
    pub status: DownloadStatus,
    pub file_hash: Option<String>,
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

impl DownloadTask {
    #[must_use]
    pub fn new(source_url: impl Into<String>, site: Option<String>) -> Self {
        let source_url = source_url.into();
        debug_assert!(!source_url.is_empty());
        Self {
            task_id: Uuid::new_v4().to_string(),
            source_url,
            site,
            status: DownloadStatus::Queued,
            file_hash: None,
            error: None,
            created_at_ms: current_timestamp_ms(),
            started_at_ms: None,
            completed_at_ms: None,
        }
    }

    /// Reset a failed task so it can be re-queued. Clears the prior error and
    /// run timestamps.
    pub fn reset_for_retry(&mut self) {
        self.status = DownloadStatus::Queued;
        self.error = None;
        self.started_at_ms = None;
        self.completed_at_ms = None;
    }
}

/// Lifecycle state of an extraction task. `Canceled` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    Sync,
    Batch,
    Background,
}

/// Provider-specific quality/cost class for an LLM request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTier {
    Auto,
    Default,
    Flex,
    Priority,
    Scale,
}

impl ServiceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceTier::Auto => "auto",
            ServiceTier::Default => "default",
            ServiceTier::Flex => "flex",
            ServiceTier::Priority => "priority",
            ServiceTier::Scale => "scale",
        }
    }
}

/// One LLM extraction run over one stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub task_id: String,
    pub file_hash: Option<String>,
    pub mode: ExtractionMode,
    pub provider: String,
    pub model: Option<String>,
    pub service_tier: Option<ServiceTier>,
    #[serde(default)]
    pub external_ids: Option<serde_json::Value>,
    pub status: ExtractionStatus,

    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub input_tokens: Option<u64>,
    pub cached_input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost_usd: Option<f64>,

    pub response_path: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,

    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

impl ExtractionTask {
    #[must_use]
    pub fn new(file_hash: impl Into<String>) -> Self {
        let file_hash = file_hash.into();
        debug_assert!(!file_hash.is_empty());
        Self {
            task_id: Uuid::new_v4().to_string(),
            file_hash: Some(file_hash),
            mode: ExtractionMode::Sync,
            provider: "openai".to_string(),
            model: None,
            service_tier: None,
            external_ids: None,
            status: ExtractionStatus::Queued,
            prompt_tokens: None,
            completion_tokens: None,
            input_tokens: None,
            cached_input_tokens: None,
            output_tokens: None,
            cost_usd: None,
            response_path: None,
            error: None,
            retry_count: 0,
            created_at_ms: current_timestamp_ms(),
            started_at_ms: None,
            completed_at_ms: None,
        }
    }
}

impl ReviewDb {
    pub fn create_download_task(&self, task: &DownloadTask) -> Result<(), DbError> {
        debug_assert!(!task.task_id.is_empty());
        let mut wtxn = self.env().write_txn()?;
        put_doc(self.download_tasks_db(), &mut wtxn, &task.task_id, task)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_download_task(&self, task_id: &str) -> Result<Option<DownloadTask>, DbError> {
        let rtxn = self.env().read_txn()?;
        get_doc(self.download_tasks_db(), &rtxn, task_id)
    }

    /// Read-modify-write a download task row in one transaction.
    pub fn update_download_task<F>(&self, task_id: &str, mutate: F) -> Result<DownloadTask, DbError>
    where
        F: FnOnce(&mut DownloadTask),
    {
        let mut wtxn = self.env().write_txn()?;
        let raw = self
            .download_tasks_db()
            .get(&wtxn, task_id)?
            .ok_or(DbError::NotFound {
                kind: "download task",
                key: task_id.to_string(),
            })?;
        let mut task: DownloadTask = decode_doc(raw)?;
        mutate(&mut task);
        put_doc(self.download_tasks_db(), &mut wtxn, task_id, &task)?;
        wtxn.commit()?;
        Ok(task)
    }

    pub fn list_download_tasks_by_status(
        &self,
        status: DownloadStatus,
    ) -> Result<Vec<DownloadTask>, DbError> {
        let rtxn = self.env().read_txn()?;
        let mut out = Vec::new();
        for entry in self.download_tasks_db().iter(&rtxn)? {
            let (_, raw) = entry?;
            let task: DownloadTask = decode_doc(raw)?;
            if task.status == status {
                out.push(task);
            }
        }
        Ok(out)
    }

    pub fn create_extraction_task(&self, task: &ExtractionTask) -> Result<(), DbError> {
        debug_assert!(!task.task_id.is_empty());
        let mut wtxn = self.env().write_txn()?;
        put_doc(self.extraction_tasks_db(), &mut wtxn, &task.task_id, task)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_extraction_task(&self, task_id: &str) -> Result<Option<ExtractionTask>, DbError> {
        let rtxn = self.env().read_txn()?;
        get_doc(self.extraction_tasks_db(), &rtxn, task_id)
    }

    /// Read-modify-write an extraction task row in one transaction. The
    /// mutation runs unconditionally; cancellation-aware writes go through
    /// [`ReviewDb::finish_extraction`] or [`ReviewDb::cancel_extraction_if`].
    pub fn update_extraction_task<F>(
        &self,
        task_id: &str,
        mutate: F,
    ) -> Result<ExtractionTask, DbError>
    where
        F: FnOnce(&mut ExtractionTask),
    {
        let mut wtxn = self.env().write_txn()?;
        let raw = self
            .extraction_tasks_db()
            .get(&wtxn, task_id)?
            .ok_or(DbError::NotFound {
                kind: "extraction task",
                key: task_id.to_string(),
            })?;
        let mut task: ExtractionTask = decode_doc(raw)?;
        mutate(&mut task);
        put_doc(self.extraction_tasks_db(), &mut wtxn, task_id, &task)?;
        wtxn.commit()?;
        Ok(task)
    }

    /// Write an extraction task's final result unless the row has been
    /// canceled in the meantime. The status re-read and the write share one
    /// transaction, so cancellation always wins the race with completion.
    /// Returns false when the row was left untouched.
    pub fn finish_extraction<F>(&self, task_id: &str, mutate: F) -> Result<bool, DbError>
    where
        F: FnOnce(&mut ExtractionTask),
    {
        let mut wtxn = self.env().write_txn()?;
        let raw = self
            .extraction_tasks_db()
            .get(&wtxn, task_id)?
            .ok_or(DbError::NotFound {
                kind: "extraction task",
                key: task_id.to_string(),
            })?;
        let mut task: ExtractionTask = decode_doc(raw)?;
        if task.status == ExtractionStatus::Canceled {
            return Ok(false);
        }
        mutate(&mut task);
        put_doc(self.extraction_tasks_db(), &mut wtxn, task_id, &task)?;
        wtxn.commit()?;
        Ok(true)
    }

    /// Transition a task to `Canceled` with the given message, but only when
    /// its current status is listed in `from`. Used by the shutdown sequence
    /// for both never-started and timed-out executions.
    pub fn cancel_extraction_if(
        &self,
        task_id: &str,
        from: &[ExtractionStatus],
        message: &str,
    ) -> Result<bool, DbError> {
        let mut wtxn = self.env().write_txn()?;
        let Some(raw) = self.extraction_tasks_db().get(&wtxn, task_id)? else {
            return Ok(false);
        };
        let mut task: ExtractionTask = decode_doc(raw)?;
        if !from.contains(&task.status) {
            return Ok(false);
        }
        task.status = ExtractionStatus::Canceled;
        task.error = Some(message.to_string());
        task.completed_at_ms = Some(current_timestamp_ms());
        put_doc(self.extraction_tasks_db(), &mut wtxn, task_id, &task)?;
        wtxn.commit()?;
        Ok(true)
    }

    pub fn list_extraction_tasks_by_status(
        &self,
        status: ExtractionStatus,
        mode: Option<ExtractionMode>,
    ) -> Result<Vec<ExtractionTask>, DbError> {
        let rtxn = self.env().read_txn()?;
        let mut out = Vec::new();
        for entry in self.extraction_tasks_db().iter(&rtxn)? {
            let (_, raw) = entry?;
            let task: ExtractionTask = decode_doc(raw)?;
            if task.status != status {
                continue;
            }
            if let Some(mode) = mode {
                if task.mode != mode {
                    continue;
                }
            }
            out.push(task);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;
    use tempfile::TempDir;

    fn open_db() -> (TempDir, ReviewDb) {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let db = ReviewDb::open(&paths).expect("open db");
        (temp, db)
    }

    #[test]
    fn download_task_retry_resets_run_state() {
        let mut task = DownloadTask::new("https://example.com/a.pdf", Some("rs".to_string()));
        task.status = DownloadStatus::Failed;
        task.error = Some("boom".to_string());
        task.started_at_ms = Some(1);
        task.completed_at_ms = Some(2);

        task.reset_for_retry();

        assert_eq!(task.status, DownloadStatus::Queued);
        assert!(task.error.is_none());
        assert!(task.started_at_ms.is_none());
        assert!(task.completed_at_ms.is_none());
    }

    #[test]
    fn update_download_task_persists() {
        let (_temp, db) = open_db();
        let task = DownloadTask::new("https://example.com/a.pdf", None);
        db.create_download_task(&task).expect("create");

        let updated = db
            .update_download_task(&task.task_id, |t| {
                t.status = DownloadStatus::Running;
                t.started_at_ms = Some(current_timestamp_ms());
            })
            .expect("update");
        assert_eq!(updated.status, DownloadStatus::Running);

        let fetched = db
            .get_download_task(&task.task_id)
            .expect("get")
            .expect("present");
        assert_eq!(fetched.status, DownloadStatus::Running);
    }

    #[test]
    fn finish_extraction_refuses_to_overwrite_canceled() {
        let (_temp, db) = open_db();
        let task = ExtractionTask::new("aa11");
        db.create_extraction_task(&task).expect("create");

        assert!(db
            .cancel_extraction_if(
                &task.task_id,
                &[ExtractionStatus::Queued],
                "canceled before start due to shutdown",
            )
            .expect("cancel"));

        let wrote = db
            .finish_extraction(&task.task_id, |t| {
                t.status = ExtractionStatus::Succeeded;
            })
            .expect("finish");
        assert!(!wrote);

        let fetched = db
            .get_extraction_task(&task.task_id)
            .expect("get")
            .expect("present");
        assert_eq!(fetched.status, ExtractionStatus::Canceled);
    }

    #[test]
    fn cancel_extraction_if_respects_source_states() {
        let (_temp, db) = open_db();
        let mut task = ExtractionTask::new("bb22");
        task.status = ExtractionStatus::Succeeded;
        db.create_extraction_task(&task).expect("create");

        let canceled = db
            .cancel_extraction_if(
                &task.task_id,
                &[ExtractionStatus::Running],
                "aborted by shutdown",
            )
            .expect("cancel attempt");
        assert!(!canceled, "finished tasks must not be overwritten");
    }

    #[test]
    fn list_by_status_filters_mode() {
        let (_temp, db) = open_db();
        let mut sync_task = ExtractionTask::new("aa11");
        sync_task.status = ExtractionStatus::Failed;
        let mut batch_task = ExtractionTask::new("bb22");
        batch_task.mode = ExtractionMode::Batch;
        batch_task.status = ExtractionStatus::Failed;
        db.create_extraction_task(&sync_task).expect("create");
        db.create_extraction_task(&batch_task).expect("create");

        let all = db
            .list_extraction_tasks_by_status(ExtractionStatus::Failed, None)
            .expect("list");
        assert_eq!(all.len(), 2);

        let batch_only = db
            .list_extraction_tasks_by_status(ExtractionStatus::Failed, Some(ExtractionMode::Batch))
            .expect("list");
        assert_eq!(batch_only.len(), 1);
        assert_eq!(batch_only[0].task_id, batch_task.task_id);
    }
}
