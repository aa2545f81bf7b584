//! Drives one task from `PROCESSING` to a terminal state.

use chrono::Utc;
use tracing::{error, info, warn};

use tryon_core::TryOnTask;

use crate::blob::{self, BlobError, DynBlobStore};
use crate::composition::{CompositionError, CompositionOutput, CompositionRequest, DynComposer};
use crate::fetch::{FetchError, RetryFetcher};
use crate::store::DynRecordStore;

/// Message recorded for failures that are not the service's own refusal.
pub const GENERIC_FAILURE: &str = "Image generation failed. Please try again.";

/// What the worker did with a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed { result_url: String },
    Failed { message: String },
    /// The task was already terminal; nothing was written.
    AlreadyTerminal,
    /// The terminal state could not be recorded.
    Unrecorded { reason: String },
}

#[derive(Debug, thiserror::Error)]
enum ProcessError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Compose(#[from] CompositionError),
    #[error(transparent)]
    Upload(#[from] BlobError),
    #[error("refused: {0}")]
    Refused(String),
}

#[derive(Clone)]
pub struct ProcessingWorker {
    records: DynRecordStore,
    blobs: DynBlobStore,
    fetcher: RetryFetcher,
    composer: DynComposer,
}

impl ProcessingWorker {
    pub fn new(records: DynRecordStore, blobs: DynBlobStore, fetcher: RetryFetcher, composer: DynComposer) -> Self {
        Self {
            records,
            blobs,
            fetcher,
            composer,
        }
    }

    /// Process `task` and record the terminal state. Never returns an error.
    pub async fn process(&self, task: &TryOnTask) -> WorkerOutcome {
        if task.status.is_terminal() {
            return WorkerOutcome::AlreadyTerminal;
        }

        match self.run(task).await {
            Ok(result_url) => match self.records.complete_task(task.id, &result_url, Utc::now()).await {
                Ok(true) => {
                    info!(task_id = %task.id, "task completed");
                    WorkerOutcome::Completed { result_url }
                }
                Ok(false) => already_terminal(task),
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "could not record completion");
                    WorkerOutcome::Unrecorded { reason: e.to_string() }
                }
            },
            Err(ProcessError::Refused(text)) => {
                warn!(task_id = %task.id, refusal = %text, "composition refused");
                self.fail(task, text).await
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "task processing failed");
                self.fail(task, GENERIC_FAILURE.to_string()).await
            }
        }
    }

    async fn run(&self, task: &TryOnTask) -> Result<String, ProcessError> {
        let subject = self.fetcher.fetch(&task.subject_url).await?;
        let item = self.fetcher.fetch(&task.item_url).await?;

        let output = self
            .composer
            .compose(CompositionRequest {
                subject,
                item,
                instructions: task.category.instructions().to_string(),
            })
            .await?;

        match output {
            CompositionOutput::Url(url) => Ok(url),
            CompositionOutput::Inline { bytes, content_type } => {
                let path = blob::result_path(task.user_id, task.id, blob::extension_for(&content_type));
                let stored = self.blobs.put(&path, bytes, &content_type).await?;
                Ok(stored.url)
            }
            CompositionOutput::Refusal(text) => Err(ProcessError::Refused(text)),
        }
    }

    async fn fail(&self, task: &TryOnTask, message: String) -> WorkerOutcome {
        match self.records.fail_task(task.id, &message, Utc::now()).await {
            Ok(true) => WorkerOutcome::Failed { message },
            Ok(false) => already_terminal(task),
            Err(e) => {
                error!(task_id = %task.id, error = %e, "could not record failure");
                WorkerOutcome::Unrecorded { reason: e.to_string() }
            }
        }
    }
}

fn already_terminal(task: &TryOnTask) -> WorkerOutcome {
    warn!(task_id = %task.id, "task reached a terminal state elsewhere");
    WorkerOutcome::AlreadyTerminal
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tryon_core::{ItemCategory, TaskId, TaskStatus, UserAccount, UserId};

    use crate::blob::{BlobStore, InMemoryBlobStore};
    use crate::retry::RetryPolicy;
    use crate::store::{InMemoryRecordStore, RecordStore};
    use crate::testing::{PNG_BYTES, ScriptedComposer};

    struct Fixture {
        worker: ProcessingWorker,
        records: Arc<InMemoryRecordStore>,
        blobs: Arc<InMemoryBlobStore>,
        composer: Arc<ScriptedComposer>,
    }

    fn fixture() -> Fixture {
        let records = Arc::new(InMemoryRecordStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new("https://blob.test"));
        let composer = Arc::new(ScriptedComposer::new());
        let fetcher = RetryFetcher::new(
            blobs.clone(),
            RetryPolicy::linear(3, Duration::from_millis(1)),
            Duration::from_secs(1),
        );
        let worker = ProcessingWorker::new(records.clone(), blobs.clone(), fetcher, composer.clone());
        Fixture {
            worker,
            records,
            blobs,
            composer,
        }
    }

    async fn task(fx: &Fixture) -> TryOnTask {
        let user = UserId::new();
        fx.records.upsert_user(&UserAccount::new(user)).await.unwrap();
        let subject = fx.blobs.put(&format!("tryon/{user}/1-subject.png"), PNG_BYTES.to_vec(), "image/png").await.unwrap();
        let item = fx.blobs.put(&format!("tryon/{user}/1-item.png"), PNG_BYTES.to_vec(), "image/png").await.unwrap();
        let now = Utc::now();
        let task = TryOnTask::accepted(TaskId::new(), user, ItemCategory::Shoes, subject.url, item.url, Vec::new(), now, now);
        fx.records.insert_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn inline_result_is_uploaded_under_the_task_path() {
        let fx = fixture();
        let task = task(&fx).await;

        let outcome = fx.worker.process(&task).await;

        let expected = fx.blobs.url_for(&blob::result_path(task.user_id, task.id, "png"));
        assert_eq!(outcome, WorkerOutcome::Completed { result_url: expected.clone() });
        assert!(fx.blobs.contains_url(&expected));
        let stored = fx.records.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result_url, Some(expected));
    }

    #[tokio::test]
    async fn returned_url_is_used_as_is() {
        let fx = fixture();
        let task = task(&fx).await;
        fx.composer.push(Ok(CompositionOutput::Url("https://cdn.example/r.png".into())));

        let outcome = fx.worker.process(&task).await;

        assert_eq!(
            outcome,
            WorkerOutcome::Completed {
                result_url: "https://cdn.example/r.png".into()
            }
        );
    }

    #[tokio::test]
    async fn exhausted_fetch_is_recorded_as_generic_failure() {
        let fx = fixture();
        let task = task(&fx).await;
        fx.blobs.fail_next_fetches(3);

        let outcome = fx.worker.process(&task).await;

        assert_eq!(
            outcome,
            WorkerOutcome::Failed {
                message: GENERIC_FAILURE.into()
            }
        );
        assert_eq!(fx.composer.calls(), 0);
        let stored = fx.records.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some(GENERIC_FAILURE));
    }

    #[tokio::test]
    async fn undecodable_response_is_a_generic_failure() {
        let fx = fixture();
        let task = task(&fx).await;
        fx.composer.push(Err(CompositionError::Decode("missing field".into())));

        let outcome = fx.worker.process(&task).await;

        assert!(matches!(outcome, WorkerOutcome::Failed { message } if message == GENERIC_FAILURE));
    }

    #[tokio::test]
    async fn terminal_tasks_are_not_reprocessed() {
        let fx = fixture();
        let task = task(&fx).await;
        assert!(fx.records.fail_task(task.id, "earlier", Utc::now()).await.unwrap());

        // Stale snapshot still says PROCESSING; the conditional write refuses it.
        let outcome = fx.worker.process(&task).await;
        assert_eq!(outcome, WorkerOutcome::AlreadyTerminal);

        let stored = fx.records.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("earlier"));
    }
}
