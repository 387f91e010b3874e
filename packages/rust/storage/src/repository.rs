//! The task repository boundary the pipeline reports state changes to.

use async_trait::async_trait;

use stitcher_shared::{DocumentTask, Result, StitchError, TaskState};

use crate::Storage;

/// Receives every state transition of a task.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Take exclusive ownership of a `NEW` task before any work starts.
    ///
    /// An error means another worker owns the task (or ownership could not be
    /// established) and the task must not be processed.
    async fn claim(&self, task: &DocumentTask) -> Result<()>;

    /// Persist a claimed task's later state.
    async fn record(&self, task: &DocumentTask) -> Result<()>;
}

/// Repository that persists nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRepository;

#[async_trait]
impl TaskRepository for NoopRepository {
    async fn claim(&self, _task: &DocumentTask) -> Result<()> {
        Ok(())
    }

    async fn record(&self, _task: &DocumentTask) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for Storage {
    /// Insert unknown tasks, then move the stored row from `NEW` to `PROCESSING`.
    async fn claim(&self, task: &DocumentTask) -> Result<()> {
        if task.state != TaskState::New {
            return Err(StitchError::AlreadyClaimed(task.id));
        }
        if self.get_task_record(&task.id).await?.is_none() {
            self.insert_task(task).await?;
        }
        if self.claim_task(&task.id).await? {
            Ok(())
        } else {
            Err(StitchError::AlreadyClaimed(task.id))
        }
    }

    /// Insert unknown tasks, update known ones.
    async fn record(&self, task: &DocumentTask) -> Result<()> {
        if self.get_task_record(&task.id).await?.is_none() {
            return self.insert_task(task).await;
        }
        self.update_task(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stitcher_shared::{Bundle, BundleDocument, Credential};
    use uuid::Uuid;

    fn task() -> DocumentTask {
        let bundle = Bundle::new(
            "Repository bundle",
            vec![BundleDocument {
                sort_index: 0,
                document_id: "doc-1".into(),
                filename: "a.pdf".into(),
                content_hash: None,
                page_range: None,
            }],
        );
        DocumentTask::new(bundle, Credential::new("t"))
    }

    #[tokio::test]
    async fn record_follows_the_task_lifecycle() {
        let tmp = std::env::temp_dir().join(format!("stitcher_test_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.unwrap();
        let mut task = task();

        storage.claim(&task).await.unwrap();
        task.transition(TaskState::Processing).unwrap();
        task.complete("store://docs/1".into()).unwrap();
        storage.record(&task).await.unwrap();

        let loaded = storage.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Done);
        assert!(loaded.bundle.is_stitched());
    }

    #[tokio::test]
    async fn copy_of_claimed_task_is_refused() {
        let tmp = std::env::temp_dir().join(format!("stitcher_test_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.unwrap();
        let task = task();
        storage.insert_task(&task).await.unwrap();
        let copy = task.clone();

        storage.claim(&task).await.unwrap();
        let err = storage.claim(&copy).await.unwrap_err();
        assert!(matches!(err, StitchError::AlreadyClaimed(id) if id == task.id));

        let record = storage.get_task_record(&task.id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Processing);
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn claim_after_completion_is_refused() {
        let tmp = std::env::temp_dir().join(format!("stitcher_test_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.unwrap();
        let mut task = task();
        let copy = task.clone();

        storage.claim(&task).await.unwrap();
        task.transition(TaskState::Processing).unwrap();
        task.complete("store://docs/1".into()).unwrap();
        storage.record(&task).await.unwrap();

        assert!(storage.claim(&copy).await.is_err());
        let loaded = storage.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.bundle.stitched_document_uri.as_deref(),
            Some("store://docs/1")
        );
    }

    #[tokio::test]
    async fn noop_repository_accepts_everything() {
        assert!(NoopRepository.claim(&task()).await.is_ok());
        assert!(NoopRepository.record(&task()).await.is_ok());
    }
}
