//! Bounded pool running many tasks through one [`Stitcher`].

use std::any::Any;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, error, instrument};

use stitcher_shared::{DocumentTask, TaskState};

use crate::pipeline::Stitcher;

/// Runs at most `workers` tasks at a time; each task stays on one worker.
pub struct WorkerPool {
    stitcher: Arc<Stitcher>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(stitcher: Arc<Stitcher>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            stitcher,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Process `tasks`, returning them in submission order.
    ///
    /// A worker that panics yields its task as `FAILED`.
    #[instrument(skip_all, fields(tasks = tasks.len(), workers = self.workers))]
    pub async fn run(&self, tasks: Vec<DocumentTask>) -> Vec<DocumentTask> {
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let fallback = task.clone();
                let stitcher = Arc::clone(&self.stitcher);
                let permits = Arc::clone(&self.permits);
                let handle = tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    stitcher.process(task).await
                });
                (fallback, handle)
            })
            .collect();

        let mut finished = Vec::with_capacity(handles.len());
        for (mut fallback, handle) in handles {
            match handle.await {
                Ok(task) => finished.push(task),
                Err(e) => {
                    let reason = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        "cancelled".to_string()
                    };
                    error!(task_id = %fallback.id, %reason, "worker panicked");

                    if fallback.state == TaskState::New {
                        let _ = fallback.transition(TaskState::Processing);
                    }
                    if fallback.fail(format!("worker panicked: {reason}")).is_ok() {
                        self.stitcher.report(&fallback).await;
                    }
                    finished.push(fallback);
                }
            }
        }

        debug!(finished = finished.len(), "batch complete");
        finished
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
