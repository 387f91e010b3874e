//! Audit events for task and bundle mutations.
//!
//! Storage emits a [`MutationEvent`] for every insert and update through an
//! [`EventSink`]. The [`AuditDispatcher`] sink hands events to a fixed pool of
//! worker tasks over a bounded queue; emitting never blocks the writer, and a
//! full queue drops the event with a warning.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stitcher_shared::{Bundle, BundleId, DocumentTask, TaskId, TaskState};

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// State of the mutated entity right after the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "entity", rename_all = "lowercase")]
pub enum EntitySnapshot {
    Task {
        id: TaskId,
        bundle_id: BundleId,
        state: TaskState,
        failure_description: Option<String>,
    },
    Bundle {
        id: BundleId,
        title: String,
        document_count: usize,
        stitched_document_uri: Option<String>,
    },
}

impl From<&DocumentTask> for EntitySnapshot {
    fn from(task: &DocumentTask) -> Self {
        Self::Task {
            id: task.id,
            bundle_id: task.bundle.id,
            state: task.state,
            failure_description: task.failure_description.clone(),
        }
    }
}

impl From<&Bundle> for EntitySnapshot {
    fn from(bundle: &Bundle) -> Self {
        Self::Bundle {
            id: bundle.id,
            title: bundle.title.clone(),
            document_count: bundle.documents.len(),
            stitched_document_uri: bundle.stitched_document_uri.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationEvent {
    pub kind: MutationKind,
    pub entity: EntitySnapshot,
    pub at: DateTime<Utc>,
}

impl MutationEvent {
    pub fn new(kind: MutationKind, entity: impl Into<EntitySnapshot>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks and handlers
// ---------------------------------------------------------------------------

/// Receives mutation events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MutationEvent);
}

/// Processes events drained from the dispatcher queue.
#[async_trait]
pub trait AuditHandler: Send + Sync {
    async fn handle(&self, event: &MutationEvent);
}

/// Writes each event as a structured log line under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

#[async_trait]
impl AuditHandler for TracingAudit {
    async fn handle(&self, event: &MutationEvent) {
        match &event.entity {
            EntitySnapshot::Task {
                id,
                bundle_id,
                state,
                failure_description,
            } => info!(
                target: "audit",
                kind = ?event.kind,
                task_id = %id,
                bundle_id = %bundle_id,
                state = %state,
                failure = failure_description.as_deref().unwrap_or(""),
                at = %event.at,
                "task mutated"
            ),
            EntitySnapshot::Bundle {
                id,
                title,
                document_count,
                stitched_document_uri,
            } => info!(
                target: "audit",
                kind = ?event.kind,
                bundle_id = %id,
                title = %title,
                document_count,
                stitched_document_uri = stitched_document_uri.as_deref().unwrap_or(""),
                at = %event.at,
                "bundle mutated"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// AuditDispatcher
// ---------------------------------------------------------------------------

/// Bounded queue drained by a fixed number of worker tasks.
pub struct AuditDispatcher {
    sender: mpsc::Sender<MutationEvent>,
    workers: Vec<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl AuditDispatcher {
    /// Spawn `workers` tasks draining a queue of `capacity` events into `handler`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(handler: Arc<dyn AuditHandler>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        match next {
                            Some(event) => handler.handle(&event).await,
                            None => break,
                        }
                    }
                    debug!(worker, "audit worker stopped");
                })
            })
            .collect();

        Self {
            sender,
            workers,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Dispatcher logging through [`TracingAudit`].
    pub fn tracing(workers: usize, capacity: usize) -> Self {
        Self::start(Arc::new(TracingAudit), workers, capacity)
    }

    /// Events discarded because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait until every accepted event is handled.
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "audit worker failed");
            }
        }
    }
}

impl EventSink for AuditDispatcher {
    fn emit(&self, event: MutationEvent) {
        if let Err(e) = self.sender.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "dispatcher closed",
            };
            warn!(reason, "audit event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stitcher_shared::{BundleDocument, Credential};
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct Collecting {
        seen: std::sync::Mutex<Vec<MutationEvent>>,
    }

    #[async_trait]
    impl AuditHandler for Collecting {
        async fn handle(&self, event: &MutationEvent) {
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    /// Blocks every event until permits are released.
    struct Gated {
        gate: Semaphore,
        handled: AtomicU64,
    }

    #[async_trait]
    impl AuditHandler for Gated {
        async fn handle(&self, _event: &MutationEvent) {
            self.gate.acquire().await.unwrap().forget();
            self.handled.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn task() -> DocumentTask {
        let bundle = Bundle::new(
            "Audit bundle",
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
    async fn accepted_events_are_all_handled() {
        let handler = Arc::new(Collecting::default());
        let dispatcher = AuditDispatcher::start(handler.clone(), 2, 16);

        let task = task();
        dispatcher.emit(MutationEvent::new(MutationKind::Create, &task.bundle));
        dispatcher.emit(MutationEvent::new(MutationKind::Create, &task));
        dispatcher.emit(MutationEvent::new(MutationKind::Update, &task));
        dispatcher.shutdown().await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(
            seen.iter()
                .any(|e| matches!(e.entity, EntitySnapshot::Bundle { document_count: 1, .. }))
        );
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let handler = Arc::new(Gated {
            gate: Semaphore::new(0),
            handled: AtomicU64::new(0),
        });
        let dispatcher = AuditDispatcher::start(handler.clone(), 1, 2);

        let task = task();
        for _ in 0..10 {
            dispatcher.emit(MutationEvent::new(MutationKind::Update, &task));
        }
        let dropped = dispatcher.dropped();
        assert!(dropped >= 7, "expected most events dropped, got {dropped}");

        handler.gate.add_permits(10);
        dispatcher.shutdown().await;
        assert_eq!(handler.handled.load(Ordering::Relaxed) + dropped, 10);
    }

    #[test]
    fn snapshot_serializes_with_entity_tag() {
        let task = task();
        let event = MutationEvent::new(MutationKind::Create, &task);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "create");
        assert_eq!(json["entity"]["entity"], "task");
        assert_eq!(json["entity"]["state"], "NEW");
    }
}
