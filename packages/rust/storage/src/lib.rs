//! libSQL-backed task repository.
//!
//! The [`Storage`] struct persists bundles, their document references, and
//! stitching tasks. Task rows carry a `version` counter; state changes are
//! forward-only and the `NEW -> PROCESSING` step is a conditional claim, so a
//! task is processed at most once even with several workers sharing the file.
//! Every insert, update, and delete is reported to an optional [`EventSink`].

pub mod events;
mod migrations;
mod repository;

use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Row, params};
use tokio::sync::Mutex;

use stitcher_shared::{
    Bundle, BundleDocument, BundleId, Credential, DocumentTask, LayoutConfig, PageRange, Result,
    StitchError, TaskId, TaskState,
};

pub use events::{
    AuditDispatcher, AuditHandler, EntitySnapshot, EventSink, MutationEvent, MutationKind,
    TracingAudit,
};
pub use repository::{NoopRepository, TaskRepository};

fn db(e: impl Display) -> StitchError {
    StitchError::Storage(e.to_string())
}

/// Task row as stored, including its version counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub bundle_id: BundleId,
    pub state: TaskState,
    pub failure_description: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskRecord> for EntitySnapshot {
    fn from(record: &TaskRecord) -> Self {
        Self::Task {
            id: record.id,
            bundle_id: record.bundle_id,
            state: record.state,
            failure_description: record.failure_description.clone(),
        }
    }
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    /// Serializes write transactions on the shared connection.
    writes: Mutex<()>,
    events: Option<Arc<dyn EventSink>>,
}

impl Storage {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StitchError::io(parent, e))?;
        }

        let database = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db)?;
        let conn = database.connect().map_err(db)?;

        let storage = Self {
            db: database,
            conn,
            writes: Mutex::new(()),
            events: None,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Report every mutation to `sink`.
    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    fn emit(&self, event: MutationEvent) {
        if let Some(sink) = &self.events {
            sink.emit(event);
        }
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        StitchError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Task operations
    // -----------------------------------------------------------------------

    /// Insert a task together with its bundle and document references.
    pub async fn insert_task(&self, task: &DocumentTask) -> Result<()> {
        let bundle = &task.bundle;
        let layout_json = serde_json::to_string(&bundle.layout).map_err(db)?;
        let created_at = task.created_at.to_rfc3339();
        let updated_at = task.updated_at.to_rfc3339();

        let _guard = self.writes.lock().await;
        let tx = self.conn.transaction().await.map_err(db)?;
        tx.execute(
            "INSERT INTO bundles (id, title, filename, layout_json, stitched_document_uri, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                filename = excluded.filename,
                layout_json = excluded.layout_json,
                updated_at = excluded.updated_at",
            params![
                bundle.id.to_string(),
                bundle.title.as_str(),
                bundle.filename.as_deref(),
                layout_json,
                bundle.stitched_document_uri.as_deref(),
                created_at.as_str(),
                updated_at.as_str()
            ],
        )
        .await
        .map_err(db)?;

        tx.execute(
            "DELETE FROM bundle_documents WHERE bundle_id = ?1",
            params![bundle.id.to_string()],
        )
        .await
        .map_err(db)?;
        for doc in &bundle.documents {
            tx.execute(
                "INSERT INTO bundle_documents
                    (bundle_id, sort_index, document_id, filename, content_hash, page_start, page_end)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    bundle.id.to_string(),
                    i64::from(doc.sort_index),
                    doc.document_id.as_str(),
                    doc.filename.as_str(),
                    doc.content_hash.as_deref(),
                    doc.page_range.map(|r| i64::from(r.start)),
                    doc.page_range.map(|r| i64::from(r.end))
                ],
            )
            .await
            .map_err(db)?;
        }

        tx.execute(
            "INSERT INTO tasks (id, bundle_id, state, failure_description, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![
                task.id.to_string(),
                bundle.id.to_string(),
                task.state.as_str(),
                task.failure_description.as_deref(),
                created_at.as_str(),
                updated_at.as_str()
            ],
        )
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;

        tracing::debug!(task_id = %task.id, bundle_id = %bundle.id, "task inserted");
        self.emit(MutationEvent::new(MutationKind::Create, bundle));
        self.emit(MutationEvent::new(MutationKind::Create, task));
        Ok(())
    }

    /// Atomically move a task from `NEW` to `PROCESSING`.
    ///
    /// Returns `false` if the task is missing or was already claimed.
    pub async fn claim_task(&self, id: &TaskId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let guard = self.writes.lock().await;
        let claimed = self
            .conn
            .execute(
                "UPDATE tasks SET state = ?1, version = version + 1, updated_at = ?2
                 WHERE id = ?3 AND state = ?4",
                params![
                    TaskState::Processing.as_str(),
                    now.as_str(),
                    id.to_string(),
                    TaskState::New.as_str()
                ],
            )
            .await
            .map_err(db)?;
        drop(guard);

        if claimed == 0 {
            tracing::debug!(task_id = %id, "task not claimable");
            return Ok(false);
        }
        if let Some(record) = self.get_task_record(id).await? {
            self.emit(MutationEvent::new(MutationKind::Update, &record));
        }
        Ok(true)
    }

    /// Persist a task's state, failure description, and bundle outcome.
    ///
    /// Rejects backward transitions and writes that race another update.
    pub async fn update_task(&self, task: &DocumentTask) -> Result<()> {
        let _guard = self.writes.lock().await;
        let current = self
            .get_task_record(&task.id)
            .await?
            .ok_or_else(|| StitchError::Storage(format!("task {} not found", task.id)))?;

        if current.state != task.state && !current.state.can_transition_to(task.state) {
            return Err(StitchError::InvalidTransition {
                from: current.state,
                to: task.state,
            });
        }

        let now = task.updated_at.to_rfc3339();
        let bundle = &task.bundle;

        let tx = self.conn.transaction().await.map_err(db)?;
        let updated = tx
            .execute(
                "UPDATE tasks SET state = ?1, failure_description = ?2, version = version + 1, updated_at = ?3
                 WHERE id = ?4 AND version = ?5",
                params![
                    task.state.as_str(),
                    task.failure_description.as_deref(),
                    now.as_str(),
                    task.id.to_string(),
                    current.version
                ],
            )
            .await
            .map_err(db)?;
        if updated == 0 {
            return Err(StitchError::Storage(format!(
                "task {} was modified concurrently",
                task.id
            )));
        }

        tx.execute(
            "UPDATE bundles SET stitched_document_uri = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                bundle.stitched_document_uri.as_deref(),
                now.as_str(),
                bundle.id.to_string()
            ],
        )
        .await
        .map_err(db)?;

        for doc in &bundle.documents {
            tx.execute(
                "UPDATE bundle_documents SET page_start = ?1, page_end = ?2
                 WHERE bundle_id = ?3 AND sort_index = ?4",
                params![
                    doc.page_range.map(|r| i64::from(r.start)),
                    doc.page_range.map(|r| i64::from(r.end)),
                    bundle.id.to_string(),
                    i64::from(doc.sort_index)
                ],
            )
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;

        tracing::debug!(task_id = %task.id, state = %task.state, "task updated");
        self.emit(MutationEvent::new(MutationKind::Update, task));
        if task.state == TaskState::Done {
            self.emit(MutationEvent::new(MutationKind::Update, bundle));
        }
        Ok(())
    }

    /// Remove a task, and its bundle once no other task refers to it.
    ///
    /// Returns `false` if the task does not exist.
    pub async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        let _guard = self.writes.lock().await;
        let Some(record) = self.get_task_record(id).await? else {
            return Ok(false);
        };

        let tx = self.conn.transaction().await.map_err(db)?;
        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(db)?;
        let orphaned = tx
            .execute(
                "DELETE FROM bundles WHERE id = ?1
                 AND NOT EXISTS (SELECT 1 FROM tasks WHERE bundle_id = ?1)",
                params![record.bundle_id.to_string()],
            )
            .await
            .map_err(db)?;
        if orphaned > 0 {
            tx.execute(
                "DELETE FROM bundle_documents WHERE bundle_id = ?1",
                params![record.bundle_id.to_string()],
            )
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)?;

        tracing::debug!(task_id = %id, bundle_removed = orphaned > 0, "task deleted");
        self.emit(MutationEvent::new(MutationKind::Delete, &record));
        Ok(true)
    }

    /// Get the stored row of a task.
    pub async fn get_task_record(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, bundle_id, state, failure_description, version, updated_at
                 FROM tasks WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db(e)),
        }
    }

    /// List task rows, optionally only those in `state`, oldest first.
    pub async fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>> {
        let mut rows = match state {
            Some(state) => {
                self.conn
                    .query(
                        "SELECT id, bundle_id, state, failure_description, version, updated_at
                         FROM tasks WHERE state = ?1 ORDER BY created_at, id",
                        params![state.as_str()],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        "SELECT id, bundle_id, state, failure_description, version, updated_at
                         FROM tasks ORDER BY created_at, id",
                        params![],
                    )
                    .await
            }
        }
        .map_err(db)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_task_record(&row)?);
        }
        Ok(results)
    }

    /// Load a task with its bundle. The credential is never stored and comes back empty.
    pub async fn get_task(&self, id: &TaskId) -> Result<Option<DocumentTask>> {
        let mut rows = self
            .conn
            .query(
                "SELECT t.id, t.state, t.failure_description, t.created_at, t.updated_at,
                        b.id, b.title, b.filename, b.layout_json, b.stitched_document_uri
                 FROM tasks t JOIN bundles b ON b.id = t.bundle_id
                 WHERE t.id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db)?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(db(e)),
        };

        let layout: LayoutConfig =
            serde_json::from_str(&row.get::<String>(8).map_err(db)?).map_err(db)?;
        let bundle_id = parse_id::<BundleId>(&row.get::<String>(5).map_err(db)?)?;

        let bundle = Bundle {
            id: bundle_id,
            title: row.get::<String>(6).map_err(db)?,
            filename: row.get::<String>(7).ok(),
            documents: self.list_bundle_documents(&bundle_id).await?,
            layout,
            stitched_document_uri: row.get::<String>(9).ok(),
        };

        Ok(Some(DocumentTask {
            id: parse_id::<TaskId>(&row.get::<String>(0).map_err(db)?)?,
            bundle,
            credential: Credential::default(),
            state: row.get::<String>(1).map_err(db)?.parse()?,
            failure_description: row.get::<String>(2).ok(),
            created_at: parse_timestamp(&row.get::<String>(3).map_err(db)?)?,
            updated_at: parse_timestamp(&row.get::<String>(4).map_err(db)?)?,
        }))
    }

    async fn list_bundle_documents(&self, bundle_id: &BundleId) -> Result<Vec<BundleDocument>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sort_index, document_id, filename, content_hash, page_start, page_end
                 FROM bundle_documents WHERE bundle_id = ?1 ORDER BY sort_index",
                params![bundle_id.to_string()],
            )
            .await
            .map_err(db)?;

        let mut documents = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let page_range = match (row.get::<i64>(4).ok(), row.get::<i64>(5).ok()) {
                (Some(start), Some(end)) => Some(PageRange::new(start as u32, end as u32)),
                _ => None,
            };
            documents.push(BundleDocument {
                sort_index: row.get::<u32>(0).map_err(db)?,
                document_id: row.get::<String>(1).map_err(db)?,
                filename: row.get::<String>(2).map_err(db)?,
                content_hash: row.get::<String>(3).ok(),
                page_range,
            });
        }
        Ok(documents)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn parse_id<T: std::str::FromStr<Err = uuid::Error>>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|e| StitchError::Storage(format!("invalid id '{s}': {e}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StitchError::Storage(format!("invalid timestamp '{s}': {e}")))
}

fn row_to_task_record(row: &Row) -> Result<TaskRecord> {
    Ok(TaskRecord {
        id: parse_id(&row.get::<String>(0).map_err(db)?)?,
        bundle_id: parse_id(&row.get::<String>(1).map_err(db)?)?,
        state: row.get::<String>(2).map_err(db)?.parse()?,
        failure_description: row.get::<String>(3).ok(),
        version: row.get::<i64>(4).map_err(db)?,
        updated_at: parse_timestamp(&row.get::<String>(5).map_err(db)?)?,
    })
}
