//! End-to-end stitch pipeline: bundle → fetch → annotate → merge → publish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use stitcher_pdf::{COVER_PAGES, CoverPage, FinalizeOptions, MergeState, MergedDocument};
use stitcher_shared::{
    AnnotationError, AnnotationSet, AppConfig, Bundle, BundleDocument, Credential, DocumentTask,
    FetchError, PageRange, PublishError, Result, StitchError, TaskState, content_hash,
};
use stitcher_storage::{NoopRepository, TaskRepository};
use stitcher_store::{
    AnnotationSource, DocumentStore, HttpAnnotationSource, HttpDocumentStore, PublishRequest,
};

use crate::case_update::{StitchRequest, StitchResponse};
use crate::toc;

/// Tuning knobs of a [`Stitcher`].
#[derive(Debug, Clone)]
pub struct StitchOptions {
    /// Downloads kept in flight ahead of the merge position.
    pub fetch_concurrency: usize,
    /// Upper bound on a single fetch, annotation lookup, or publish call.
    pub request_timeout: Duration,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            fetch_concurrency: 1,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&AppConfig> for StitchOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            fetch_concurrency: config.pipeline.fetch_concurrency,
            request_timeout: config.pipeline.request_timeout(),
        }
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a task enters a new phase.
    fn phase(&self, task: &DocumentTask, name: &str);
    /// Called after each document has been merged.
    fn document_merged(&self, filename: &str, current: usize, total: usize);
    /// Called once the task reached a terminal state.
    fn done(&self, task: &DocumentTask);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _task: &DocumentTask, _name: &str) {}
    fn document_merged(&self, _filename: &str, _current: usize, _total: usize) {}
    fn done(&self, _task: &DocumentTask) {}
}

/// Successful run of the pipeline, applied to the task afterwards.
struct Outcome {
    uri: String,
    /// `(position in bundle.documents, range in the output)`.
    ranges: Vec<(usize, PageRange)>,
    page_count: usize,
}

/// Runs document tasks against a document store.
pub struct Stitcher {
    store: Arc<dyn DocumentStore>,
    annotations: Arc<dyn AnnotationSource>,
    repository: Arc<dyn TaskRepository>,
    progress: Arc<dyn ProgressReporter>,
    options: StitchOptions,
}

impl Stitcher {
    pub fn new(store: Arc<dyn DocumentStore>, annotations: Arc<dyn AnnotationSource>) -> Self {
        Self {
            store,
            annotations,
            repository: Arc::new(NoopRepository),
            progress: Arc::new(SilentProgress),
            options: StitchOptions::default(),
        }
    }

    /// Stitcher talking to the HTTP store and annotation source from `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = HttpDocumentStore::from_config(config)?;
        let annotations = HttpAnnotationSource::from_config(config)?;
        Ok(Self::new(Arc::new(store), Arc::new(annotations)).with_options(config.into()))
    }

    /// Claim tasks in and report their outcome to `repository`.
    pub fn with_repository(mut self, repository: Arc<dyn TaskRepository>) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_options(mut self, options: StitchOptions) -> Self {
        self.options = options;
        self
    }

    /// Run a case-triggered request and build its response.
    ///
    /// The request is expected to have passed [`StitchRequest::validate`].
    pub async fn stitch(&self, request: StitchRequest, credential: Credential) -> StitchResponse {
        let (context, task) = request.into_task(credential);
        let task = self.process(task).await;
        StitchResponse::new(&context, &task)
    }

    /// Run `task` to a terminal state.
    ///
    /// Never fails: any stage error moves the task to `FAILED` with the
    /// error's message as its failure description. Tasks not in `NEW`, and
    /// tasks the repository refuses to hand over, are returned untouched.
    #[instrument(skip_all, fields(task_id = %task.id, bundle_id = %task.bundle.id))]
    pub async fn process(&self, mut task: DocumentTask) -> DocumentTask {
        if task.state != TaskState::New {
            warn!(state = %task.state, "task is not new, skipping");
            return task;
        }
        if let Err(e) = self.repository.claim(&task).await {
            warn!(error = %e, "task not claimed, skipping");
            return task;
        }
        if let Err(e) = task.transition(TaskState::Processing) {
            warn!(error = %e, "cannot start task");
            return task;
        }

        let start = Instant::now();
        info!(documents = task.bundle.documents.len(), "starting stitch pipeline");

        let result = match self.run(&task).await {
            Ok(outcome) => task.complete(outcome.uri).map(|()| {
                for (position, range) in outcome.ranges {
                    task.bundle.documents[position].page_range = Some(range);
                }
                outcome.page_count
            }),
            Err(e) => Err(e),
        };

        match result {
            Ok(page_count) => info!(
                page_count,
                uri = task.bundle.stitched_document_uri.as_deref().unwrap_or(""),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "task done"
            ),
            Err(e) => {
                let description = e.to_string();
                if e.is_stage_error() {
                    warn!(error = %description, "task failed");
                } else {
                    error!(error = %description, "task failed outside a pipeline stage");
                }
                if let Err(e) = task.fail(description) {
                    warn!(error = %e, "cannot record failure");
                }
            }
        }

        self.report(&task).await;
        self.progress.done(&task);
        task
    }

    /// Hand the task's current state to the repository; failures are only logged.
    pub(crate) async fn report(&self, task: &DocumentTask) {
        if let Err(e) = self.repository.record(task).await {
            warn!(task_id = %task.id, state = %task.state, error = %e, "repository update failed");
        }
    }

    async fn run(&self, task: &DocumentTask) -> Result<Outcome> {
        let bundle = &task.bundle;
        bundle.validate()?;

        let order = bundle.merge_order();
        let documents: Vec<&BundleDocument> =
            order.iter().map(|&i| &bundle.documents[i]).collect();
        let total = documents.len();

        self.progress.phase(task, "Fetching documents");
        let mut prefetch = Prefetch::new(
            &documents,
            Arc::clone(&self.store),
            task.credential.clone(),
            &self.options,
        );

        self.progress.phase(task, "Merging documents");
        let mut merge = MergeState::new();
        let mut ranges = Vec::with_capacity(total);
        for (position, doc) in documents.iter().enumerate() {
            let mut bytes = prefetch.take(position).await?;
            if let Some(expected) = doc.content_hash.as_deref() {
                let actual = content_hash(&bytes);
                if actual != expected {
                    warn!(document_id = %doc.document_id, %expected, %actual, "content hash mismatch");
                }
            }

            if bundle.layout.annotations {
                let set = self.fetch_annotations(doc, &task.credential).await?;
                if !set.is_empty() {
                    debug!(document_id = %doc.document_id, annotations = set.len(), "applying annotations");
                    bytes = blocking(move || stitcher_pdf::annotate(&bytes, &set)).await??;
                }
            }

            let (state, range) = blocking(move || {
                let range = merge.append(&bytes);
                (merge, range)
            })
            .await?;
            merge = state;
            let range = range?;

            debug!(document_id = %doc.document_id, start = range.start, end = range.end, "document merged");
            ranges.push((order[position], range));
            self.progress
                .document_merged(&doc.filename, position + 1, total);
        }
        drop(prefetch);

        let merged_ranges: Vec<PageRange> = ranges.iter().map(|&(_, range)| range).collect();
        if !toc::ranges_are_contiguous(&merged_ranges, merge.page_count()) {
            return Err(StitchError::Internal(
                "merged page ranges do not cover the output".into(),
            ));
        }
        debug!(
            documents = merge.document_count(),
            pages = merge.page_count(),
            "documents merged"
        );

        self.progress.phase(task, "Finalizing");
        let offset = if bundle.layout.cover_page {
            COVER_PAGES
        } else {
            0
        };
        let ranges: Vec<(usize, PageRange)> = ranges
            .into_iter()
            .map(|(i, range)| (i, range.shifted(offset)))
            .collect();

        let options = finalize_options(bundle, &ranges);
        let merged: MergedDocument = blocking(move || merge.finalize(&options)).await??;
        debug!(
            page_count = merged.page_count,
            bookmarks = merged.bookmarks.len(),
            bytes = merged.bytes.len(),
            "merge finalized"
        );

        self.progress.phase(task, "Publishing");
        let page_count = merged.page_count;
        let uri = self.publish(bundle, merged.bytes, &task.credential).await?;

        Ok(Outcome {
            uri,
            ranges,
            page_count,
        })
    }

    async fn fetch_annotations(
        &self,
        doc: &BundleDocument,
        credential: &Credential,
    ) -> Result<AnnotationSet> {
        let lookup = self.annotations.annotations(&doc.document_id, credential);
        match tokio::time::timeout(self.options.request_timeout, lookup).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(AnnotationError::Source(format!(
                "timed out fetching annotations for {}",
                doc.document_id
            ))
            .into()),
        }
    }

    async fn publish(&self, bundle: &Bundle, bytes: Vec<u8>, credential: &Credential) -> Result<String> {
        let request = PublishRequest {
            filename: bundle.artifact_filename(),
            credential: credential.clone(),
        };

        let upload = self.store.publish(bytes, &request);
        let uri = match tokio::time::timeout(self.options.request_timeout, upload).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PublishError::Timeout {
                    filename: request.filename,
                }
                .into());
            }
        };

        if uri.trim().is_empty() {
            return Err(PublishError::MissingReference {
                filename: request.filename,
            }
            .into());
        }
        Ok(uri)
    }
}

/// Cover, outline, and pagination settings for the finalize step.
fn finalize_options(bundle: &Bundle, ranges: &[(usize, PageRange)]) -> FinalizeOptions {
    let merged: Vec<BundleDocument> = ranges
        .iter()
        .map(|&(i, range)| BundleDocument {
            page_range: Some(range),
            ..bundle.documents[i].clone()
        })
        .collect();

    let cover = bundle.layout.cover_page.then(|| CoverPage {
        title: bundle.title.clone(),
        entries: merged.iter().map(|d| d.filename.clone()).collect(),
    });
    let bookmarks = if bundle.layout.table_of_contents {
        toc::build_outline(&merged, 0)
    } else {
        Vec::new()
    };

    FinalizeOptions {
        title: bundle.title.clone(),
        cover,
        bookmarks,
        pagination: bundle.layout.pagination,
    }
}

/// Run CPU-bound document work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StitchError::Internal(format!("document worker failed: {e}")))
}

// ---------------------------------------------------------------------------
// Prefetch
// ---------------------------------------------------------------------------

/// Downloads running ahead of the merge, consumed in merge order.
///
/// At most `window` downloads are spawned past the one the merge is waiting
/// on; the next one starts only when the merge takes a document. Documents
/// with the same fetch key share one download. Dropping the prefetch aborts
/// whatever is still in flight.
struct Prefetch {
    store: Arc<dyn DocumentStore>,
    credential: Credential,
    timeout: Duration,
    window: usize,
    /// Document fetched by each download slot, in first-use order.
    sources: Vec<String>,
    handles: Vec<Option<JoinHandle<std::result::Result<Vec<u8>, FetchError>>>>,
    fetched: Vec<Option<Vec<u8>>>,
    /// Merge positions still to be served from each download.
    remaining: Vec<usize>,
    /// Merge position -> download slot.
    slot_of: Vec<usize>,
    /// First slot not spawned yet.
    next_slot: usize,
}

impl Prefetch {
    fn new(
        documents: &[&BundleDocument],
        store: Arc<dyn DocumentStore>,
        credential: Credential,
        options: &StitchOptions,
    ) -> Self {
        let mut slots: HashMap<&str, usize> = HashMap::new();
        let mut sources = Vec::new();
        let mut remaining = Vec::new();
        let mut slot_of = Vec::with_capacity(documents.len());

        for doc in documents {
            let slot = *slots.entry(doc.fetch_key()).or_insert_with(|| {
                sources.push(doc.document_id.clone());
                remaining.push(0);
                sources.len() - 1
            });
            remaining[slot] += 1;
            slot_of.push(slot);
        }

        if sources.len() < documents.len() {
            debug!(
                documents = documents.len(),
                downloads = sources.len(),
                "duplicate documents share a download"
            );
        }

        Self {
            store,
            credential,
            timeout: options.request_timeout,
            window: options.fetch_concurrency.max(1),
            handles: (0..sources.len()).map(|_| None).collect(),
            fetched: vec![None; sources.len()],
            sources,
            remaining,
            slot_of,
            next_slot: 0,
        }
    }

    fn spawn(&mut self, slot: usize) {
        let store = Arc::clone(&self.store);
        let credential = self.credential.clone();
        let document_id = self.sources[slot].clone();
        let timeout = self.timeout;

        self.handles[slot] = Some(tokio::spawn(async move {
            debug!(%document_id, "fetching document");
            match tokio::time::timeout(timeout, store.fetch(&document_id, &credential)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout { document_id }),
            }
        }));
    }

    /// Bytes of the document at merge `position`.
    async fn take(&mut self, position: usize) -> Result<Vec<u8>> {
        let slot = self.slot_of[position];
        let horizon = (slot + self.window).min(self.sources.len());
        while self.next_slot < horizon {
            self.spawn(self.next_slot);
            self.next_slot += 1;
        }

        if let Some(handle) = self.handles[slot].take() {
            let bytes = handle
                .await
                .map_err(|e| StitchError::Internal(format!("fetch task failed: {e}")))??;
            self.fetched[slot] = Some(bytes);
        }

        self.remaining[slot] -= 1;
        let bytes = if self.remaining[slot] == 0 {
            self.fetched[slot].take()
        } else {
            self.fetched[slot].clone()
        };
        bytes.ok_or_else(|| StitchError::Internal(format!("document {position} fetched twice")))
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        for handle in self.handles.iter().flatten() {
            handle.abort();
        }
    }
}
