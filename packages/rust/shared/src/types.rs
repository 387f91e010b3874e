//! Core domain types for bundle stitching.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, StitchError};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// A UUID v7 wrapper for bundle identifiers.
    BundleId
);

uuid_id!(
    /// A UUID v7 wrapper for task identifiers.
    TaskId
);

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// Short-lived caller credential forwarded to downstream services.
///
/// Never serialized and redacted from `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building request headers.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Lifecycle of a [`DocumentTask`]: `NEW -> PROCESSING -> {DONE, FAILED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    New,
    Processing,
    Done,
    Failed,
}

impl TaskState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::New, TaskState::Processing)
                | (TaskState::Processing, TaskState::Done)
                | (TaskState::Processing, TaskState::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::New => "NEW",
            TaskState::Processing => "PROCESSING",
            TaskState::Done => "DONE",
            TaskState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = StitchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(TaskState::New),
            "PROCESSING" => Ok(TaskState::Processing),
            "DONE" => Ok(TaskState::Done),
            "FAILED" => Ok(TaskState::Failed),
            other => Err(StitchError::validation(format!("unknown task state '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Where page-number stamps are placed on the finalized output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationStyle {
    #[default]
    None,
    Top,
    Bottom,
}

/// Layout options of a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Insert a generated title page before the first document.
    #[serde(default)]
    pub cover_page: bool,
    /// Emit one bookmark per document.
    #[serde(default)]
    pub table_of_contents: bool,
    #[serde(default)]
    pub pagination: PaginationStyle,
    /// Fetch and overlay each document's annotation set before merging.
    #[serde(default)]
    pub annotations: bool,
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Half-open `[start, end)` page range, zero-based over the merged output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The same range moved `offset` pages further into the output.
    pub fn shifted(self, offset: u32) -> Self {
        Self {
            start: self.start + offset,
            end: self.end + offset,
        }
    }
}

/// A reference to one source document inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDocument {
    /// Merge order; unique across the bundle.
    pub sort_index: u32,
    /// Identifier in the remote document store.
    pub document_id: String,
    pub filename: String,
    /// Hash of the stored content, used to skip redundant fetches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Recorded once the document has been merged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_range: Option<PageRange>,
}

impl BundleDocument {
    /// Key identifying identical content within one run.
    pub fn fetch_key(&self) -> &str {
        self.content_hash.as_deref().unwrap_or(&self.document_id)
    }
}

/// An ordered set of source documents plus layout options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: BundleId,
    pub title: String,
    /// Filename for the published artifact; derived from the title when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub documents: Vec<BundleDocument>,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stitched_document_uri: Option<String>,
}

impl Bundle {
    pub fn new(title: impl Into<String>, documents: Vec<BundleDocument>) -> Self {
        Self {
            id: BundleId::new(),
            title: title.into(),
            filename: None,
            documents,
            layout: LayoutConfig::default(),
            stitched_document_uri: None,
        }
    }

    /// Check that the bundle can be stitched at all.
    pub fn validate(&self) -> Result<()> {
        if self.documents.is_empty() {
            return Err(StitchError::validation(format!(
                "bundle {} has no documents",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for doc in &self.documents {
            if !seen.insert(doc.sort_index) {
                return Err(StitchError::validation(format!(
                    "bundle {} has duplicate sort index {}",
                    self.id, doc.sort_index
                )));
            }
            if doc.document_id.trim().is_empty() {
                return Err(StitchError::validation(format!(
                    "document at sort index {} has no identifier",
                    doc.sort_index
                )));
            }
        }
        Ok(())
    }

    /// Positions into `documents`, in ascending sort-index order.
    pub fn merge_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.documents.len()).collect();
        order.sort_by_key(|&i| self.documents[i].sort_index);
        order
    }

    /// Whether a stitched artifact has been published for this bundle.
    pub fn is_stitched(&self) -> bool {
        self.stitched_document_uri
            .as_deref()
            .is_some_and(|uri| !uri.is_empty())
    }

    /// Filename used when publishing the merged artifact.
    pub fn artifact_filename(&self) -> String {
        if let Some(name) = self.filename.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }

        let slug = self
            .title
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");

        if slug.is_empty() {
            format!("bundle-{}.pdf", self.id)
        } else {
            format!("{slug}.pdf")
        }
    }
}

// ---------------------------------------------------------------------------
// DocumentTask
// ---------------------------------------------------------------------------

/// One execution attempt of the stitching pipeline over a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentTask {
    pub id: TaskId,
    pub bundle: Bundle,
    /// Lives only as long as the task; never serialized.
    #[serde(skip)]
    pub credential: Credential,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentTask {
    pub fn new(bundle: Bundle, credential: Credential) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            bundle,
            credential,
            state: TaskState::New,
            failure_description: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, enforcing the forward-only state machine.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(StitchError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record the published reference and move to `DONE`.
    pub fn complete(&mut self, stitched_document_uri: String) -> Result<()> {
        if stitched_document_uri.is_empty() {
            return Err(StitchError::validation("stitched document URI is empty"));
        }
        self.transition(TaskState::Done)?;
        self.bundle.stitched_document_uri = Some(stitched_document_uri);
        self.failure_description = None;
        Ok(())
    }

    /// Record `description` and move to `FAILED`.
    pub fn fail(&mut self, description: impl Into<String>) -> Result<()> {
        self.transition(TaskState::Failed)?;
        let description = description.into();
        self.failure_description = Some(if description.is_empty() {
            "unknown failure".to_string()
        } else {
            description
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Annotations
// ---------------------------------------------------------------------------

/// Kind of native overlay an annotation becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Highlight,
    Note,
    Stamp,
}

/// Rectangle in points with a top-left origin, as annotation tools report it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A single page-positioned annotation descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub kind: AnnotationKind,
    pub geometry: Rect,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub text: String,
    /// RGB components in `0.0..=1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<[f32; 3]>,
}

/// Annotations of one document, keyed by zero-based page index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationSet {
    pages: BTreeMap<u32, Vec<Annotation>>,
}

impl AnnotationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `annotation` to the descriptors of `page`.
    pub fn push(&mut self, page: u32, annotation: Annotation) {
        self.pages.entry(page).or_default().push(annotation);
    }

    pub fn is_empty(&self) -> bool {
        self.pages.values().all(Vec::is_empty)
    }

    /// Total number of descriptors across all pages.
    pub fn len(&self) -> usize {
        self.pages.values().map(Vec::len).sum()
    }

    /// Highest annotated page index, if any.
    pub fn max_page(&self) -> Option<u32> {
        self.pages
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(page, _)| *page)
            .next_back()
    }

    /// Pages in ascending order with their descriptors.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[Annotation])> {
        self.pages.iter().map(|(page, list)| (*page, list.as_slice()))
    }
}

// ---------------------------------------------------------------------------
// Bookmark
// ---------------------------------------------------------------------------

/// An outline entry of the merged output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Display title.
    pub title: String,
    /// Zero-based page index in the merged output.
    pub page: u32,
}

/// Compute the SHA-256 hex digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(sort_index: u32, id: &str) -> BundleDocument {
        BundleDocument {
            sort_index,
            document_id: id.into(),
            filename: format!("{id}.pdf"),
            content_hash: None,
            page_range: None,
        }
    }

    #[test]
    fn task_id_roundtrip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().expect("parse TaskId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn state_machine_is_forward_only() {
        use TaskState::*;
        assert!(New.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Failed));

        assert!(!New.can_transition_to(Done));
        assert!(!Done.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(New));
        assert!(!Done.can_transition_to(Failed));
    }

    #[test]
    fn task_state_string_roundtrip() {
        for state in [
            TaskState::New,
            TaskState::Processing,
            TaskState::Done,
            TaskState::Failed,
        ] {
            let parsed: TaskState = state.as_str().parse().expect("parse state");
            assert_eq!(parsed, state);
        }
        assert!("RUNNING".parse::<TaskState>().is_err());
    }

    #[test]
    fn complete_sets_uri_and_done() {
        let bundle = Bundle::new("Case 1", vec![doc(0, "a")]);
        let mut task = DocumentTask::new(bundle, Credential::new("t"));
        task.transition(TaskState::Processing).unwrap();
        task.complete("https://store/documents/1".into()).unwrap();

        assert_eq!(task.state, TaskState::Done);
        assert!(task.bundle.is_stitched());
        assert!(task.failure_description.is_none());
    }

    #[test]
    fn complete_rejects_empty_uri() {
        let bundle = Bundle::new("Case 1", vec![doc(0, "a")]);
        let mut task = DocumentTask::new(bundle, Credential::new("t"));
        task.transition(TaskState::Processing).unwrap();
        assert!(task.complete(String::new()).is_err());
        assert_eq!(task.state, TaskState::Processing);
        assert!(!task.bundle.is_stitched());
    }

    #[test]
    fn terminal_task_cannot_be_reopened() {
        let bundle = Bundle::new("Case 1", vec![doc(0, "a")]);
        let mut task = DocumentTask::new(bundle, Credential::new("t"));
        task.transition(TaskState::Processing).unwrap();
        task.fail("boom").unwrap();

        assert!(task.transition(TaskState::Processing).is_err());
        assert!(task.transition(TaskState::New).is_err());
        assert_eq!(task.failure_description.as_deref(), Some("boom"));
    }

    #[test]
    fn merge_order_follows_sort_index() {
        let bundle = Bundle::new("b", vec![doc(5, "c"), doc(1, "a"), doc(3, "b")]);
        let ids: Vec<&str> = bundle
            .merge_order()
            .into_iter()
            .map(|i| bundle.documents[i].document_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn validate_rejects_duplicate_sort_index() {
        let bundle = Bundle::new("b", vec![doc(1, "a"), doc(1, "b")]);
        let err = bundle.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate sort index 1"));
    }

    #[test]
    fn validate_rejects_empty_bundle() {
        let bundle = Bundle::new("b", vec![]);
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn artifact_filename_from_title() {
        let bundle = Bundle::new("Hearing Bundle: Smith v Jones", vec![doc(0, "a")]);
        assert_eq!(bundle.artifact_filename(), "hearing-bundle-smith-v-jones.pdf");

        let mut named = bundle.clone();
        named.filename = Some("custom.pdf".into());
        assert_eq!(named.artifact_filename(), "custom.pdf");
    }

    #[test]
    fn credential_is_redacted_and_not_serialized() {
        let bundle = Bundle::new("b", vec![doc(0, "a")]);
        let task = DocumentTask::new(bundle, Credential::new("secret-token"));
        assert!(!format!("{task:?}").contains("secret-token"));

        let json = serde_json::to_string(&task).expect("serialize task");
        assert!(!json.contains("secret-token"));
        assert!(json.contains("\"NEW\""));
    }

    #[test]
    fn annotation_set_page_bookkeeping() {
        let mut set = AnnotationSet::new();
        assert!(set.is_empty());
        assert_eq!(set.max_page(), None);

        let note = Annotation {
            kind: AnnotationKind::Note,
            geometry: Rect {
                x: 10.0,
                y: 10.0,
                width: 20.0,
                height: 20.0,
            },
            author: "judge".into(),
            text: "see para 4".into(),
            color: None,
        };
        set.push(4, note.clone());
        set.push(1, note);

        assert_eq!(set.len(), 2);
        assert_eq!(set.max_page(), Some(4));
        let pages: Vec<u32> = set.iter().map(|(p, _)| p).collect();
        assert_eq!(pages, vec![1, 4]);
    }

    #[test]
    fn page_range_shift() {
        let range = PageRange::new(0, 3).shifted(1);
        assert_eq!(range, PageRange::new(1, 4));
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        let hash = content_hash(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
