//! Error types for the bundle stitcher.
//!
//! Library crates use [`StitchError`] via `thiserror`; the stage errors
//! ([`FetchError`], [`AnnotationError`], [`MergeError`], [`PublishError`])
//! are raised by the individual pipeline stages and collapsed by the
//! orchestrator into a task's failure description.
//! App crates (cli) wrap this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::{TaskId, TaskState};

// ---------------------------------------------------------------------------
// Stage errors
// ---------------------------------------------------------------------------

/// Failure retrieving a source document from the document store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The store has no document with this identifier.
    #[error("document {document_id} not found")]
    NotFound { document_id: String },

    /// The caller credential was rejected.
    #[error("not authorized to read document {document_id}")]
    Unauthorized { document_id: String },

    /// The request did not complete within the configured timeout.
    #[error("timed out fetching document {document_id}")]
    Timeout { document_id: String },

    /// The response body exceeded the configured size ceiling.
    #[error("document {document_id} exceeds the {limit} byte limit")]
    TooLarge { document_id: String, limit: u64 },

    /// Any other transport-level failure.
    #[error("{0}")]
    Transport(String),
}

/// Failure fetching or applying a document's annotation set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnotationError {
    /// The document bytes could not be parsed.
    #[error("cannot parse document for annotation: {0}")]
    Parse(String),

    /// An annotation targets a page the document does not have.
    #[error("annotation targets page {page} but the document has {page_count} pages")]
    PageOutOfRange { page: u32, page_count: usize },

    /// The annotation source could not be reached or returned garbage.
    #[error("annotation source error: {0}")]
    Source(String),

    /// The annotated document could not be written back out.
    #[error("cannot write annotated document: {0}")]
    Serialize(String),
}

/// Failure assembling the merged output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// An input is not a valid document of the expected format.
    #[error("document {index} is not a valid PDF: {reason}")]
    InvalidDocument { index: usize, reason: String },

    /// `finalize` was called before anything was appended.
    #[error("nothing to merge")]
    Empty,

    /// A bookmark points outside the merged output.
    #[error("bookmark '{title}' targets page {page} of {page_count}")]
    BookmarkOutOfRange {
        title: String,
        page: u32,
        page_count: usize,
    },

    /// The merged document could not be written.
    #[error("cannot write merged document: {0}")]
    Serialize(String),
}

/// Failure uploading the merged artifact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The store rejected the caller credential.
    #[error("not authorized to publish {filename}")]
    Unauthorized { filename: String },

    /// The upload did not complete within the configured timeout.
    #[error("timed out publishing {filename}")]
    Timeout { filename: String },

    /// The store accepted the upload but returned no usable reference.
    #[error("document store returned no reference for {filename}")]
    MissingReference { filename: String },

    /// Any other transport-level failure.
    #[error("{0}")]
    Transport(String),
}

/// A callback URL failed the definition-time reachability probe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("callback {url} is unreachable: {reason}")]
pub struct CallbackUnreachable {
    pub url: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// StitchError
// ---------------------------------------------------------------------------

/// Top-level error type for all stitcher operations.
#[derive(Debug, thiserror::Error)]
pub enum StitchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of a pipeline stage.
    #[error("network error: {0}")]
    Network(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad bundle definition, schema mismatch, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A task state change that the state machine forbids.
    #[error("invalid task transition {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    /// Another worker already owns the task.
    #[error("task {0} is already claimed")]
    AlreadyClaimed(TaskId),

    /// A background task died before producing a result.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Annotation(#[from] AnnotationError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    CallbackUnreachable(#[from] CallbackUnreachable),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StitchError>;

impl StitchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error came out of one of the pipeline stages.
    pub fn is_stage_error(&self) -> bool {
        matches!(
            self,
            Self::Fetch(_) | Self::Annotation(_) | Self::Merge(_) | Self::Publish(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = StitchError::config("missing base_url");
        assert_eq!(err.to_string(), "config error: missing base_url");

        let err = StitchError::validation("duplicate sort index 3");
        assert!(err.to_string().contains("duplicate sort index 3"));
    }

    #[test]
    fn stage_errors_display_their_cause_verbatim() {
        let err: StitchError = FetchError::Transport("404 not found".into()).into();
        assert_eq!(err.to_string(), "404 not found");
        assert!(err.is_stage_error());

        let err: StitchError = AnnotationError::PageOutOfRange {
            page: 7,
            page_count: 3,
        }
        .into();
        assert!(err.to_string().contains("page 7"));
    }

    #[test]
    fn callback_unreachable_is_not_a_stage_error() {
        let err: StitchError = CallbackUnreachable {
            url: "http://cb.example".into(),
            reason: "HTTP 500".into(),
        }
        .into();
        assert!(!err.is_stage_error());
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = StitchError::InvalidTransition {
            from: TaskState::Done,
            to: TaskState::Processing,
        };
        assert_eq!(err.to_string(), "invalid task transition DONE -> PROCESSING");
    }
}
