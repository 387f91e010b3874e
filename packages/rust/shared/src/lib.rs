//! Shared types, error model, and configuration for the bundle stitcher.
//!
//! This crate is the foundation depended on by all other stitcher crates.
//! It provides:
//! - [`StitchError`] and the per-stage error enums
//! - Domain types ([`Bundle`], [`DocumentTask`], [`AnnotationSet`], [`Bookmark`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnnotationsConfig, AppConfig, CallbackConfig, PipelineConfig, StorageConfig, StoreConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from, resolve_credential,
};
pub use error::{
    AnnotationError, CallbackUnreachable, FetchError, MergeError, PublishError, Result,
    StitchError,
};
pub use types::{
    Annotation, AnnotationKind, AnnotationSet, Bookmark, Bundle, BundleDocument, BundleId,
    Credential, DocumentTask, LayoutConfig, PageRange, PaginationStyle, Rect, TaskId, TaskState,
    content_hash,
};
