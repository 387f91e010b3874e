//! Task orchestration for the bundle stitcher.
//!
//! This crate ties together the document store, the annotator, and the merger
//! into the stitch pipeline ([`Stitcher::process`]), runs batches of tasks on
//! a bounded [`WorkerPool`], and maps tasks to and from their wire formats.

pub mod case_update;
pub mod dto;
pub mod pipeline;
pub mod toc;
pub mod worker;

pub use case_update::{
    CallbackTarget, CaseContext, CaseDocumentUpdate, StitchRequest, StitchResponse,
};
pub use dto::{BundleDocumentDto, BundleDto, TaskDto};
pub use pipeline::{ProgressReporter, SilentProgress, StitchOptions, Stitcher};
pub use worker::WorkerPool;
