//! Page-level document manipulation for the stitcher.
//!
//! Built on `lopdf`; this crate never parses PDF syntax itself.
//! - [`annotate`] overlays an [`AnnotationSet`](stitcher_shared::AnnotationSet)
//!   as native annotations.
//! - [`MergeState`] concatenates documents and finalizes the merged output
//!   (cover page, outline, page-number stamps).

pub mod annotate;
pub mod merge;
mod page;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use annotate::annotate;
pub use merge::{CoverPage, FinalizeOptions, MergeState, MergedDocument, COVER_PAGES};

/// Number of pages in `bytes`, or `None` if it is not a loadable PDF.
pub fn page_count(bytes: &[u8]) -> Option<usize> {
    lopdf::Document::load_mem(bytes)
        .ok()
        .map(|doc| doc.get_pages().len())
}
