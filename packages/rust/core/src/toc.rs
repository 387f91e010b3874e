//! Outline (table of contents) planning for the merged output.
//!
//! One bookmark per merged document, titled by its filename and pointing at
//! the first page of its recorded range. Ranges are consumed in merge order
//! in a single forward pass; they never overlap and never go backwards.

use tracing::{debug, instrument, warn};

use stitcher_shared::{Bookmark, BundleDocument, PageRange};

/// Plan the outline for `documents`, given in merge order.
///
/// `offset` is the number of pages placed in front of the merged documents
/// (the cover page, if any). Documents without a recorded range are skipped.
#[instrument(skip_all, fields(document_count = documents.len(), offset = offset))]
pub fn build_outline(documents: &[BundleDocument], offset: u32) -> Vec<Bookmark> {
    let mut bookmarks = Vec::new();
    let mut next_start = 0u32;

    for doc in documents {
        let Some(range) = doc.page_range else {
            warn!(document_id = %doc.document_id, "document has no page range, skipping bookmark");
            continue;
        };
        debug_assert!(
            range.start >= next_start,
            "page ranges must follow merge order"
        );
        next_start = range.end;

        bookmarks.push(Bookmark {
            title: bookmark_title(doc),
            page: range.shifted(offset).start,
        });
    }

    debug!(bookmarks = bookmarks.len(), "outline planned");
    bookmarks
}

/// Display title of a document's bookmark.
fn bookmark_title(doc: &BundleDocument) -> String {
    let name = doc.filename.trim();
    if name.is_empty() {
        doc.document_id.clone()
    } else {
        name.to_string()
    }
}

/// Whether `ranges` tile `[0, total)` contiguously in order.
pub fn ranges_are_contiguous(ranges: &[PageRange], total: u32) -> bool {
    let mut cursor = 0;
    for range in ranges {
        if range.start != cursor || range.end < range.start {
            return false;
        }
        cursor = range.end;
    }
    cursor == total
}
