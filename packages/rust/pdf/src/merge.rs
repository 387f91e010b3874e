//! Incremental document merging.
//!
//! [`MergeState`] accumulates pages from each appended document and
//! [`MergeState::finalize`] assembles them into one output with an optional
//! cover page, outline, and page-number stamps.
//!
//! Every appended document is renumbered above the objects already held, so
//! object ids never collide. Source catalogs, page trees, and outlines are
//! discarded; inheritable page attributes are copied onto each page first.

use std::collections::BTreeMap;

use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::debug;

use stitcher_shared::{Bookmark, MergeError, PageRange, PaginationStyle};

use crate::page;

/// Pages added in front of the merged documents when a cover is requested.
pub const COVER_PAGES: u32 = 1;

const COVER_FONT: &str = "FCover";
const STAMP_FONT: &str = "FStitch";
const STAMP_FONT_SIZE: f32 = 9.0;
const STAMP_MARGIN: f32 = 18.0;

// ---------------------------------------------------------------------------
// Options and output
// ---------------------------------------------------------------------------

/// Title page generated in front of the merged documents.
#[derive(Debug, Clone, Default)]
pub struct CoverPage {
    pub title: String,
    /// One line per merged document, in merge order.
    pub entries: Vec<String>,
}

/// Post-processing applied when the merge is finalized.
#[derive(Debug, Clone, Default)]
pub struct FinalizeOptions {
    /// Document title recorded in the output's info dictionary.
    pub title: String,
    pub cover: Option<CoverPage>,
    /// Outline entries; page indices refer to the finalized output.
    pub bookmarks: Vec<Bookmark>,
    pub pagination: PaginationStyle,
}

/// The finalized merged output.
#[derive(Debug, Clone)]
pub struct MergedDocument {
    pub bytes: Vec<u8>,
    pub page_count: usize,
    pub bookmarks: Vec<Bookmark>,
}

// ---------------------------------------------------------------------------
// MergeState
// ---------------------------------------------------------------------------

/// In-progress merge: pages and supporting objects of every appended document.
#[derive(Debug, Default)]
pub struct MergeState {
    pages: Vec<(ObjectId, Dictionary)>,
    objects: BTreeMap<ObjectId, Object>,
    max_id: u32,
    documents: usize,
}

impl MergeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages appended so far.
    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Documents appended so far.
    pub fn document_count(&self) -> usize {
        self.documents
    }

    /// Append every page of `bytes`, returning where they landed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<PageRange, MergeError> {
        let index = self.documents;
        let invalid = |reason: String| MergeError::InvalidDocument { index, reason };

        let mut doc = Document::load_mem(bytes).map_err(|e| invalid(e.to_string()))?;
        doc.renumber_objects_with(self.max_id + 1);

        let source_pages = doc.get_pages();
        if source_pages.is_empty() {
            return Err(invalid("document has no pages".into()));
        }

        let start = self.page_count();
        let mut pages = Vec::with_capacity(source_pages.len());
        for &page_id in source_pages.values() {
            let mut dict = doc
                .get_object(page_id)
                .and_then(Object::as_dict)
                .map_err(|e| invalid(format!("page {page_id:?}: {e}")))?
                .clone();
            for key in page::INHERITABLE {
                if !dict.has(key) {
                    if let Some(value) = page::inherited(&doc, page_id, key) {
                        dict.set(key.to_vec(), value);
                    }
                }
            }
            dict.remove(b"Parent");
            pages.push((page_id, dict));
        }

        let page_ids: Vec<ObjectId> = pages.iter().map(|(id, _)| *id).collect();
        for (id, object) in doc.objects {
            if page_ids.contains(&id) {
                continue;
            }
            match object.type_name().unwrap_or("") {
                "Catalog" | "Pages" | "Outlines" | "Outline" => {}
                _ => {
                    self.objects.insert(id, object);
                }
            }
        }

        self.max_id = self.max_id.max(doc.max_id);
        self.pages.extend(pages);
        self.documents += 1;

        let range = PageRange::new(start, self.page_count());
        debug!(index, start = range.start, end = range.end, "document appended");
        Ok(range)
    }

    /// Assemble the final document.
    pub fn finalize(self, options: &FinalizeOptions) -> Result<MergedDocument, MergeError> {
        if self.pages.is_empty() {
            return Err(MergeError::Empty);
        }

        let cover_pages = if options.cover.is_some() { COVER_PAGES } else { 0 };
        let page_count = self.pages.len() + cover_pages as usize;
        for bookmark in &options.bookmarks {
            if bookmark.page as usize >= page_count {
                return Err(MergeError::BookmarkOutOfRange {
                    title: bookmark.title.clone(),
                    page: bookmark.page,
                    page_count,
                });
            }
        }

        let mut doc = Document::with_version("1.7");
        doc.objects = self.objects;
        doc.max_id = self.max_id;

        let pages_id = doc.new_object_id();
        let mut kids: Vec<ObjectId> = Vec::with_capacity(page_count);

        if let Some(cover) = &options.cover {
            let media_box = self
                .pages
                .first()
                .and_then(|(_, dict)| dict.get(b"MediaBox").ok().cloned())
                .and_then(|obj| media_box_of(&doc, &obj))
                .unwrap_or(page::DEFAULT_MEDIA_BOX);
            kids.push(add_cover_page(&mut doc, pages_id, cover, media_box)?);
        }

        for (id, mut dict) in self.pages {
            dict.set("Parent", Object::Reference(pages_id));
            doc.objects.insert(id, Object::Dictionary(dict));
            kids.push(id);
        }

        let mut pages = Dictionary::new();
        pages.set("Type", Object::Name(b"Pages".to_vec()));
        pages.set(
            "Kids",
            Object::Array(kids.iter().copied().map(Object::Reference).collect()),
        );
        pages.set("Count", Object::Integer(kids.len() as i64));
        doc.objects.insert(pages_id, Object::Dictionary(pages));

        if options.pagination != PaginationStyle::None {
            stamp_page_numbers(&mut doc, &kids, options.pagination)?;
        }

        let mut catalog = Dictionary::new();
        catalog.set("Type", Object::Name(b"Catalog".to_vec()));
        catalog.set("Pages", Object::Reference(pages_id));
        if !options.bookmarks.is_empty() {
            let outlines_id = add_outline(&mut doc, &kids, &options.bookmarks);
            catalog.set("Outlines", Object::Reference(outlines_id));
            catalog.set("PageMode", Object::Name(b"UseOutlines".to_vec()));
        }
        let catalog_id = doc.add_object(catalog);
        doc.trailer.set("Root", Object::Reference(catalog_id));

        let mut info = Dictionary::new();
        if !options.title.is_empty() {
            info.set("Title", Object::string_literal(options.title.as_str()));
        }
        info.set(
            "Producer",
            Object::string_literal(concat!("stitcher ", env!("CARGO_PKG_VERSION"))),
        );
        let info_id = doc.add_object(info);
        doc.trailer.set("Info", Object::Reference(info_id));

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes)
            .map_err(|e| MergeError::Serialize(e.to_string()))?;

        debug!(page_count, bytes = bytes.len(), "merge finalized");
        Ok(MergedDocument {
            bytes,
            page_count,
            bookmarks: options.bookmarks.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Finalization passes
// ---------------------------------------------------------------------------

fn media_box_of(doc: &Document, obj: &Object) -> Option<[f32; 4]> {
    let Object::Array(values) = page::resolve(doc, obj) else {
        return None;
    };
    let values: Vec<f32> = values
        .iter()
        .filter_map(|v| page::number(page::resolve(doc, v)))
        .collect();
    match values.as_slice() {
        [a, b, c, d] => Some([*a, *b, *c, *d]),
        _ => None,
    }
}

fn encode(operations: Vec<Operation>) -> Result<Vec<u8>, MergeError> {
    Content { operations }
        .encode()
        .map_err(|e| MergeError::Serialize(e.to_string()))
}

fn text_at(font: &str, size: f32, x: f32, y: f32, text: &str) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new(
            "Tf",
            vec![Object::Name(font.as_bytes().to_vec()), Object::Real(size.into())],
        ),
        Operation::new("Td", vec![Object::Real(x.into()), Object::Real(y.into())]),
        Operation::new("Tj", vec![Object::string_literal(text)]),
        Operation::new("ET", vec![]),
    ]
}

fn add_cover_page(
    doc: &mut Document,
    pages_id: ObjectId,
    cover: &CoverPage,
    media_box: [f32; 4],
) -> Result<ObjectId, MergeError> {
    let [x0, y0, x1, y1] = media_box;
    let left = x0 + 72.0;
    let bottom = y0 + 72.0;
    let mut y = y1 - 144.0;

    let mut ops = text_at(COVER_FONT, 24.0, left, y, &cover.title);
    y -= 48.0;

    for (n, entry) in cover.entries.iter().enumerate() {
        if y < bottom {
            let rest = cover.entries.len() - n;
            ops.extend(text_at(COVER_FONT, 12.0, left, y, &format!("... and {rest} more")));
            break;
        }
        ops.extend(text_at(COVER_FONT, 12.0, left, y, &format!("{}. {entry}", n + 1)));
        y -= 18.0;
    }

    let content_id = doc.add_object(lopdf::Stream::new(Dictionary::new(), encode(ops)?));
    let font_id = doc.add_object(page::helvetica());

    let mut fonts = Dictionary::new();
    fonts.set(COVER_FONT, Object::Reference(font_id));
    let mut resources = Dictionary::new();
    resources.set("Font", Object::Dictionary(fonts));

    let mut page_dict = Dictionary::new();
    page_dict.set("Type", Object::Name(b"Page".to_vec()));
    page_dict.set("Parent", Object::Reference(pages_id));
    page_dict.set(
        "MediaBox",
        Object::Array(vec![
            Object::Real(x0.into()),
            Object::Real(y0.into()),
            Object::Real(x1.into()),
            Object::Real(y1.into()),
        ]),
    );
    page_dict.set("Resources", Object::Dictionary(resources));
    page_dict.set("Contents", Object::Reference(content_id));
    Ok(doc.add_object(page_dict))
}

/// Stamp "n of total" on every page.
fn stamp_page_numbers(
    doc: &mut Document,
    kids: &[ObjectId],
    style: PaginationStyle,
) -> Result<(), MergeError> {
    let font_id = doc.add_object(page::helvetica());
    let total = kids.len();

    for (n, &page_id) in kids.iter().enumerate() {
        let [x0, y0, x1, y1] = page::media_box(doc, page_id);
        let label = format!("{} of {total}", n + 1);
        let x = x0 + (x1 - x0 - page::approx_text_width(&label, STAMP_FONT_SIZE)) / 2.0;
        let y = match style {
            PaginationStyle::Top => y1 - STAMP_MARGIN,
            _ => y0 + STAMP_MARGIN - STAMP_FONT_SIZE / 2.0,
        };

        let mut ops = vec![Operation::new("g", vec![Object::Integer(0)])];
        ops.extend(text_at(STAMP_FONT, STAMP_FONT_SIZE, x, y, &label));
        let overlay = encode(ops)?;

        let resources = page::resources_with_font(doc, page_id, STAMP_FONT, font_id);
        let stamp_err = |e: lopdf::Error| MergeError::Serialize(format!("page {}: {e}", n + 1));
        doc.get_object_mut(page_id)
            .and_then(Object::as_dict_mut)
            .map_err(stamp_err)?
            .set("Resources", Object::Dictionary(resources));
        page::overlay_content(doc, page_id, overlay).map_err(stamp_err)?;
    }
    Ok(())
}

/// Build a flat outline, one item per bookmark, and return its root.
fn add_outline(doc: &mut Document, kids: &[ObjectId], bookmarks: &[Bookmark]) -> ObjectId {
    let outlines_id = doc.new_object_id();
    let item_ids: Vec<ObjectId> = bookmarks.iter().map(|_| doc.new_object_id()).collect();

    for (i, (bookmark, &item_id)) in bookmarks.iter().zip(&item_ids).enumerate() {
        let target = kids[bookmark.page as usize];

        let mut item = Dictionary::new();
        item.set("Title", Object::string_literal(bookmark.title.as_str()));
        item.set("Parent", Object::Reference(outlines_id));
        item.set(
            "Dest",
            Object::Array(vec![
                Object::Reference(target),
                Object::Name(b"Fit".to_vec()),
            ]),
        );
        if i > 0 {
            item.set("Prev", Object::Reference(item_ids[i - 1]));
        }
        if let Some(&next) = item_ids.get(i + 1) {
            item.set("Next", Object::Reference(next));
        }
        doc.objects.insert(item_id, Object::Dictionary(item));
    }

    let mut outlines = Dictionary::new();
    outlines.set("Type", Object::Name(b"Outlines".to_vec()));
    if let (Some(&first), Some(&last)) = (item_ids.first(), item_ids.last()) {
        outlines.set("First", Object::Reference(first));
        outlines.set("Last", Object::Reference(last));
    }
    outlines.set("Count", Object::Integer(item_ids.len() as i64));
    doc.objects.insert(outlines_id, Object::Dictionary(outlines));
    outlines_id
}
