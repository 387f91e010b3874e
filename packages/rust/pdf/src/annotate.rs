//! Overlay annotation sets as native PDF annotations.
//!
//! Each descriptor becomes an annotation dictionary appended to the page's
//! `/Annots`. Geometry arrives with a top-left origin and is flipped against
//! the page's `MediaBox`.

use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::debug;

use stitcher_shared::{Annotation, AnnotationError, AnnotationKind, AnnotationSet};

use crate::page;

const HIGHLIGHT_COLOR: [f32; 3] = [1.0, 0.92, 0.23];
const NOTE_COLOR: [f32; 3] = [1.0, 0.8, 0.0];
const STAMP_COLOR: [f32; 3] = [0.8, 0.1, 0.1];

/// Annotation flag `Print`.
const FLAG_PRINT: i64 = 4;

/// Apply `set` to the document in `bytes` and return the modified document.
///
/// Every page index is checked before anything is written, so a single
/// out-of-range entry leaves no partial result behind. An empty set returns
/// the bytes unparsed; an unreadable document then fails later, when it is
/// appended to the merge.
pub fn annotate(bytes: &[u8], set: &AnnotationSet) -> Result<Vec<u8>, AnnotationError> {
    if set.is_empty() {
        return Ok(bytes.to_vec());
    }

    let mut doc =
        Document::load_mem(bytes).map_err(|e| AnnotationError::Parse(e.to_string()))?;
    let pages = doc.get_pages();
    let page_count = pages.len();

    if let Some(page) = set.max_page() {
        if page as usize >= page_count {
            return Err(AnnotationError::PageOutOfRange { page, page_count });
        }
    }

    for (index, annotations) in set.iter() {
        if annotations.is_empty() {
            continue;
        }
        let Some(&page_id) = pages.get(&(index + 1)) else {
            return Err(AnnotationError::PageOutOfRange {
                page: index,
                page_count,
            });
        };
        let media_box = page::media_box(&doc, page_id);

        let refs: Vec<Object> = annotations
            .iter()
            .map(|a| Object::Reference(doc.add_object(annotation_dict(a, page_id, media_box))))
            .collect();
        append_annots(&mut doc, page_id, refs)
            .map_err(|e| AnnotationError::Serialize(e.to_string()))?;
        debug!(page = index, count = annotations.len(), "page annotated");
    }

    let mut output = Vec::with_capacity(bytes.len());
    doc.save_to(&mut output)
        .map_err(|e| AnnotationError::Serialize(e.to_string()))?;
    Ok(output)
}

/// `[llx, lly, urx, ury]` in PDF user space for a top-left `Rect`.
fn pdf_rect(a: &Annotation, media_box: [f32; 4]) -> [f32; 4] {
    let [x0, _, _, y1] = media_box;
    let g = a.geometry;
    let llx = x0 + g.x;
    let ury = y1 - g.y;
    [llx, ury - g.height, llx + g.width, ury]
}

fn numbers(values: &[f32]) -> Object {
    Object::Array(values.iter().map(|v| Object::Real((*v).into())).collect())
}

fn annotation_dict(a: &Annotation, page_id: ObjectId, media_box: [f32; 4]) -> Dictionary {
    let rect = pdf_rect(a, media_box);
    let [llx, lly, urx, ury] = rect;

    let (subtype, default_color) = match a.kind {
        AnnotationKind::Highlight => ("Highlight", HIGHLIGHT_COLOR),
        AnnotationKind::Note => ("Text", NOTE_COLOR),
        AnnotationKind::Stamp => ("Stamp", STAMP_COLOR),
    };

    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"Annot".to_vec()));
    dict.set("Subtype", Object::Name(subtype.as_bytes().to_vec()));
    dict.set("Rect", numbers(&rect));
    dict.set("P", Object::Reference(page_id));
    dict.set("F", Object::Integer(FLAG_PRINT));
    dict.set("C", numbers(&a.color.unwrap_or(default_color)));
    if !a.text.is_empty() {
        dict.set("Contents", Object::string_literal(a.text.as_str()));
    }
    if !a.author.is_empty() {
        dict.set("T", Object::string_literal(a.author.as_str()));
    }

    match a.kind {
        AnnotationKind::Highlight => {
            dict.set(
                "QuadPoints",
                numbers(&[llx, ury, urx, ury, llx, lly, urx, lly]),
            );
        }
        AnnotationKind::Note => {
            dict.set("Name", Object::Name(b"Comment".to_vec()));
            dict.set("Open", Object::Boolean(false));
        }
        AnnotationKind::Stamp => {
            dict.set("Name", Object::Name(b"Approved".to_vec()));
        }
    }
    dict
}

/// Append `refs` to the page's `/Annots`, whether inline or indirect.
fn append_annots(doc: &mut Document, page_id: ObjectId, refs: Vec<Object>) -> lopdf::Result<()> {
    let indirect = match doc.get_object(page_id)?.as_dict()?.get(b"Annots") {
        Ok(Object::Reference(id)) => Some(*id),
        _ => None,
    };

    if let Some(array_id) = indirect {
        if let Ok(Object::Array(existing)) = doc.get_object_mut(array_id) {
            existing.extend(refs);
            return Ok(());
        }
    }

    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    let mut annots = match page.get(b"Annots") {
        Ok(Object::Array(existing)) => existing.clone(),
        _ => Vec::new(),
    };
    annots.extend(refs);
    page.set("Annots", Object::Array(annots));
    Ok(())
}
