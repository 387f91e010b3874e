//! Helpers over lopdf page dictionaries.
//!
//! PDF uses a bottom-left origin. Callers convert top-left geometry with
//! `pdf_y = y1 - y` against the page's `MediaBox`.

use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

/// US Letter, used when a page carries no usable `MediaBox`.
pub(crate) const DEFAULT_MEDIA_BOX: [f32; 4] = [0.0, 0.0, 612.0, 792.0];

/// Attributes a page may inherit from its ancestors in the page tree.
pub(crate) const INHERITABLE: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

/// Upper bound on `Parent` hops, guarding against cyclic page trees.
const MAX_TREE_DEPTH: usize = 32;

/// Numeric value of an `Integer` or `Real` object.
pub(crate) fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

/// Follow a single level of indirection.
pub(crate) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        other => other,
    }
}

/// Look up `key` on the page, then on each ancestor.
pub(crate) fn inherited(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = doc.get_object(page_id).ok()?.as_dict().ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = current.get(key) {
            return Some(value.clone());
        }
        let parent = match current.get(b"Parent") {
            Ok(Object::Reference(id)) => *id,
            _ => return None,
        };
        current = doc.get_object(parent).ok()?.as_dict().ok()?;
    }
    None
}

/// The page's `MediaBox` as `[x0, y0, x1, y1]`.
pub(crate) fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    inherited(doc, page_id, b"MediaBox")
        .and_then(|obj| rect_values(doc, &obj))
        .unwrap_or(DEFAULT_MEDIA_BOX)
}

fn rect_values(doc: &Document, obj: &Object) -> Option<[f32; 4]> {
    let Object::Array(arr) = resolve(doc, obj) else {
        return None;
    };
    if arr.len() != 4 {
        return None;
    }
    let values: Vec<f32> = arr
        .iter()
        .filter_map(|o| number(resolve(doc, o)))
        .collect();
    match values.as_slice() {
        [a, b, c, d] => Some([a.min(*c), b.min(*d), a.max(*c), b.max(*d)]),
        _ => None,
    }
}

/// Draw `overlay` on top of the page's existing content.
///
/// The existing content is wrapped in `q`/`Q` so graphics state it leaves
/// behind cannot displace the overlay.
pub(crate) fn overlay_content(
    doc: &mut Document,
    page_id: ObjectId,
    overlay: Vec<u8>,
) -> lopdf::Result<()> {
    let existing: Vec<Object> = {
        let page = doc.get_object(page_id)?.as_dict()?;
        match page.get(b"Contents") {
            Ok(Object::Reference(id)) => match doc.get_object(*id) {
                Ok(Object::Array(arr)) => arr.clone(),
                _ => vec![Object::Reference(*id)],
            },
            Ok(Object::Array(arr)) => arr.clone(),
            _ => Vec::new(),
        }
    };

    let contents = if existing.is_empty() {
        vec![Object::Reference(add_stream(doc, overlay))]
    } else {
        let mut tail = b"Q\n".to_vec();
        tail.extend_from_slice(&overlay);
        let open = add_stream(doc, b"q\n".to_vec());
        let close = add_stream(doc, tail);

        let mut contents = Vec::with_capacity(existing.len() + 2);
        contents.push(Object::Reference(open));
        contents.extend(existing);
        contents.push(Object::Reference(close));
        contents
    };

    doc.get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Contents", Object::Array(contents));
    Ok(())
}

fn add_stream(doc: &mut Document, content: Vec<u8>) -> ObjectId {
    doc.add_object(Stream::new(Dictionary::new(), content))
}

/// A copy of the page's resources with `font_id` registered as `/name`.
pub(crate) fn resources_with_font(
    doc: &Document,
    page_id: ObjectId,
    name: &str,
    font_id: ObjectId,
) -> Dictionary {
    let mut resources = inherited(doc, page_id, b"Resources")
        .and_then(|obj| resolve(doc, &obj).as_dict().ok().cloned())
        .unwrap_or_else(Dictionary::new);

    let mut fonts = resources
        .get(b"Font")
        .ok()
        .and_then(|obj| resolve(doc, obj).as_dict().ok().cloned())
        .unwrap_or_else(Dictionary::new);
    fonts.set(name, Object::Reference(font_id));
    resources.set("Font", Object::Dictionary(fonts));
    resources
}

/// A standard-14 Helvetica font dictionary.
pub(crate) fn helvetica() -> Dictionary {
    let mut font = Dictionary::new();
    font.set("Type", Object::Name(b"Font".to_vec()));
    font.set("Subtype", Object::Name(b"Type1".to_vec()));
    font.set("BaseFont", Object::Name(b"Helvetica".to_vec()));
    font.set("Encoding", Object::Name(b"WinAnsiEncoding".to_vec()));
    font
}

/// Rough Helvetica advance width, good enough for centring short labels.
pub(crate) fn approx_text_width(text: &str, font_size: f32) -> f32 {
    text.chars().count() as f32 * font_size * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_pdf;

    #[test]
    fn media_box_is_inherited_from_page_tree() {
        let doc = Document::load_mem(&sample_pdf(2)).unwrap();
        let (_, first) = doc.get_pages().into_iter().next().unwrap();
        assert_eq!(media_box(&doc, first), [0.0, 0.0, 595.0, 842.0]);
        assert!(inherited(&doc, first, b"Resources").is_some());
        assert!(inherited(&doc, first, b"Rotate").is_none());
    }

    #[test]
    fn overlay_wraps_existing_content() {
        let mut doc = Document::load_mem(&sample_pdf(1)).unwrap();
        let (_, page_id) = doc.get_pages().into_iter().next().unwrap();

        overlay_content(&mut doc, page_id, b"0 0 m 10 10 l S\n".to_vec()).unwrap();

        let page = doc.get_object(page_id).unwrap().as_dict().unwrap();
        let Ok(Object::Array(contents)) = page.get(b"Contents") else {
            panic!("contents should be an array");
        };
        assert_eq!(contents.len(), 3);
    }

    #[test]
    fn font_is_added_to_a_copy_of_resources() {
        let doc = Document::load_mem(&sample_pdf(1)).unwrap();
        let (_, page_id) = doc.get_pages().into_iter().next().unwrap();

        let resources = resources_with_font(&doc, page_id, "FStitch", (999, 0));
        let fonts = resources.get(b"Font").unwrap().as_dict().unwrap();
        assert!(fonts.has(b"F1"));
        assert!(fonts.has(b"FStitch"));
    }
}
