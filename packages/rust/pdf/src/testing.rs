//! Small in-memory documents for tests.

use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, Stream};

/// An A4 document with `page_count` pages, each labelled "Page n".
///
/// `MediaBox` and `Resources` live on the page tree root, so pages only
/// carry them by inheritance.
pub fn sample_pdf(page_count: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut font = Dictionary::new();
    font.set("Type", Object::Name(b"Font".to_vec()));
    font.set("Subtype", Object::Name(b"Type1".to_vec()));
    font.set("BaseFont", Object::Name(b"Courier".to_vec()));
    let font_id = doc.add_object(font);

    let mut fonts = Dictionary::new();
    fonts.set("F1", Object::Reference(font_id));
    let mut resources = Dictionary::new();
    resources.set("Font", Object::Dictionary(fonts));
    let resources_id = doc.add_object(resources);

    let mut kids = Vec::with_capacity(page_count);
    for n in 1..=page_count {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), 24.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(format!("Page {n}"))]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            Dictionary::new(),
            content.encode().expect("encode sample content"),
        ));

        let mut page = Dictionary::new();
        page.set("Type", Object::Name(b"Page".to_vec()));
        page.set("Parent", Object::Reference(pages_id));
        page.set("Contents", Object::Reference(content_id));
        kids.push(Object::Reference(doc.add_object(page)));
    }

    let mut pages = Dictionary::new();
    pages.set("Type", Object::Name(b"Pages".to_vec()));
    pages.set("Kids", Object::Array(kids));
    pages.set("Count", Object::Integer(page_count as i64));
    pages.set(
        "MediaBox",
        Object::Array(vec![0.into(), 0.into(), 595.into(), 842.into()]),
    );
    pages.set("Resources", Object::Reference(resources_id));
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", Object::Reference(pages_id));
    let catalog_id = doc.add_object(catalog);
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("save sample document");
    bytes
}

/// Text drawn by `Tj` operators across every content stream of page `index`.
pub fn page_text(bytes: &[u8], index: usize) -> String {
    let doc = Document::load_mem(bytes).expect("load document");
    let pages = doc.get_pages();
    let page_id = *pages
        .get(&(index as u32 + 1))
        .expect("page index within document");
    let content = doc.get_page_content(page_id).expect("page content");
    let content = Content::decode(&content).expect("decode content");

    content
        .operations
        .iter()
        .filter(|op| op.operator == "Tj")
        .filter_map(|op| match op.operands.first() {
            Some(Object::String(text, _)) => Some(String::from_utf8_lossy(text).into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Position given by the `Td` that places `text` on page `index`.
pub fn text_position(bytes: &[u8], index: usize, text: &str) -> Option<(f32, f32)> {
    let doc = Document::load_mem(bytes).expect("load document");
    let page_id = *doc.get_pages().get(&(index as u32 + 1))?;
    let content = doc.get_page_content(page_id).expect("page content");
    let content = Content::decode(&content).expect("decode content");

    let number = |object: &Object| match object {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    };

    let mut position = None;
    for op in &content.operations {
        match op.operator.as_str() {
            "Td" if op.operands.len() == 2 => {
                position = number(&op.operands[0]).zip(number(&op.operands[1]));
            }
            "Tj" => {
                if let Some(Object::String(shown, _)) = op.operands.first() {
                    if shown.as_slice() == text.as_bytes() {
                        return position;
                    }
                }
            }
            _ => {}
        }
    }
    None
}
