// src/pdf_pages.rs

use crate::error::Result;
use crate::heuristics;
use lopdf::{Document, Object, ObjectId};
use std::path::Path;
use tracing::{debug, info, warn};

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Guard against cyclic `Parent` chains in broken files.
const MAX_TREE_DEPTH: usize = 64;

/// One page's text, alive only while it is being looked at.
#[derive(Debug)]
pub struct Page {
    /// 1-based, document order.
    pub page_number: u32,
    pub text: String,
}

impl Page {
    pub fn is_consignment_note(&self) -> bool {
        heuristics::is_consignment_note_page(&self.text)
    }

    pub fn is_mrn_page(&self) -> bool {
        heuristics::is_mrn_page(&self.text)
    }
}

/// Open a PDF. Failing here is fatal for the document.
pub fn open(path: &Path) -> Result<Document> {
    let doc = Document::load(path)?;
    info!(path = %path.display(), pages = doc.get_pages().len(), "Opened PDF");
    Ok(doc)
}

pub fn page_count(path: &Path) -> Result<usize> {
    Ok(Document::load(path)?.get_pages().len())
}

/// Walk the pages in order, handing each page's text to `visit`.
///
/// A page whose text cannot be extracted is passed on with empty text.
/// Returns the number of pages visited.
pub fn for_each_page(doc: &Document, mut visit: impl FnMut(Page)) -> usize {
    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
    for &page_number in &page_numbers {
        let text = match doc.extract_text(&[page_number]) {
            Ok(text) => text,
            Err(e) => {
                warn!(page = page_number, error = %e, "Could not extract page text; treating as empty");
                String::new()
            }
        };
        visit(Page { page_number, text });
    }
    page_numbers.len()
}

/// Full text with page markers, for text-mode AI prompts.
pub fn marked_text(doc: &Document) -> String {
    let mut parts = Vec::new();
    for_each_page(doc, |page| {
        if !page.text.trim().is_empty() {
            parts.push(format!("--- PAGE {} ---\n{}\n", page.page_number, page.text));
        }
    });
    parts.join("\n")
}

/// Copy the given 1-based pages, in the given order, into `output`.
///
/// Out-of-range numbers are skipped and repeats keep their first position.
/// Returns the number of pages written.
pub fn extract_pages(source: &Path, page_numbers: &[u32], output: &Path) -> Result<usize> {
    let doc = Document::load(source)?;
    let mut sub = sub_document(doc, page_numbers)?;
    let written = sub.get_pages().len();
    sub.save(output)?;
    info!(output = %output.display(), pages = written, "Saved page sub-document");
    Ok(written)
}

/// Reduce `doc` to the selected pages, flattened under the root page node.
pub fn sub_document(mut doc: Document, page_numbers: &[u32]) -> Result<Document> {
    let pages = doc.get_pages();
    let mut selected: Vec<ObjectId> = Vec::with_capacity(page_numbers.len());
    for page_number in page_numbers {
        match pages.get(page_number) {
            Some(id) if !selected.contains(id) => selected.push(*id),
            Some(_) => {}
            None => debug!(page = page_number, total = pages.len(), "Skipping out-of-range page"),
        }
    }

    let root_pages_id = page_tree_root(&doc)?;

    for &page_id in &selected {
        let inherited: Vec<(&[u8], Object)> = INHERITABLE
            .iter()
            .filter_map(|key| inherited_attribute(&doc, page_id, key).map(|v| (*key, v)))
            .collect();

        let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
        for (key, value) in inherited {
            page.set(key.to_vec(), value);
        }
        page.set("Parent", Object::Reference(root_pages_id));
    }

    let root = doc.get_object_mut(root_pages_id)?.as_dict_mut()?;
    root.set(
        "Kids",
        Object::Array(selected.iter().map(|id| Object::Reference(*id)).collect()),
    );
    root.set("Count", Object::Integer(selected.len() as i64));

    doc.prune_objects();
    Ok(doc)
}

fn page_tree_root(doc: &Document) -> Result<ObjectId> {
    let catalog_id = doc.trailer.get(b"Root")?.as_reference()?;
    Ok(doc.get_dictionary(catalog_id)?.get(b"Pages")?.as_reference()?)
}

/// Value of `key` from the nearest ancestor, when the page lacks its own.
fn inherited_attribute(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let page = doc.get_dictionary(page_id).ok()?;
    if page.has(key) {
        return None;
    }

    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    for _ in 0..MAX_TREE_DEPTH {
        let node = doc.get_dictionary(parent?).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

#[cfg(test)]
pub(crate) mod test_support {
    use lopdf::content::{Content, Operation};
    use lopdf::{Document, Object, Stream, dictionary};
    use std::path::{Path, PathBuf};

    /// A Helvetica document, one text line per `\n` in each page string.
    pub fn build_pdf(pages: &[&str]) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in pages {
            let mut operations = Vec::new();
            for (i, line) in text.lines().enumerate() {
                operations.push(Operation::new("BT", vec![]));
                operations.push(Operation::new(
                    "Tf",
                    vec![Object::Name(b"F1".to_vec()), Object::Integer(12)],
                ));
                operations.push(Operation::new(
                    "Td",
                    vec![Object::Integer(50), Object::Integer(780 - 16 * i as i64)],
                ));
                operations.push(Operation::new("Tj", vec![Object::string_literal(line)]));
                operations.push(Operation::new("ET", vec![]));
            }
            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => Object::Integer(count),
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(595),
                Object::Integer(842),
            ],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    pub fn write_pdf(dir: &Path, name: &str, pages: &[&str]) -> PathBuf {
        let path = dir.join(name);
        build_pdf(pages).save(&path).unwrap();
        path
    }
}
