// src/classify.rs

use crate::error::Result;
use crate::pdf_pages;
use crate::record::PageTypeMap;
use std::path::Path;
use tracing::info;

/// Tag every page as Consignment Note and/or MRN page.
///
/// Also returns the page count. Only opening the document can fail; an
/// unreadable page is classified from empty text.
pub fn classify(pdf_path: &Path) -> Result<(PageTypeMap, usize)> {
    let doc = pdf_pages::open(pdf_path)?;

    let mut cn_pages = Vec::new();
    let mut mrn_pages = Vec::new();
    let page_count = pdf_pages::for_each_page(&doc, |page| {
        if page.is_consignment_note() {
            cn_pages.push(page.page_number);
        }
        if page.is_mrn_page() {
            mrn_pages.push(page.page_number);
        }
    });

    let page_types = PageTypeMap::new(cn_pages, mrn_pages);
    info!(
        pages = page_count,
        consignment_notes = ?page_types.consignment_notes(),
        mrn = ?page_types.mrn(),
        "Classified pages"
    );
    Ok((page_types, page_count))
}
