// src/reconcile.rs

use crate::heuristics::span_pages;
use crate::record::{MrnPages, PageTypeMap, Record};
use tracing::info;

/// How the final `mrn_pages` values were decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// The records already named MRN pages; they win outright.
    RecordClaimed,
    /// One record per CN page; each takes the MRN pages of its span.
    ConsignmentSpans,
    /// Record and CN counts differ; detected pages are dealt out in order.
    EvenDistribution,
    /// Nothing to assign from either source.
    NoMrnPages,
    /// Detected pages exist but there are no records to give them to.
    NoRecords,
}

/// Every page number the records claim, ascending and unique.
pub fn claimed_mrn_pages(records: &[Record]) -> Vec<u32> {
    let mut pages: Vec<u32> = records.iter().flat_map(|r| r.mrn_pages.pages()).collect();
    pages.sort_unstable();
    pages.dedup();
    pages
}

/// Settle one authoritative `mrn_pages` per record.
///
/// Pages claimed by the records take precedence and replace the detected
/// MRN list in `page_types`; otherwise the detected pages are assigned by
/// position. The records' own values are never mixed with detected ones.
pub fn reconcile(records: &mut [Record], page_types: &mut PageTypeMap) -> Policy {
    let claimed = claimed_mrn_pages(records);
    if !claimed.is_empty() {
        info!(pages = ?claimed, "Using MRN pages named by the extracted records");
        page_types.set_mrn(claimed);
        return Policy::RecordClaimed;
    }

    let detected = page_types.mrn().to_vec();
    if detected.is_empty() {
        for record in records.iter_mut() {
            record.mrn_pages = MrnPages::Empty;
        }
        return Policy::NoMrnPages;
    }
    if records.is_empty() {
        return Policy::NoRecords;
    }

    info!(pages = ?detected, "Using MRN pages found by text detection");
    let cn_pages = page_types.consignment_notes();
    if !cn_pages.is_empty() && cn_pages.len() == records.len() {
        for (i, record) in records.iter_mut().enumerate() {
            record.mrn_pages = MrnPages::from_pages(&span_pages(cn_pages, i, &detected));
        }
        Policy::ConsignmentSpans
    } else {
        distribute(records, &detected);
        Policy::EvenDistribution
    }
}

/// Front-loaded even split: the first `len % n` records get one extra page.
fn distribute(records: &mut [Record], pages: &[u32]) {
    let per_record = pages.len() / records.len();
    let remainder = pages.len() % records.len();

    let mut next = 0;
    for (i, record) in records.iter_mut().enumerate() {
        let take = per_record + usize::from(i < remainder);
        if next < pages.len() {
            let end = (next + take).min(pages.len());
            record.mrn_pages = MrnPages::from_pages(&pages[next..end]);
            next += take;
        } else {
            record.mrn_pages = MrnPages::Empty;
        }
    }
}
