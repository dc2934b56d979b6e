// src/heuristics/mod.rs

mod consignment;

use crate::error::Result;
use crate::pdf_pages;
use crate::record::{MrnPages, Record};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

pub use consignment::{extract_hs_codes, find_cn_number, parse_shipment_total};

/// Shortest token we accept as a customs MRN code.
const MIN_MRN_CODE_LEN: usize = 15;

pub fn is_consignment_note_page(text: &str) -> bool {
    text.to_lowercase().contains("consignment note")
}

/// "mrn" somewhere on the page plus at least one long alphanumeric token.
pub fn is_mrn_page(text: &str) -> bool {
    if !text.to_lowercase().contains("mrn") {
        return false;
    }
    text.split_whitespace().any(looks_like_mrn_code)
}

fn looks_like_mrn_code(token: &str) -> bool {
    let stripped: String = token.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    stripped.len() >= MIN_MRN_CODE_LEN
}

/// Pages strictly after `cn_pages[index]` and before the next CN page.
///
/// `cn_pages` must be ascending; the last CN page's span runs to the end.
pub fn span_pages(cn_pages: &[u32], index: usize, pages: &[u32]) -> Vec<u32> {
    let Some(&start) = cn_pages.get(index) else {
        return Vec::new();
    };
    let end = cn_pages.get(index + 1).copied();
    pages
        .iter()
        .copied()
        .filter(|&p| p > start && end.is_none_or(|e| p < e))
        .collect()
}

/// Derive records from page text alone, without any AI call.
pub fn extract_without_ai(pdf_path: &Path) -> Result<Vec<Record>> {
    let doc = pdf_pages::open(pdf_path)?;

    let mut texts: BTreeMap<u32, String> = BTreeMap::new();
    let mut cn_pages = Vec::new();
    let mut mrn_pages = Vec::new();

    pdf_pages::for_each_page(&doc, |page| {
        let is_cn = page.is_consignment_note();
        let is_mrn = page.is_mrn_page();
        if is_cn {
            cn_pages.push(page.page_number);
        }
        if is_mrn {
            mrn_pages.push(page.page_number);
        }
        // Text of other pages is never looked at again.
        if is_cn || is_mrn {
            texts.insert(page.page_number, page.text);
        }
    });
    drop(doc);

    let records = records_from_pages(&texts, &cn_pages, &mrn_pages);
    info!(
        cn_pages = cn_pages.len(),
        mrn_pages = mrn_pages.len(),
        records = records.len(),
        "Deterministic extraction complete"
    );
    Ok(records)
}

/// One record per CN page, with the MRN pages of its span attached.
pub fn records_from_pages(
    texts: &BTreeMap<u32, String>,
    cn_pages: &[u32],
    mrn_pages: &[u32],
) -> Vec<Record> {
    let mut records = Vec::new();

    for (i, cn_page) in cn_pages.iter().enumerate() {
        let assigned = span_pages(cn_pages, i, mrn_pages);
        let cn_text = texts.get(cn_page).map(String::as_str).unwrap_or("");

        let cn_number = find_cn_number(cn_text).unwrap_or_default();
        let total = parse_shipment_total(cn_text).unwrap_or_default();

        let hs_codes: Vec<Value> = assigned
            .iter()
            .filter_map(|p| texts.get(p))
            .flat_map(|text| extract_hs_codes(text))
            .map(Value::String)
            .collect();

        if cn_number.is_empty() && total.is_empty() {
            continue;
        }

        let mut record = Record::default();
        record.set("consignment_note", cn_number);
        record.set("gross_weight_kg", total.gross_weight_kg);
        record.set("packages", total.packages);
        record.set("volume_m3", total.volume_m3);
        record.set("hs_codes", Value::Array(hs_codes));
        record.mrn_pages = if assigned.is_empty() {
            MrnPages::Empty
        } else {
            MrnPages::List(assigned)
        };
        records.push(record);
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf_pages::test_support::write_pdf;
    use serde_json::json;

    const MRN_LINE: &str = "MRN 25CZ3O000OO1DAGMB8";

    #[test]
    fn test_mrn_page_needs_keyword_and_long_code() {
        assert!(is_mrn_page("Export MRN: 25CZ3O000OO1DAGMB8"));
        assert!(is_mrn_page("mrn (25CZ-3O00-0OO1-DAGMB8)"));
        assert!(!is_mrn_page("MRN pending"));
        assert!(!is_mrn_page("code 25CZ3O000OO1DAGMB8 without the keyword"));
    }

    #[test]
    fn test_consignment_note_page_is_case_insensitive() {
        assert!(is_consignment_note_page("CONSIGNMENT NOTE 40846302"));
        assert!(!is_consignment_note_page("consignment"));
    }

    #[test]
    fn test_span_pages() {
        let cn = [1, 5];
        let pages = [2, 3, 5, 6, 9];
        assert_eq!(span_pages(&cn, 0, &pages), vec![2, 3]);
        assert_eq!(span_pages(&cn, 1, &pages), vec![6, 9]);
        assert!(span_pages(&cn, 2, &pages).is_empty());
    }

    #[test]
    fn test_records_keep_duplicate_hs_codes() {
        let mut texts = BTreeMap::new();
        texts.insert(
            1,
            "CONSIGNMENT NOTE 40846302\nShipment total: 6colli 1478,0 6,432".to_string(),
        );
        texts.insert(
            2,
            format!("{MRN_LINE}\nQBP3123 CZ 85472000\nQBP3123 CZ 85472000"),
        );

        let records = records_from_pages(&texts, &[1], &[2]);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.get("consignment_note"), Some(&json!("40846302")));
        assert_eq!(record.get("packages"), Some(&json!("6")));
        assert_eq!(record.get("gross_weight_kg"), Some(&json!("1478.0")));
        assert_eq!(record.get("volume_m3"), Some(&json!("6.432")));
        assert_eq!(record.get("hs_codes"), Some(&json!(["85472000", "85472000"])));
        assert_eq!(record.mrn_pages, MrnPages::List(vec![2]));
    }

    #[test]
    fn test_record_without_any_economic_field_is_dropped() {
        let mut texts = BTreeMap::new();
        texts.insert(1, "Consignment note, no numbers here".to_string());
        texts.insert(2, format!("{MRN_LINE}\nQBP1 CZ 12345678"));

        assert!(records_from_pages(&texts, &[1], &[2]).is_empty());
    }

    #[test]
    fn test_record_kept_without_hs_codes() {
        let mut texts = BTreeMap::new();
        texts.insert(1, "Consignment note 123456".to_string());

        let records = records_from_pages(&texts, &[1], &[]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("gross_weight_kg"), Some(&json!("")));
        assert_eq!(records[0].get("hs_codes"), Some(&json!([])));
        assert!(records[0].mrn_pages.is_empty());
    }

    #[test]
    fn test_extract_without_ai_assigns_mrn_pages_by_span() {
        let dir = tempfile::tempdir().unwrap();
        let mrn_a = format!("{MRN_LINE}\nQBP3123 CZ 85472000\nQBP3123 CZ 85472000");
        let mrn_b = format!("{MRN_LINE}\nABP77 CZ 39269097");
        let mrn_c = format!("{MRN_LINE}\nXBP1 CZ 73181588");
        let pdf = write_pdf(
            dir.path(),
            "two_cn.pdf",
            &[
                "CONSIGNMENT NOTE 40846302\nShipment total: 6colli 1478,0 6,432",
                &mrn_a,
                &mrn_b,
                "CONSIGNMENT NOTE 40846399\nShipment total: 2colli 310,5 1,2",
                &mrn_c,
            ],
        );

        let records = extract_without_ai(&pdf).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].get("consignment_note"), Some(&json!("40846302")));
        assert_eq!(records[0].mrn_pages, MrnPages::List(vec![2, 3]));
        assert_eq!(
            records[0].get("hs_codes"),
            Some(&json!(["85472000", "85472000", "39269097"]))
        );

        assert_eq!(records[1].get("consignment_note"), Some(&json!("40846399")));
        assert_eq!(records[1].mrn_pages, MrnPages::List(vec![5]));
        assert_eq!(records[1].get("hs_codes"), Some(&json!(["73181588"])));
    }
}
