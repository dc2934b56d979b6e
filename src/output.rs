// src/output.rs

use crate::error::{Error, Result};
use crate::pdf_pages;
use crate::record::{MRN_PAGES_FIELD, Record};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::info;

/// Single cell written when there is nothing to tabulate.
pub const NO_DATA_PLACEHOLDER: &str = "No data extracted";

/// Render records as CSV bytes.
///
/// Columns are the sorted union of every record's field names. An empty
/// record list still produces a one-cell table.
pub fn to_table(records: &[Record]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    if records.is_empty() {
        writer.write_record([NO_DATA_PLACEHOLDER])?;
    } else {
        let columns: BTreeSet<&str> = records.iter().flat_map(Record::keys).collect();
        writer.write_record(&columns)?;
        for record in records {
            writer.write_record(columns.iter().map(|column| cell(record, column)))?;
        }
    }

    writer.into_inner().map_err(|e| Error::Io(e.into_error()))
}

fn cell(record: &Record, column: &str) -> String {
    if column == MRN_PAGES_FIELD {
        return record.mrn_pages.render_cell();
    }
    record.get(column).map(render_value).unwrap_or_default()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}

pub fn write_csv(records: &[Record], path: &Path) -> Result<()> {
    let bytes = to_table(records)?;
    fs::write(path, bytes)?;
    info!(path = %path.display(), rows = records.len(), "CSV written");
    Ok(())
}

/// Write the MRN pages of `source` to `output`, returning the page count.
pub fn write_mrn_pdf(source: &Path, mrn_pages: &[u32], output: &Path) -> Result<usize> {
    pdf_pages::extract_pages(source, mrn_pages, output)
}
