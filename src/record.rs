// src/record.rs

use crate::usage::UsageInfo;
use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Field name that carries the MRN page reference of a record.
pub const MRN_PAGES_FIELD: &str = "mrn_pages";

/// Authoritative MRN page reference of one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MrnPages {
    #[default]
    Empty,
    Scalar(u32),
    List(Vec<u32>),
}

impl MrnPages {
    /// Collapse a page slice: nothing, one bare page, or a list.
    pub fn from_pages(pages: &[u32]) -> Self {
        match pages {
            [] => MrnPages::Empty,
            [single] => MrnPages::Scalar(*single),
            many => MrnPages::List(many.to_vec()),
        }
    }

    /// Normalise whatever shape a model put into `mrn_pages`.
    ///
    /// Numbers, numeric strings and arrays of either are accepted; anything
    /// that is not a page number (>= 1) is dropped silently.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(items) => {
                let mut pages: Vec<u32> = Vec::with_capacity(items.len());
                for page in items.iter().filter_map(page_number) {
                    if !pages.contains(&page) {
                        pages.push(page);
                    }
                }
                if pages.is_empty() {
                    MrnPages::Empty
                } else {
                    MrnPages::List(pages)
                }
            }
            other => page_number(other).map_or(MrnPages::Empty, MrnPages::Scalar),
        }
    }

    /// Flat page list in stored order.
    pub fn pages(&self) -> Vec<u32> {
        match self {
            MrnPages::Empty => Vec::new(),
            MrnPages::Scalar(page) => vec![*page],
            MrnPages::List(pages) => pages.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MrnPages::Empty => true,
            MrnPages::Scalar(_) => false,
            MrnPages::List(pages) => pages.is_empty(),
        }
    }

    /// CSV cell form: lists are joined with `"; "`.
    pub fn render_cell(&self) -> String {
        match self {
            MrnPages::Empty => String::new(),
            MrnPages::Scalar(page) => page.to_string(),
            MrnPages::List(pages) => pages
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MrnPages::Empty => Value::Array(Vec::new()),
            MrnPages::Scalar(page) => Value::from(*page),
            MrnPages::List(pages) => Value::Array(pages.iter().map(|p| Value::from(*p)).collect()),
        }
    }
}

impl Serialize for MrnPages {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn page_number(value: &Value) -> Option<u32> {
    let raw = match value {
        Value::Number(n) => match n.as_u64() {
            Some(v) => v,
            None => {
                let f = n.as_f64()?;
                if f.fract() != 0.0 || f < 0.0 {
                    return None;
                }
                f as u64
            }
        },
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u32::try_from(raw).ok().filter(|&p| p >= 1)
}

/// One shipment entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    /// Every field except `mrn_pages`.
    pub fields: BTreeMap<String, Value>,
    pub mrn_pages: MrnPages,
}

impl Record {
    pub fn from_object(mut object: Map<String, Value>) -> Self {
        let mrn_pages = object
            .remove(MRN_PAGES_FIELD)
            .map(|v| MrnPages::from_value(&v))
            .unwrap_or_default();
        Record {
            fields: object.into_iter().collect(),
            mrn_pages,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Field names including `mrn_pages`.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields
            .keys()
            .map(String::as_str)
            .chain(std::iter::once(MRN_PAGES_FIELD))
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry(MRN_PAGES_FIELD, &self.mrn_pages)?;
        map.end()
    }
}

/// Which stage produced the final record list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Ai,
    Deterministic,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::Ai => "ai",
            RecordSource::Deterministic => "deterministic",
        }
    }
}

/// Page numbers per structural type, always ascending and unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageTypeMap {
    #[serde(rename = "Consignment Note")]
    consignment_notes: Vec<u32>,
    #[serde(rename = "MRN")]
    mrn: Vec<u32>,
}

impl PageTypeMap {
    pub fn new(consignment_notes: Vec<u32>, mrn: Vec<u32>) -> Self {
        PageTypeMap {
            consignment_notes: sorted_unique(consignment_notes),
            mrn: sorted_unique(mrn),
        }
    }

    pub fn consignment_notes(&self) -> &[u32] {
        &self.consignment_notes
    }

    pub fn mrn(&self) -> &[u32] {
        &self.mrn
    }

    pub fn set_mrn(&mut self, pages: Vec<u32>) {
        self.mrn = sorted_unique(pages);
    }
}

fn sorted_unique(mut pages: Vec<u32>) -> Vec<u32> {
    pages.sort_unstable();
    pages.dedup();
    pages
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputFiles {
    pub csv: PathBuf,
    pub mrn_pdf: Option<PathBuf>,
}

/// Outcome of one `process` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub records: Vec<Record>,
    pub record_source: RecordSource,
    pub page_types: PageTypeMap,
    pub page_count: usize,
    pub output_folder: PathBuf,
    pub output_files: OutputFiles,
    pub usage: Option<UsageInfo>,
    pub processing_time_secs: f64,
}
