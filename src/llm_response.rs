// src/llm_response.rs

use crate::record::Record;
use serde_json::{Deserializer, Value};
use tracing::{debug, warn};

/// Upper bound on JSON start positions tried in one response.
const MAX_CANDIDATES: usize = 2000;

/// Turn a raw model reply into records.
///
/// Tolerates markdown fences, prose around the JSON, a single object
/// instead of an array, and several JSON fragments. Never fails: an
/// unusable reply is an empty list.
pub fn parse(raw_text: &str) -> Vec<Record> {
    let content = strip_fences(raw_text);

    if let Ok(value) = serde_json::from_str::<Value>(content) {
        let records = normalize(value);
        if !records.is_empty() {
            return records;
        }
    }

    let candidates = content
        .char_indices()
        .filter(|(_, c)| *c == '[' || *c == '{')
        .map(|(i, _)| i)
        .take(MAX_CANDIDATES);

    for start in candidates {
        // First complete value from `start`; whatever follows is ignored.
        let mut stream = Deserializer::from_str(&content[start..]).into_iter::<Value>();
        let Some(Ok(value)) = stream.next() else {
            continue;
        };
        let records = normalize(value);
        if !records.is_empty() {
            debug!(offset = start, records = records.len(), "Recovered JSON from model reply");
            return records;
        }
    }

    let preview: String = content.chars().take(500).collect();
    warn!(preview = %preview, "No usable JSON found in model reply");
    Vec::new()
}

fn strip_fences(raw: &str) -> &str {
    let mut content = raw.trim();
    if let Some(rest) = content.strip_prefix("```json") {
        content = rest;
    }
    if let Some(rest) = content.strip_prefix("```") {
        content = rest;
    }
    if let Some(rest) = content.strip_suffix("```") {
        content = rest;
    }
    content.trim()
}

/// Lists keep their object elements; an object yields the objects of its
/// first list-valued entry, or is itself the single record.
fn normalize(value: Value) -> Vec<Record> {
    match value {
        Value::Array(items) => objects_only(items),
        Value::Object(mut object) => {
            let first_list = object
                .iter()
                .find(|(_, v)| v.is_array())
                .map(|(k, _)| k.clone());
            match first_list.and_then(|key| object.remove(&key)) {
                Some(Value::Array(items)) => objects_only(items),
                _ => vec![Record::from_object(object)],
            }
        }
        _ => Vec::new(),
    }
}

fn objects_only(items: Vec<Value>) -> Vec<Record> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(object) => Some(Record::from_object(object)),
            _ => None,
        })
        .collect()
}
