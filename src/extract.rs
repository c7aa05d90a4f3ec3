use std::collections::BTreeSet;

use anyhow::{Result, bail};
use serde_json::{Map, Value};

/// Field-alias priority orders. Candidates are tried in this exact order
/// and the first present key wins.
pub const RUN_ID_KEYS: &[&str] = &["run_id", "config_id", "run", "id"];
pub const QUERY_ID_KEYS: &[&str] = &["query_id", "qid", "id"];
pub const DOCS_KEYS: &[&str] = &["cited", "docs", "documents", "retrieved", "contexts"];
pub const DOC_ID_KEYS: &[&str] = &["doc_id", "document_id", "docid", "id", "source_id"];
pub const SOURCE_KEYS: &[&str] = &["source", "document", "doc", "metadata"];

/// One entry of a citation list. Run logs mix three shapes freely, so
/// classification is a tagged union resolved by one dispatch function
/// instead of per-call-site field probing.
#[derive(Debug)]
pub enum CitationEntry<'a> {
    /// The entry is the doc id itself.
    Bare(&'a str),
    /// A flat object holding one of the doc-id keys.
    Flat(&'a Map<String, Value>),
    /// The doc-id key sits one level down under a source-like key.
    Nested(&'a Map<String, Value>),
}

impl CitationEntry<'_> {
    /// Shape dispatch. `None` means the entry is unrecognizable and the
    /// whole record is malformed; a recognized entry whose id turns out
    /// empty or non-string is a null doc id instead, handled downstream.
    pub fn classify(value: &Value) -> Option<CitationEntry<'_>> {
        match value {
            Value::String(s) => Some(CitationEntry::Bare(s)),
            Value::Object(map) => {
                if has_doc_id_key(map) {
                    return Some(CitationEntry::Flat(map));
                }
                for key in SOURCE_KEYS {
                    if let Some(Value::Object(inner)) = map.get(*key) {
                        if has_doc_id_key(inner) {
                            return Some(CitationEntry::Nested(map));
                        }
                    }
                }
                None
            }
            _ => None,
        }
    }

    /// The raw doc id. Empty means the first-priority id field was
    /// empty or not string-convertible (a null doc id).
    pub fn doc_id(&self) -> String {
        match self {
            CitationEntry::Bare(s) => s.trim().to_string(),
            CitationEntry::Flat(map) => doc_id_value(map),
            CitationEntry::Nested(map) => SOURCE_KEYS
                .iter()
                .find_map(|key| match map.get(*key) {
                    Some(Value::Object(inner)) if has_doc_id_key(inner) => {
                        Some(doc_id_value(inner))
                    }
                    _ => None,
                })
                .unwrap_or_default(),
        }
    }
}

fn has_doc_id_key(map: &Map<String, Value>) -> bool {
    DOC_ID_KEYS
        .iter()
        .any(|key| matches!(map.get(*key), Some(value) if !value.is_null()))
}

/// Value of the first present doc-id key. Ids of non-scalar type are
/// unusable and collapse to the empty string.
fn doc_id_value(map: &Map<String, Value>) -> String {
    for key in DOC_ID_KEYS {
        match map.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => return s.trim().to_string(),
            Some(Value::Number(n)) => return n.to_string(),
            Some(_) => return String::new(),
        }
    }
    String::new()
}

/// First non-empty string-convertible value among the candidate keys.
/// Numeric ids are stringified, matching what loosely-typed run loggers
/// tend to emit.
fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        let s = match map.get(*key) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => continue,
        };
        if !s.is_empty() {
            return Some(s);
        }
    }
    None
}

/// One record's citations, extracted but not yet canonicalized.
#[derive(Debug)]
pub struct ExtractedCitations {
    pub run_id: String,
    pub query_id: String,
    /// Ordered raw ids after top-k truncation, before dedup.
    pub raw_doc_ids: Vec<String>,
    /// The pre-truncation list contained a repeated raw id.
    pub had_duplicates: bool,
}

/// Extracts run id, query id, and the ordered raw doc-id list from one
/// parsed record. A missing or empty citation list yields an empty list
/// (a legitimate null citation); a missing run/query id or an entry of
/// unsupported shape makes the record malformed.
pub fn extract_record(record: &Value, topk: Option<usize>) -> Result<ExtractedCitations> {
    let Value::Object(map) = record else {
        bail!("record is not a JSON object");
    };

    let Some(run_id) = first_string(map, RUN_ID_KEYS) else {
        bail!("record missing run id (tried keys: {RUN_ID_KEYS:?})");
    };
    let Some(query_id) = first_string(map, QUERY_ID_KEYS) else {
        bail!("record missing query id (tried keys: {QUERY_ID_KEYS:?})");
    };

    let docs = match docs_list(map)? {
        Some(docs) => docs,
        None => {
            return Ok(ExtractedCitations {
                run_id,
                query_id,
                raw_doc_ids: Vec::new(),
                had_duplicates: false,
            });
        }
    };

    let mut raw_doc_ids = Vec::with_capacity(docs.len());
    for (index, entry) in docs.iter().enumerate() {
        let Some(classified) = CitationEntry::classify(entry) else {
            bail!(
                "citation entry {index} has unsupported shape \
                 (expected string, flat object, or nested object)"
            );
        };
        raw_doc_ids.push(classified.doc_id());
    }

    // Duplicates are flagged on the full list (empty ids excluded);
    // top-k truncation happens afterwards but before dedup, so rank
    // order stays significant.
    let mut seen = BTreeSet::new();
    let had_duplicates = raw_doc_ids
        .iter()
        .filter(|id| !id.is_empty())
        .any(|id| !seen.insert(id.clone()));

    if let Some(k) = topk {
        raw_doc_ids.truncate(k);
    }

    Ok(ExtractedCitations {
        run_id,
        query_id,
        raw_doc_ids,
        had_duplicates,
    })
}

fn docs_list(map: &Map<String, Value>) -> Result<Option<&Vec<Value>>> {
    for key in DOCS_KEYS {
        match map.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::Array(list)) => return Ok(Some(list)),
            Some(other) => bail!(
                "citation field '{key}' must be a list (got {})",
                json_type_name(other)
            ),
        }
    }
    Ok(None)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
