//! Write-path type coercion
//!
//! Strings that look like object-ids become object-ids and strings that
//! look like UTC ISO-8601 timestamps become datetimes. Callers skip this
//! when the request disables type conversions.

use std::sync::OnceLock;

use bson::{oid::ObjectId, Bson, Document};
use regex::Regex;

use crate::value::parse_timestamp;

fn object_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([0-9a-f]{24})$").expect("valid regex"))
}

fn timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z$").expect("valid regex")
    })
}

/// Coerce a single value in place, recursing into documents and arrays
pub fn coerce_value(value: &mut Bson) {
    match value {
        Bson::String(s) => {
            if object_id_pattern().is_match(s) {
                if let Ok(oid) = ObjectId::parse_str(s.as_str()) {
                    *value = Bson::ObjectId(oid);
                }
            } else if timestamp_pattern().is_match(s) {
                match parse_timestamp(s) {
                    Some(parsed) => *value = Bson::DateTime(parsed),
                    None => tracing::warn!(value = %s, "could not parse timestamp, keeping string"),
                }
            }
        }
        Bson::Document(doc) => coerce_document(doc),
        Bson::Array(items) => items.iter_mut().for_each(coerce_value),
        _ => {}
    }
}

/// Coerce every value of a document in place
pub fn coerce_document(doc: &mut Document) {
    for (_, value) in doc.iter_mut() {
        coerce_value(value);
    }
}
