//! # Value Conversion
//!
//! Documents travel as `bson::Document` trees. JSON enters through
//! `json_to_bson`, which only recognises the explicit `{"$oid": ..}`
//! and `{"$date": ..}` literals, and leaves through `bson_to_json`,
//! which renders object-ids as hex and timestamps as RFC 3339.

use bson::{oid::ObjectId, Bson, Document};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};

/// Convert a JSON value into a BSON value
pub fn json_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => number_to_bson(n),
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(json_to_bson).collect()),
        Value::Object(map) => {
            if let Some(literal) = extended_literal(map) {
                return literal;
            }
            Bson::Document(json_to_document(map))
        }
    }
}

/// Convert a JSON object into a document, preserving key order
pub fn json_to_document(map: &Map<String, Value>) -> Document {
    map.iter()
        .map(|(key, value)| (key.clone(), json_to_bson(value)))
        .collect()
}

fn number_to_bson(n: &Number) -> Bson {
    if let Some(i) = n.as_i64() {
        Bson::Int64(i)
    } else {
        Bson::Double(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn extended_literal(map: &Map<String, Value>) -> Option<Bson> {
    if map.len() != 1 {
        return None;
    }
    let (key, value) = map.iter().next()?;
    match (key.as_str(), value) {
        ("$oid", Value::String(hex)) => ObjectId::parse_str(hex).ok().map(Bson::ObjectId),
        ("$date", Value::String(iso)) => parse_timestamp(iso).map(Bson::DateTime),
        ("$date", Value::Number(millis)) => millis
            .as_i64()
            .map(|ms| Bson::DateTime(bson::DateTime::from_millis(ms))),
        _ => None,
    }
}

/// Parse an RFC 3339 timestamp
pub fn parse_timestamp(iso: &str) -> Option<bson::DateTime> {
    DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|t| bson::DateTime::from_chrono(t.with_timezone(&Utc)))
}

/// Render a timestamp as RFC 3339 with millisecond precision
pub fn format_timestamp(value: &bson::DateTime) -> String {
    value
        .to_chrono()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert a BSON value into its JSON rendering
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Bson::String(s) => Value::String(s.clone()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(format_timestamp(dt)),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(document_to_json(doc)),
        other => other.clone().into_relaxed_extjson(),
    }
}

/// Convert a document into a JSON object
pub fn document_to_json(doc: &Document) -> Map<String, Value> {
    doc.iter()
        .map(|(key, value)| (key.clone(), bson_to_json(value)))
        .collect()
}

/// Parse numeric text, preferring integers
pub fn parse_number(text: &str) -> Option<Bson> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Bson::Int64(i));
    }
    text.parse::<f64>().ok().map(Bson::Double)
}

/// Textual form of a value inside a composite cache key.
///
/// Must stay byte-stable: independent processes derive identical keys.
pub fn key_fragment(value: Option<&Bson>) -> String {
    match value {
        None | Some(Bson::Null) | Some(Bson::Undefined) => "<nil>".to_string(),
        Some(Bson::String(s)) => s.clone(),
        Some(Bson::ObjectId(oid)) => oid.to_hex(),
        Some(Bson::Int32(i)) => i.to_string(),
        Some(Bson::Int64(i)) => i.to_string(),
        Some(Bson::Double(f)) => f.to_string(),
        Some(Bson::Boolean(b)) => b.to_string(),
        Some(Bson::DateTime(dt)) => format_timestamp(dt),
        Some(other) => bson_to_json(other).to_string(),
    }
}

/// Stringify an identifier the way clients see it
pub fn id_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => key_fragment(Some(other)),
    }
}

/// Turn a client-supplied id into the stored form: hex strings become object-ids
pub fn parse_id(raw: &str) -> Bson {
    match ObjectId::parse_str(raw) {
        Ok(oid) => Bson::ObjectId(oid),
        Err(_) => Bson::String(raw.to_string()),
    }
}
