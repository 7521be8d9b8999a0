//! # Filter Types
//!
//! The declarative query accepted by every read operation:
//!
//! ```json
//! {
//!   "where": {"title": {"$regex": "^draft"}},
//!   "include": [{"relation": "account", "scope": {"where": {"active": true}}}],
//!   "order": ["created DESC", "title"],
//!   "skip": 10,
//!   "limit": 5
//! }
//! ```
//!
//! `include` also accepts a relation name or a list of names; `order`
//! also accepts a single string.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::errors::{FilterError, FilterResult};
use crate::value::{format_timestamp, json_to_bson};

/// A parsed filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFilter", into = "RawFilter")]
pub struct Filter {
    pub where_: Option<Document>,
    pub include: Vec<Include>,
    pub order: Vec<OrderBy>,
    pub skip: i64,
    pub limit: i64,
}

/// One relation expansion
#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub relation: String,
    pub scope: Option<Filter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl Filter {
    /// Filter with only a where clause
    pub fn with_where(where_: Document) -> Self {
        Self {
            where_: Some(where_),
            ..Default::default()
        }
    }

    /// Parse the JSON text of a `filter` query parameter
    pub fn from_json_str(text: &str) -> FilterResult<Self> {
        serde_json::from_str(text).map_err(|e| FilterError::invalid(e.to_string()))
    }

    pub fn has_include(&self) -> bool {
        !self.include.is_empty()
    }
}

impl OrderBy {
    fn parse(spec: &str) -> FilterResult<Self> {
        let mut parts = spec.split_whitespace();
        let field = parts
            .next()
            .ok_or_else(|| FilterError::invalid("empty order clause"))?;
        let direction = match parts.next().map(str::to_ascii_uppercase).as_deref() {
            None | Some("ASC") => Direction::Asc,
            Some("DESC") => Direction::Desc,
            Some(other) => {
                return Err(FilterError::invalid(format!(
                    "unknown order direction {other}"
                )))
            }
        };
        if parts.next().is_some() {
            return Err(FilterError::invalid(format!("malformed order clause {spec}")));
        }
        Ok(Self {
            field: field.to_string(),
            direction,
        })
    }

    fn render(&self) -> String {
        match self.direction {
            Direction::Asc => format!("{} ASC", self.field),
            Direction::Desc => format!("{} DESC", self.field),
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RawFilter {
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    where_: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    include: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    order: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    skip: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<i64>,
}

impl TryFrom<RawFilter> for Filter {
    type Error = FilterError;

    fn try_from(raw: RawFilter) -> FilterResult<Self> {
        let where_ = match raw.where_ {
            None | Some(Value::Null) => None,
            Some(value) => match json_to_bson(&value) {
                Bson::Document(doc) => Some(doc),
                _ => return Err(FilterError::invalid("where must be an object")),
            },
        };
        Ok(Self {
            where_,
            include: parse_includes(raw.include)?,
            order: parse_order(raw.order)?,
            skip: raw.skip.unwrap_or(0),
            limit: raw.limit.unwrap_or(0),
        })
    }
}

impl From<Filter> for RawFilter {
    fn from(filter: Filter) -> Self {
        Self {
            where_: filter
                .where_
                .as_ref()
                .map(|doc| Value::Object(document_to_literal_json(doc))),
            include: (!filter.include.is_empty()).then(|| {
                Value::Array(
                    filter
                        .include
                        .into_iter()
                        .map(|include| {
                            let mut entry = Map::new();
                            entry.insert("relation".into(), Value::String(include.relation));
                            if let Some(scope) = include.scope {
                                entry.insert(
                                    "scope".into(),
                                    serde_json::to_value(scope).unwrap_or(Value::Null),
                                );
                            }
                            Value::Object(entry)
                        })
                        .collect(),
                )
            }),
            order: (!filter.order.is_empty())
                .then(|| Value::Array(filter.order.iter().map(|o| json!(o.render())).collect())),
            skip: (filter.skip != 0).then_some(filter.skip),
            limit: (filter.limit != 0).then_some(filter.limit),
        }
    }
}

fn parse_includes(value: Option<Value>) -> FilterResult<Vec<Include>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.into_iter().map(parse_include).collect(),
        Some(single) => Ok(vec![parse_include(single)?]),
    }
}

fn parse_include(value: Value) -> FilterResult<Include> {
    match value {
        Value::String(relation) => Ok(Include {
            relation,
            scope: None,
        }),
        Value::Object(mut map) => {
            let relation = match map.remove("relation") {
                Some(Value::String(relation)) => relation,
                _ => return Err(FilterError::invalid("include entries need a relation name")),
            };
            let scope = match map.remove("scope") {
                None | Some(Value::Null) => None,
                Some(scope) => Some(
                    serde_json::from_value::<Filter>(scope)
                        .map_err(|e| FilterError::invalid(e.to_string()))?,
                ),
            };
            Ok(Include { relation, scope })
        }
        _ => Err(FilterError::invalid(
            "include must be a relation name or an object",
        )),
    }
}

fn parse_order(value: Option<Value>) -> FilterResult<Vec<OrderBy>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(spec)) => Ok(vec![OrderBy::parse(&spec)?]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(spec) => OrderBy::parse(spec),
                _ => Err(FilterError::invalid("order entries must be strings")),
            })
            .collect(),
        Some(_) => Err(FilterError::invalid("order must be a string or a list")),
    }
}

/// JSON rendering that keeps object-ids and timestamps as extended literals
fn document_to_literal_json(doc: &Document) -> Map<String, Value> {
    doc.iter()
        .map(|(key, value)| (key.clone(), bson_to_literal_json(value)))
        .collect()
}

fn bson_to_literal_json(value: &Bson) -> Value {
    match value {
        Bson::ObjectId(oid) => json!({"$oid": oid.to_hex()}),
        Bson::DateTime(dt) => json!({"$date": format_timestamp(dt)}),
        Bson::Document(doc) => Value::Object(document_to_literal_json(doc)),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_literal_json).collect()),
        other => crate::value::bson_to_json(other),
    }
}
