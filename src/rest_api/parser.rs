//! # Query Parameter Parser
//!
//! Parses the `filter` and `where` query parameters. Both carry JSON
//! text; `where` may also be given as the `where` key of `filter`.

use std::collections::HashMap;

use bson::Document;
use serde_json::Value;

use super::errors::{RestError, RestResult};
use crate::filter::Filter;
use crate::value::json_to_document;

/// Parsed query parameters
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub filter: Filter,
}

impl QueryParams {
    /// Parse query parameters from a HashMap
    pub fn parse(params: &HashMap<String, String>) -> RestResult<Self> {
        let mut filter = match params.get("filter") {
            Some(text) if !text.trim().is_empty() => {
                Filter::from_json_str(text).map_err(|e| RestError::InvalidQueryParam {
                    name: "filter",
                    message: e.to_string(),
                })?
            }
            _ => Filter::default(),
        };

        if let Some(where_) = parse_where(params)? {
            filter.where_ = Some(where_);
        }

        Ok(Self { filter })
    }

    /// Where clause for `count`
    pub fn into_where(self) -> Option<Document> {
        self.filter.where_
    }
}

/// Parse the `where` parameter as a JSON object
pub fn parse_where(params: &HashMap<String, String>) -> RestResult<Option<Document>> {
    let Some(text) = params.get("where") else {
        return Ok(None);
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(Some(json_to_document(&map))),
        Ok(_) => Err(RestError::InvalidQueryParam {
            name: "where",
            message: "expected a JSON object".to_string(),
        }),
        Err(e) => Err(RestError::InvalidQueryParam {
            name: "where",
            message: e.to_string(),
        }),
    }
}

/// Request body as a document
pub fn parse_body(body: Value) -> RestResult<Document> {
    match body {
        Value::Object(map) => Ok(json_to_document(&map)),
        _ => Err(RestError::InvalidBody("expected a JSON object".to_string())),
    }
}
