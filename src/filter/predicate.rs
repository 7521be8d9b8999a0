//! Where-clause translation into a `$match` body
//!
//! Validates operators against the supported set, maps `id` to `_id`,
//! resolves date placeholders and applies type coercion.

use bson::{oid::ObjectId, Bson, Document};
use chrono::{DateTime, Utc};

use super::dates;
use super::errors::{FilterError, FilterResult};
use crate::datasource::coerce::coerce_value;
use crate::model::{ModelConfig, PropertyType};
use crate::value::{parse_number, parse_timestamp};

const FIELD_OPERATORS: &[&str] = &[
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$regex", "$options", "$exists",
    "$not",
];

/// Translate where clauses for one model
pub struct Predicate<'a> {
    model: &'a ModelConfig,
    now: DateTime<Utc>,
    coerce: bool,
}

impl<'a> Predicate<'a> {
    pub fn new(model: &'a ModelConfig, now: DateTime<Utc>, coerce: bool) -> Self {
        Self { model, now, coerce }
    }

    pub fn translate(&self, where_: &Document) -> FilterResult<Document> {
        let mut out = Document::new();
        for (key, value) in where_ {
            match key.as_str() {
                "$and" | "$or" => {
                    let clauses = value.as_array().ok_or_else(|| {
                        FilterError::invalid(format!("{key} expects a list of conditions"))
                    })?;
                    let mut translated = Vec::with_capacity(clauses.len());
                    for clause in clauses {
                        let clause = clause.as_document().ok_or_else(|| {
                            FilterError::invalid(format!("{key} entries must be objects"))
                        })?;
                        translated.push(Bson::Document(self.translate(clause)?));
                    }
                    out.insert(key.clone(), translated);
                }
                op if op.starts_with('$') => {
                    return Err(FilterError::invalid(format!("unsupported operator {op}")))
                }
                field => {
                    let field = canonical_field(field);
                    let translated = self.translate_condition(field, value)?;
                    out.insert(field, translated);
                }
            }
        }
        Ok(out)
    }

    fn translate_condition(&self, field: &str, value: &Bson) -> FilterResult<Bson> {
        let ops = match value {
            Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => ops,
            other => return self.operand(field, other),
        };

        let mut out = Document::new();
        for (op, operand) in ops {
            if !FIELD_OPERATORS.contains(&op.as_str()) {
                return Err(FilterError::invalid(format!("unsupported operator {op}")));
            }
            let translated = match op.as_str() {
                "$in" | "$nin" => {
                    let items = operand
                        .as_array()
                        .ok_or_else(|| FilterError::invalid(format!("{op} expects a list")))?;
                    Bson::Array(
                        items
                            .iter()
                            .map(|item| self.operand(field, item))
                            .collect::<FilterResult<Vec<Bson>>>()?,
                    )
                }
                "$not" => match operand {
                    Bson::Document(_) => self.translate_condition(field, operand)?,
                    _ => return Err(FilterError::invalid("$not expects an operator object")),
                },
                "$regex" | "$options" => match operand {
                    Bson::String(_) | Bson::RegularExpression(_) => operand.clone(),
                    _ => return Err(FilterError::invalid(format!("{op} expects a string"))),
                },
                "$exists" => operand.clone(),
                _ => self.operand(field, operand)?,
            };
            out.insert(op.clone(), translated);
        }
        Ok(Bson::Document(out))
    }

    /// Resolve placeholders and coerce a comparison operand
    fn operand(&self, field: &str, value: &Bson) -> FilterResult<Bson> {
        if let Bson::String(text) = value {
            if let Some(when) = dates::resolve(text, self.now)? {
                return Ok(Bson::DateTime(bson::DateTime::from_chrono(when)));
            }
        }
        if !self.coerce {
            return Ok(value.clone());
        }

        let mut coerced = match (self.model.property_type(field), value) {
            (Some(PropertyType::ObjectId), Bson::String(hex)) => ObjectId::parse_str(hex)
                .map(Bson::ObjectId)
                .unwrap_or_else(|_| value.clone()),
            (Some(PropertyType::Date), Bson::String(iso)) => parse_timestamp(iso)
                .map(Bson::DateTime)
                .unwrap_or_else(|| value.clone()),
            (Some(PropertyType::Number), Bson::String(text)) => parse_number(text)
                .ok_or_else(|| {
                    FilterError::invalid(format!("{field} expects a number, got {text:?}"))
                })?,
            _ => value.clone(),
        };
        coerce_value(&mut coerced);
        Ok(coerced)
    }
}

/// `id` is an alias of `_id`
pub fn canonical_field(field: &str) -> &str {
    if field == "id" {
        "_id"
    } else {
        field
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use chrono::Duration;
    use serde_json::json;

    fn model() -> ModelConfig {
        serde_json::from_value(json!({
            "name": "Note",
            "properties": {
                "views": {"type": "number"},
                "created": {"type": "date"},
                "accountId": {"type": "objectId"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_id_alias_and_object_id_coercion() {
        let model = model();
        let hex = "64b7f1a2c3d4e5f600112233";
        let out = Predicate::new(&model, Utc::now(), true)
            .translate(&doc! {"id": hex})
            .unwrap();
        assert_eq!(
            out,
            doc! {"_id": ObjectId::parse_str(hex).unwrap()}
        );
    }

    #[test]
    fn test_disabled_coercion_keeps_strings() {
        let model = model();
        let hex = "64b7f1a2c3d4e5f600112233";
        let out = Predicate::new(&model, Utc::now(), false)
            .translate(&doc! {"accountId": hex})
            .unwrap();
        assert_eq!(out, doc! {"accountId": hex});
    }

    #[test]
    fn test_number_coercion_inside_operators() {
        let model = model();
        let out = Predicate::new(&model, Utc::now(), true)
            .translate(&doc! {"views": {"$gte": "10", "$in": ["1", "2.5"]}})
            .unwrap();
        assert_eq!(
            out,
            doc! {"views": {"$gte": 10_i64, "$in": [1_i64, 2.5]}}
        );
    }

    #[test]
    fn test_date_placeholder_resolution() {
        let model = model();
        let now = Utc::now();
        let out = Predicate::new(&model, now, true)
            .translate(&doc! {"created": {"$lte": "$15Sago"}})
            .unwrap();
        let expected = bson::DateTime::from_chrono(now - Duration::seconds(15));
        assert_eq!(out, doc! {"created": {"$lte": expected}});
    }

    #[test]
    fn test_nested_logical_operators() {
        let model = model();
        let out = Predicate::new(&model, Utc::now(), true)
            .translate(&doc! {"$or": [{"title": "a"}, {"views": {"$not": {"$gt": 3}}}]})
            .unwrap();
        assert_eq!(
            out,
            doc! {"$or": [{"title": "a"}, {"views": {"$not": {"$gt": 3}}}]}
        );
    }

    #[test]
    fn test_unsupported_operators_are_rejected() {
        let model = model();
        let predicate = Predicate::new(&model, Utc::now(), true);
        assert!(predicate.translate(&doc! {"$where": "1"}).is_err());
        assert!(predicate.translate(&doc! {"a": {"$near": [1, 2]}}).is_err());
        assert!(predicate.translate(&doc! {"views": "many"}).is_err());
    }
}
