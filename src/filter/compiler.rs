//! # Pipeline Compiler
//!
//! Compiles a `Filter` for one model into aggregation stages, in order:
//! `$match`, one `$lookup` per include, `$sort`, `$skip`, `$limit`.
//!
//! Includes compile into `$lookup` stages with a `let`/`pipeline` join,
//! the nested filter compiled into the sub-pipeline. Single-kind
//! relations are capped at one row and unwound so they materialise as
//! an object (or stay absent). Many-to-many relations traverse their
//! junction collection.

use std::collections::{BTreeMap, HashMap};

use bson::{doc, Document};
use chrono::{DateTime, Utc};

use super::errors::{FilterError, FilterResult};
use super::predicate::{canonical_field, Predicate};
use super::types::{Direction, Filter, Include};
use crate::model::{ModelConfig, RelationKind};

/// Lookup of model definitions by name
pub trait Schema {
    fn model_config(&self, name: &str) -> Option<&ModelConfig>;
}

impl Schema for HashMap<String, ModelConfig> {
    fn model_config(&self, name: &str) -> Option<&ModelConfig> {
        self.get(name)
    }
}

impl Schema for BTreeMap<String, ModelConfig> {
    fn model_config(&self, name: &str) -> Option<&ModelConfig> {
        self.get(name)
    }
}

/// Stages of one filter level, split so many-to-many joins can place
/// the matching part before the junction hop and the rest after it
#[derive(Default)]
struct Stages {
    matching: Vec<Document>,
    shaping: Vec<Document>,
}

impl Stages {
    fn into_pipeline(self) -> Vec<Document> {
        let mut pipeline = self.matching;
        pipeline.extend(self.shaping);
        pipeline
    }
}

/// Filter-to-pipeline compiler bound to a schema
pub struct Compiler<'a, S: Schema + ?Sized> {
    schema: &'a S,
    now: DateTime<Utc>,
    coerce: bool,
}

impl<'a, S: Schema + ?Sized> Compiler<'a, S> {
    pub fn new(schema: &'a S) -> Self {
        Self {
            schema,
            now: Utc::now(),
            coerce: true,
        }
    }

    /// Reference instant for date placeholders
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Toggle type coercion of where operands
    pub fn coerce(mut self, enabled: bool) -> Self {
        self.coerce = enabled;
        self
    }

    pub fn compile(&self, model: &ModelConfig, filter: &Filter) -> FilterResult<Vec<Document>> {
        let mut path = Vec::new();
        Ok(self.compile_level(model, filter, &mut path)?.into_pipeline())
    }

    /// Compile only the where clause into a `$match` body
    pub fn compile_where(&self, model: &ModelConfig, where_: &Document) -> FilterResult<Document> {
        Predicate::new(model, self.now, self.coerce).translate(where_)
    }

    fn compile_level(
        &self,
        model: &ModelConfig,
        filter: &Filter,
        path: &mut Vec<(String, String)>,
    ) -> FilterResult<Stages> {
        if filter.skip < 0 {
            return Err(FilterError::invalid("skip must not be negative"));
        }
        if filter.limit < 0 {
            return Err(FilterError::invalid("limit must not be negative"));
        }

        let mut stages = Stages::default();
        if let Some(where_) = filter.where_.as_ref().filter(|w| !w.is_empty()) {
            stages
                .matching
                .push(doc! {"$match": self.compile_where(model, where_)?});
        }

        for include in &filter.include {
            self.lookup(model, include, path, &mut stages.shaping)?;
        }

        if !filter.order.is_empty() {
            let mut sort = Document::new();
            for order in &filter.order {
                let direction = match order.direction {
                    Direction::Asc => 1,
                    Direction::Desc => -1,
                };
                sort.insert(canonical_field(&order.field), direction);
            }
            stages.shaping.push(doc! {"$sort": sort});
        }
        if filter.skip > 0 {
            stages.shaping.push(doc! {"$skip": filter.skip});
        }
        if filter.limit > 0 {
            stages.shaping.push(doc! {"$limit": filter.limit});
        }
        Ok(stages)
    }

    fn lookup(
        &self,
        parent: &ModelConfig,
        include: &Include,
        path: &mut Vec<(String, String)>,
        out: &mut Vec<Document>,
    ) -> FilterResult<()> {
        let relation =
            parent
                .relation(&include.relation)
                .ok_or_else(|| FilterError::UnknownRelation {
                    model: parent.name.clone(),
                    relation: include.relation.clone(),
                })?;
        let edge = (parent.name.clone(), include.relation.clone());
        if path.contains(&edge) {
            return Err(FilterError::IncludeCycle {
                model: edge.0,
                relation: edge.1,
            });
        }
        let target = self
            .schema
            .model_config(&relation.model)
            .ok_or_else(|| FilterError::UnknownModel(relation.model.clone()))?;

        let unscoped = Filter::default();
        let scope = include.scope.as_ref().unwrap_or(&unscoped);
        path.push(edge);
        let nested = self.compile_level(target, scope, path);
        path.pop();
        let nested = nested?;

        let field = include.relation.as_str();
        let keys = relation.join_keys(field, &parent.name);
        match relation.kind {
            RelationKind::HasAndBelongsToMany => {
                let junction = relation.junction(&parent.name);

                let mut target_pipeline = vec![join_match("_id", "targetKey")];
                target_pipeline.extend(nested.matching);

                let mut junction_pipeline = vec![
                    join_match(&junction.parent_key, "parentKey"),
                    doc! {"$lookup": {
                        "from": target.collection(),
                        "let": {"targetKey": format!("${}", junction.target_key)},
                        "pipeline": target_pipeline,
                        "as": "__target",
                    }},
                    doc! {"$unwind": "$__target"},
                    doc! {"$replaceRoot": {"newRoot": "$__target"}},
                ];
                junction_pipeline.extend(nested.shaping);

                out.push(doc! {"$lookup": {
                    "from": junction.collection,
                    "let": {"parentKey": format!("${}", keys.local)},
                    "pipeline": junction_pipeline,
                    "as": field,
                }});
            }
            kind => {
                let mut pipeline = vec![join_match(&keys.remote, "parentKey")];
                pipeline.extend(nested.into_pipeline());
                if kind.is_single() {
                    pipeline.push(doc! {"$limit": 1_i64});
                }

                out.push(doc! {"$lookup": {
                    "from": target.collection(),
                    "let": {"parentKey": format!("${}", keys.local)},
                    "pipeline": pipeline,
                    "as": field,
                }});
                if kind.is_single() {
                    out.push(doc! {"$unwind": {
                        "path": format!("${field}"),
                        "preserveNullAndEmptyArrays": true,
                    }});
                }
            }
        }
        Ok(())
    }
}

fn join_match(field: &str, variable: &str) -> Document {
    doc! {"$match": {"$expr": {"$eq": [format!("${field}"), format!("$${variable}")]}}}
}
