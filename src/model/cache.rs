//! # Read-through Cache
//!
//! Rows of a `memorykv` datasource, keyed by composite strings built
//! from a model's configured key groups:
//!
//! ```text
//! key group ["accountId", "kind"]  ->  "accountId:64b7f1a2...:kind:note"
//! ```
//!
//! Each row holds the BSON encoding of every document sharing that key.
//! Writes never invalidate rows; they expire after the configured TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson, Document};

use super::config::CacheConfig;
use super::errors::ModelResult;
use crate::datasource::{Connector, MemoryKvConnector, ENTRIES_FIELD, REDIS_ID_FIELD};
use crate::filter::{canonical_field, Filter};
use crate::value::key_fragment;

/// Cache access for one model
pub struct CacheCoordinator {
    kv: Arc<MemoryKvConnector>,
    bucket: String,
    ttl: Duration,
    keys: Vec<Vec<String>>,
}

impl CacheCoordinator {
    pub fn new(kv: Arc<MemoryKvConnector>, bucket: &str, config: &CacheConfig) -> Self {
        Self {
            kv,
            bucket: bucket.to_string(),
            ttl: Duration::from_secs(config.ttl),
            keys: config.keys.clone(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `filter` can be answered from a cached row
    pub fn accepts(filter: &Filter) -> bool {
        !filter.has_include() && filter.order.is_empty() && filter.skip == 0 && filter.limit >= 0
    }

    /// Key of the row answering `where_`, when it pins every field of
    /// one key group to a literal and nothing else
    pub fn key_for_where(&self, where_: &Document) -> Option<String> {
        let mut pinned: HashMap<&str, &Bson> = HashMap::new();
        for (field, value) in where_ {
            if field.starts_with('$') {
                return None;
            }
            if let Bson::Document(ops) = value {
                if ops.keys().any(|k| k.starts_with('$')) {
                    return None;
                }
            }
            pinned.insert(canonical_field(field), value);
        }

        self.keys
            .iter()
            .find(|group| {
                group.len() == pinned.len()
                    && group
                        .iter()
                        .all(|field| pinned.contains_key(canonical_field(field)))
            })
            .map(|group| {
                composite_key(group, |field| pinned.get(canonical_field(field)).copied())
            })
    }

    /// Cached documents under `key`; `None` on a miss
    pub async fn lookup(&self, key: &str) -> ModelResult<Option<Vec<Document>>> {
        let mut query = Document::new();
        query.insert(REDIS_ID_FIELD, key);
        let cursor = self
            .kv
            .find(&self.bucket, vec![doc! {"$match": query}])
            .await?;
        if cursor.is_empty() {
            tracing::debug!(bucket = %self.bucket, key, "cache miss");
            return Ok(None);
        }
        tracing::debug!(bucket = %self.bucket, key, entries = cursor.len(), "cache hit");
        Ok(Some(cursor.all()))
    }

    /// Store `docs` under every key group they populate completely.
    ///
    /// `pinned` is the group the query matched exactly, if any. A result
    /// set is only complete for other groups when `complete` is set
    /// (no where, skip or limit) or the group is the identifier.
    pub async fn populate(
        &self,
        docs: &[Document],
        pinned: Option<&str>,
        complete: bool,
    ) -> ModelResult<()> {
        for group in &self.keys {
            let is_identity = group.len() == 1 && canonical_field(&group[0]) == "_id";
            let mut rows: Vec<(String, Vec<Bson>)> = Vec::new();
            let mut index: HashMap<String, usize> = HashMap::new();

            for doc in docs {
                let key = document_key(group, doc);
                let usable = complete || is_identity || pinned == Some(key.as_str());
                if !usable {
                    continue;
                }
                match index.get(&key) {
                    Some(&at) => rows[at].1.push(Bson::Document(doc.clone())),
                    None => {
                        index.insert(key.clone(), rows.len());
                        rows.push((key, vec![Bson::Document(doc.clone())]));
                    }
                }
            }

            for (key, entries) in rows {
                let count = entries.len();
                let mut row = Document::new();
                row.insert(REDIS_ID_FIELD, key.as_str());
                row.insert(ENTRIES_FIELD, entries);
                self.kv.create_with_ttl(&self.bucket, row, self.ttl)?;
                tracing::debug!(bucket = %self.bucket, key = %key, entries = count, "cache populated");
            }
        }
        Ok(())
    }
}

/// Composite key of `doc` for one key group; `_id` falls back to `id`
pub fn document_key(group: &[String], doc: &Document) -> String {
    composite_key(group, |field| match field {
        "_id" => doc.get("_id").or_else(|| doc.get("id")),
        "id" => doc.get("id").or_else(|| doc.get("_id")),
        other => doc.get(other),
    })
}

fn composite_key<'v>(group: &[String], value: impl Fn(&str) -> Option<&'v Bson>) -> String {
    group
        .iter()
        .map(|field| format!("{field}:{}", key_fragment(value(field))))
        .collect::<Vec<_>>()
        .join(":")
}
