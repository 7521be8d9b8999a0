//! KV-backed connector
//!
//! Maps collections to buckets of the in-process KV database. Only
//! lookup-by-key and bulk create are meaningful here; it is used as the
//! backing store of the read-through cache.

use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Document};

use super::errors::{DatasourceError, DatasourceResult};
use super::{validate_delete_lookups, Connector, ConnectorFuture, Cursor, DeleteResult};
use crate::memorykv::Database;
use crate::value::key_fragment;

/// Key under which a create payload names the row
pub const REDIS_ID_FIELD: &str = "_redId";

/// Key under which a create payload carries the documents to store
pub const ENTRIES_FIELD: &str = "_entries";

/// Connector over a `memorykv::Database`
pub struct MemoryKvConnector {
    db: Arc<Database>,
}

impl MemoryKvConnector {
    pub fn new(name: &str) -> Self {
        Self {
            db: Arc::new(Database::new(name)),
        }
    }

    /// The underlying KV database
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn find_now(&self, collection: &str, pipeline: &[Document]) -> DatasourceResult<Cursor> {
        let key = lookup_key(pipeline)?;
        match self.db.bucket(collection)?.get(&key)? {
            Some(blobs) => Cursor::from_blobs(&blobs),
            None => Ok(Cursor::default()),
        }
    }

    /// Store a create payload expiring after `ttl`. The row is never
    /// visible with the default deadline.
    pub fn create_with_ttl(
        &self,
        collection: &str,
        data: Document,
        ttl: Duration,
    ) -> DatasourceResult<Document> {
        let (key, blobs) = row(&data)?;
        self.db.bucket(collection)?.set_ex(&key, blobs, ttl)?;
        Ok(data)
    }

    fn create_now(&self, collection: &str, data: Document) -> DatasourceResult<Document> {
        let (key, blobs) = row(&data)?;
        self.db.bucket(collection)?.set(&key, blobs)?;
        Ok(data)
    }

    fn delete_now(&self, collection: &str, id: &Bson) -> DatasourceResult<DeleteResult> {
        let key = key_fragment(Some(id));
        let bucket = self.db.bucket(collection)?;
        let existed = bucket.get(&key)?.is_some();
        bucket.delete(&key)?;
        Ok(DeleteResult {
            deleted_count: i64::from(existed),
        })
    }
}

/// Split a create payload into its row key and serialised entries
fn row(data: &Document) -> DatasourceResult<(String, Vec<Vec<u8>>)> {
    let key = match data.get(REDIS_ID_FIELD) {
        Some(Bson::String(id)) => id.clone(),
        Some(Bson::ObjectId(oid)) => oid.to_hex(),
        Some(_) => {
            return Err(DatasourceError::InvalidQuery(format!(
                "{REDIS_ID_FIELD} must be a string or object id"
            )))
        }
        None => uuid::Uuid::new_v4().to_string(),
    };
    let entries = match data.get(ENTRIES_FIELD) {
        Some(Bson::Array(entries)) => entries,
        _ => {
            return Err(DatasourceError::InvalidQuery(format!(
                "{ENTRIES_FIELD} must be an array of documents"
            )))
        }
    };

    let mut blobs = Vec::with_capacity(entries.len());
    for entry in entries {
        let doc = entry.as_document().ok_or_else(|| {
            DatasourceError::InvalidQuery(format!("{ENTRIES_FIELD} must contain documents"))
        })?;
        blobs.push(bson::to_vec(doc)?);
    }
    Ok((key, blobs))
}

/// Extract the lookup key from `[{$match: {<field>: <value>}}, ..]`
fn lookup_key(pipeline: &[Document]) -> DatasourceResult<String> {
    let first = pipeline
        .first()
        .ok_or_else(|| DatasourceError::InvalidQuery("empty query".into()))?;
    let query = match first.get("$match") {
        Some(Bson::Document(query)) => query,
        Some(_) => return Err(DatasourceError::InvalidQuery("$match must be a document".into())),
        None => {
            return Err(DatasourceError::InvalidQuery(
                "invalid first stage for memorykv. First stage must contain $match".into(),
            ))
        }
    };
    let (_, value) = query
        .iter()
        .next()
        .ok_or_else(|| DatasourceError::InvalidQuery("empty $match".into()))?;
    Ok(key_fragment(Some(value)))
}

impl Connector for MemoryKvConnector {
    fn kind(&self) -> &'static str {
        "memorykv"
    }

    fn connect(&self) -> ConnectorFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn disconnect(&self) -> ConnectorFuture<'_, ()> {
        Box::pin(async move { Ok(self.db.purge()?) })
    }

    fn ping(&self) -> ConnectorFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn find<'a>(&'a self, collection: &'a str, pipeline: Vec<Document>) -> ConnectorFuture<'a, Cursor> {
        Box::pin(async move { self.find_now(collection, &pipeline) })
    }

    fn count<'a>(&'a self, _collection: &'a str, _pipeline: Vec<Document>) -> ConnectorFuture<'a, i64> {
        Box::pin(async {
            Err(DatasourceError::Unsupported {
                connector: "memorykv",
                operation: "count",
            })
        })
    }

    fn create<'a>(&'a self, collection: &'a str, data: Document) -> ConnectorFuture<'a, Document> {
        Box::pin(async move { self.create_now(collection, data) })
    }

    fn update_by_id<'a>(
        &'a self,
        _collection: &'a str,
        _id: Bson,
        _patch: Document,
    ) -> ConnectorFuture<'a, Document> {
        Box::pin(async {
            Err(DatasourceError::Unsupported {
                connector: "memorykv",
                operation: "updateById",
            })
        })
    }

    fn delete_by_id<'a>(&'a self, collection: &'a str, id: Bson) -> ConnectorFuture<'a, DeleteResult> {
        Box::pin(async move { self.delete_now(collection, &id) })
    }

    fn delete_many<'a>(
        &'a self,
        _collection: &'a str,
        where_lookups: Option<Vec<Bson>>,
    ) -> ConnectorFuture<'a, DeleteResult> {
        Box::pin(async move {
            validate_delete_lookups(where_lookups.as_deref())?;
            Err(DatasourceError::Unsupported {
                connector: "memorykv",
                operation: "deleteMany",
            })
        })
    }

    fn set_timeout(&self, _seconds: f32) {}
}
