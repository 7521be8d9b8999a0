//! In-process document connector
//!
//! Keeps collections in memory and evaluates pipelines with the
//! `aggregate` evaluator. Useful for tests and single-process setups.

use std::sync::RwLock;

use bson::{oid::ObjectId, Bson, Document};

use super::aggregate::{self, Collections};
use super::errors::{DatasourceError, DatasourceResult};
use super::{
    strip_id_keys, validate_delete_lookups, Connector, ConnectorFuture, Cursor, DeleteResult,
};
use crate::value::id_string;

/// Connector over in-process collections
#[derive(Debug)]
pub struct MemoryConnector {
    name: String,
    collections: RwLock<Collections>,
}

impl MemoryConnector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            collections: RwLock::new(Collections::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of stored documents in a collection
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn read(&self) -> DatasourceResult<std::sync::RwLockReadGuard<'_, Collections>> {
        self.collections
            .read()
            .map_err(|_| DatasourceError::Driver("memory connector lock poisoned".into()))
    }

    fn write(&self) -> DatasourceResult<std::sync::RwLockWriteGuard<'_, Collections>> {
        self.collections
            .write()
            .map_err(|_| DatasourceError::Driver("memory connector lock poisoned".into()))
    }

    fn find_now(&self, collection: &str, pipeline: &[Document]) -> DatasourceResult<Vec<Document>> {
        let collections = self.read()?;
        let input = collections.get(collection).cloned().unwrap_or_default();
        aggregate::run(&collections, input, pipeline)
    }

    fn create_now(&self, collection: &str, mut data: Document) -> DatasourceResult<Document> {
        if !matches!(data.get("_id"), Some(id) if id != &Bson::Null) {
            data.insert("_id", ObjectId::new());
        }
        let mut collections = self.write()?;
        let docs = collections.entry(collection.to_string()).or_default();
        if let Some(id) = data.get("_id") {
            if docs.iter().any(|doc| id_matches(doc, id)) {
                return Err(DatasourceError::DuplicateKey(format!(
                    "{collection} already holds _id {}",
                    id_string(id)
                )));
            }
        }
        docs.push(data.clone());
        Ok(data)
    }

    fn update_now(&self, collection: &str, id: &Bson, mut patch: Document) -> DatasourceResult<Document> {
        strip_id_keys(&mut patch);
        let mut collections = self.write()?;
        let stored = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|doc| id_matches(doc, id)))
            .ok_or(DatasourceError::NotFound)?;
        for (key, value) in patch {
            stored.insert(key, value);
        }
        Ok(stored.clone())
    }

    fn delete_where(
        &self,
        collection: &str,
        keep: impl Fn(&Document) -> DatasourceResult<bool>,
    ) -> DatasourceResult<DeleteResult> {
        let mut collections = self.write()?;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(DeleteResult::default());
        };
        let before = docs.len();
        let mut verdicts = Vec::with_capacity(before);
        for doc in docs.iter() {
            verdicts.push(keep(doc)?);
        }
        let mut verdicts = verdicts.into_iter();
        docs.retain(|_| verdicts.next().unwrap_or(true));
        let deleted = before - docs.len();
        Ok(DeleteResult {
            deleted_count: deleted as i64,
        })
    }
}

fn id_matches(doc: &Document, id: &Bson) -> bool {
    doc.get("_id").is_some_and(|stored| stored == id)
}

impl Connector for MemoryConnector {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn connect(&self) -> ConnectorFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn disconnect(&self) -> ConnectorFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn ping(&self) -> ConnectorFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn find<'a>(&'a self, collection: &'a str, pipeline: Vec<Document>) -> ConnectorFuture<'a, Cursor> {
        Box::pin(async move { self.find_now(collection, &pipeline).map(Cursor::new) })
    }

    fn count<'a>(&'a self, collection: &'a str, pipeline: Vec<Document>) -> ConnectorFuture<'a, i64> {
        Box::pin(async move { Ok(self.find_now(collection, &pipeline)?.len() as i64) })
    }

    fn create<'a>(&'a self, collection: &'a str, data: Document) -> ConnectorFuture<'a, Document> {
        Box::pin(async move { self.create_now(collection, data) })
    }

    fn update_by_id<'a>(
        &'a self,
        collection: &'a str,
        id: Bson,
        patch: Document,
    ) -> ConnectorFuture<'a, Document> {
        Box::pin(async move { self.update_now(collection, &id, patch) })
    }

    fn delete_by_id<'a>(&'a self, collection: &'a str, id: Bson) -> ConnectorFuture<'a, DeleteResult> {
        Box::pin(async move { self.delete_where(collection, |doc| Ok(!id_matches(doc, &id))) })
    }

    fn delete_many<'a>(
        &'a self,
        collection: &'a str,
        where_lookups: Option<Vec<Bson>>,
    ) -> ConnectorFuture<'a, DeleteResult> {
        Box::pin(async move {
            let query = validate_delete_lookups(where_lookups.as_deref())?;
            self.delete_where(collection, |doc| Ok(!aggregate::matches(doc, query)?))
        })
    }

    fn set_timeout(&self, _seconds: f32) {}
}
