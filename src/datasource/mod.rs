//! # Datasource Module
//!
//! Uniform CRUD and aggregation over pluggable backends.
//!
//! A `Connector` receives queries as aggregation pipelines: ordered lists
//! of stage documents. Three connectors exist:
//! - `MongoConnector` talks to a MongoDB-compatible document store
//! - `MemoryKvConnector` stores BSON blobs in the in-process KV store
//! - `MemoryConnector` evaluates pipelines over in-process collections
//!
//! `Datasources` holds the named instances built from configuration.

mod aggregate;
pub mod coerce;
mod cursor;
mod errors;
mod memory;
mod memorykv;
mod mongo;
pub mod supervisor;

use std::collections::HashMap;
use std::sync::Arc;

use bson::{Bson, Document};
use futures_util::future::BoxFuture;

pub use aggregate::Collections;
pub use cursor::Cursor;
pub use errors::{DatasourceError, DatasourceResult};
pub use memory::MemoryConnector;
pub use memorykv::{MemoryKvConnector, ENTRIES_FIELD, REDIS_ID_FIELD};
pub use mongo::{MongoConnector, MongoOptions};

use crate::config::{ConnectorKind, DatasourceConfig};

/// Future returned by connector operations
pub type ConnectorFuture<'a, T> = BoxFuture<'a, DatasourceResult<T>>;

/// Outcome of a delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: i64,
}

/// Backend contract shared by every datasource
pub trait Connector: Send + Sync {
    /// Connector kind, used in logs and errors
    fn kind(&self) -> &'static str;

    fn connect(&self) -> ConnectorFuture<'_, ()>;

    fn disconnect(&self) -> ConnectorFuture<'_, ()>;

    fn ping(&self) -> ConnectorFuture<'_, ()>;

    /// Run an aggregation pipeline against a collection
    fn find<'a>(&'a self, collection: &'a str, pipeline: Vec<Document>)
        -> ConnectorFuture<'a, Cursor>;

    /// Count documents produced by a pipeline
    fn count<'a>(&'a self, collection: &'a str, pipeline: Vec<Document>)
        -> ConnectorFuture<'a, i64>;

    /// Insert a document and return it as stored
    fn create<'a>(&'a self, collection: &'a str, data: Document) -> ConnectorFuture<'a, Document>;

    /// Apply a partial update; `id` and `_id` keys in `patch` are ignored
    fn update_by_id<'a>(
        &'a self,
        collection: &'a str,
        id: Bson,
        patch: Document,
    ) -> ConnectorFuture<'a, Document>;

    fn delete_by_id<'a>(&'a self, collection: &'a str, id: Bson)
        -> ConnectorFuture<'a, DeleteResult>;

    /// Delete every document matched by a single `$match` stage.
    ///
    /// Shape errors are reported before any connector-specific check.
    fn delete_many<'a>(
        &'a self,
        collection: &'a str,
        where_lookups: Option<Vec<Bson>>,
    ) -> ConnectorFuture<'a, DeleteResult>;

    /// Per-operation timeout in seconds
    fn set_timeout(&self, seconds: f32);
}

/// Validate the `whereLookups` argument of a bulk delete and return its
/// `$match` body.
pub fn validate_delete_lookups(where_lookups: Option<&[Bson]>) -> DatasourceResult<&Document> {
    let lookups =
        where_lookups.ok_or(DatasourceError::BadLookup("whereLookups cannot be nil"))?;
    if lookups.len() != 1 {
        return Err(DatasourceError::BadLookup(
            "whereLookups must have exactly one element as a $match stage",
        ));
    }
    let first = match &lookups[0] {
        Bson::Null => {
            return Err(DatasourceError::BadLookup(
                "whereLookups cannot have nil elements",
            ))
        }
        Bson::Document(stage) if stage.contains_key("$match") => stage,
        _ => {
            return Err(DatasourceError::BadLookup(
                "first element of whereLookups must be a $match stage",
            ))
        }
    };
    if first.len() > 1 {
        return Err(DatasourceError::BadLookup(
            "first element of whereLookups must be a single $match stage",
        ));
    }
    match first.get("$match") {
        Some(Bson::Document(query)) if !query.is_empty() => Ok(query),
        _ => Err(DatasourceError::BadLookup(
            "first element of whereLookups must be a single and non-empty $match stage",
        )),
    }
}

/// Strip identifier keys from an update payload
pub(crate) fn strip_id_keys(patch: &mut Document) {
    patch.remove("_id");
    patch.remove("id");
}

/// A named, configured connector
#[derive(Clone)]
pub struct Datasource {
    name: String,
    connector: Arc<dyn Connector>,
    kv: Option<Arc<MemoryKvConnector>>,
}

impl std::fmt::Debug for Datasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datasource")
            .field("name", &self.name)
            .field("kind", &self.connector.kind())
            .finish()
    }
}

impl Datasource {
    /// Build the connector named by `config.connector`
    pub fn from_config(config: &DatasourceConfig) -> DatasourceResult<Self> {
        let datasource = match config.connector_kind() {
            Some(ConnectorKind::DocumentStore) => Self::new(
                &config.name,
                Arc::new(MongoConnector::new(MongoOptions::from_config(config))),
            ),
            Some(ConnectorKind::MemoryKv) => {
                Self::memorykv(&config.name, Arc::new(MemoryKvConnector::new(&config.name)))
            }
            Some(ConnectorKind::Memory) => {
                Self::new(&config.name, Arc::new(MemoryConnector::new(&config.name)))
            }
            None => {
                return Err(DatasourceError::InvalidConnector(config.connector.clone()))
            }
        };
        if let Some(seconds) = config.timeout_seconds {
            datasource.connector.set_timeout(seconds);
        }
        Ok(datasource)
    }

    /// Wrap an arbitrary connector
    pub fn new(name: &str, connector: Arc<dyn Connector>) -> Self {
        Self {
            name: name.to_string(),
            connector,
            kv: None,
        }
    }

    /// Wrap a KV connector, keeping its typed handle for cache use
    pub fn memorykv(name: &str, connector: Arc<MemoryKvConnector>) -> Self {
        Self {
            name: name.to_string(),
            connector: connector.clone(),
            kv: Some(connector),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// The KV connector, when this datasource is backed by one
    pub fn kv(&self) -> Option<&Arc<MemoryKvConnector>> {
        self.kv.as_ref()
    }
}

/// Registry of datasources by name
#[derive(Debug, Clone, Default)]
pub struct Datasources {
    entries: HashMap<String, Datasource>,
}

impl Datasources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured datasource
    pub fn from_configs<'a>(
        configs: impl IntoIterator<Item = &'a DatasourceConfig>,
    ) -> DatasourceResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.insert(Datasource::from_config(config)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, datasource: Datasource) {
        self.entries.insert(datasource.name.clone(), datasource);
    }

    pub fn get(&self, name: &str) -> Option<&Datasource> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Connect every datasource, failing on the first error
    pub async fn connect_all(&self) -> DatasourceResult<()> {
        for datasource in self.entries.values() {
            datasource.connector.connect().await?;
            tracing::info!(
                datasource = %datasource.name,
                connector = datasource.connector.kind(),
                "datasource connected"
            );
        }
        Ok(())
    }

    /// Disconnect every datasource, logging failures
    pub async fn disconnect_all(&self) {
        for datasource in self.entries.values() {
            if let Err(e) = datasource.connector.disconnect().await {
                tracing::warn!(datasource = %datasource.name, error = %e, "disconnect failed");
            }
        }
    }
}
