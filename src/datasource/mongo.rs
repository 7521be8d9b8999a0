//! Document-store connector backed by the MongoDB driver

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bson::{doc, Bson, Document};
use futures_util::future::BoxFuture;
use futures_util::TryStreamExt;
use mongodb::options::{
    AggregateOptions, ClientOptions, Credential, ReadPreference, ReadPreferenceOptions,
    SelectionCriteria,
};
use mongodb::{Client, Collection};
use tokio::task::JoinHandle;

use super::errors::{DatasourceError, DatasourceResult};
use super::supervisor::{self, Supervised, SupervisorConfig};
use super::{
    strip_id_keys, validate_delete_lookups, Connector, ConnectorFuture, Cursor, DeleteResult,
};
use crate::config::DatasourceConfig;

const DRIVER_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PORT: u16 = 27017;

const STATE_IDLE: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

/// Connection settings for `MongoConnector`
#[derive(Debug, Clone)]
pub struct MongoOptions {
    pub name: String,
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
}

impl MongoOptions {
    /// Derive options from a datasource entry. An explicit `url` wins over
    /// host, port and database.
    pub fn from_config(config: &DatasourceConfig) -> Self {
        let database = config.database.clone().unwrap_or_else(|| config.name.clone());
        let url = match config.url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => format!(
                "mongodb://{}:{}/{}",
                config.host.as_deref().unwrap_or("localhost"),
                config.port.unwrap_or(DEFAULT_PORT),
                database
            ),
        };
        Self {
            name: config.name.clone(),
            url,
            database,
            username: config.username.clone().filter(|u| !u.is_empty()),
            password: config.password.clone().filter(|p| !p.is_empty()),
            min_pool_size: 1,
            max_pool_size: 5,
        }
    }
}

struct Inner {
    options: MongoOptions,
    client: RwLock<Option<Client>>,
    state: AtomicU8,
    timeout_ms: AtomicU64,
}

impl Inner {
    async fn open(&self) -> DatasourceResult<Client> {
        let options = self.client_options(ClientOptions::parse(&self.options.url).await?);
        let client = Client::with_options(options)?;
        self.ping_client(&client).await?;
        Ok(client)
    }

    /// Apply pool sizes, the current timeout and credentials to parsed options
    fn client_options(&self, mut options: ClientOptions) -> ClientOptions {
        let timeout = self.timeout();
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);
        options.min_pool_size = Some(self.options.min_pool_size);
        options.max_pool_size = Some(self.options.max_pool_size);
        if let (Some(username), Some(password)) = (&self.options.username, &self.options.password) {
            let mut credential = Credential::default();
            credential.username = Some(username.clone());
            credential.password = Some(password.clone());
            options.credential = Some(credential);
        }
        options
    }

    async fn ping_client(&self, client: &Client) -> DatasourceResult<()> {
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred {
            options: ReadPreferenceOptions::default(),
        });
        self.bounded(
            client
                .database(&self.options.database)
                .run_command(doc! {"ping": 1}, criteria),
        )
        .await?;
        Ok(())
    }

    fn install(&self, client: Client) -> DatasourceResult<()> {
        let mut slot = self
            .client
            .write()
            .map_err(|_| DatasourceError::Driver("client lock poisoned".into()))?;
        *slot = Some(client);
        self.state.store(STATE_CONNECTED, Ordering::SeqCst);
        Ok(())
    }

    fn client(&self) -> DatasourceResult<Client> {
        if self.state.load(Ordering::SeqCst) == STATE_DISCONNECTED {
            return Err(DatasourceError::Disconnected);
        }
        self.client
            .read()
            .map_err(|_| DatasourceError::Driver("client lock poisoned".into()))?
            .clone()
            .ok_or(DatasourceError::Disconnected)
    }

    fn collection(&self, name: &str) -> DatasourceResult<Collection<Document>> {
        Ok(self
            .client()?
            .database(&self.options.database)
            .collection::<Document>(name))
    }

    /// Deadline for driver calls; a zero setting falls back to the default
    fn timeout(&self) -> Duration {
        match self.timeout_ms.load(Ordering::Relaxed) {
            0 => DRIVER_TIMEOUT,
            millis => Duration::from_millis(millis),
        }
    }

    async fn bounded<T, F>(&self, operation: F) -> DatasourceResult<T>
    where
        F: Future<Output = mongodb::error::Result<T>>,
    {
        let limit = self.timeout();
        match tokio::time::timeout(limit, operation).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DatasourceError::Timeout(limit)),
        }
    }

    async fn find_by_id(&self, collection: &str, id: Bson) -> DatasourceResult<Document> {
        let docs = self.aggregate(collection, vec![doc! {"$match": {"_id": id}}]).await?;
        docs.into_iter().next().ok_or(DatasourceError::NotFound)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> DatasourceResult<Vec<Document>> {
        let collection = self.collection(collection)?;
        let options = AggregateOptions::builder().allow_disk_use(true).build();
        self.bounded(async move {
            collection
                .aggregate(pipeline, options)
                .await?
                .try_collect::<Vec<Document>>()
                .await
        })
        .await
    }
}

impl Supervised for Inner {
    fn label(&self) -> &str {
        &self.options.name
    }

    fn ping(&self) -> BoxFuture<'_, DatasourceResult<()>> {
        Box::pin(async move {
            let client = self.client()?;
            self.ping_client(&client).await
        })
    }

    fn reconnect(&self) -> BoxFuture<'_, DatasourceResult<()>> {
        Box::pin(async move {
            let client = self.open().await?;
            self.install(client)
        })
    }

    fn mark_disconnected(&self) {
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        if let Ok(mut slot) = self.client.write() {
            slot.take();
        }
    }
}

/// Connector for MongoDB-compatible document stores
pub struct MongoConnector {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MongoConnector {
    pub fn new(options: MongoOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                client: RwLock::new(None),
                state: AtomicU8::new(STATE_IDLE),
                timeout_ms: AtomicU64::new(DRIVER_TIMEOUT.as_millis() as u64),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &MongoOptions {
        &self.inner.options
    }

    /// Whether the supervisor gave up on this connection
    pub fn is_disconnected(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_DISCONNECTED
    }

    fn stop_supervisor(&self) {
        if let Ok(mut slot) = self.supervisor.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for MongoConnector {
    fn drop(&mut self) {
        self.stop_supervisor();
    }
}

impl Connector for MongoConnector {
    fn kind(&self) -> &'static str {
        "mongodb"
    }

    fn connect(&self) -> ConnectorFuture<'_, ()> {
        Box::pin(async move {
            let client = self.inner.open().await?;
            self.inner.install(client)?;

            self.stop_supervisor();
            let handle = supervisor::spawn(Arc::downgrade(&self.inner), SupervisorConfig::default());
            if let Ok(mut slot) = self.supervisor.lock() {
                *slot = Some(handle);
            }
            tracing::info!(datasource = %self.inner.options.name, "document store connected");
            Ok(())
        })
    }

    fn disconnect(&self) -> ConnectorFuture<'_, ()> {
        Box::pin(async move {
            self.stop_supervisor();
            let client = self
                .inner
                .client
                .write()
                .map_err(|_| DatasourceError::Driver("client lock poisoned".into()))?
                .take();
            drop(client);
            self.inner.state.store(STATE_IDLE, Ordering::SeqCst);
            Ok(())
        })
    }

    fn ping(&self) -> ConnectorFuture<'_, ()> {
        Supervised::ping(self.inner.as_ref())
    }

    fn find<'a>(&'a self, collection: &'a str, pipeline: Vec<Document>) -> ConnectorFuture<'a, Cursor> {
        Box::pin(async move {
            let docs = self.inner.aggregate(collection, pipeline).await?;
            Ok(Cursor::new(docs))
        })
    }

    fn count<'a>(&'a self, collection: &'a str, mut pipeline: Vec<Document>) -> ConnectorFuture<'a, i64> {
        Box::pin(async move {
            pipeline.push(doc! {"$count": "count"});
            let docs = self.inner.aggregate(collection, pipeline).await?;
            Ok(match docs.first().and_then(|d| d.get("count")) {
                Some(Bson::Int32(n)) => i64::from(*n),
                Some(Bson::Int64(n)) => *n,
                _ => 0,
            })
        })
    }

    fn create<'a>(&'a self, collection: &'a str, data: Document) -> ConnectorFuture<'a, Document> {
        Box::pin(async move {
            let target = self.inner.collection(collection)?;
            let inserted = self.inner.bounded(target.insert_one(data, None)).await?;
            self.inner.find_by_id(collection, inserted.inserted_id).await
        })
    }

    fn update_by_id<'a>(
        &'a self,
        collection: &'a str,
        id: Bson,
        mut patch: Document,
    ) -> ConnectorFuture<'a, Document> {
        Box::pin(async move {
            strip_id_keys(&mut patch);
            if !patch.is_empty() {
                let target = self.inner.collection(collection)?;
                let outcome = self
                    .inner
                    .bounded(target.update_one(doc! {"_id": id.clone()}, doc! {"$set": patch}, None))
                    .await?;
                if outcome.matched_count == 0 {
                    return Err(DatasourceError::NotFound);
                }
            }
            self.inner.find_by_id(collection, id).await
        })
    }

    fn delete_by_id<'a>(&'a self, collection: &'a str, id: Bson) -> ConnectorFuture<'a, DeleteResult> {
        Box::pin(async move {
            let target = self.inner.collection(collection)?;
            let outcome = self.inner.bounded(target.delete_one(doc! {"_id": id}, None)).await?;
            Ok(DeleteResult {
                deleted_count: outcome.deleted_count as i64,
            })
        })
    }

    fn delete_many<'a>(
        &'a self,
        collection: &'a str,
        where_lookups: Option<Vec<Bson>>,
    ) -> ConnectorFuture<'a, DeleteResult> {
        Box::pin(async move {
            let query = validate_delete_lookups(where_lookups.as_deref())?.clone();
            let target = self.inner.collection(collection)?;
            let outcome = self.inner.bounded(target.delete_many(query, None)).await?;
            Ok(DeleteResult {
                deleted_count: outcome.deleted_count as i64,
            })
        })
    }

    fn set_timeout(&self, seconds: f32) {
        let millis = (f64::from(seconds.max(0.0)) * 1000.0) as u64;
        self.inner.timeout_ms.store(millis, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_compose_url_from_parts() {
        let config = DatasourceConfig {
            name: "db".into(),
            connector: "mongodb".into(),
            host: Some("mongo.internal".into()),
            port: Some(27018),
            database: Some("westore".into()),
            ..Default::default()
        };
        let options = MongoOptions::from_config(&config);
        assert_eq!(options.url, "mongodb://mongo.internal:27018/westore");
        assert_eq!(options.database, "westore");
        assert!(options.username.is_none());
    }

    #[test]
    fn test_explicit_url_wins() {
        let config = DatasourceConfig {
            name: "db".into(),
            connector: "mongodb".into(),
            url: Some("mongodb://user@example:1234/other".into()),
            host: Some("ignored".into()),
            ..Default::default()
        };
        let options = MongoOptions::from_config(&config);
        assert_eq!(options.url, "mongodb://user@example:1234/other");
        assert_eq!(options.database, "db");
    }

    #[tokio::test]
    async fn test_operations_before_connect_are_disconnected() {
        let connector = MongoConnector::new(MongoOptions::from_config(&DatasourceConfig {
            name: "db".into(),
            connector: "mongodb".into(),
            ..Default::default()
        }));
        let err = connector.find("Note", vec![]).await.unwrap_err();
        assert!(matches!(err, DatasourceError::Disconnected));
    }

    #[tokio::test]
    async fn test_marked_disconnected_is_terminal() {
        let connector = MongoConnector::new(MongoOptions::from_config(&DatasourceConfig {
            name: "db".into(),
            connector: "mongodb".into(),
            ..Default::default()
        }));
        connector.inner.mark_disconnected();
        assert!(connector.is_disconnected());
        let err = connector.count("Note", vec![]).await.unwrap_err();
        assert!(matches!(err, DatasourceError::Disconnected));
    }

    fn connector_with(username: Option<&str>, password: Option<&str>) -> MongoConnector {
        MongoConnector::new(MongoOptions::from_config(&DatasourceConfig {
            name: "db".into(),
            connector: "mongodb".into(),
            username: username.map(String::from),
            password: password.map(String::from),
            ..Default::default()
        }))
    }

    #[test]
    fn test_set_timeout_reaches_driver_options() {
        let connector = connector_with(None, None);
        let options = connector.inner.client_options(ClientOptions::builder().build());
        assert_eq!(options.connect_timeout, Some(DRIVER_TIMEOUT));

        connector.set_timeout(2.5);
        let options = connector.inner.client_options(ClientOptions::builder().build());
        assert_eq!(options.connect_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(options.server_selection_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(options.min_pool_size, Some(1));
        assert_eq!(options.max_pool_size, Some(5));
    }

    #[test]
    fn test_credentials_need_username_and_password() {
        let options = connector_with(Some("app"), None)
            .inner
            .client_options(ClientOptions::builder().build());
        assert!(options.credential.is_none());

        let options = connector_with(Some("app"), Some(""))
            .inner
            .client_options(ClientOptions::builder().build());
        assert!(options.credential.is_none());

        let options = connector_with(Some("app"), Some("secret"))
            .inner
            .client_options(ClientOptions::builder().build());
        let credential = options.credential.unwrap();
        assert_eq!(credential.username.as_deref(), Some("app"));
        assert_eq!(credential.password.as_deref(), Some("secret"));
    }
}
