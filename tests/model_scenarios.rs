//! Model Scenario Tests
//!
//! End-to-end behaviour of the registry over the in-process document
//! connector with a `memorykv` cache:
//! - filtered finds and relation includes of every kind
//! - relative date placeholders
//! - cache population, hits and expiry
//! - before_load short-circuits
//! - bulk delete validation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson, Document};
use chrono::Utc;
use serde_json::json;

use westore::datasource::{
    Connector, ConnectorFuture, Cursor, Datasource, DatasourceError, Datasources, DeleteResult,
    MemoryConnector, MemoryKvConnector,
};
use westore::filter::Filter;
use westore::model::{HookResult, Instance, ModelConfig, Registry, RequestContext, Related};

// =============================================================================
// Helper Functions
// =============================================================================

/// Document connector that records how often it is queried
struct CountingConnector {
    inner: MemoryConnector,
    finds: AtomicUsize,
}

impl CountingConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryConnector::new("db"),
            finds: AtomicUsize::new(0),
        })
    }

    fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }
}

impl Connector for CountingConnector {
    fn kind(&self) -> &'static str {
        "counting"
    }

    fn connect(&self) -> ConnectorFuture<'_, ()> {
        self.inner.connect()
    }

    fn disconnect(&self) -> ConnectorFuture<'_, ()> {
        self.inner.disconnect()
    }

    fn ping(&self) -> ConnectorFuture<'_, ()> {
        self.inner.ping()
    }

    fn find<'a>(&'a self, collection: &'a str, pipeline: Vec<Document>) -> ConnectorFuture<'a, Cursor> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.inner.find(collection, pipeline)
    }

    fn count<'a>(&'a self, collection: &'a str, pipeline: Vec<Document>) -> ConnectorFuture<'a, i64> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.inner.count(collection, pipeline)
    }

    fn create<'a>(&'a self, collection: &'a str, data: Document) -> ConnectorFuture<'a, Document> {
        self.inner.create(collection, data)
    }

    fn update_by_id<'a>(
        &'a self,
        collection: &'a str,
        id: Bson,
        patch: Document,
    ) -> ConnectorFuture<'a, Document> {
        self.inner.update_by_id(collection, id, patch)
    }

    fn delete_by_id<'a>(&'a self, collection: &'a str, id: Bson) -> ConnectorFuture<'a, DeleteResult> {
        self.inner.delete_by_id(collection, id)
    }

    fn delete_many<'a>(
        &'a self,
        collection: &'a str,
        where_lookups: Option<Vec<Bson>>,
    ) -> ConnectorFuture<'a, DeleteResult> {
        self.inner.delete_many(collection, where_lookups)
    }

    fn set_timeout(&self, seconds: f32) {
        self.inner.set_timeout(seconds)
    }
}

fn model(value: serde_json::Value) -> ModelConfig {
    serde_json::from_value(value).unwrap()
}

fn setup(models: Vec<serde_json::Value>) -> (Arc<Registry>, Arc<CountingConnector>, Arc<MemoryKvConnector>) {
    let db = CountingConnector::new();
    let kv = Arc::new(MemoryKvConnector::new("cache"));
    let mut datasources = Datasources::new();
    datasources.insert(Datasource::new("db", db.clone()));
    datasources.insert(Datasource::memorykv("cache", kv.clone()));

    let registry = Registry::builder(datasources)
        .models(models.into_iter().map(model))
        .build()
        .unwrap();
    (registry, db, kv)
}

fn system() -> Arc<RequestContext> {
    Arc::new(RequestContext::system())
}

fn children<'a>(instance: &'a Instance, relation: &str) -> &'a [Instance] {
    match instance.related(relation) {
        Some(Related::Many(children)) => children,
        other => panic!("{relation} is not a list: {other:?}"),
    }
}

// =============================================================================
// Find Tests
// =============================================================================

#[tokio::test]
async fn test_simple_find_returns_matching_documents() {
    let (registry, _db, _kv) = setup(vec![json!({"name": "Note"})]);
    let notes = registry.model("Note").unwrap();
    notes.create(doc! {"_id": "a", "title": "t1"}, &system()).await.unwrap();
    notes.create(doc! {"_id": "b", "title": "t2"}, &system()).await.unwrap();

    let found = notes
        .find_many(Filter::with_where(doc! {"title": "t1"}), &system())
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), Some(&Bson::String("a".into())));
}

#[tokio::test]
async fn test_include_belongs_to() {
    let (registry, _db, _kv) = setup(vec![
        json!({"name": "Customer", "properties": {"name": {"type": "string"}}}),
        json!({
            "name": "Order",
            "relations": {"customer": {"type": "belongsTo", "model": "Customer"}}
        }),
    ]);
    let customers = registry.model("Customer").unwrap();
    let orders = registry.model("Order").unwrap();

    let customer = customers.create(doc! {"name": "Ada"}, &system()).await.unwrap();
    let customer_id = customer.id().cloned().unwrap();
    orders
        .create(doc! {"customerId": customer_id.clone(), "total": 12}, &system())
        .await
        .unwrap();

    let filter = Filter::from_json_str(r#"{"include": [{"relation": "customer"}]}"#).unwrap();
    let found = orders.find_many(filter, &system()).await.unwrap();

    assert_eq!(found.len(), 1);
    let body = found[0].to_json();
    assert_eq!(body["customer"]["name"], "Ada");
    assert_eq!(
        body["customer"]["id"],
        json!(westore::value::id_string(&customer_id))
    );
}

#[tokio::test]
async fn test_relative_date_placeholder() {
    let (registry, _db, _kv) = setup(vec![json!({
        "name": "Note",
        "properties": {"created": {"type": "date"}}
    })]);
    let notes = registry.model("Note").unwrap();
    let old = bson::DateTime::from_chrono(Utc::now() - chrono::Duration::seconds(16));
    let fresh = bson::DateTime::from_chrono(Utc::now() - chrono::Duration::seconds(5));
    notes.create(doc! {"_id": "old", "created": old}, &system()).await.unwrap();
    notes.create(doc! {"_id": "fresh", "created": fresh}, &system()).await.unwrap();

    let filter = Filter::from_json_str(r#"{"where": {"created": {"$lte": "$15Sago"}}}"#).unwrap();
    let found = notes.find_many(filter, &system()).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), Some(&Bson::String("old".into())));
}

// =============================================================================
// Relation Include Tests
// =============================================================================

#[tokio::test]
async fn test_include_has_one_never_duplicates_the_parent() {
    let (registry, _db, _kv) = setup(vec![
        json!({
            "name": "Customer",
            "relations": {"profile": {"type": "hasOne", "model": "Profile"}}
        }),
        json!({"name": "Profile"}),
    ]);
    let customers = registry.model("Customer").unwrap();
    let profiles = registry.model("Profile").unwrap();
    customers.create(doc! {"_id": "c1", "name": "Ada"}, &system()).await.unwrap();
    customers.create(doc! {"_id": "c2", "name": "Bob"}, &system()).await.unwrap();
    // two candidates for a single-kind relation
    profiles
        .create(doc! {"_id": "p1", "customerId": "c1", "bio": "first"}, &system())
        .await
        .unwrap();
    profiles
        .create(doc! {"_id": "p2", "customerId": "c1", "bio": "second"}, &system())
        .await
        .unwrap();

    let filter = Filter::from_json_str(r#"{"include": "profile", "order": "_id"}"#).unwrap();
    let found = customers.find_many(filter, &system()).await.unwrap();

    assert_eq!(found.len(), 2);
    match found[0].related("profile") {
        Some(Related::One(profile)) => {
            assert_eq!(profile.get("customerId"), Some(&Bson::String("c1".into())));
        }
        other => panic!("expected one profile, got {other:?}"),
    }
    assert!(found[1].related("profile").is_none());
    assert!(found[1].to_json()["profile"].is_null());
}

#[tokio::test]
async fn test_include_has_many_collects_children() {
    let (registry, _db, _kv) = setup(vec![
        json!({
            "name": "Order",
            "relations": {"items": {"type": "hasMany", "model": "Item"}}
        }),
        json!({"name": "Item"}),
    ]);
    let orders = registry.model("Order").unwrap();
    let items = registry.model("Item").unwrap();
    orders.create(doc! {"_id": "o1"}, &system()).await.unwrap();
    orders.create(doc! {"_id": "o2"}, &system()).await.unwrap();
    for n in [1, 2, 3] {
        items.create(doc! {"orderId": "o1", "n": n}, &system()).await.unwrap();
    }

    let filter = Filter::from_json_str(r#"{"include": "items", "order": "_id"}"#).unwrap();
    let found = orders.find_many(filter, &system()).await.unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(children(&found[0], "items").len(), 3);
    assert!(children(&found[1], "items").is_empty());
    assert_eq!(found[1].to_json()["items"], json!([]));
}

#[tokio::test]
async fn test_scoped_include_orders_and_limits_children() {
    let (registry, _db, _kv) = setup(vec![
        json!({
            "name": "Order",
            "relations": {"items": {"type": "hasMany", "model": "Item"}}
        }),
        json!({"name": "Item"}),
    ]);
    let orders = registry.model("Order").unwrap();
    let items = registry.model("Item").unwrap();
    orders.create(doc! {"_id": "o1"}, &system()).await.unwrap();
    for n in [2, 7, 4] {
        items.create(doc! {"orderId": "o1", "n": n}, &system()).await.unwrap();
    }

    let filter = Filter::from_json_str(
        r#"{"include": [{"relation": "items", "scope": {"order": "n DESC", "limit": 2}}]}"#,
    )
    .unwrap();
    let found = orders.find_many(filter, &system()).await.unwrap();

    assert_eq!(found.len(), 1);
    let body = found[0].to_json();
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["items"][0]["n"], 7);
    assert_eq!(body["items"][1]["n"], 4);
}

#[tokio::test]
async fn test_include_has_and_belongs_to_many_through_junction() {
    let (registry, db, _kv) = setup(vec![
        json!({
            "name": "Order",
            "relations": {"tags": {"type": "hasAndBelongsToMany", "model": "Tag"}}
        }),
        json!({"name": "Tag"}),
    ]);
    let orders = registry.model("Order").unwrap();
    let tags = registry.model("Tag").unwrap();
    orders.create(doc! {"_id": "o1"}, &system()).await.unwrap();
    orders.create(doc! {"_id": "o2"}, &system()).await.unwrap();
    for (id, name) in [("t1", "red"), ("t2", "blue"), ("t3", "green")] {
        tags.create(doc! {"_id": id, "name": name}, &system()).await.unwrap();
    }
    for (order, tag) in [("o1", "t1"), ("o1", "t2"), ("o2", "t3")] {
        db.create("Order_Tag", doc! {"orderId": order, "tagId": tag})
            .await
            .unwrap();
    }

    let filter = Filter::from_json_str(
        r#"{"include": {"relation": "tags", "scope": {"order": "name"}}, "order": "_id"}"#,
    )
    .unwrap();
    let found = orders.find_many(filter, &system()).await.unwrap();

    assert_eq!(found.len(), 2);
    let first = found[0].to_json();
    assert_eq!(first["tags"][0]["name"], "blue");
    assert_eq!(first["tags"][1]["name"], "red");
    assert_eq!(first["tags"][0]["id"], "t2");
    // junction fields stay behind
    assert!(first["tags"][0].get("orderId").is_none());
    let second = children(&found[1], "tags");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].get("name"), Some(&Bson::String("green".into())));
}

// =============================================================================
// Cache Tests
// =============================================================================

#[tokio::test]
async fn test_cache_populate_then_hit_then_expire() {
    let (registry, db, kv) = setup(vec![json!({
        "name": "Note",
        "cache": {"datasource": "cache", "ttl": 1, "keys": [["_id"]]}
    })]);
    let notes = registry.model("Note").unwrap();
    assert!(notes.is_cached());

    let created = notes.create(doc! {"title": "cached"}, &system()).await.unwrap();
    let id = created.id().cloned().unwrap();
    let key = format!("_id:{}", westore::value::id_string(&id));

    notes.find_many(Filter::default(), &system()).await.unwrap();
    assert_eq!(db.finds(), 1);
    let bucket = kv.database().bucket("Note").unwrap();
    assert!(bucket.get(&key).unwrap().is_some());

    let hit = notes.find_by_id(id.clone(), None, &system()).await.unwrap();
    assert_eq!(db.finds(), 1);
    assert_eq!(hit.get("title"), Some(&Bson::String("cached".into())));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(bucket.get(&key).unwrap().is_none());

    notes.find_by_id(id, None, &system()).await.unwrap();
    assert_eq!(db.finds(), 2);
}

#[tokio::test]
async fn test_filters_outside_the_cache_go_to_the_connector() {
    let (registry, db, _kv) = setup(vec![json!({
        "name": "Note",
        "cache": {"datasource": "cache", "ttl": 60, "keys": [["_id"]]}
    })]);
    let notes = registry.model("Note").unwrap();
    notes.create(doc! {"_id": "a", "title": "x"}, &system()).await.unwrap();
    notes.find_many(Filter::default(), &system()).await.unwrap();
    assert_eq!(db.finds(), 1);

    // ordered and ranged reads bypass the cache
    let filter = Filter::from_json_str(r#"{"where": {"_id": "a"}, "order": "title"}"#).unwrap();
    notes.find_many(filter, &system()).await.unwrap();
    let filter = Filter::from_json_str(r#"{"where": {"title": "x"}}"#).unwrap();
    notes.find_many(filter, &system()).await.unwrap();
    assert_eq!(db.finds(), 3);
}

// =============================================================================
// Event Pipeline Tests
// =============================================================================

#[tokio::test]
async fn test_before_load_result_skips_the_connector() {
    let (registry, db, _kv) = setup(vec![json!({"name": "Note"})]);
    let notes = registry.model("Note").unwrap();
    notes
        .observe("before load", |ctx| {
            if ctx.operation.name() == "count" {
                ctx.result = Some(HookResult::Count(42));
            }
            Ok(())
        })
        .unwrap();

    let count = notes.count(None, &system()).await.unwrap();
    assert_eq!(count, 42);
    assert_eq!(db.finds(), 0);

    notes.find_many(Filter::default(), &system()).await.unwrap();
    assert_eq!(db.finds(), 1);
}

// =============================================================================
// Bulk Delete Tests
// =============================================================================

#[tokio::test]
async fn test_delete_many_rejects_non_match_stage() {
    let db = MemoryConnector::new("db");
    let err = db
        .delete_many("X", Some(vec![Bson::Document(doc! {"$foo": "bar"})]))
        .await
        .unwrap_err();
    assert!(matches!(err, DatasourceError::BadLookup(_)));
    assert_eq!(
        err.to_string(),
        "first element of whereLookups must be a $match stage"
    );
}

#[tokio::test]
async fn test_delete_many_through_the_model() {
    let (registry, _db, _kv) = setup(vec![json!({"name": "Note"})]);
    let notes = registry.model("Note").unwrap();
    for kind in ["a", "a", "b"] {
        notes.create(doc! {"kind": kind}, &system()).await.unwrap();
    }

    let deleted = notes
        .delete_many(Some(doc! {"kind": "a"}), &system())
        .await
        .unwrap();
    assert_eq!(deleted.deleted_count, 2);
    assert_eq!(notes.count(None, &system()).await.unwrap(), 1);
}
