//! # Models
//!
//! A `Model` binds a config to its datasource, its authorizer and its
//! handler chains. Every operation runs the same steps:
//!
//! 1. Derive an `EventContext` from the request context
//! 2. Run `before_load` or `before_save`; a handler result ends the call here
//! 3. Compile the filter and call the connector (reads try the cache first)
//! 4. Build instances
//! 5. Run `after_load` or `after_save`

use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};

use bson::{doc, oid::ObjectId, Bson, Document};

use super::cache::CacheCoordinator;
use super::config::{ModelConfig, PropertyType};
use super::context::{EventContext, HookResult, RequestContext};
use super::errors::{ModelError, ModelResult};
use super::events::{normalize_event, Event, Handlers};
use super::instance::{Instance, InstanceBuilder};
use super::operation::Operation;
use super::registry::Registry;
use crate::auth::Authorizer;
use crate::datasource::coerce::coerce_value;
use crate::datasource::{strip_id_keys, Datasource, DatasourceError, DatasourceResult, DeleteResult};
use crate::filter::{Compiler, Filter};
use crate::value::{id_string, json_to_bson, parse_number, parse_timestamp};

/// Registry-wide switches every model shares
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelOptions {
    pub disable_cache: bool,
    pub strict_single_related_document_check: bool,
}

/// Outcome of the `after_load` pass
enum Loaded {
    Instances(Vec<Instance>),
    Replaced(HookResult),
}

/// Runtime binding of one model definition
pub struct Model {
    config: ModelConfig,
    datasource: Datasource,
    authorizer: Authorizer,
    handlers: Handlers,
    options: ModelOptions,
    registry: OnceLock<Weak<Registry>>,
    cache: OnceLock<Option<CacheCoordinator>>,
}

impl Model {
    pub(crate) fn new(config: ModelConfig, datasource: Datasource, options: ModelOptions) -> Self {
        Self {
            authorizer: Authorizer::from_config(&config),
            config,
            datasource,
            handlers: Handlers::new(),
            options,
            registry: OnceLock::new(),
            cache: OnceLock::new(),
        }
    }

    /// Final step of registry resolution
    pub(crate) fn attach(
        &self,
        registry: Weak<Registry>,
        cache: Option<CacheCoordinator>,
    ) -> ModelResult<()> {
        let twice = || ModelError::internal(format!("model {} attached twice", self.name()));
        self.cache.set(cache).map_err(|_| twice())?;
        self.registry.set(registry).map_err(|_| twice())?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn plural(&self) -> String {
        self.config.plural()
    }

    pub fn datasource(&self) -> &Datasource {
        &self.datasource
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    /// Whether reads go through a read-through cache
    pub fn is_cached(&self) -> bool {
        self.cache().is_some()
    }

    /// Register a handler for `before load`, `after load`, `before save`
    /// or `after save`
    pub fn observe<F>(&self, event: &str, handler: F) -> ModelResult<()>
    where
        F: Fn(&mut EventContext) -> ModelResult<()> + Send + Sync + 'static,
    {
        self.handlers.on(&normalize_event(event), handler)
    }

    /// Register a handler under a raw event name
    pub fn on<F>(&self, event: &str, handler: F) -> ModelResult<()>
    where
        F: Fn(&mut EventContext) -> ModelResult<()> + Send + Sync + 'static,
    {
        self.handlers.on(event, handler)
    }

    // ==================
    // Reads
    // ==================

    pub async fn find_many(
        &self,
        filter: Filter,
        request: &Arc<RequestContext>,
    ) -> ModelResult<Vec<Instance>> {
        let operation = Operation::FindMany;
        let registry = self.registry()?;
        let mut ctx = EventContext::new(request.clone(), self.name(), operation);
        ctx.filter = Some(filter);

        self.handlers.dispatch(Event::BeforeLoad.name(), &mut ctx)?;
        if let Some(result) = ctx.result.take() {
            return result.into_instances(operation);
        }

        let instances = self.fetch(&registry, &ctx).await?;
        match self.after_load(&mut ctx, instances)? {
            Loaded::Instances(instances) => Ok(instances),
            Loaded::Replaced(result) => result.into_instances(operation),
        }
    }

    pub async fn find_one(
        &self,
        mut filter: Filter,
        request: &Arc<RequestContext>,
    ) -> ModelResult<Option<Instance>> {
        let operation = Operation::FindOne;
        let registry = self.registry()?;
        filter.limit = 1;
        let mut ctx = EventContext::new(request.clone(), self.name(), operation);
        ctx.filter = Some(filter);

        self.handlers.dispatch(Event::BeforeLoad.name(), &mut ctx)?;
        if let Some(result) = ctx.result.take() {
            return result.into_instance(operation);
        }

        let instances = self.fetch(&registry, &ctx).await?;
        match self.after_load(&mut ctx, instances)? {
            Loaded::Instances(instances) => Ok(instances.into_iter().next()),
            Loaded::Replaced(result) => result.into_instance(operation),
        }
    }

    /// Load one document; `filter` may add includes and extra conditions
    pub async fn find_by_id(
        &self,
        id: Bson,
        filter: Option<Filter>,
        request: &Arc<RequestContext>,
    ) -> ModelResult<Instance> {
        let operation = Operation::FindById;
        let registry = self.registry()?;
        let mut filter = filter.unwrap_or_default();
        let mut where_ = filter.where_.take().unwrap_or_default();
        where_.remove("id");
        where_.insert("_id", id.clone());
        filter.where_ = Some(where_);

        let mut ctx = EventContext::new(request.clone(), self.name(), operation);
        ctx.filter = Some(filter);
        ctx.id = Some(id.clone());

        self.handlers.dispatch(Event::BeforeLoad.name(), &mut ctx)?;
        if let Some(result) = ctx.result.take() {
            return result.into_single(operation);
        }

        let instances = self.fetch(&registry, &ctx).await?;
        match self.after_load(&mut ctx, instances)? {
            Loaded::Instances(instances) => instances
                .into_iter()
                .next()
                .ok_or_else(|| self.not_found(&id)),
            Loaded::Replaced(result) => result.into_single(operation),
        }
    }

    pub async fn count(
        &self,
        where_: Option<Document>,
        request: &Arc<RequestContext>,
    ) -> ModelResult<i64> {
        let operation = Operation::Count;
        let registry = self.registry()?;
        let mut ctx = EventContext::new(request.clone(), self.name(), operation);
        ctx.filter = Some(Filter {
            where_,
            ..Default::default()
        });

        self.handlers.dispatch(Event::BeforeLoad.name(), &mut ctx)?;
        if let Some(result) = ctx.result.take() {
            return result.into_count(operation);
        }

        let mut pipeline = Vec::new();
        if let Some(where_) = ctx.filter.as_ref().and_then(|f| f.where_.as_ref()) {
            if !where_.is_empty() {
                let body = self.compiler(&registry, &ctx).compile_where(&self.config, where_)?;
                pipeline.push(doc! {"$match": body});
            }
        }
        let connector = self.datasource.connector();
        self.bounded(request, connector.count(self.config.collection(), pipeline))
            .await
    }

    // ==================
    // Writes
    // ==================

    pub async fn create(&self, data: Document, request: &Arc<RequestContext>) -> ModelResult<Instance> {
        let operation = Operation::Create;
        let registry = self.registry()?;
        let mut ctx = EventContext::new(request.clone(), self.name(), operation);
        ctx.is_new_instance = true;
        ctx.data = Some(self.prepare(data, true, !ctx.disable_type_conversions())?);

        self.handlers.dispatch(Event::BeforeSave.name(), &mut ctx)?;
        if let Some(result) = ctx.result.take() {
            return result.into_single(operation);
        }

        let data = ctx.data.take().unwrap_or_default();
        let connector = self.datasource.connector();
        let stored = self
            .bounded(request, connector.create(self.config.collection(), data))
            .await?;
        let instance = self.builder(&registry).build(&self.config, stored)?;
        self.after_save(ctx, instance)
    }

    /// Apply a partial update. Identifier keys in `patch` are dropped.
    pub async fn update_by_id(
        &self,
        id: Bson,
        mut patch: Document,
        request: &Arc<RequestContext>,
    ) -> ModelResult<Instance> {
        let operation = Operation::UpdateById;
        let registry = self.registry()?;
        strip_id_keys(&mut patch);
        let mut ctx = EventContext::new(request.clone(), self.name(), operation);
        let patch = self.prepare(patch, false, !ctx.disable_type_conversions())?;
        if patch.is_empty() {
            return Err(ModelError::invalid_input("update has no properties to set"));
        }
        ctx.id = Some(id.clone());
        ctx.data = Some(patch);
        self.load_guarded(&mut ctx, &id).await?;

        self.handlers.dispatch(Event::BeforeSave.name(), &mut ctx)?;
        if let Some(result) = ctx.result.take() {
            return result.into_single(operation);
        }

        let patch = ctx.data.take().unwrap_or_default();
        let connector = self.datasource.connector();
        let updated = self
            .bounded(
                request,
                connector.update_by_id(self.config.collection(), id.clone(), patch),
            )
            .await
            .map_err(|e| self.missing_as_not_found(e, &id))?;
        let instance = self.builder(&registry).build(&self.config, updated)?;
        ctx.instance = None;
        self.after_save(ctx, instance)
    }

    pub async fn delete_by_id(&self, id: Bson, request: &Arc<RequestContext>) -> ModelResult<DeleteResult> {
        let operation = Operation::DeleteById;
        self.registry()?;
        let mut ctx = EventContext::new(request.clone(), self.name(), operation);
        ctx.id = Some(id.clone());
        self.load_guarded(&mut ctx, &id).await?;

        self.handlers.dispatch(Event::BeforeSave.name(), &mut ctx)?;
        if let Some(result) = ctx.result.take() {
            return result.into_deleted(operation);
        }

        let connector = self.datasource.connector();
        let deleted = self
            .bounded(request, connector.delete_by_id(self.config.collection(), id.clone()))
            .await
            .map_err(|e| self.missing_as_not_found(e, &id))?;
        if deleted.deleted_count == 0 {
            return Err(self.not_found(&id));
        }

        self.handlers.dispatch(Event::AfterSave.name(), &mut ctx)?;
        match ctx.result.take() {
            Some(result) => result.into_deleted(operation),
            None => Ok(deleted),
        }
    }

    /// Delete every document matching `where_`, which must be non-empty
    pub async fn delete_many(
        &self,
        where_: Option<Document>,
        request: &Arc<RequestContext>,
    ) -> ModelResult<DeleteResult> {
        let operation = Operation::DeleteMany;
        let registry = self.registry()?;
        let where_ = match where_ {
            Some(where_) if !where_.is_empty() => where_,
            _ => return Err(ModelError::invalid_input("deleteMany requires a non-empty where")),
        };
        let mut ctx = EventContext::new(request.clone(), self.name(), operation);
        ctx.filter = Some(Filter::with_where(where_));

        self.handlers.dispatch(Event::BeforeSave.name(), &mut ctx)?;
        if let Some(result) = ctx.result.take() {
            return result.into_deleted(operation);
        }

        let where_ = ctx
            .filter
            .as_ref()
            .and_then(|f| f.where_.clone())
            .unwrap_or_default();
        let body = self.compiler(&registry, &ctx).compile_where(&self.config, &where_)?;
        let lookups = vec![Bson::Document(doc! {"$match": body})];
        let connector = self.datasource.connector();
        let deleted = self
            .bounded(request, connector.delete_many(self.config.collection(), Some(lookups)))
            .await?;

        self.handlers.dispatch(Event::AfterSave.name(), &mut ctx)?;
        match ctx.result.take() {
            Some(result) => result.into_deleted(operation),
            None => Ok(deleted),
        }
    }

    // ==================
    // Internals
    // ==================

    fn registry(&self) -> ModelResult<Arc<Registry>> {
        self.registry
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ModelError::NotResolved(self.config.name.clone()))
    }

    fn cache(&self) -> Option<&CacheCoordinator> {
        if self.options.disable_cache {
            return None;
        }
        self.cache.get().and_then(Option::as_ref)
    }

    fn compiler<'r>(&self, registry: &'r Registry, ctx: &EventContext) -> Compiler<'r, Registry> {
        Compiler::new(registry).coerce(!ctx.disable_type_conversions())
    }

    fn builder<'r>(&self, registry: &'r Registry) -> InstanceBuilder<'r, Registry> {
        InstanceBuilder::new(registry, self.options.strict_single_related_document_check)
    }

    fn not_found(&self, id: &Bson) -> ModelError {
        ModelError::NotFound {
            model: self.config.name.clone(),
            id: id_string(id),
        }
    }

    fn missing_as_not_found(&self, error: ModelError, id: &Bson) -> ModelError {
        match error {
            ModelError::Datasource(DatasourceError::NotFound) => self.not_found(id),
            other => other,
        }
    }

    /// Run a connector call under the request deadline
    async fn bounded<T>(
        &self,
        request: &RequestContext,
        call: impl Future<Output = DatasourceResult<T>>,
    ) -> ModelResult<T> {
        match request.remaining() {
            None => Ok(call.await?),
            Some(left) => match tokio::time::timeout(left, call).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(DatasourceError::Timeout(left).into()),
            },
        }
    }

    /// Query through the cache when the filter allows it
    async fn fetch(&self, registry: &Registry, ctx: &EventContext) -> ModelResult<Vec<Instance>> {
        let filter = ctx.filter.clone().unwrap_or_default();
        let compiler = self.compiler(registry, ctx);
        let cache = self.cache().filter(|_| CacheCoordinator::accepts(&filter));

        let mut pinned = None;
        if let Some(cache) = cache {
            if let Some(where_) = &filter.where_ {
                let compiled = compiler.compile_where(&self.config, where_)?;
                pinned = cache.key_for_where(&compiled);
            }
            if let Some(key) = &pinned {
                if let Some(mut docs) = cache.lookup(key).await? {
                    match usize::try_from(filter.limit) {
                        Ok(limit) if limit > 0 => docs.truncate(limit),
                        _ => {}
                    }
                    return self.builder(registry).build_many(&self.config, docs);
                }
            }
        }

        let pipeline = compiler.compile(&self.config, &filter)?;
        tracing::debug!(
            model = %self.config.name,
            operation = ctx.operation.name(),
            request_id = %ctx.request().request_id,
            stages = pipeline.len(),
            "dispatching query"
        );
        let connector = self.datasource.connector();
        let docs = self
            .bounded(ctx.request(), connector.find(self.config.collection(), pipeline))
            .await?
            .all();

        if let Some(cache) = cache {
            let complete = filter.where_.is_none() && filter.limit == 0;
            let pinned = pinned.as_deref().filter(|_| filter.limit == 0);
            if let Err(e) = cache.populate(&docs, pinned, complete).await {
                tracing::warn!(model = %self.config.name, error = %e, "cache population failed");
            }
        }
        self.builder(registry).build_many(&self.config, docs)
    }

    /// Run `after_load` once per instance. Handlers may edit or drop the
    /// instance, or replace the whole result.
    fn after_load(&self, ctx: &mut EventContext, instances: Vec<Instance>) -> ModelResult<Loaded> {
        let mut out = Vec::with_capacity(instances.len());
        for instance in instances {
            ctx.instance = Some(instance);
            self.handlers.dispatch(Event::AfterLoad.name(), ctx)?;
            if let Some(result) = ctx.result.take() {
                return Ok(Loaded::Replaced(result));
            }
            if let Some(instance) = ctx.instance.take() {
                out.push(instance);
            }
        }
        Ok(Loaded::Instances(out))
    }

    fn after_save(&self, mut ctx: EventContext, instance: Instance) -> ModelResult<Instance> {
        let operation = ctx.operation;
        ctx.instance = Some(instance);
        self.handlers.dispatch(Event::AfterSave.name(), &mut ctx)?;
        if let Some(result) = ctx.result.take() {
            return result.into_single(operation);
        }
        ctx.instance
            .take()
            .ok_or_else(|| ModelError::internal("after_save handler removed the instance"))
    }

    /// Load the current document when the ACL decides by owner
    async fn load_guarded(&self, ctx: &mut EventContext, id: &Bson) -> ModelResult<()> {
        if ctx.principal().system || !self.authorizer.needs_owner() {
            return Ok(());
        }
        let mut query = Document::new();
        query.insert("_id", id.clone());
        let connector = self.datasource.connector();
        let current = self
            .bounded(
                ctx.request(),
                connector.find(self.config.collection(), vec![doc! {"$match": query}]),
            )
            .await?
            .next()
            .ok_or_else(|| self.not_found(id))?;
        ctx.instance = Some(Instance::new(self.name(), current));
        Ok(())
    }

    /// Normalise a write payload: drop relation keys, fill defaults,
    /// check required properties and coerce typed ones
    fn prepare(&self, mut data: Document, creating: bool, coerce: bool) -> ModelResult<Document> {
        if creating {
            if let Some(id) = data.remove("id") {
                if !data.contains_key("_id") {
                    data.insert("_id", id);
                }
            }
        }
        for relation in self.config.relations.keys() {
            data.remove(relation);
        }
        if creating {
            for (name, property) in &self.config.properties {
                if let (false, Some(default)) = (data.contains_key(name), &property.default) {
                    data.insert(name.clone(), json_to_bson(default));
                }
            }
        }
        for (name, property) in &self.config.properties {
            match data.get_mut(name) {
                None if creating && property.required => {
                    return Err(ModelError::invalid_input(format!("{name} is required")))
                }
                None => {}
                Some(Bson::Null) if property.required => {
                    return Err(ModelError::invalid_input(format!("{name} cannot be null")))
                }
                Some(Bson::Null) => {}
                Some(value) if coerce => convert_property(name, property.kind, value)?,
                Some(_) => {}
            }
        }

        // string-typed properties keep hex and ISO text as written
        if coerce {
            for (key, value) in data.iter_mut() {
                if self.config.property_type(key) != Some(PropertyType::String) {
                    coerce_value(value);
                }
            }
        }
        Ok(data)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.config.name)
            .field("datasource", &self.datasource.name())
            .field("cached", &self.is_cached())
            .finish()
    }
}

fn convert_property(name: &str, kind: PropertyType, value: &mut Bson) -> ModelResult<()> {
    let mismatch = |expected: &str| {
        ModelError::invalid_input(format!("{name} must be {expected}"))
    };
    let converted = match (kind, &*value) {
        (PropertyType::String, Bson::String(_)) => None,
        (PropertyType::String, _) => return Err(mismatch("a string")),
        (PropertyType::Number, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)) => None,
        (PropertyType::Number, Bson::String(text)) => {
            Some(parse_number(text).ok_or_else(|| mismatch("a number"))?)
        }
        (PropertyType::Number, _) => return Err(mismatch("a number")),
        (PropertyType::Boolean, Bson::Boolean(_)) => None,
        (PropertyType::Boolean, Bson::String(text)) => match text.as_str() {
            "true" => Some(Bson::Boolean(true)),
            "false" => Some(Bson::Boolean(false)),
            _ => return Err(mismatch("a boolean")),
        },
        (PropertyType::Boolean, _) => return Err(mismatch("a boolean")),
        (PropertyType::Date, Bson::DateTime(_)) => None,
        (PropertyType::Date, Bson::String(text)) => Some(Bson::DateTime(
            parse_timestamp(text).ok_or_else(|| mismatch("an RFC 3339 timestamp"))?,
        )),
        (PropertyType::Date, Bson::Int64(millis)) => Some(Bson::DateTime(bson::DateTime::from_millis(*millis))),
        (PropertyType::Date, _) => return Err(mismatch("a timestamp")),
        (PropertyType::ObjectId, Bson::String(hex)) => ObjectId::parse_str(hex).ok().map(Bson::ObjectId),
        _ => None,
    };
    if let Some(converted) = converted {
        *value = converted;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::datasource::{Datasources, MemoryConnector};
    use serde_json::json;

    fn registry(models: Vec<serde_json::Value>) -> Arc<Registry> {
        let mut datasources = Datasources::new();
        datasources.insert(Datasource::new("db", Arc::new(MemoryConnector::new("db"))));
        Registry::builder(datasources)
            .models(models.into_iter().map(|m| serde_json::from_value(m).unwrap()))
            .build()
            .unwrap()
    }

    fn system() -> Arc<RequestContext> {
        Arc::new(RequestContext::system())
    }

    #[tokio::test]
    async fn test_create_applies_defaults_and_coercion() {
        let registry = registry(vec![json!({
            "name": "Note",
            "properties": {
                "title": {"type": "string", "required": true},
                "views": {"type": "number", "default": 0},
                "created": {"type": "date"}
            },
            "relations": {"tags": {"type": "hasMany", "model": "Note"}}
        })]);
        let notes = registry.model("Note").unwrap();

        let created = notes
            .create(
                doc! {"title": "t", "created": "2024-01-02T03:04:05Z", "tags": [1]},
                &system(),
            )
            .await
            .unwrap();

        assert!(matches!(created.id(), Some(Bson::ObjectId(_))));
        assert_eq!(created.get("views"), Some(&Bson::Int64(0)));
        assert!(matches!(created.get("created"), Some(Bson::DateTime(_))));
        assert!(created.get("tags").is_none());

        let err = notes.create(doc! {"views": 1}, &system()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        let err = notes
            .create(doc! {"title": "t", "views": "many"}, &system())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_string_properties_keep_hex_and_iso_text() {
        let registry = registry(vec![json!({
            "name": "Upload",
            "properties": {
                "hash": {"type": "string"},
                "takenAt": {"type": "string"},
                "ownerId": {"type": "objectId"}
            }
        })]);
        let uploads = registry.model("Upload").unwrap();
        let hex = "64b7f1a2c3d4e5f600112233";

        let created = uploads
            .create(
                doc! {
                    "hash": hex,
                    "takenAt": "2024-01-01T00:00:00Z",
                    "ownerId": hex,
                    "seenAt": "2024-01-01T00:00:00Z"
                },
                &system(),
            )
            .await
            .unwrap();

        assert_eq!(created.get("hash"), Some(&Bson::String(hex.into())));
        assert_eq!(
            created.get("takenAt"),
            Some(&Bson::String("2024-01-01T00:00:00Z".into()))
        );
        assert!(matches!(created.get("ownerId"), Some(Bson::ObjectId(_))));
        assert!(matches!(created.get("seenAt"), Some(Bson::DateTime(_))));

        let updated = uploads
            .update_by_id(created.id().cloned().unwrap(), doc! {"hash": hex}, &system())
            .await
            .unwrap();
        assert_eq!(updated.get("hash"), Some(&Bson::String(hex.into())));
    }

    #[tokio::test]
    async fn test_create_with_taken_id_is_invalid_input() {
        let registry = registry(vec![json!({"name": "Note"})]);
        let notes = registry.model("Note").unwrap();
        notes.create(doc! {"_id": "a", "title": "x"}, &system()).await.unwrap();

        let err = notes
            .create(doc! {"_id": "a", "title": "y"}, &system())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        assert_eq!(err.status_code(), 400);
        assert_eq!(notes.count(None, &system()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_ignores_identifier_changes() {
        let registry = registry(vec![json!({"name": "Note"})]);
        let notes = registry.model("Note").unwrap();
        let created = notes.create(doc! {"title": "a"}, &system()).await.unwrap();
        let id = created.id().cloned().unwrap();

        let updated = notes
            .update_by_id(id.clone(), doc! {"_id": "other", "id": "x", "title": "b"}, &system())
            .await
            .unwrap();
        assert_eq!(updated.id(), Some(&id));
        assert_eq!(updated.get("title"), Some(&Bson::from("b")));

        let err = notes
            .update_by_id(Bson::ObjectId(ObjectId::new()), doc! {"title": "c"}, &system())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_find_by_id_and_delete() {
        let registry = registry(vec![json!({"name": "Note"})]);
        let notes = registry.model("Note").unwrap();
        let created = notes.create(doc! {"title": "a"}, &system()).await.unwrap();
        let id = created.id().cloned().unwrap();

        let found = notes.find_by_id(id.clone(), None, &system()).await.unwrap();
        assert_eq!(found.get("title"), Some(&Bson::from("a")));

        let deleted = notes.delete_by_id(id.clone(), &system()).await.unwrap();
        assert_eq!(deleted.deleted_count, 1);
        let err = notes.delete_by_id(id.clone(), &system()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = notes.find_by_id(id, None, &system()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_delete_many_requires_where() {
        let registry = registry(vec![json!({"name": "Note"})]);
        let notes = registry.model("Note").unwrap();
        for title in ["a", "a", "b"] {
            notes.create(doc! {"title": title}, &system()).await.unwrap();
        }

        let err = notes.delete_many(None, &system()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        let err = notes.delete_many(Some(Document::new()), &system()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        let deleted = notes
            .delete_many(Some(doc! {"title": "a"}), &system())
            .await
            .unwrap();
        assert_eq!(deleted.deleted_count, 2);
        assert_eq!(notes.count(None, &system()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_before_load_result_must_match_operation() {
        let registry = registry(vec![json!({"name": "Note"})]);
        let notes = registry.model("Note").unwrap();
        notes
            .observe("before load", |ctx: &mut EventContext| {
                ctx.result = Some(HookResult::Count(42));
                Ok(())
            })
            .unwrap();

        assert_eq!(notes.count(None, &system()).await.unwrap(), 42);
        let err = notes
            .find_many(Filter::default(), &system())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TYPE_MISMATCH");
    }

    #[tokio::test]
    async fn test_after_load_can_drop_instances() {
        let registry = registry(vec![json!({"name": "Note"})]);
        let notes = registry.model("Note").unwrap();
        for title in ["keep", "drop"] {
            notes.create(doc! {"title": title}, &system()).await.unwrap();
        }
        notes
            .observe("after load", |ctx: &mut EventContext| {
                if ctx
                    .instance
                    .as_ref()
                    .is_some_and(|i| i.get("title") == Some(&Bson::from("drop")))
                {
                    ctx.instance = None;
                }
                Ok(())
            })
            .unwrap();

        let found = notes.find_many(Filter::default(), &system()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("title"), Some(&Bson::from("keep")));
    }

    #[tokio::test]
    async fn test_owner_rules_guard_writes_and_reads() {
        let registry = registry(vec![json!({
            "name": "Note",
            "policyEffect": "allowOverrides",
            "acls": [
                {"principalId": "$everyone", "permission": "DENY"},
                {"principalId": "$authenticated", "permission": "ALLOW", "property": "create"},
                {"principalId": "$owner", "permission": "ALLOW"}
            ]
        })]);
        let notes = registry.model("Note").unwrap();
        let alice = Arc::new(RequestContext::new(Principal::user("alice", vec![])));
        let bob = Arc::new(RequestContext::new(Principal::user("bob", vec![])));

        let note = notes
            .create(doc! {"userId": "alice", "title": "mine"}, &alice)
            .await
            .unwrap();
        let id = note.id().cloned().unwrap();

        assert!(notes.find_by_id(id.clone(), None, &alice).await.is_ok());
        let err = notes.find_by_id(id.clone(), None, &bob).await.unwrap_err();
        assert_eq!(err.status_code(), 403);

        let err = notes
            .update_by_id(id.clone(), doc! {"title": "theirs"}, &bob)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert!(notes
            .update_by_id(id.clone(), doc! {"title": "still mine"}, &alice)
            .await
            .is_ok());

        let err = notes
            .find_many(Filter::default(), &Arc::new(RequestContext::anonymous()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn test_handler_panic_is_an_internal_error() {
        let registry = registry(vec![json!({"name": "Note"})]);
        let notes = registry.model("Note").unwrap();
        notes
            .observe("before save", |_ctx: &mut EventContext| panic!("bad handler"))
            .unwrap();

        let err = notes.create(doc! {"a": 1}, &system()).await.unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
        assert_eq!(notes.count(None, &system()).await.unwrap(), 0);
    }
}
