//! # Model Registry
//!
//! Built in two passes. The first creates one `Model` per config and
//! binds it to its datasource; the second validates every relation
//! target, attaches the cache coordinators and wires the authorizer into
//! each model's hooks. Models refuse to run until the second pass has
//! attached them to the registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use super::binding::{Model, ModelOptions};
use super::cache::CacheCoordinator;
use super::config::ModelConfig;
use super::context::EventContext;
use super::errors::{ModelError, ModelResult};
use super::events::Event;
use super::operation::Operation;
use crate::auth::Principal;
use crate::config::{load_model_dir, AppConfig, DEFAULT_DATASOURCE};
use crate::datasource::Datasources;
use crate::filter::{Include, Schema};

/// Every model of the application, by name
pub struct Registry {
    models: BTreeMap<String, Arc<Model>>,
    datasources: Datasources,
}

impl Registry {
    pub fn builder(datasources: Datasources) -> RegistryBuilder {
        RegistryBuilder::new(datasources)
    }

    /// Build datasources and models from an application config
    pub fn from_app_config(app: &AppConfig) -> ModelResult<Arc<Self>> {
        let datasources = Datasources::from_configs(app.datasources.values())?;
        let configs = load_model_dir(&app.models_dir)?;
        RegistryBuilder::from_app_config(app, datasources)
            .models(configs)
            .build()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Model>> {
        self.models.get(name)
    }

    pub fn model(&self, name: &str) -> ModelResult<Arc<Model>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::UnknownModel(name.to_string()))
    }

    /// Models in name order
    pub fn models(&self) -> impl Iterator<Item = &Arc<Model>> {
        self.models.values()
    }

    /// Public model served under `plural`
    pub fn by_plural(&self, plural: &str) -> Option<&Arc<Model>> {
        self.models
            .values()
            .find(|model| model.config().public && model.plural() == plural)
    }

    pub fn datasources(&self) -> &Datasources {
        &self.datasources
    }

    /// Check read access on every included target that does not skip it
    pub fn authorize_includes(
        &self,
        model: &str,
        includes: &[Include],
        principal: &Principal,
    ) -> ModelResult<()> {
        let Some(parent) = self.models.get(model) else {
            return Ok(());
        };
        for include in includes {
            let Some(relation) = parent.config().relation(&include.relation) else {
                continue;
            };
            if relation.options.skip_auth {
                continue;
            }
            let Some(target) = self.models.get(&relation.model) else {
                continue;
            };
            target
                .authorizer()
                .authorize(principal, Operation::FindMany, None)?;
            if let Some(scope) = &include.scope {
                self.authorize_includes(&relation.model, &scope.include, principal)?;
            }
        }
        Ok(())
    }

    fn resolve(registry: &Arc<Self>) -> ModelResult<()> {
        for model in registry.models.values() {
            let config = model.config();
            for (name, relation) in &config.relations {
                if !registry.models.contains_key(&relation.model) {
                    return Err(ModelError::UnresolvedRelation {
                        model: config.name.clone(),
                        relation: name.clone(),
                        target: relation.model.clone(),
                    });
                }
            }

            let cache = match &config.cache {
                None => None,
                Some(cache) => {
                    let datasource = registry.datasources.get(&cache.datasource).ok_or_else(|| {
                        ModelError::UnknownDatasource {
                            model: config.name.clone(),
                            datasource: cache.datasource.clone(),
                        }
                    })?;
                    match datasource.kv() {
                        Some(kv) => Some(CacheCoordinator::new(kv.clone(), config.collection(), cache)),
                        None => {
                            let error = ModelError::CacheUnsupported {
                                model: config.name.clone(),
                                datasource: cache.datasource.clone(),
                            };
                            tracing::warn!(error = %error, "serving model without cache");
                            None
                        }
                    }
                }
            };

            install_authorization(model, Arc::downgrade(registry))?;
            model.attach(Arc::downgrade(registry), cache)?;
        }
        Ok(())
    }
}

impl Schema for Registry {
    fn model_config(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name).map(|model| model.config())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Collects model configs and datasource bindings before resolution
pub struct RegistryBuilder {
    configs: Vec<ModelConfig>,
    datasources: Datasources,
    model_datasources: BTreeMap<String, String>,
    options: ModelOptions,
}

impl RegistryBuilder {
    pub fn new(datasources: Datasources) -> Self {
        Self {
            configs: Vec::new(),
            datasources,
            model_datasources: BTreeMap::new(),
            options: ModelOptions::default(),
        }
    }

    pub fn from_app_config(app: &AppConfig, datasources: Datasources) -> Self {
        Self {
            configs: Vec::new(),
            datasources,
            model_datasources: app.model_datasources.clone(),
            options: ModelOptions {
                disable_cache: app.disable_cache,
                strict_single_related_document_check: app.strict_single_related_document_check,
            },
        }
    }

    pub fn options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    /// Serve `model` from `datasource` instead of the default one
    pub fn bind(mut self, model: &str, datasource: &str) -> Self {
        self.model_datasources
            .insert(model.to_string(), datasource.to_string());
        self
    }

    pub fn model(mut self, config: ModelConfig) -> Self {
        self.configs.push(config);
        self
    }

    pub fn models(mut self, configs: impl IntoIterator<Item = ModelConfig>) -> Self {
        self.configs.extend(configs);
        self
    }

    pub fn build(self) -> ModelResult<Arc<Registry>> {
        let mut models = BTreeMap::new();
        for config in self.configs {
            let name = self
                .model_datasources
                .get(&config.name)
                .map(String::as_str)
                .unwrap_or(DEFAULT_DATASOURCE);
            let datasource = self.datasources.get(name).cloned().ok_or_else(|| {
                ModelError::UnknownDatasource {
                    model: config.name.clone(),
                    datasource: name.to_string(),
                }
            })?;
            if models.contains_key(&config.name) {
                return Err(ModelError::DuplicateModel(config.name));
            }
            let model = Model::new(config, datasource, self.options);
            models.insert(model.name().to_string(), Arc::new(model));
        }

        let registry = Arc::new(Registry {
            models,
            datasources: self.datasources,
        });
        Registry::resolve(&registry)?;
        tracing::info!(models = registry.models.len(), "model registry resolved");
        Ok(registry)
    }
}

/// Wire the model's ACL into its load and save hooks
fn install_authorization(model: &Model, registry: Weak<Registry>) -> ModelResult<()> {
    let authorizer = model.authorizer().clone();
    model.on(Event::BeforeLoad.name(), move |ctx: &mut EventContext| {
        if ctx.skip_auth {
            return Ok(());
        }
        let owner = ctx
            .instance
            .as_ref()
            .and_then(|instance| instance.get(authorizer.owner_key()))
            .cloned();
        match authorizer.authorize(ctx.principal(), ctx.operation, owner.as_ref()) {
            Ok(()) => {}
            Err(_)
                if ctx.operation == Operation::FindById
                    && authorizer.needs_owner()
                    && ctx.principal().user_id.is_some() =>
            {
                ctx.deferred_owner_check = true;
            }
            Err(e) => return Err(e.into()),
        }

        let Some(filter) = ctx.filter.as_ref().filter(|f| f.has_include()) else {
            return Ok(());
        };
        let registry = registry
            .upgrade()
            .ok_or_else(|| ModelError::NotResolved(ctx.model.clone()))?;
        registry.authorize_includes(&ctx.model, &filter.include, ctx.principal())
    })?;

    let authorizer = model.authorizer().clone();
    model.on(Event::AfterLoad.name(), move |ctx: &mut EventContext| {
        if !ctx.deferred_owner_check {
            return Ok(());
        }
        let owner = ctx
            .instance
            .as_ref()
            .and_then(|instance| instance.get(authorizer.owner_key()));
        authorizer.authorize(ctx.principal(), ctx.operation, owner)?;
        Ok(())
    })?;

    let authorizer = model.authorizer().clone();
    model.on(Event::BeforeSave.name(), move |ctx: &mut EventContext| {
        if ctx.skip_auth {
            return Ok(());
        }
        let key = authorizer.owner_key();
        let owner = ctx
            .instance
            .as_ref()
            .and_then(|instance| instance.get(key))
            .or_else(|| ctx.data.as_ref().and_then(|data| data.get(key)))
            .cloned();
        authorizer.authorize(ctx.principal(), ctx.operation, owner.as_ref())?;
        Ok(())
    })
}
