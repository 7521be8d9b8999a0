//! # Model Module
//!
//! Model definitions and their runtime: the registry, per-model
//! operations, the event pipeline, instance building and the
//! read-through cache.

mod binding;
mod cache;
pub mod config;
mod context;
mod errors;
mod events;
mod instance;
mod operation;
mod registry;

pub use binding::{Model, ModelOptions};
pub use cache::{document_key, CacheCoordinator};
pub use config::{
    CacheConfig, JoinKeys, Junction, ModelConfig, MongoModelConfig, PropertyConfig, PropertyType,
    RelationConfig, RelationKind, RelationOptions,
};
pub use context::{EventContext, HookResult, RequestContext};
pub use errors::{ModelError, ModelResult};
pub use events::{normalize_event, Event, Handler, Handlers};
pub use instance::{Instance, InstanceBuilder, Related};
pub use operation::Operation;
pub use registry::{Registry, RegistryBuilder};
