//! # Model Definitions
//!
//! The JSON shape of a model file and the key conventions relations
//! follow when none are given explicitly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::auth::{AclRule, PolicyEffect};

/// Default owner field for `$owner` rules
pub const DEFAULT_OWNER_KEY: &str = "userId";

/// One model definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub name: String,

    /// URL segment; derived from `name` when absent
    #[serde(default)]
    pub plural: Option<String>,

    #[serde(default)]
    pub base: Option<String>,

    /// Whether the REST surface exposes the model
    #[serde(default = "default_public")]
    pub public: bool,

    #[serde(default)]
    pub properties: BTreeMap<String, PropertyConfig>,

    #[serde(default)]
    pub relations: BTreeMap<String, RelationConfig>,

    /// Properties omitted from serialised output
    #[serde(default)]
    pub hidden: Vec<String>,

    #[serde(default)]
    pub cache: Option<CacheConfig>,

    #[serde(default)]
    pub acls: Vec<AclRule>,

    #[serde(default)]
    pub policy_effect: PolicyEffect,

    #[serde(default)]
    pub owner_key: Option<String>,

    #[serde(default)]
    pub mongo: Option<MongoModelConfig>,
}

fn default_public() -> bool {
    true
}

impl ModelConfig {
    /// A public model with no properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plural: None,
            base: None,
            public: true,
            properties: BTreeMap::new(),
            relations: BTreeMap::new(),
            hidden: Vec::new(),
            cache: None,
            acls: Vec::new(),
            policy_effect: PolicyEffect::default(),
            owner_key: None,
            mongo: None,
        }
    }

    /// Collection name in the backing store
    pub fn collection(&self) -> &str {
        self.mongo
            .as_ref()
            .and_then(|m| m.collection.as_deref())
            .unwrap_or(&self.name)
    }

    /// URL segment of the REST surface
    pub fn plural(&self) -> String {
        match &self.plural {
            Some(plural) => plural.clone(),
            None => pluralize(&kebab_case(&self.name)),
        }
    }

    pub fn owner_key(&self) -> String {
        self.owner_key
            .clone()
            .unwrap_or_else(|| DEFAULT_OWNER_KEY.to_string())
    }

    pub fn property_type(&self, name: &str) -> Option<PropertyType> {
        if name == "_id" {
            return Some(PropertyType::ObjectId);
        }
        self.properties.get(name).map(|p| p.kind)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationConfig> {
        self.relations.get(name)
    }

    pub fn is_hidden(&self, key: &str) -> bool {
        self.hidden.iter().any(|h| h == key)
    }
}

/// Semantic type of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    Date,
    #[serde(alias = "ObjectID", alias = "objectid")]
    ObjectId,
    #[serde(alias = "object")]
    Embedded,
    Array,
    #[serde(other)]
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyConfig {
    #[serde(rename = "type")]
    pub kind: PropertyType,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// Relation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    BelongsTo,
    HasOne,
    HasMany,
    HasAndBelongsToMany,
}

impl RelationKind {
    /// Single-kind relations materialise as one object
    pub fn is_single(self) -> bool {
        matches!(self, RelationKind::BelongsTo | RelationKind::HasOne)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationOptions {
    /// Skip authorization of the target model when eagerly loaded
    #[serde(default)]
    pub skip_auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationConfig {
    #[serde(rename = "type")]
    pub kind: RelationKind,

    /// Target model name
    pub model: String,

    #[serde(default)]
    pub primary_key: Option<String>,

    #[serde(default)]
    pub foreign_key: Option<String>,

    /// Junction collection of a many-to-many relation
    #[serde(default)]
    pub through: Option<String>,

    #[serde(default)]
    pub options: RelationOptions,
}

/// Fields joined by a relation lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKeys {
    /// Field on the parent document
    pub local: String,
    /// Field on the target (or junction) document
    pub remote: String,
}

/// Junction layout of a many-to-many relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Junction {
    pub collection: String,
    /// Junction field referencing the parent
    pub parent_key: String,
    /// Junction field referencing the target
    pub target_key: String,
}

impl RelationConfig {
    /// Join keys between `parent` and the target for relation `name`.
    /// For many-to-many relations these join the parent to the junction.
    pub fn join_keys(&self, name: &str, parent: &str) -> JoinKeys {
        match self.kind {
            RelationKind::BelongsTo => JoinKeys {
                local: self
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| format!("{name}Id")),
                remote: self.primary_key.clone().unwrap_or_else(|| "_id".into()),
            },
            RelationKind::HasOne | RelationKind::HasMany => JoinKeys {
                local: self.primary_key.clone().unwrap_or_else(|| "_id".into()),
                remote: self
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| format!("{}Id", lower_first(parent))),
            },
            RelationKind::HasAndBelongsToMany => JoinKeys {
                local: self.primary_key.clone().unwrap_or_else(|| "_id".into()),
                remote: format!("{}Id", lower_first(parent)),
            },
        }
    }

    pub fn junction(&self, parent: &str) -> Junction {
        let collection = self.through.clone().unwrap_or_else(|| {
            let mut names = [parent, self.model.as_str()];
            names.sort_unstable();
            format!("{}_{}", names[0], names[1])
        });
        Junction {
            collection,
            parent_key: format!("{}Id", lower_first(parent)),
            target_key: format!("{}Id", lower_first(&self.model)),
        }
    }
}

/// Read-through cache policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// KV datasource holding the entries
    pub datasource: String,

    /// Entry lifetime in seconds
    #[serde(default = "default_ttl")]
    pub ttl: u64,

    /// Composite key groups, each an ordered list of property names
    #[serde(default)]
    pub keys: Vec<Vec<String>>,
}

fn default_ttl() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MongoModelConfig {
    #[serde(default)]
    pub collection: Option<String>,
}

pub(crate) fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn kebab_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn pluralize(s: &str) -> String {
    if s.ends_with('s') || s.ends_with('x') || s.ends_with("ch") || s.ends_with("sh") {
        format!("{s}es")
    } else if let Some(stem) = s.strip_suffix('y') {
        if stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            format!("{s}s")
        } else {
            format!("{stem}ies")
        }
    } else {
        format!("{s}s")
    }
}
