//! # Instances
//!
//! Materialised documents. The builder turns raw connector output into
//! `Instance` trees, recursing into included relations through the
//! registry's model configs.

use std::collections::{BTreeMap, HashMap, HashSet};

use bson::{Bson, Document};
use serde_json::{Map, Value};

use super::config::{ModelConfig, RelationConfig};
use super::errors::{ModelError, ModelResult};
use crate::filter::Schema;
use crate::value::{bson_to_json, key_fragment};

/// A loaded relation
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Box<Instance>),
    Many(Vec<Instance>),
}

/// One materialised document
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    model: String,
    id: Option<Bson>,
    data: Document,
    relations: BTreeMap<String, Related>,
    hidden: Vec<String>,
}

impl Instance {
    /// Wrap a raw document, lifting `_id` (or `id`) out of the data
    pub fn new(model: impl Into<String>, mut data: Document) -> Self {
        let id = data.remove("_id").or_else(|| data.remove("id"));
        Self {
            model: model.into(),
            id,
            data,
            relations: BTreeMap::new(),
            hidden: Vec::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn id(&self) -> Option<&Bson> {
        self.id.as_ref()
    }

    pub fn get(&self, key: &str) -> Option<&Bson> {
        match key {
            "_id" | "id" => self.id.as_ref(),
            _ => self.data.get(key),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Bson>) {
        match key {
            "_id" | "id" => self.id = Some(value.into()),
            _ => {
                self.data.insert(key, value.into());
            }
        }
    }

    /// Property values, without the identifier
    pub fn data(&self) -> &Document {
        &self.data
    }

    pub fn related(&self, relation: &str) -> Option<&Related> {
        self.relations.get(relation)
    }

    pub fn set_related(&mut self, relation: impl Into<String>, related: Related) {
        self.relations.insert(relation.into(), related);
    }

    /// Mark `keys` hidden. Sticky: later calls only add keys.
    pub fn hide(&mut self, keys: &[String]) {
        for key in keys {
            if !self.hidden.contains(key) {
                self.hidden.push(key.clone());
            }
        }
    }

    pub fn is_hidden(&self, key: &str) -> bool {
        self.hidden.iter().any(|k| k == key)
    }

    /// Storage form: `_id` first, relations nested, hidden keys kept
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(id) = &self.id {
            doc.insert("_id", id.clone());
        }
        for (key, value) in &self.data {
            doc.insert(key.clone(), value.clone());
        }
        for (name, related) in &self.relations {
            let value = match related {
                Related::One(child) => Bson::Document(child.to_document()),
                Related::Many(children) => Bson::Array(
                    children
                        .iter()
                        .map(|child| Bson::Document(child.to_document()))
                        .collect(),
                ),
            };
            doc.insert(name.clone(), value);
        }
        doc
    }

    /// Client form: `id` first, hidden keys omitted
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        if let Some(id) = &self.id {
            out.insert("id".into(), bson_to_json(id));
        }
        for (key, value) in &self.data {
            if !self.is_hidden(key) {
                out.insert(key.clone(), bson_to_json(value));
            }
        }
        for (name, related) in &self.relations {
            if self.is_hidden(name) {
                continue;
            }
            let value = match related {
                Related::One(child) => child.to_json(),
                Related::Many(children) => {
                    Value::Array(children.iter().map(Instance::to_json).collect())
                }
            };
            out.insert(name.clone(), value);
        }
        Value::Object(out)
    }
}

/// Builds instance trees for one operation
pub struct InstanceBuilder<'a, S: Schema + ?Sized> {
    schema: &'a S,
    strict: bool,
    /// Single relations already materialised, by (parent id, relation)
    same_level: HashSet<(String, String)>,
    /// (model, id) pairs on the current root-to-leaf path
    visiting: HashSet<(String, String)>,
}

impl<'a, S: Schema + ?Sized> InstanceBuilder<'a, S> {
    pub fn new(schema: &'a S, strict: bool) -> Self {
        Self {
            schema,
            strict,
            same_level: HashSet::new(),
            visiting: HashSet::new(),
        }
    }

    /// Build one level of documents, collapsing repeated parents
    pub fn build_many(&mut self, model: &ModelConfig, docs: Vec<Document>) -> ModelResult<Vec<Instance>> {
        let mut out: Vec<Instance> = Vec::with_capacity(docs.len());
        let mut positions: HashMap<String, usize> = HashMap::new();

        for doc in docs {
            let id_key = key_fragment(doc.get("_id").or_else(|| doc.get("id")));
            if let Some(&at) = positions.get(&id_key) {
                self.merge_duplicate(model, &mut out[at], doc)?;
                continue;
            }
            let instance = self.build(model, doc)?;
            if instance.id.is_some() {
                positions.insert(id_key, out.len());
            }
            out.push(instance);
        }
        Ok(out)
    }

    pub fn build(&mut self, model: &ModelConfig, mut doc: Document) -> ModelResult<Instance> {
        let mut relation_values = Vec::new();
        for name in model.relations.keys() {
            if let Some(value) = doc.remove(name) {
                relation_values.push((name.clone(), value));
            }
        }

        let mut instance = Instance::new(&model.name, doc);
        instance.hide(&model.hidden);

        let id_key = key_fragment(instance.id());
        let node = (model.name.clone(), id_key.clone());
        if instance.id.is_some() && !self.visiting.insert(node.clone()) {
            // Already on the path: stop before looping through the relation graph
            return Ok(instance);
        }

        let result = self.build_relations(model, &mut instance, &id_key, relation_values);
        self.visiting.remove(&node);
        result.map(|()| instance)
    }

    fn build_relations(
        &mut self,
        model: &ModelConfig,
        instance: &mut Instance,
        id_key: &str,
        relation_values: Vec<(String, Bson)>,
    ) -> ModelResult<()> {
        for (name, value) in relation_values {
            let Some(relation) = model.relation(&name) else {
                continue;
            };
            let target = self
                .schema
                .model_config(&relation.model)
                .ok_or_else(|| ModelError::UnknownModel(relation.model.clone()))?;

            if relation.kind.is_single() {
                if let Some(child) = self.build_single(model, &name, relation, target, id_key, value)? {
                    instance.set_related(name, Related::One(Box::new(child)));
                }
            } else {
                let docs = match value {
                    Bson::Array(items) => documents(items),
                    Bson::Document(doc) => vec![doc],
                    _ => Vec::new(),
                };
                let mut children = Vec::with_capacity(docs.len());
                for doc in docs {
                    children.push(self.build(target, doc)?);
                }
                instance.set_related(name, Related::Many(children));
            }
        }
        Ok(())
    }

    fn build_single(
        &mut self,
        model: &ModelConfig,
        name: &str,
        relation: &RelationConfig,
        target: &ModelConfig,
        id_key: &str,
        value: Bson,
    ) -> ModelResult<Option<Instance>> {
        let mut docs = match value {
            Bson::Document(doc) => vec![doc],
            Bson::Array(items) => documents(items),
            _ => return Ok(None),
        };
        if docs.is_empty() {
            return Ok(None);
        }
        if docs.len() > 1 {
            self.duplicate(model, name, relation, id_key)?;
        }
        let slot = (id_key.to_string(), name.to_string());
        self.same_level.insert(slot);
        Ok(Some(self.build(target, docs.swap_remove(0))?))
    }

    /// A parent seen again on the same level: keep the first, check single relations
    fn merge_duplicate(&mut self, model: &ModelConfig, first: &mut Instance, doc: Document) -> ModelResult<()> {
        let id_key = key_fragment(first.id());
        for (name, relation) in &model.relations {
            let present = matches!(doc.get(name), Some(Bson::Document(_)))
                || matches!(doc.get(name), Some(Bson::Array(items)) if !items.is_empty());
            if !present {
                continue;
            }
            if relation.kind.is_single() {
                if self.same_level.contains(&(id_key.clone(), name.clone())) {
                    self.duplicate(model, name, relation, &id_key)?;
                }
            } else if let (Some(Related::Many(children)), Some(value)) =
                (first.relations.get_mut(name), doc.get(name))
            {
                let target = self
                    .schema
                    .model_config(&relation.model)
                    .ok_or_else(|| ModelError::UnknownModel(relation.model.clone()))?;
                let extra = match value {
                    Bson::Array(items) => documents(items.clone()),
                    Bson::Document(doc) => vec![doc.clone()],
                    _ => Vec::new(),
                };
                for child in extra {
                    let child = self.build(target, child)?;
                    if !children.iter().any(|c| c.id.is_some() && c.id == child.id) {
                        children.push(child);
                    }
                }
            }
        }
        Ok(())
    }

    fn duplicate(
        &self,
        model: &ModelConfig,
        name: &str,
        relation: &RelationConfig,
        id_key: &str,
    ) -> ModelResult<()> {
        if self.strict {
            return Err(ModelError::DuplicateRelated {
                model: model.name.clone(),
                relation: name.to_string(),
                target: relation.model.clone(),
                id: id_key.to_string(),
            });
        }
        tracing::warn!(
            model = %model.name,
            relation = name,
            id = id_key,
            "more than one related document for a single relation; keeping the first"
        );
        Ok(())
    }
}

fn documents(items: Vec<Bson>) -> Vec<Document> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Bson::Document(doc) => Some(doc),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn schema() -> BTreeMap<String, ModelConfig> {
        let order: ModelConfig = serde_json::from_value(json!({
            "name": "Order",
            "hidden": ["secret"],
            "relations": {
                "customer": {"type": "belongsTo", "model": "Customer"},
                "items": {"type": "hasMany", "model": "Item"}
            }
        }))
        .unwrap();
        let customer: ModelConfig = serde_json::from_value(json!({
            "name": "Customer",
            "relations": {"orders": {"type": "hasMany", "model": "Order"}}
        }))
        .unwrap();
        let item = ModelConfig::new("Item");
        [order, customer, item]
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect()
    }

    #[test]
    fn test_build_nested_relations() {
        let schema = schema();
        let oid = ObjectId::new();
        let doc = doc! {
            "_id": oid,
            "customerId": "c1",
            "secret": "s",
            "customer": {"_id": "c1", "name": "Ada"},
            "items": [{"_id": "i1"}, {"_id": "i2"}]
        };

        let mut builder = InstanceBuilder::new(&schema, false);
        let instance = builder.build(&schema["Order"], doc).unwrap();

        assert_eq!(instance.id(), Some(&Bson::ObjectId(oid)));
        match instance.related("customer") {
            Some(Related::One(customer)) => assert_eq!(customer.get("name"), Some(&Bson::from("Ada"))),
            other => panic!("unexpected {other:?}"),
        }
        match instance.related("items") {
            Some(Related::Many(items)) => assert_eq!(items.len(), 2),
            other => panic!("unexpected {other:?}"),
        }

        let rendered = instance.to_json();
        assert_eq!(rendered["id"], json!(oid.to_hex()));
        assert_eq!(rendered["customer"], json!({"id": "c1", "name": "Ada"}));
        assert!(rendered.get("secret").is_none());
        assert!(instance.to_document().contains_key("secret"));
    }

    #[test]
    fn test_hidden_is_sticky() {
        let mut instance = Instance::new("Order", doc! {"_id": 1, "a": 1, "b": 2});
        instance.hide(&["a".to_string()]);
        instance.hide(&[]);
        assert_eq!(instance.to_json(), json!({"id": 1, "b": 2}));
    }

    #[test]
    fn test_duplicate_single_related_keeps_first() {
        let schema = schema();
        let docs = vec![
            doc! {"_id": "o1", "customer": {"_id": "c1"}},
            doc! {"_id": "o1", "customer": {"_id": "c2"}},
        ];
        let mut builder = InstanceBuilder::new(&schema, false);
        let built = builder.build_many(&schema["Order"], docs).unwrap();
        assert_eq!(built.len(), 1);
        match built[0].related("customer") {
            Some(Related::One(customer)) => assert_eq!(customer.id(), Some(&Bson::from("c1"))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_single_related_fails_when_strict() {
        let schema = schema();
        let docs = vec![
            doc! {"_id": "o1", "customer": [{"_id": "c1"}, {"_id": "c2"}]},
        ];
        let mut builder = InstanceBuilder::new(&schema, true);
        let err = builder.build_many(&schema["Order"], docs).unwrap_err();
        assert!(matches!(err, ModelError::DuplicateRelated { .. }));
    }

    #[test]
    fn test_cycles_stop_at_revisited_documents() {
        let schema = schema();
        let doc = doc! {
            "_id": "c1",
            "orders": [{
                "_id": "o1",
                "customer": {"_id": "c1", "orders": [{"_id": "o1"}]}
            }]
        };
        let mut builder = InstanceBuilder::new(&schema, false);
        let customer = builder.build(&schema["Customer"], doc).unwrap();

        let Some(Related::Many(orders)) = customer.related("orders") else {
            panic!("orders missing");
        };
        let Some(Related::One(inner)) = orders[0].related("customer") else {
            panic!("customer missing");
        };
        assert!(inner.related("orders").is_none());
    }

    #[test]
    fn test_empty_single_relation_is_absent() {
        let schema = schema();
        let mut builder = InstanceBuilder::new(&schema, true);
        let instance = builder
            .build(&schema["Order"], doc! {"_id": "o1", "customer": []})
            .unwrap();
        assert!(instance.related("customer").is_none());
    }
}
