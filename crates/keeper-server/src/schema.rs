//! Per-list schema registry
//!
//! Every component list owns a schema: the ordered field names seen in its
//! uploads, the field that names a component, and the lookup parameters
//! attached to stored rows. Schemas are created lazily the first time a list
//! is observed and only ever grow.

use keeper_common::{KeeperError, Result, SchemaParameters};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::storage::Storage;

pub const DEFAULT_NAME_FIELD: &str = "part name";
pub const DEFAULT_REGION: &str = "1";
pub const DEFAULT_MINIMUM_AMOUNT: &str = "100";

pub const PARAM_ID: &str = "id";
pub const PARAM_NAME_FIELD: &str = "nameField";
pub const PARAM_FIELD_NAMES: &str = "fieldNames";
pub const PARAM_REGION: &str = "region";
pub const PARAM_MINIMUM_AMOUNT: &str = "minimumAmount";

/// Separator of the persisted `fieldNames` parameter.
const FIELD_NAME_SEPARATOR: &str = ", ";

/// Stored schema parameters shorter than this carry no schemas (`null`, `[]`).
const MIN_SYNC_BODY_LEN: usize = 5;

/// Read-side view of the registry used by the decoders and the analyzer.
pub trait SchemaSource: Send + Sync {
    /// Ordered field names and the position of the name field among them.
    fn field_order(&self, list_id: &str) -> Result<(Vec<String>, usize)>;

    /// Parameters attached to every stored component of the list.
    fn parameters(&self, list_id: &str) -> Result<SchemaParameters>;

    /// Register `observed` field names for the list, creating it if unknown.
    fn reconcile_field_names(&self, list_id: &str, observed: &[String]) -> Result<()>;
}

/// Schema of one component list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSchema {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "nameField", default = "default_name_field")]
    pub name_field: String,
    #[serde(rename = "fieldNames", default, with = "joined_names")]
    pub field_names: Vec<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(rename = "minimumAmount", default = "default_minimum_amount")]
    pub minimum_amount: String,
}

fn default_name_field() -> String {
    DEFAULT_NAME_FIELD.to_string()
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_minimum_amount() -> String {
    DEFAULT_MINIMUM_AMOUNT.to_string()
}

impl ListSchema {
    pub fn new(id: impl Into<String>, field_names: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name_field: default_name_field(),
            field_names,
            region: default_region(),
            minimum_amount: default_minimum_amount(),
        }
    }

    pub fn name_index(&self) -> Option<usize> {
        self.field_names.iter().position(|f| *f == self.name_field)
    }

    /// Append names not yet registered, keeping the existing order.
    fn absorb(&mut self, observed: &[String]) -> usize {
        let mut added = 0;
        for name in observed {
            if !self.field_names.contains(name) {
                self.field_names.push(name.clone());
                added += 1;
            }
        }
        added
    }

    pub fn parameters(&self) -> SchemaParameters {
        SchemaParameters::from([
            (PARAM_ID.to_string(), self.id.clone()),
            (PARAM_NAME_FIELD.to_string(), self.name_field.clone()),
            (
                PARAM_FIELD_NAMES.to_string(),
                self.field_names.join(FIELD_NAME_SEPARATOR),
            ),
            (PARAM_REGION.to_string(), self.region.clone()),
            (PARAM_MINIMUM_AMOUNT.to_string(), self.minimum_amount.clone()),
        ])
    }
}

mod joined_names {
    use super::FIELD_NAME_SEPARATOR;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(names: &[String], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&names.join(FIELD_NAME_SEPARATOR))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let joined = String::deserialize(d)?;
        Ok(joined
            .split(FIELD_NAME_SEPARATOR)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// In-memory registry of list schemas
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, ListSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ListSchema>> {
        self.schemas.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ListSchema>> {
        self.schemas.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load every persisted schema from storage.
    pub async fn init(&self, storage: &dyn Storage) -> Result<usize> {
        let body = storage.sync_schemas().await?;
        let loaded = self.load(&body)?;
        info!(schemas = loaded, "Schema registry initialized");
        Ok(loaded)
    }

    /// Load schemas from a JSON array of parameter maps.
    pub fn load(&self, body: &[u8]) -> Result<usize> {
        if body.len() < MIN_SYNC_BODY_LEN {
            return Ok(0);
        }

        let stored: Vec<Option<ListSchema>> = serde_json::from_slice(body)?;
        let mut schemas = self.write();
        let mut loaded = 0;
        for schema in stored.into_iter().flatten() {
            if schema.id.is_empty() {
                continue;
            }
            schemas.insert(schema.id.clone(), schema);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn new_schema(&self, list_id: &str) -> Result<()> {
        let mut schemas = self.write();
        if schemas.contains_key(list_id) {
            return Err(KeeperError::validation(format!(
                "schema for list '{list_id}' already exists"
            )));
        }
        schemas.insert(list_id.to_string(), ListSchema::new(list_id, Vec::new()));
        Ok(())
    }

    pub fn schema(&self, list_id: &str) -> Result<ListSchema> {
        self.read()
            .get(list_id)
            .cloned()
            .ok_or_else(|| unknown_list(list_id))
    }

    pub fn save_schema(&self, list_id: &str, mut schema: ListSchema) -> Result<()> {
        let mut schemas = self.write();
        let slot = schemas.get_mut(list_id).ok_or_else(|| unknown_list(list_id))?;
        schema.id = list_id.to_string();
        *slot = schema;
        Ok(())
    }

    pub fn all_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn unknown_list(list_id: &str) -> KeeperError {
    KeeperError::lookup(format!("no schema registered for list '{list_id}'"))
}

impl SchemaSource for SchemaRegistry {
    fn field_order(&self, list_id: &str) -> Result<(Vec<String>, usize)> {
        let schemas = self.read();
        let schema = schemas.get(list_id).ok_or_else(|| unknown_list(list_id))?;
        let index = schema.name_index().ok_or_else(|| {
            KeeperError::lookup(format!(
                "name field '{}' is not registered for list '{list_id}'",
                schema.name_field
            ))
        })?;
        Ok((schema.field_names.clone(), index))
    }

    fn parameters(&self, list_id: &str) -> Result<SchemaParameters> {
        self.read()
            .get(list_id)
            .map(ListSchema::parameters)
            .ok_or_else(|| unknown_list(list_id))
    }

    fn reconcile_field_names(&self, list_id: &str, observed: &[String]) -> Result<()> {
        let mut schemas = self.write();
        match schemas.get_mut(list_id) {
            Some(schema) => {
                let added = schema.absorb(observed);
                if added > 0 {
                    debug!(list_id, added, "Extended list schema");
                }
            }
            None => {
                let mut schema = ListSchema::new(list_id, Vec::with_capacity(observed.len()));
                schema.absorb(observed);
                debug!(list_id, fields = schema.field_names.len(), "Created list schema");
                schemas.insert(list_id.to_string(), schema);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reconcile_creates_unknown_list() {
        let registry = SchemaRegistry::new();
        registry
            .reconcile_field_names("L1abcdef", &names(&["part name", "value"]))
            .unwrap();

        let (fields, index) = registry.field_order("L1abcdef").unwrap();
        assert_eq!(fields, names(&["part name", "value"]));
        assert_eq!(index, 0);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let registry = SchemaRegistry::new();
        let observed = names(&["value", "part name"]);
        registry.reconcile_field_names("L1", &observed).unwrap();
        let first = registry.schema("L1").unwrap();
        registry.reconcile_field_names("L1", &observed).unwrap();

        assert_eq!(registry.schema("L1").unwrap(), first);
    }

    #[test]
    fn test_reconcile_appends_new_names() {
        let registry = SchemaRegistry::new();
        registry
            .reconcile_field_names("L1", &names(&["part name", "value"]))
            .unwrap();
        registry
            .reconcile_field_names("L1", &names(&["package", "value", "part name"]))
            .unwrap();

        let (fields, index) = registry.field_order("L1").unwrap();
        assert_eq!(fields, names(&["part name", "value", "package"]));
        assert_eq!(index, 0);
    }

    #[test]
    fn test_field_order_errors() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            registry.field_order("missing"),
            Err(KeeperError::Lookup(_))
        ));

        registry
            .reconcile_field_names("L1", &names(&["value"]))
            .unwrap();
        assert!(matches!(
            registry.field_order("L1"),
            Err(KeeperError::Lookup(_))
        ));
    }

    #[test]
    fn test_parameters() {
        let registry = SchemaRegistry::new();
        registry
            .reconcile_field_names("L1abcdef", &names(&["part name", "value"]))
            .unwrap();
        let params = registry.parameters("L1abcdef").unwrap();

        assert_eq!(params[PARAM_ID], "L1abcdef");
        assert_eq!(params[PARAM_NAME_FIELD], "part name");
        assert_eq!(params[PARAM_FIELD_NAMES], "part name, value");
        assert_eq!(params[PARAM_REGION], "1");
        assert_eq!(params[PARAM_MINIMUM_AMOUNT], "100");
    }

    #[test]
    fn test_load_stored_parameters() {
        let registry = SchemaRegistry::new();
        let body = br#"[
            {"id":"L1abcdef","nameField":"part name","fieldNames":"part name, value","region":"2","minimumAmount":"50"},
            null,
            {"id":"L2abcdef","fieldNames":"mpn","nameField":"mpn"}
        ]"#;

        assert_eq!(registry.load(body).unwrap(), 2);
        assert_eq!(registry.all_ids(), names(&["L1abcdef", "L2abcdef"]));

        let first = registry.schema("L1abcdef").unwrap();
        assert_eq!(first.field_names, names(&["part name", "value"]));
        assert_eq!(first.region, "2");

        let second = registry.schema("L2abcdef").unwrap();
        assert_eq!(second.minimum_amount, DEFAULT_MINIMUM_AMOUNT);
        assert_eq!(registry.field_order("L2abcdef").unwrap().1, 0);
    }

    #[test]
    fn test_load_short_body_is_empty() {
        let registry = SchemaRegistry::new();
        assert_eq!(registry.load(b"null").unwrap(), 0);
        assert_eq!(registry.load(b"").unwrap(), 0);
        assert!(registry.all_ids().is_empty());
    }

    #[test]
    fn test_new_and_save_schema() {
        let registry = SchemaRegistry::new();
        registry.new_schema("L1").unwrap();
        assert!(matches!(
            registry.new_schema("L1"),
            Err(KeeperError::Validation(_))
        ));

        let mut schema = registry.schema("L1").unwrap();
        schema.name_field = "mpn".to_string();
        schema.field_names = names(&["mpn", "qty"]);
        registry.save_schema("L1", schema).unwrap();
        assert_eq!(registry.field_order("L1").unwrap().1, 0);

        assert!(registry
            .save_schema("L2", ListSchema::new("L2", Vec::new()))
            .is_err());
    }
}
