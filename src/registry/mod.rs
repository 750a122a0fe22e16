//! Resource registry.
//!
//! Holds the schema of every resource type a deployment may declare. Types
//! are data, not code: adding a type means registering a schema.

mod schema;

pub use schema::{FieldSchema, ResourceSchema};

use std::collections::BTreeMap;
use tracing::debug;

use crate::error::SchemaError;
use crate::graph::ResourceId;

/// Registry of resource type schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    /// Schemas keyed by resource type.
    schemas: BTreeMap<String, ResourceSchema>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            schemas: BTreeMap::new(),
        }
    }

    /// Builds a registry from the `schemas` section of a deploy file.
    #[must_use]
    pub fn from_config(schemas: &BTreeMap<String, ResourceSchema>) -> Self {
        let mut registry = Self::new();
        for (resource_type, schema) in schemas {
            registry.register(resource_type.clone(), schema.clone());
        }
        registry
    }

    /// Registers (or replaces) the schema of a resource type.
    pub fn register(&mut self, resource_type: impl Into<String>, schema: ResourceSchema) {
        let resource_type = resource_type.into();
        debug!(
            "Registering schema for {resource_type} ({} fields)",
            schema.fields.len()
        );
        self.schemas.insert(resource_type, schema);
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with_schema(mut self, resource_type: impl Into<String>, schema: ResourceSchema) -> Self {
        self.register(resource_type, schema);
        self
    }

    /// Looks up a schema.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<&ResourceSchema> {
        self.schemas.get(resource_type)
    }

    /// Looks up the schema for a resource, failing if the type is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownType`] when nothing is registered.
    pub fn require(&self, id: &ResourceId) -> std::result::Result<&ResourceSchema, SchemaError> {
        self.schemas
            .get(&id.resource_type)
            .ok_or_else(|| SchemaError::UnknownType {
                id: id.to_string(),
                resource_type: id.resource_type.clone(),
            })
    }

    /// Returns true if the type is registered.
    #[must_use]
    pub fn contains(&self, resource_type: &str) -> bool {
        self.schemas.contains_key(resource_type)
    }

    /// Registered type names.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns true if no types are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_unknown_type() {
        let registry = SchemaRegistry::new();
        let id = ResourceId::new("aws:s3/Bucket", "logs");
        let err = registry.require(&id).expect_err("type should be unknown");
        assert!(matches!(
            err,
            SchemaError::UnknownType { resource_type, .. } if resource_type == "aws:s3/Bucket"
        ));
    }

    #[test]
    fn test_from_config() {
        let mut schemas = BTreeMap::new();
        schemas.insert(
            String::from("aws:iam/Role"),
            ResourceSchema::new().with_field("name", FieldSchema::required()),
        );
        let registry = SchemaRegistry::from_config(&schemas);

        assert_eq!(registry.len(), 1);
        assert!(registry.contains("aws:iam/Role"));
        assert_eq!(registry.types().collect::<Vec<_>>(), vec!["aws:iam/Role"]);
    }
}
