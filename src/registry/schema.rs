//! Resource type schemas.
//!
//! A schema is plain data: the set of fields a resource type has and, for
//! each field, whether it is required, output-only, or forces replacement
//! when changed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SchemaError;
use crate::graph::{AttrValue, ResourceId};

/// Flags describing a single field of a resource type.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSchema {
    /// The field must be present in every declaration.
    #[serde(default)]
    pub required: bool,
    /// Changing the field cannot be done in place.
    #[serde(default)]
    pub force_replace: bool,
    /// The field is computed by the provider and may not be declared.
    #[serde(default)]
    pub output_only: bool,
}

/// Schema of a resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Fields by name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSchema>,
}

impl FieldSchema {
    /// A required, updatable input.
    #[must_use]
    pub const fn required() -> Self {
        Self {
            required: true,
            force_replace: false,
            output_only: false,
        }
    }

    /// An optional, updatable input.
    #[must_use]
    pub const fn optional() -> Self {
        Self {
            required: false,
            force_replace: false,
            output_only: false,
        }
    }

    /// A provider-computed output.
    #[must_use]
    pub const fn output() -> Self {
        Self {
            required: false,
            force_replace: false,
            output_only: true,
        }
    }

    /// Marks the field as force-replace.
    #[must_use]
    pub const fn force_replace(mut self) -> Self {
        self.force_replace = true;
        self
    }
}

impl ResourceSchema {
    /// Creates an empty schema.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            description: None,
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field, builder style.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Looks up a field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    /// Returns true if `name` is a provider output.
    #[must_use]
    pub fn is_output(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(|f| f.output_only)
    }

    /// Returns true if changing `name` requires replacement.
    #[must_use]
    pub fn forces_replace(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(|f| f.force_replace)
    }

    /// Names of the required input fields.
    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, f)| f.required && !f.output_only)
            .map(|(name, _)| name.as_str())
    }

    /// Checks a declaration's attributes against this schema.
    ///
    /// # Errors
    ///
    /// Returns the first violation found: an unknown field, an output-only
    /// field set as input, or a missing required field.
    pub fn validate(
        &self,
        id: &ResourceId,
        attributes: &BTreeMap<String, AttrValue>,
    ) -> std::result::Result<(), SchemaError> {
        for name in attributes.keys() {
            match self.fields.get(name) {
                None => {
                    return Err(SchemaError::UnknownField {
                        id: id.to_string(),
                        field: name.clone(),
                    });
                }
                Some(field) if field.output_only => {
                    return Err(SchemaError::OutputOnlySet {
                        id: id.to_string(),
                        field: name.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(missing) = self
            .required_fields()
            .find(|name| !attributes.contains_key(*name))
        {
            return Err(SchemaError::MissingRequired {
                id: id.to_string(),
                field: missing.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn role_schema() -> ResourceSchema {
        ResourceSchema::new()
            .with_field("name", FieldSchema::required().force_replace())
            .with_field("description", FieldSchema::optional())
            .with_field("arn", FieldSchema::output())
    }

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, AttrValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), AttrValue::Literal(v.clone())))
            .collect()
    }

    #[test]
    fn test_valid_declaration() {
        let id = ResourceId::new("aws:iam/Role", "r");
        let result = role_schema().validate(&id, &attrs(&[("name", json!("r"))]));
        assert!(result.is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let id = ResourceId::new("aws:iam/Role", "r");
        let result = role_schema().validate(
            &id,
            &attrs(&[("name", json!("r")), ("colour", json!("blue"))]),
        );
        assert!(matches!(
            result,
            Err(SchemaError::UnknownField { field, .. }) if field == "colour"
        ));
    }

    #[test]
    fn test_missing_required_rejected() {
        let id = ResourceId::new("aws:iam/Role", "r");
        let result = role_schema().validate(&id, &attrs(&[("description", json!("x"))]));
        assert!(matches!(
            result,
            Err(SchemaError::MissingRequired { field, .. }) if field == "name"
        ));
    }

    #[test]
    fn test_output_only_rejected() {
        let id = ResourceId::new("aws:iam/Role", "r");
        let result = role_schema().validate(
            &id,
            &attrs(&[("name", json!("r")), ("arn", json!("arn:aws:iam::1:role/r"))]),
        );
        assert!(matches!(result, Err(SchemaError::OutputOnlySet { .. })));
    }

    #[test]
    fn test_schema_from_yaml() {
        let yaml = r"
description: IAM role
fields:
  name: { required: true, force_replace: true }
  arn: { output_only: true }
";
        let schema: ResourceSchema = serde_yaml::from_str(yaml).expect("schema should parse");
        assert!(schema.forces_replace("name"));
        assert!(schema.is_output("arn"));
        assert_eq!(schema.required_fields().collect::<Vec<_>>(), vec!["name"]);
    }
}
