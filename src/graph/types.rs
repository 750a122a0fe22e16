//! Core resource types shared by the graph, diff and apply stages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config::ResourceDecl;
use crate::error::ConfigError;

/// Concrete attribute values keyed by field name.
///
/// A `BTreeMap` keeps serialization order stable, which the state file and
/// the input hashes depend on.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Separator between type and name in a rendered identity.
const ID_SEPARATOR: &str = "::";

/// Identity of a resource: its type plus its logical name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    /// Resource type, e.g. `aws:iam/Role`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name, unique per type.
    pub name: String,
}

/// A reference to an output field of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputRef {
    /// The producing resource.
    pub target: ResourceId,
    /// The output field read from the producer.
    pub field: String,
}

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// A value known at declaration time.
    Literal(serde_json::Value),
    /// A value read from another resource's outputs once it exists.
    Reference(OutputRef),
}

/// A declared resource. Immutable once the graph is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNode {
    /// Identity.
    pub id: ResourceId,
    /// Declared attributes.
    pub attributes: BTreeMap<String, AttrValue>,
}

/// Edge from a consumer to the producer it references.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DependencyEdge {
    /// The resource holding the reference.
    pub consumer: ResourceId,
    /// The referenced resource.
    pub producer: ResourceId,
}

impl ResourceId {
    /// Creates a new identity.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// The string key used by the state store.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ID_SEPARATOR}{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(ID_SEPARATOR) {
            Some((resource_type, name)) if !resource_type.is_empty() && !name.is_empty() => {
                Ok(Self::new(resource_type, name))
            }
            _ => Err(ConfigError::InvalidReference {
                expression: s.to_string(),
                reason: String::from("expected <type>::<name>"),
            }),
        }
    }
}

impl OutputRef {
    /// Parses `${<type>::<name>.<field>}`.
    ///
    /// Returns `Ok(None)` when `s` is not a reference expression at all and
    /// an error when it looks like one but is malformed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidReference`] for malformed expressions.
    pub fn parse(s: &str) -> Result<Option<Self>, ConfigError> {
        let Some(inner) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) else {
            return Ok(None);
        };

        let invalid = |reason: &str| ConfigError::InvalidReference {
            expression: s.to_string(),
            reason: reason.to_string(),
        };

        let (resource_type, rest) = inner
            .split_once(ID_SEPARATOR)
            .ok_or_else(|| invalid("expected ${<type>::<name>.<field>}"))?;
        let (name, field) = rest
            .split_once('.')
            .ok_or_else(|| invalid("missing output field after resource name"))?;

        if resource_type.is_empty() || name.is_empty() || field.is_empty() {
            return Err(invalid("type, name and field must be non-empty"));
        }

        Ok(Some(Self {
            target: ResourceId::new(resource_type, name),
            field: field.to_string(),
        }))
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.target, self.field)
    }
}

impl AttrValue {
    /// Classifies a raw declared value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is a malformed reference expression.
    pub fn from_raw(value: &serde_json::Value) -> Result<Self, ConfigError> {
        if let serde_json::Value::String(s) = value
            && let Some(reference) = OutputRef::parse(s)?
        {
            return Ok(Self::Reference(reference));
        }
        Ok(Self::Literal(value.clone()))
    }

    /// Returns the reference, if this is one.
    #[must_use]
    pub const fn as_reference(&self) -> Option<&OutputRef> {
        match self {
            Self::Reference(r) => Some(r),
            Self::Literal(_) => None,
        }
    }
}

impl ResourceNode {
    /// Builds a node from a declaration, parsing reference expressions.
    ///
    /// # Errors
    ///
    /// Returns an error if an attribute holds a malformed reference.
    pub fn from_decl(decl: &ResourceDecl) -> Result<Self, ConfigError> {
        let attributes = decl
            .attributes
            .iter()
            .map(|(field, raw)| AttrValue::from_raw(raw).map(|v| (field.clone(), v)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Self {
            id: ResourceId::new(&decl.resource_type, &decl.name),
            attributes,
        })
    }

    /// All references held by this node, with the field holding each.
    pub fn references(&self) -> impl Iterator<Item = (&str, &OutputRef)> {
        self.attributes
            .iter()
            .filter_map(|(field, value)| value.as_reference().map(|r| (field.as_str(), r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_id_roundtrip() {
        let id = ResourceId::new("aws:iam/Role", "lambda_role");
        assert_eq!(id.to_string(), "aws:iam/Role::lambda_role");
        let parsed: ResourceId = id.key().parse().expect("identity should parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_reference() {
        let r = OutputRef::parse("${aws:iam/Role::lambda_role.arn}")
            .expect("should parse")
            .expect("should be a reference");
        assert_eq!(r.target, ResourceId::new("aws:iam/Role", "lambda_role"));
        assert_eq!(r.field, "arn");
        assert_eq!(r.to_string(), "${aws:iam/Role::lambda_role.arn}");
    }

    #[test]
    fn test_plain_string_is_literal() {
        assert!(OutputRef::parse("bootstrap").expect("should parse").is_none());
        let value = AttrValue::from_raw(&json!("prefix-${x}")).expect("should classify");
        assert_eq!(value, AttrValue::Literal(json!("prefix-${x}")));
    }

    #[test]
    fn test_malformed_reference() {
        assert!(OutputRef::parse("${no-separator}").is_err());
        assert!(OutputRef::parse("${aws:iam/Role::role}").is_err());
        assert!(OutputRef::parse("${::role.arn}").is_err());
    }
}
