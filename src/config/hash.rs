//! Deterministic hashing of attributes and configuration.
//!
//! Input hashes let the state store detect a record whose stored inputs were
//! tampered with, and let a run be tied to the configuration it applied.

use sha2::{Digest, Sha256};

use crate::graph::Attributes;

use super::types::DeployConfig;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole deploy file's semantic content.
    ///
    /// Resources are hashed in identity order, so reordering declarations
    /// does not change the hash.
    #[must_use]
    pub fn hash_config(&self, config: &DeployConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(config.project.environment.as_bytes());
        hasher.update([0u8]);

        for (resource_type, schema) in &config.schemas {
            hasher.update(resource_type.as_bytes());
            for (name, field) in &schema.fields {
                hasher.update(name.as_bytes());
                hasher.update([
                    u8::from(field.required),
                    u8::from(field.force_replace),
                    u8::from(field.output_only),
                ]);
            }
        }

        let mut resources: Vec<_> = config.resources.iter().collect();
        resources.sort_by(|a, b| {
            (&a.resource_type, &a.name).cmp(&(&b.resource_type, &b.name))
        });
        for resource in resources {
            hasher.update(resource.resource_type.as_bytes());
            hasher.update([0u8]);
            hasher.update(resource.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(self.hash_attributes(&resource.attributes).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a set of concrete attribute values.
    ///
    /// The canonical form is compact JSON with keys in sorted order.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &Attributes) -> String {
        let canonical = serde_json::to_vec(attributes).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Constant-time comparison
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, ResourceDecl};
    use serde_json::json;

    fn config_with(resources: Vec<ResourceDecl>) -> DeployConfig {
        let mut config = ConfigParser::new()
            .parse_yaml("project:\n  name: demo\n", None)
            .expect("config should parse");
        config.resources = resources;
        config
    }

    #[test]
    fn test_attribute_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let mut a = Attributes::new();
        a.insert(String::from("handler"), json!("bootstrap"));
        a.insert(String::from("architectures"), json!(["arm64"]));

        let mut b = Attributes::new();
        b.insert(String::from("architectures"), json!(["arm64"]));
        b.insert(String::from("handler"), json!("bootstrap"));

        assert_eq!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
    }

    #[test]
    fn test_attribute_hash_changes_with_value() {
        let hasher = ConfigHasher::new();
        let mut a = Attributes::new();
        a.insert(String::from("handler"), json!("bootstrap"));
        let mut b = a.clone();
        b.insert(String::from("handler"), json!("main"));

        assert_ne!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
    }

    #[test]
    fn test_config_hash_ignores_declaration_order() {
        let hasher = ConfigHasher::new();
        let r1 = ResourceDecl::new("t", "a").with_attr("x", json!(1));
        let r2 = ResourceDecl::new("t", "b").with_attr("x", json!(2));

        let forward = config_with(vec![r1.clone(), r2.clone()]);
        let backward = config_with(vec![r2, r1]);

        assert_eq!(hasher.hash_config(&forward), hasher.hash_config(&backward));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
