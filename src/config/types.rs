//! Configuration types.
//!
//! This module defines the structs that map to the `keel.deploy.yaml` file:
//! project identity, state backend, provider endpoint, engine settings,
//! resource type schemas and the resource declarations themselves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::registry::ResourceSchema;

/// Default number of steps in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default provider request timeout in seconds.
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 30;

/// Default environment variable holding the provider token.
pub const DEFAULT_TOKEN_ENV: &str = "KEEL_PROVIDER_TOKEN";

/// The root configuration structure for a Keel deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider API configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Resource type schemas, keyed by type.
    #[serde(default)]
    pub schemas: BTreeMap<String, ResourceSchema>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider API configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Base URL of the provider API.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

/// Engine tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of steps in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Re-read provider state before diffing.
    #[serde(default = "default_refresh")]
    pub refresh: bool,
}

/// A declared resource.
///
/// Attribute values are literals, except strings of the exact form
/// `${<type>::<name>.<field>}`, which reference another resource's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDecl {
    /// Resource type; must have a schema.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name, unique per type.
    pub name: String,
    /// Declared attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_token_env() -> String {
    String::from(DEFAULT_TOKEN_ENV)
}

const fn default_provider_timeout() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT_SECS
}

const fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

const fn default_refresh() -> bool {
    true
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token_env: default_token_env(),
            timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            refresh: true,
        }
    }
}

impl DeployConfig {
    /// Returns resource identities as `type::name` strings.
    #[must_use]
    pub fn resource_keys(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(|r| format!("{}::{}", r.resource_type, r.name))
            .collect()
    }

    /// Finds a declaration by type and name.
    #[must_use]
    pub fn find_resource(&self, resource_type: &str, name: &str) -> Option<&ResourceDecl> {
        self.resources
            .iter()
            .find(|r| r.resource_type == resource_type && r.name == name)
    }
}

impl ResourceDecl {
    /// Creates a declaration with no attributes.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute, builder style.
    #[must_use]
    pub fn with_attr(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(field.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let yaml = r"
project:
  name: demo
";
        let config: DeployConfig = serde_yaml::from_str(yaml).expect("config should parse");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.engine.concurrency, DEFAULT_CONCURRENCY);
        assert!(config.engine.refresh);
        assert_eq!(config.provider.token_env, DEFAULT_TOKEN_ENV);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_resource_decl_parse() {
        let yaml = r#"
type: aws:lambda/Function
name: test_pulumi
attributes:
  handler: bootstrap
  architectures: ["arm64"]
  role: "${aws:iam/Role::lambda_role.arn}"
"#;
        let decl: ResourceDecl = serde_yaml::from_str(yaml).expect("declaration should parse");
        assert_eq!(decl.resource_type, "aws:lambda/Function");
        assert_eq!(decl.attributes.len(), 3);
        assert_eq!(decl.attributes["architectures"], serde_json::json!(["arm64"]));
    }
}
