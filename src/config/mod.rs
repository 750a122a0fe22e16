//! Configuration module for Keel.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `keel.deploy.yaml`
//! - Validation of configuration values
//! - Computing attribute and configuration hashes for change detection

mod hash;
mod parser;
mod types;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use types::{
    DEFAULT_CONCURRENCY, DEFAULT_PROVIDER_TIMEOUT_SECS, DEFAULT_TOKEN_ENV, DeployConfig,
    EngineConfig, ProjectConfig, ProviderConfig, ResourceDecl, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
