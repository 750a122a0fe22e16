//! Configuration validation for deploy files.
//!
//! Structural checks that need no registry or graph: project identity, state
//! backend settings, engine limits, schema flag consistency and resource
//! naming. Schema conformance of each resource is checked later by the diff
//! engine, and references by the graph builder.

use crate::error::{ConfigError, KeelError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::types::{DeployConfig, EngineConfig, ProviderConfig, ResourceDecl, StateBackend};

/// Concurrency above which a warning is emitted.
const HIGH_CONCURRENCY: usize = 64;

/// Validator for deployment configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(KeelError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Runs every check and returns all errors and warnings.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_schemas(config, &mut result);
        Self::validate_resources(&config.resources, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &super::types::ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_project_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &super::types::StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Validates provider configuration.
    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if let Some(endpoint) = &provider.endpoint
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            result.errors.push(ValidationError {
                field: String::from("provider.endpoint"),
                message: format!("Provider endpoint '{endpoint}' must be an http(s) URL"),
            });
        }

        if provider.timeout_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("provider.timeout_secs"),
                message: String::from("Provider timeout must be at least 1 second"),
            });
        }
    }

    /// Validates engine settings.
    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.concurrency == 0 {
            result.errors.push(ValidationError {
                field: String::from("engine.concurrency"),
                message: String::from("Concurrency must be at least 1"),
            });
        } else if engine.concurrency > HIGH_CONCURRENCY {
            result.warnings.push(format!(
                "engine.concurrency: {} steps in flight may overwhelm the provider API",
                engine.concurrency
            ));
        }
    }

    /// Validates schema flag combinations.
    fn validate_schemas(config: &DeployConfig, result: &mut ValidationResult) {
        for (resource_type, schema) in &config.schemas {
            if schema.fields.is_empty() {
                result
                    .warnings
                    .push(format!("schemas.{resource_type}: schema declares no fields"));
            }

            for (name, field) in &schema.fields {
                let path = format!("schemas.{resource_type}.fields.{name}");
                if field.output_only && field.required {
                    result.errors.push(ValidationError {
                        field: path.clone(),
                        message: String::from("A field cannot be both output_only and required"),
                    });
                }
                if field.output_only && field.force_replace {
                    result.warnings.push(format!(
                        "{path}: force_replace has no effect on an output_only field"
                    ));
                }
            }
        }
    }

    /// Validates resource declarations.
    fn validate_resources(resources: &[ResourceDecl], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if resource.resource_type.is_empty() || resource.resource_type.contains("::") {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.type"),
                    message: format!(
                        "Resource type '{}' must be non-empty and may not contain '::'",
                        resource.resource_type
                    ),
                });
            }

            if !is_valid_resource_name(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!(
                        "Resource name '{}' is invalid. Use letters, digits, '-' and '_'.",
                        resource.name
                    ),
                });
            }

            if !seen.insert((&resource.resource_type, &resource.name)) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!(
                        "Duplicate resource {}::{}",
                        resource.resource_type, resource.name
                    ),
                });
            }
        }
    }
}

/// Validates that a project name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_project_name(name: &str) -> bool {
    let mut chars = name.chars();

    if !chars.next().is_some_and(|first| first.is_ascii_lowercase()) {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource names may not contain `.` or `:`, which delimit references.
fn is_valid_resource_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
