//! Error types for the Keel provisioning engine.
//!
//! Errors fall into two groups. Structural errors (configuration, graph,
//! schema, corrupted state) abort a run before any provider call is made.
//! Provider errors are per-step: they are recorded against the failing node
//! and never abort sibling steps.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for Keel.
#[derive(Debug, Error)]
pub enum KeelError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Desired-state graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Resource schema violations.
    #[error("Schema violation: {0}")]
    Schema(#[from] SchemaError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A reference expression could not be parsed.
    #[error("Invalid reference expression '{expression}': {reason}")]
    InvalidReference {
        /// The offending expression.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors raised while building the desired-state graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A reference points at a resource that is not declared.
    #[error("{consumer}.{field} references undeclared resource {target}")]
    UnknownReference {
        /// Resource holding the reference.
        consumer: String,
        /// Attribute holding the reference.
        field: String,
        /// Referenced identity.
        target: String,
    },

    /// The reference graph contains a cycle.
    #[error("Dependency cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// Identities along the cycle, first repeated at the end.
        path: Vec<String>,
    },

    /// The same identity was declared twice.
    #[error("Resource {id} is declared more than once")]
    DuplicateResource {
        /// The duplicated identity.
        id: String,
    },
}

/// Schema violations detected against the resource registry.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// No schema is registered for the resource type.
    #[error("{id}: unknown resource type '{resource_type}'")]
    UnknownType {
        /// Offending resource.
        id: String,
        /// Unregistered type.
        resource_type: String,
    },

    /// An attribute is set that the schema does not declare.
    #[error("{id}: unknown attribute '{field}'")]
    UnknownField {
        /// Offending resource.
        id: String,
        /// Unknown attribute.
        field: String,
    },

    /// A required attribute is absent.
    #[error("{id}: required attribute '{field}' is missing")]
    MissingRequired {
        /// Offending resource.
        id: String,
        /// Missing attribute.
        field: String,
    },

    /// An output-only attribute was set as an input.
    #[error("{id}: attribute '{field}' is output-only and cannot be set")]
    OutputOnlySet {
        /// Offending resource.
        id: String,
        /// Output-only attribute.
        field: String,
    },

    /// A reference names a field that is not an output of the target type.
    #[error("{consumer}.{field} references '{output}', which is not an output of {target}")]
    UnknownOutput {
        /// Resource holding the reference.
        consumer: String,
        /// Attribute holding the reference.
        field: String,
        /// Referenced resource.
        target: String,
        /// Referenced output name.
        output: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is unreadable or malformed. Never repaired automatically.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State backend IO failed.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors returned by a provider API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The resource does not exist on the provider side.
    #[error("{resource_type} '{id}' not found")]
    NotFound {
        /// Resource type.
        resource_type: String,
        /// Provider-assigned ID.
        id: String,
    },

    /// The API returned an error status.
    #[error("Provider API request failed: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// The request never reached the API.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The API answered with something unexpected.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// The provider refused the operation.
    #[error("Provider rejected operation: {message}")]
    Rejected {
        /// Reason given by the provider.
        message: String,
    },
}

/// Errors raised while applying a plan.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A referenced output was not available when the step ran.
    #[error("{consumer}.{field}: output '{output}' of {target} is not available")]
    UnresolvedReference {
        /// Resource holding the reference.
        consumer: String,
        /// Attribute holding the reference.
        field: String,
        /// Referenced resource.
        target: String,
        /// Referenced output name.
        output: String,
    },

    /// The run finished with failed or skipped steps.
    #[error("Apply incomplete: {failed} failed, {skipped} skipped")]
    Incomplete {
        /// Number of failed steps.
        failed: usize,
        /// Number of skipped steps.
        skipped: usize,
    },
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, KeelError>;

impl KeelError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true for errors that invalidate the whole run before any
    /// provider call is made.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Graph(_)
                | Self::Schema(_)
                | Self::State(StateError::Corrupted { .. } | StateError::VersionMismatch { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a backend IO error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Returns true if the resource is absent on the provider side.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the error is likely transient.
    ///
    /// Keel never retries on its own; this only informs the operator.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
