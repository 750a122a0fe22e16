//! Provider API abstraction.
//!
//! A provider performs the actual create/read/update/delete calls against the
//! system that owns the resources. It is passed explicitly to the engine and
//! executor as an `Arc<dyn Provider>`.

mod http;
mod memory;

pub use http::HttpProvider;
pub use memory::{InMemoryProvider, ProviderCall, ProviderOp};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::graph::{Attributes, ResourceId};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A resource as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    /// Provider-assigned ID.
    pub id: String,
    /// Output attributes.
    #[serde(default)]
    pub outputs: Attributes,
    /// Inputs as the provider currently sees them, when it reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Attributes>,
}

/// Operations the engine needs from a provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource from fully resolved inputs.
    async fn create(&self, id: &ResourceId, inputs: &Attributes)
    -> ProviderResult<RemoteResource>;

    /// Reads a resource by provider ID.
    ///
    /// Returns [`ProviderError::NotFound`] if it no longer exists.
    async fn read(&self, resource_type: &str, provider_id: &str) -> ProviderResult<RemoteResource>;

    /// Updates a resource in place.
    async fn update(
        &self,
        resource_type: &str,
        provider_id: &str,
        inputs: &Attributes,
    ) -> ProviderResult<RemoteResource>;

    /// Deletes a resource.
    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()>;

    /// Finds an existing resource by identity, for adopting resources whose
    /// creation was not recorded. Providers that cannot search return `None`.
    async fn lookup(&self, _id: &ResourceId) -> ProviderResult<Option<RemoteResource>> {
        Ok(None)
    }

    /// Short provider name for logs and reports.
    fn name(&self) -> &'static str;
}

impl RemoteResource {
    /// Creates a remote resource with outputs only.
    #[must_use]
    pub fn new(id: impl Into<String>, outputs: Attributes) -> Self {
        Self {
            id: id.into(),
            outputs,
            inputs: None,
        }
    }
}
