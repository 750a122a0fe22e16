//! In-process provider.
//!
//! Keeps resources in memory, optionally mirrored to a JSON file so that
//! successive CLI runs see the same world. Used for dry runs and tests; tests
//! can inject failures, simulate out-of-band changes and inspect the call log.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{KeelError, ProviderError, Result, StateError};
use crate::graph::{Attributes, ResourceId};
use crate::registry::SchemaRegistry;

use super::{Provider, ProviderResult, RemoteResource};

/// Provider operations, for the call log and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `lookup`
    Lookup,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// The operation.
    pub op: ProviderOp,
    /// The resource it targeted.
    pub resource: ResourceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResource {
    resource_type: String,
    name: String,
    inputs: Attributes,
    outputs: Attributes,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct World {
    next_id: u64,
    /// Keyed by provider ID.
    resources: BTreeMap<String, StoredResource>,
}

#[derive(Debug, Default)]
struct Inner {
    world: World,
    calls: Vec<ProviderCall>,
    failures: HashMap<(ProviderOp, ResourceId), ProviderError>,
}

/// In-memory provider.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    inner: Mutex<Inner>,
    registry: Option<SchemaRegistry>,
    latency: Option<Duration>,
    backing_file: Option<PathBuf>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StoredResource {
    fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }
}

impl InMemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Synthesizes a value for every output field the registry declares.
    #[must_use]
    pub fn with_registry(mut self, registry: SchemaRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Delays every call, to make concurrency observable.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Loads the world from `path` if it exists and writes it back after
    /// every mutation.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn persistent(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let world: World = serde_json::from_str(&content).map_err(|e| {
                KeelError::State(StateError::corrupted(format!(
                    "Failed to parse {}: {e}",
                    path.display()
                )))
            })?;
            debug!(
                "Loaded {} in-memory resources from {}",
                world.resources.len(),
                path.display()
            );
            self.lock().world = world;
        }
        self.backing_file = Some(path);
        Ok(self)
    }

    /// Makes the next matching call fail with `error`.
    pub fn fail_on(&self, op: ProviderOp, id: &ResourceId, error: ProviderError) {
        self.lock().failures.insert((op, id.clone()), error);
    }

    /// Clears injected failures.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// All calls made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Calls made for one resource.
    #[must_use]
    pub fn calls_for(&self, id: &ResourceId) -> Vec<ProviderOp> {
        self.lock()
            .calls
            .iter()
            .filter(|call| &call.resource == id)
            .map(|call| call.op)
            .collect()
    }

    /// Calls that change the world.
    #[must_use]
    pub fn mutating_calls(&self) -> Vec<ProviderCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| {
                matches!(
                    call.op,
                    ProviderOp::Create | ProviderOp::Update | ProviderOp::Delete
                )
            })
            .cloned()
            .collect()
    }

    /// Clears the call log.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of resources that exist.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().world.resources.len()
    }

    /// Returns true if no resources exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current inputs of the resource with this identity.
    #[must_use]
    pub fn inputs_of(&self, id: &ResourceId) -> Option<Attributes> {
        self.lock()
            .world
            .resources
            .values()
            .find(|r| &r.id() == id)
            .map(|r| r.inputs.clone())
    }

    /// Creates a resource without going through the engine, as if a
    /// previous run crashed before recording it. Returns its provider ID.
    pub fn insert_existing(&self, id: &ResourceId, inputs: Attributes) -> String {
        let mut inner = self.lock();
        self.insert(&mut inner.world, id, inputs)
    }

    /// Deletes a resource behind the engine's back.
    pub fn remove_out_of_band(&self, id: &ResourceId) -> bool {
        let mut inner = self.lock();
        let before = inner.world.resources.len();
        inner.world.resources.retain(|_, r| &r.id() != id);
        before != inner.world.resources.len()
    }

    /// Overwrites an output behind the engine's back.
    pub fn set_output_out_of_band(&self, id: &ResourceId, field: &str, value: serde_json::Value) {
        let mut inner = self.lock();
        if let Some(resource) = inner.world.resources.values_mut().find(|r| &r.id() == id) {
            resource.outputs.insert(field.to_string(), value);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn insert(&self, world: &mut World, id: &ResourceId, inputs: Attributes) -> String {
        world.next_id += 1;
        let provider_id = format!("mem-{}", world.next_id);
        let outputs = self.synthesize_outputs(id, &provider_id);
        world.resources.insert(
            provider_id.clone(),
            StoredResource {
                resource_type: id.resource_type.clone(),
                name: id.name.clone(),
                inputs,
                outputs,
            },
        );
        provider_id
    }

    fn synthesize_outputs(&self, id: &ResourceId, provider_id: &str) -> Attributes {
        let mut outputs = Attributes::new();
        outputs.insert(String::from("id"), provider_id.into());
        if let Some(schema) = self
            .registry
            .as_ref()
            .and_then(|r| r.get(&id.resource_type))
        {
            for (field, field_schema) in &schema.fields {
                if field_schema.output_only && field != "id" {
                    outputs.insert(
                        field.clone(),
                        format!("{}:{}:{field}:{provider_id}", id.resource_type, id.name).into(),
                    );
                }
            }
        }
        outputs
    }

    /// Logs the call and returns an injected failure, if any.
    fn begin(&self, op: ProviderOp, id: ResourceId) -> ProviderResult<()> {
        let mut inner = self.lock();
        let failure = inner.failures.remove(&(op, id.clone()));
        inner.calls.push(ProviderCall { op, resource: id });
        failure.map_or(Ok(()), Err)
    }

    fn identity_of(&self, resource_type: &str, provider_id: &str) -> ResourceId {
        self.lock()
            .world
            .resources
            .get(provider_id)
            .map_or_else(|| ResourceId::new(resource_type, provider_id), StoredResource::id)
    }

    async fn simulate_latency(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn persist(&self) {
        let Some(path) = &self.backing_file else {
            return;
        };
        let content = match serde_json::to_string_pretty(&self.lock().world) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to serialize in-memory provider: {e}");
                return;
            }
        };
        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!("Failed to create {}: {e}", parent.display());
            return;
        }
        if let Err(e) = tokio::fs::write(path, content).await {
            warn!("Failed to write {}: {e}", path.display());
        }
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn create(&self, id: &ResourceId, inputs: &Attributes) -> ProviderResult<RemoteResource> {
        self.begin(ProviderOp::Create, id.clone())?;
        self.simulate_latency().await;

        let remote = {
            let mut inner = self.lock();
            let provider_id = self.insert(&mut inner.world, id, inputs.clone());
            let outputs = inner
                .world
                .resources
                .get(&provider_id)
                .map(|r| r.outputs.clone())
                .unwrap_or_default();
            RemoteResource::new(provider_id, outputs)
        };
        self.persist().await;
        debug!("Created {id} as {}", remote.id);
        Ok(remote)
    }

    async fn read(&self, resource_type: &str, provider_id: &str) -> ProviderResult<RemoteResource> {
        self.begin(ProviderOp::Read, self.identity_of(resource_type, provider_id))?;
        self.simulate_latency().await;

        let inner = self.lock();
        let resource = inner
            .world
            .resources
            .get(provider_id)
            .filter(|r| r.resource_type == resource_type)
            .ok_or_else(|| ProviderError::not_found(resource_type, provider_id))?;

        Ok(RemoteResource {
            id: provider_id.to_string(),
            outputs: resource.outputs.clone(),
            inputs: Some(resource.inputs.clone()),
        })
    }

    async fn update(
        &self,
        resource_type: &str,
        provider_id: &str,
        inputs: &Attributes,
    ) -> ProviderResult<RemoteResource> {
        self.begin(ProviderOp::Update, self.identity_of(resource_type, provider_id))?;
        self.simulate_latency().await;

        let remote = {
            let mut inner = self.lock();
            let resource = inner
                .world
                .resources
                .get_mut(provider_id)
                .filter(|r| r.resource_type == resource_type)
                .ok_or_else(|| ProviderError::not_found(resource_type, provider_id))?;
            resource.inputs = inputs.clone();
            RemoteResource::new(provider_id, resource.outputs.clone())
        };
        self.persist().await;
        Ok(remote)
    }

    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
        self.begin(ProviderOp::Delete, self.identity_of(resource_type, provider_id))?;
        self.simulate_latency().await;

        let removed = self.lock().world.resources.remove(provider_id);
        if removed.is_none() {
            return Err(ProviderError::not_found(resource_type, provider_id));
        }
        self.persist().await;
        Ok(())
    }

    async fn lookup(&self, id: &ResourceId) -> ProviderResult<Option<RemoteResource>> {
        self.begin(ProviderOp::Lookup, id.clone())?;

        let inner = self.lock();
        Ok(inner
            .world
            .resources
            .iter()
            .find(|(_, r)| &r.id() == id)
            .map(|(provider_id, r)| RemoteResource {
                id: provider_id.clone(),
                outputs: r.outputs.clone(),
                inputs: Some(r.inputs.clone()),
            }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FieldSchema, ResourceSchema};
    use serde_json::json;
    use tempfile::TempDir;

    fn role() -> ResourceId {
        ResourceId::new("aws:iam/Role", "lambda_role")
    }

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new().with_schema(
            "aws:iam/Role",
            ResourceSchema::new()
                .with_field("name", FieldSchema::required())
                .with_field("arn", FieldSchema::output()),
        )
    }

    #[tokio::test]
    async fn test_create_synthesizes_outputs() {
        let provider = InMemoryProvider::new().with_registry(registry());
        let created = provider
            .create(&role(), &Attributes::new())
            .await
            .expect("create");

        assert_eq!(created.id, "mem-1");
        assert_eq!(
            created.outputs["arn"],
            json!("aws:iam/Role:lambda_role:arn:mem-1")
        );
        assert_eq!(provider.calls_for(&role()), vec![ProviderOp::Create]);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let provider = InMemoryProvider::new();
        provider.fail_on(ProviderOp::Create, &role(), ProviderError::network("boom"));

        assert!(provider.create(&role(), &Attributes::new()).await.is_err());
        assert!(provider.is_empty());
        assert!(provider.create(&role(), &Attributes::new()).await.is_ok());
        assert_eq!(provider.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let provider = InMemoryProvider::new();
        let err = provider
            .delete("aws:iam/Role", "mem-9")
            .await
            .expect_err("should fail");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_lookup_and_out_of_band_changes() {
        let provider = InMemoryProvider::new();
        let provider_id = provider.insert_existing(
            &role(),
            Attributes::from([(String::from("name"), json!("r"))]),
        );

        let found = provider
            .lookup(&role())
            .await
            .expect("lookup")
            .expect("should exist");
        assert_eq!(found.id, provider_id);

        provider.set_output_out_of_band(&role(), "arn", json!("changed"));
        let read = provider
            .read("aws:iam/Role", &provider_id)
            .await
            .expect("read");
        assert_eq!(read.outputs["arn"], json!("changed"));

        assert!(provider.remove_out_of_band(&role()));
        assert!(provider.lookup(&role()).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn test_persistent_world_survives_reload() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let path = temp.path().join("world.json");

        let first = InMemoryProvider::new()
            .persistent(&path)
            .expect("open provider");
        first
            .create(&role(), &Attributes::new())
            .await
            .expect("create");

        let second = InMemoryProvider::new()
            .persistent(&path)
            .expect("reopen provider");
        assert_eq!(second.len(), 1);
        let created = second
            .create(&ResourceId::new("t", "other"), &Attributes::new())
            .await
            .expect("create");
        assert_eq!(created.id, "mem-2");
    }
}
