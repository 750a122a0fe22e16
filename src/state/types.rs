//! State types for tracking applied resources.
//!
//! A [`StateSnapshot`] is the whole persisted document; each applied
//! resource has one [`StateRecord`] keyed by its `type::name` identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ConfigHasher;
use crate::error::StateError;
use crate::graph::{Attributes, ResourceId};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of history entries kept in the snapshot.
const MAX_HISTORY: usize = 100;

/// The complete persisted state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every write.
    pub serial: u64,
    /// Hash of the last applied configuration.
    #[serde(default)]
    pub config_hash: String,
    /// Applied resources keyed by identity.
    #[serde(default)]
    pub resources: BTreeMap<String, StateRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Last-applied state of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name.
    pub name: String,
    /// ID assigned by the provider.
    pub provider_id: String,
    /// Resolved input attributes as last applied.
    pub inputs: Attributes,
    /// SHA-256 of `inputs` in canonical form.
    pub inputs_hash: String,
    /// Output attributes reported by the provider.
    #[serde(default)]
    pub outputs: Attributes,
    /// Identities this resource referenced when it was applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// When the resource was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// One entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Kind of run.
    pub operation: RunOperation,
    /// Configuration hash the run applied.
    pub config_hash: String,
    /// Identities touched by the run.
    pub resources: Vec<String>,
    /// Whether every step succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Kinds of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Desired state applied.
    Apply,
    /// Every resource deleted.
    Destroy,
    /// Provider state re-read.
    Refresh,
}

impl StateSnapshot {
    /// Creates a new empty snapshot.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            serial: 0,
            config_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Parses and verifies a persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupted`] if the document is malformed or a
    /// record fails verification, and [`StateError::VersionMismatch`] for an
    /// unsupported format version.
    pub fn from_json(content: &str) -> Result<Self, StateError> {
        let snapshot: Self = serde_json::from_str(content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;

        if snapshot.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: snapshot.version,
            });
        }

        snapshot.verify()?;
        Ok(snapshot)
    }

    /// Serializes the snapshot in its canonical persisted form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, StateError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))
    }

    /// Checks every record against its key and its stored input hash.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupted`] naming the first bad record.
    pub fn verify(&self) -> Result<(), StateError> {
        let hasher = ConfigHasher::new();
        for (key, record) in &self.resources {
            let expected_key = record.id().key();
            if key != &expected_key {
                return Err(StateError::corrupted(format!(
                    "record stored under '{key}' describes '{expected_key}'"
                )));
            }
            if record.provider_id.is_empty() {
                return Err(StateError::corrupted(format!(
                    "record '{key}' has an empty provider id"
                )));
            }
            let actual = hasher.hash_attributes(&record.inputs);
            if !ConfigHasher::hashes_match(&actual, &record.inputs_hash) {
                return Err(StateError::corrupted(format!(
                    "record '{key}' inputs do not match their hash"
                )));
            }
        }
        Ok(())
    }

    /// Gets a record by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.resources.get(&id.key())
    }

    /// Inserts or replaces a record.
    pub fn upsert(&mut self, record: StateRecord) {
        self.resources.insert(record.id().key(), record);
        self.touch();
    }

    /// Removes a record.
    pub fn remove(&mut self, id: &ResourceId) -> Option<StateRecord> {
        let removed = self.resources.remove(&id.key());
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// All records, ordered by identity.
    pub fn records(&self) -> impl Iterator<Item = &StateRecord> {
        self.resources.values()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Adds a history entry, dropping the oldest beyond the limit.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
        self.touch();
    }

    /// Marks the snapshot as changed.
    fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }
}

impl StateRecord {
    /// Creates a record, computing the input hash.
    #[must_use]
    pub fn new(
        id: &ResourceId,
        provider_id: impl Into<String>,
        inputs: Attributes,
        outputs: Attributes,
        dependencies: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let inputs_hash = ConfigHasher::new().hash_attributes(&inputs);
        Self {
            resource_type: id.resource_type.clone(),
            name: id.name.clone(),
            provider_id: provider_id.into(),
            inputs,
            inputs_hash,
            outputs,
            dependencies,
            created_at: now,
            updated_at: now,
        }
    }

    /// The identity of this record.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }

    /// Replaces the outputs, e.g. after a refresh or an in-place update.
    pub fn set_outputs(&mut self, outputs: Attributes) {
        self.outputs = outputs;
        self.updated_at = Utc::now();
    }

    /// Keeps the original creation time when replacing an existing record.
    #[must_use]
    pub fn created_at_from(mut self, previous: Option<&Self>) -> Self {
        if let Some(prev) = previous {
            self.created_at = prev.created_at;
        }
        self
    }

    /// Parsed dependency identities; malformed entries are skipped.
    #[must_use]
    pub fn dependency_ids(&self) -> Vec<ResourceId> {
        self.dependencies
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect()
    }
}

impl HistoryEntry {
    /// Creates a history entry.
    #[must_use]
    pub fn new(
        operation: RunOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: error.is_none(),
            error,
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
        };
        write!(f, "{op}")
    }
}
