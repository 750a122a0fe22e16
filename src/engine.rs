//! Run orchestration.
//!
//! The engine ties the pipeline together for one run: parse the declared
//! resources into a graph, validate it against the registry, load and
//! refresh state, diff, schedule and (for `apply` and `destroy`) execute.
//! Structural problems surface before the first provider call.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, DEFAULT_CONCURRENCY, DeployConfig};
use crate::error::Result;
use crate::graph::{
    AttrValue, Attributes, GraphBuilder, ResourceGraph, ResourceId, ResourceNode,
};
use crate::planner::{
    ApplyExecutor, ApplyReport, DiffEngine, ExecutionPlan, PlanScheduler, StepAction,
};
use crate::provider::Provider;
use crate::registry::SchemaRegistry;
use crate::state::{
    RunOperation, StateLedger, StateRecord, StateSnapshot, StateStore, generate_holder_id,
};

/// What a refresh changed in the loaded snapshot.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RefreshReport {
    /// Declared resources found on the provider without a record.
    pub adopted: Vec<ResourceId>,
    /// Recorded resources the provider no longer has.
    pub removed: Vec<ResourceId>,
    /// Recorded resources whose outputs or inputs changed remotely.
    pub drifted: Vec<ResourceId>,
}

impl RefreshReport {
    /// Returns true if the refresh left the snapshot untouched.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.adopted.is_empty() && self.removed.is_empty() && self.drifted.is_empty()
    }
}

/// Result of `plan`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanOutcome {
    /// The scheduled plan.
    pub plan: ExecutionPlan,
    /// What the refresh found before diffing.
    pub refresh: RefreshReport,
}

/// Result of `apply` and `destroy`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApplyOutcome {
    /// The plan that was executed.
    pub plan: ExecutionPlan,
    /// What the refresh found before diffing.
    pub refresh: RefreshReport,
    /// Per-step results.
    pub report: ApplyReport,
}

/// Report of drift detection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DriftReport {
    /// What the refresh found.
    pub refresh: RefreshReport,
    /// Resources an apply would change, with the action it would take.
    pub pending: Vec<(ResourceId, StepAction)>,
    /// Number of declared resources.
    pub total_resources: usize,
}

impl DriftReport {
    /// Returns true if state, provider and configuration agree.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.refresh.is_clean() && self.pending.is_empty()
    }
}

/// Orchestrates runs for one deploy configuration.
pub struct Engine {
    config: DeployConfig,
    registry: SchemaRegistry,
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    concurrency: usize,
    refresh: bool,
}

impl Engine {
    /// Creates an engine. Concurrency and refresh come from the `engine`
    /// section of the configuration.
    #[must_use]
    pub fn new(
        config: DeployConfig,
        provider: Arc<dyn Provider>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let registry = SchemaRegistry::from_config(&config.schemas);
        let concurrency = if config.engine.concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            config.engine.concurrency
        };
        let refresh = config.engine.refresh;
        Self {
            config,
            registry,
            provider,
            store,
            concurrency,
            refresh,
        }
    }

    /// Overrides the concurrency cap.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Enables or disables the refresh phase.
    #[must_use]
    pub const fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// The configuration this engine runs.
    #[must_use]
    pub const fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// The schema registry built from the configuration.
    #[must_use]
    pub const fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Builds the desired-state graph and validates it against the registry.
    ///
    /// # Errors
    ///
    /// Returns a graph or schema error.
    pub fn build_graph(&self) -> Result<ResourceGraph> {
        let graph = GraphBuilder::from_declarations(&self.config.resources)?.build()?;
        DiffEngine::new(&self.registry).validate(&graph)?;
        debug!(
            "Built graph with {} nodes and {} edges",
            graph.len(),
            graph.edges().len()
        );
        Ok(graph)
    }

    /// Loads the stored snapshot, or an empty one for a first run.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the stored state fails verification.
    pub async fn load_state(&self) -> Result<StateSnapshot> {
        let project = &self.config.project;
        match self.store.load().await? {
            Some(snapshot) => {
                if snapshot.project != project.name || snapshot.environment != project.environment
                {
                    warn!(
                        "State belongs to {}/{}, configuration is {}/{}",
                        snapshot.project, snapshot.environment, project.name, project.environment
                    );
                }
                Ok(snapshot)
            }
            None => Ok(StateSnapshot::new(&project.name, &project.environment)),
        }
    }

    /// Reconciles `snapshot` with what the provider reports.
    ///
    /// Recorded resources are read back: missing ones are dropped so they get
    /// created again, changed ones are updated in place. Declared resources
    /// without a record are then looked up and adopted, which recovers
    /// resources created by a run that crashed before recording them.
    ///
    /// # Errors
    ///
    /// Returns the first provider error other than not-found.
    pub async fn refresh(
        &self,
        snapshot: &mut StateSnapshot,
        graph: &ResourceGraph,
    ) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();

        let recorded: Vec<StateRecord> = snapshot.records().cloned().collect();
        for record in recorded {
            let id = record.id();
            match self
                .provider
                .read(&record.resource_type, &record.provider_id)
                .await
            {
                Ok(remote) => {
                    let inputs = remote.inputs.unwrap_or_else(|| record.inputs.clone());
                    if remote.outputs == record.outputs && inputs == record.inputs {
                        continue;
                    }
                    warn!("{id} changed outside of keel");
                    let refreshed = StateRecord::new(
                        &id,
                        record.provider_id.clone(),
                        inputs,
                        remote.outputs,
                        record.dependencies.clone(),
                    )
                    .created_at_from(Some(&record));
                    snapshot.upsert(refreshed);
                    report.drifted.push(id);
                }
                Err(e) if e.is_not_found() => {
                    warn!("{id} ({}) no longer exists", record.provider_id);
                    snapshot.remove(&id);
                    report.removed.push(id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Producers first, so an adopted consumer can resolve its references.
        for id in graph.topological_order() {
            if snapshot.get(id).is_some() {
                continue;
            }
            let Some(node) = graph.node(id) else {
                continue;
            };
            if let Some(remote) = self.provider.lookup(id).await? {
                info!("Adopting existing {id} ({})", remote.id);
                let inputs = remote
                    .inputs
                    .unwrap_or_else(|| declared_inputs(node, snapshot));
                let record = StateRecord::new(
                    id,
                    remote.id,
                    inputs,
                    remote.outputs,
                    dependency_keys(node),
                );
                snapshot.upsert(record);
                report.adopted.push(id.clone());
            }
        }

        Ok(report)
    }

    /// Computes the plan for the current configuration without changing
    /// anything. The refreshed state is not persisted.
    ///
    /// # Errors
    ///
    /// Returns structural errors, state errors and refresh errors.
    pub async fn plan(&self) -> Result<PlanOutcome> {
        let graph = self.build_graph()?;
        let (plan, refresh, _) = self.prepare(&graph, false).await?;
        Ok(PlanOutcome { plan, refresh })
    }

    /// Applies the configuration. Step failures are reported in the outcome,
    /// not as an error.
    ///
    /// # Errors
    ///
    /// Returns structural errors, lock errors, state errors and refresh
    /// errors. None of these leave partial provider changes behind.
    pub async fn apply(&self, cancel: CancellationToken) -> Result<ApplyOutcome> {
        let graph = self.build_graph()?;
        self.locked("apply", graph, RunOperation::Apply, cancel)
            .await
    }

    /// Deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns lock errors, state errors and refresh errors.
    pub async fn destroy(&self, cancel: CancellationToken) -> Result<ApplyOutcome> {
        let graph = GraphBuilder::new().build()?;
        self.locked("destroy", graph, RunOperation::Destroy, cancel)
            .await
    }

    /// Refreshes a copy of the state and reports what differs.
    ///
    /// # Errors
    ///
    /// Returns structural errors, state errors and refresh errors.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            self.config.project.name, self.config.project.environment
        );
        let graph = self.build_graph()?;
        let mut snapshot = self.load_state().await?;
        let refresh = self.refresh(&mut snapshot, &graph).await?;
        let diff = DiffEngine::new(&self.registry).compute_diff(&graph, &snapshot)?;

        let pending = diff
            .steps
            .iter()
            .filter(|s| s.action.is_change())
            .map(|s| (s.id.clone(), s.action))
            .collect();

        Ok(DriftReport {
            refresh,
            pending,
            total_resources: graph.len(),
        })
    }

    /// Runs `operation` while holding the state lock.
    async fn locked(
        &self,
        command: &str,
        graph: ResourceGraph,
        operation: RunOperation,
        cancel: CancellationToken,
    ) -> Result<ApplyOutcome> {
        let holder = generate_holder_id();
        let lock = self.store.acquire_lock(&holder, command).await?;
        debug!("Acquired state lock {}", lock.lock_id);

        let result = self.execute(&graph, operation, cancel).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock: {e}");
        }
        result
    }

    async fn execute(
        &self,
        graph: &ResourceGraph,
        operation: RunOperation,
        cancel: CancellationToken,
    ) -> Result<ApplyOutcome> {
        let (plan, refresh, snapshot) = self.prepare(graph, true).await?;
        info!("{plan}");

        let ledger = Arc::new(StateLedger::new(Arc::clone(&self.store), snapshot));
        let report = ApplyExecutor::new(Arc::clone(&self.provider), ledger)
            .with_concurrency(self.concurrency)
            .with_cancellation(cancel)
            .with_operation(operation)
            .execute(&plan)
            .await;

        Ok(ApplyOutcome {
            plan,
            refresh,
            report,
        })
    }

    /// Loads, optionally refreshes, diffs and schedules.
    async fn prepare(
        &self,
        graph: &ResourceGraph,
        persist_refresh: bool,
    ) -> Result<(ExecutionPlan, RefreshReport, StateSnapshot)> {
        let mut snapshot = self.load_state().await?;

        let refresh = if self.refresh {
            let report = self.refresh(&mut snapshot, graph).await?;
            if persist_refresh && !report.is_clean() {
                self.store.save(&snapshot).await?;
                debug!("Persisted refreshed state (serial {})", snapshot.serial);
            }
            report
        } else {
            RefreshReport::default()
        };

        let diff = DiffEngine::new(&self.registry).compute_diff(graph, &snapshot)?;
        let config_hash = ConfigHasher::new().hash_config(&self.config);
        let plan = PlanScheduler::new().schedule(diff, graph, &snapshot, &config_hash)?;
        Ok((plan, refresh, snapshot))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("project", &self.config.project.name)
            .field("provider", &self.provider.name())
            .field("backend", &self.store.backend_type())
            .field("concurrency", &self.concurrency)
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

/// Inputs of an adopted resource whose provider does not report them: the
/// declared values, with references resolved against recorded outputs.
/// Unresolvable references are left out.
fn declared_inputs(node: &ResourceNode, snapshot: &StateSnapshot) -> Attributes {
    node.attributes
        .iter()
        .filter_map(|(field, value)| {
            let resolved = match value {
                AttrValue::Literal(v) => Some(v.clone()),
                AttrValue::Reference(r) => snapshot
                    .get(&r.target)
                    .and_then(|producer| producer.outputs.get(&r.field))
                    .cloned(),
            };
            resolved.map(|v| (field.clone(), v))
        })
        .collect()
}

fn dependency_keys(node: &ResourceNode) -> Vec<String> {
    let mut keys: Vec<String> = node.references().map(|(_, r)| r.target.key()).collect();
    keys.sort();
    keys.dedup();
    keys
}

impl std::fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} adopted, {} removed, {} drifted",
            self.adopted.len(),
            self.removed.len(),
            self.drifted.len()
        )
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - state is converged");
        }
        writeln!(f, "Drift detected:")?;
        for id in &self.refresh.removed {
            writeln!(f, "  - {id}: missing on provider")?;
        }
        for id in &self.refresh.drifted {
            writeln!(f, "  - {id}: changed outside of keel")?;
        }
        for id in &self.refresh.adopted {
            writeln!(f, "  - {id}: exists but was not recorded")?;
        }
        for (id, action) in &self.pending {
            writeln!(f, "  - {id}: pending {action}")?;
        }
        Ok(())
    }
}
