//! Plan executor.
//!
//! Waves run strictly in order. Inside a wave, steps run as tokio tasks
//! bounded by a semaphore. A step whose dependency failed or was skipped is
//! skipped without calling the provider. Every successful step is written to
//! the state ledger before it counts as succeeded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_CONCURRENCY;
use crate::error::{ApplyError, KeelError, Result};
use crate::graph::{AttrValue, Attributes, ResourceId};
use crate::provider::{Provider, RemoteResource};
use crate::state::{HistoryEntry, RunOperation, StateLedger, StateRecord};

use super::plan::{ExecutionPlan, PlanStep, StepAction};

/// Lifecycle of a step during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepState {
    /// Not started.
    Pending,
    /// Provider call in progress.
    InFlight,
    /// Finished and recorded.
    Succeeded,
    /// Provider call or state write failed.
    Failed {
        /// Error message.
        error: String,
    },
    /// Never started.
    Skipped {
        /// Why the step did not run.
        reason: SkipReason,
    },
}

/// Why a step was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency failed or was itself skipped.
    DependencyFailed(ResourceId),
    /// The run was cancelled before the step started.
    Cancelled,
}

/// Final outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// Target resource.
    pub id: ResourceId,
    /// Planned action.
    pub action: StepAction,
    /// Wave index.
    pub wave: usize,
    /// Terminal state.
    pub state: StepState,
    /// Wall time spent, in milliseconds.
    pub duration_ms: u64,
}

/// Result of applying a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Per-step outcomes in plan order.
    pub outcomes: Vec<StepOutcome>,
    /// Whether cancellation was requested during the run.
    pub cancelled: bool,
}

/// Executes plans against a provider.
pub struct ApplyExecutor {
    provider: Arc<dyn Provider>,
    ledger: Arc<StateLedger>,
    concurrency: usize,
    cancel: CancellationToken,
    operation: RunOperation,
}

/// Outputs of every resource known so far in the run.
type OutputMap = Arc<RwLock<HashMap<ResourceId, Attributes>>>;

impl ApplyExecutor {
    /// Creates an executor with the default concurrency.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, ledger: Arc<StateLedger>) -> Self {
        Self {
            provider,
            ledger,
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
            operation: RunOperation::Apply,
        }
    }

    /// Sets the maximum number of steps in flight at once.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Uses `cancel` to stop new steps from starting.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the operation recorded in history.
    #[must_use]
    pub const fn with_operation(mut self, operation: RunOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Executes every wave of `plan`.
    ///
    /// Step failures are reported in the returned [`ApplyReport`], never as
    /// an error.
    pub async fn execute(&self, plan: &ExecutionPlan) -> ApplyReport {
        let started_at = Utc::now();
        info!(
            "Applying plan: {} steps in {} waves (concurrency {})",
            plan.step_count(),
            plan.wave_count(),
            self.concurrency
        );

        let outputs: OutputMap = Arc::new(RwLock::new(
            self.ledger
                .snapshot()
                .await
                .records()
                .map(|r| (r.id(), r.outputs.clone()))
                .collect(),
        ));

        let mut states: HashMap<ResourceId, StepState> = plan
            .steps()
            .map(|s| (s.id.clone(), StepState::Pending))
            .collect();
        let mut durations: HashMap<ResourceId, u64> = HashMap::new();

        for (index, wave) in plan.waves.iter().enumerate() {
            debug!("Starting wave {index} ({} steps)", wave.len());
            self.run_wave(wave, &outputs, &mut states, &mut durations)
                .await;
        }

        let outcomes: Vec<StepOutcome> = plan
            .steps()
            .map(|step| StepOutcome {
                id: step.id.clone(),
                action: step.action,
                wave: step.wave,
                state: states
                    .remove(&step.id)
                    .unwrap_or(StepState::Pending),
                duration_ms: durations.get(&step.id).copied().unwrap_or(0),
            })
            .collect();

        let report = ApplyReport {
            started_at,
            finished_at: Utc::now(),
            outcomes,
            cancelled: self.cancel.is_cancelled(),
        };

        let touched = report
            .outcomes
            .iter()
            .filter(|o| o.action.is_change() && o.state == StepState::Succeeded)
            .map(|o| o.id.key())
            .collect();
        let summary = (!report.is_success()).then(|| report.summary());
        if let Err(e) = self
            .ledger
            .record_run(HistoryEntry::new(
                self.operation,
                &plan.config_hash,
                touched,
                summary,
            ))
            .await
        {
            warn!("Failed to record run history: {e}");
        }

        info!("{}", report.summary());
        report
    }

    async fn run_wave(
        &self,
        wave: &[PlanStep],
        outputs: &OutputMap,
        states: &mut HashMap<ResourceId, StepState>,
        durations: &mut HashMap<ResourceId, u64>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for step in wave {
            let blocker = step.dependencies.iter().find(|dep| {
                matches!(
                    states.get(*dep),
                    Some(StepState::Failed { .. } | StepState::Skipped { .. })
                )
            });
            if let Some(blocker) = blocker {
                warn!("Skipping {}: dependency {blocker} did not succeed", step.id);
                let reason = SkipReason::DependencyFailed(blocker.clone());
                states.insert(step.id.clone(), StepState::Skipped { reason });
                continue;
            }

            if self.cancel.is_cancelled() {
                states.insert(
                    step.id.clone(),
                    StepState::Skipped {
                        reason: SkipReason::Cancelled,
                    },
                );
                continue;
            }

            let context = StepContext {
                provider: Arc::clone(&self.provider),
                ledger: Arc::clone(&self.ledger),
                outputs: Arc::clone(outputs),
            };
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            let step = step.clone();
            states.insert(step.id.clone(), StepState::InFlight);

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        let state = StepState::Skipped { reason: SkipReason::Cancelled };
                        return (step.id, state, 0);
                    }
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(e) => {
                            let state = StepState::Failed { error: e.to_string() };
                            return (step.id, state, 0);
                        }
                    },
                };

                let started = Instant::now();
                let state = match context.run(&step).await {
                    Ok(()) => StepState::Succeeded,
                    Err(e) => {
                        error!("{} {} failed: {e}", step.action, step.id);
                        StepState::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                (step.id, state, elapsed)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, state, elapsed)) => {
                    durations.insert(id.clone(), elapsed);
                    states.insert(id, state);
                }
                Err(join_error) => error!("Step task did not complete: {join_error}"),
            }
        }

        // A task that panicked never reported back.
        for step in wave {
            if let Some(state) = states.get_mut(&step.id)
                && *state == StepState::InFlight
            {
                *state = StepState::Failed {
                    error: String::from("step task panicked"),
                };
            }
        }
    }
}

impl std::fmt::Debug for ApplyExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyExecutor")
            .field("provider", &self.provider.name())
            .field("concurrency", &self.concurrency)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

/// Everything a step task needs, shared with its siblings.
struct StepContext {
    provider: Arc<dyn Provider>,
    ledger: Arc<StateLedger>,
    outputs: OutputMap,
}

impl StepContext {
    async fn run(&self, step: &PlanStep) -> Result<()> {
        match step.action {
            StepAction::Noop => Ok(()),
            StepAction::Create => self.create(step).await,
            StepAction::Update => self.update(step).await,
            StepAction::Replace => {
                self.delete(step).await?;
                self.create(step).await
            }
            StepAction::Delete => self.delete(step).await,
        }
    }

    async fn create(&self, step: &PlanStep) -> Result<()> {
        let inputs = self.resolve(step)?;
        let remote = self.provider.create(&step.id, &inputs).await?;
        info!("Created {} ({})", step.id, remote.id);
        self.record(step, remote, inputs).await
    }

    async fn update(&self, step: &PlanStep) -> Result<()> {
        let provider_id = Self::provider_id(step)?;
        let inputs = self.resolve(step)?;
        let mut remote = self
            .provider
            .update(&step.id.resource_type, provider_id, &inputs)
            .await?;
        if remote.id.is_empty() {
            remote.id = provider_id.to_string();
        }
        info!("Updated {} ({})", step.id, remote.id);
        self.record(step, remote, inputs).await
    }

    async fn delete(&self, step: &PlanStep) -> Result<()> {
        let provider_id = Self::provider_id(step)?;
        match self
            .provider
            .delete(&step.id.resource_type, provider_id)
            .await
        {
            Ok(()) => info!("Deleted {} ({provider_id})", step.id),
            Err(e) if e.is_not_found() => {
                info!("{} ({provider_id}) was already gone", step.id);
            }
            Err(e) => return Err(e.into()),
        }

        self.ledger.remove(&step.id).await?;
        self.write_outputs().remove(&step.id);
        Ok(())
    }

    /// Persists the step's result, then publishes its outputs.
    async fn record(
        &self,
        step: &PlanStep,
        remote: RemoteResource,
        inputs: Attributes,
    ) -> Result<()> {
        let dependencies = step.referenced().iter().map(ResourceId::key).collect();
        let record = StateRecord::new(
            &step.id,
            remote.id,
            inputs,
            remote.outputs.clone(),
            dependencies,
        );
        self.ledger.upsert(record).await?;
        self.write_outputs().insert(step.id.clone(), remote.outputs);
        Ok(())
    }

    /// Substitutes every reference with the producer's current output.
    fn resolve(&self, step: &PlanStep) -> Result<Attributes> {
        let outputs = self
            .outputs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        step.attributes
            .iter()
            .map(|(field, value)| match value {
                AttrValue::Literal(v) => Ok((field.clone(), v.clone())),
                AttrValue::Reference(r) => outputs
                    .get(&r.target)
                    .and_then(|o| o.get(&r.field))
                    .map(|v| (field.clone(), v.clone()))
                    .ok_or_else(|| {
                        KeelError::Apply(ApplyError::UnresolvedReference {
                            consumer: step.id.to_string(),
                            field: field.clone(),
                            target: r.target.to_string(),
                            output: r.field.clone(),
                        })
                    }),
            })
            .collect()
    }

    fn provider_id(step: &PlanStep) -> Result<&str> {
        step.provider_id.as_deref().ok_or_else(|| {
            KeelError::internal(format!("{} {} has no provider id", step.action, step.id))
        })
    }

    fn write_outputs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ResourceId, Attributes>> {
        self.outputs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ApplyReport {
    /// Outcomes in the given terminal state kind.
    fn count_where(&self, pred: impl Fn(&StepState) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.state)).count()
    }

    /// Number of succeeded steps, including no-ops.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count_where(|s| *s == StepState::Succeeded)
    }

    /// Number of failed steps.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count_where(|s| matches!(s, StepState::Failed { .. }))
    }

    /// Number of skipped steps.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count_where(|s| matches!(s, StepState::Skipped { .. }))
    }

    /// Number of succeeded steps that changed something.
    #[must_use]
    pub fn changed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.action.is_change() && o.state == StepState::Succeeded)
            .count()
    }

    /// Returns true if no step failed or was skipped.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0
    }

    /// Outcome for a resource.
    #[must_use]
    pub fn outcome(&self, id: &ResourceId) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| &o.id == id)
    }

    /// One-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} changed, {} unchanged, {} failed, {} skipped",
            self.changed(),
            self.succeeded() - self.changed(),
            self.failed(),
            self.skipped()
        )
    }

    /// Converts an unsuccessful report into an error.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Incomplete`] if any step failed or was skipped.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(KeelError::Apply(ApplyError::Incomplete {
                failed: self.failed(),
                skipped: self.skipped(),
            }))
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InFlight => write!(f, "in flight"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            Self::Skipped {
                reason: SkipReason::Cancelled,
            } => write!(f, "skipped: cancelled"),
            Self::Skipped {
                reason: SkipReason::DependencyFailed(dep),
            } => write!(f, "skipped: {dep} did not succeed"),
        }
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Apply finished: {}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDecl;
    use crate::error::ProviderError;
    use crate::graph::GraphBuilder;
    use crate::planner::{DiffEngine, PlanScheduler};
    use crate::provider::{InMemoryProvider, MockProvider, ProviderOp};
    use crate::registry::{FieldSchema, ResourceSchema, SchemaRegistry};
    use crate::state::{LocalStateStore, StateSnapshot, StateStore};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry() -> SchemaRegistry {
        let schema = ResourceSchema::new()
            .with_field("value", FieldSchema::optional())
            .with_field("parent", FieldSchema::optional())
            .with_field("out", FieldSchema::output());
        SchemaRegistry::new().with_schema("t", schema)
    }

    fn decl(name: &str, parent: Option<&str>) -> ResourceDecl {
        let decl = ResourceDecl::new("t", name).with_attr("value", json!(name));
        match parent {
            Some(p) => decl.with_attr("parent", json!(format!("${{t::{p}.out}}"))),
            None => decl,
        }
    }

    fn id(name: &str) -> ResourceId {
        ResourceId::new("t", name)
    }

    struct Harness {
        _temp: TempDir,
        store: Arc<LocalStateStore>,
    }

    impl Harness {
        fn new() -> Self {
            let temp = TempDir::new().expect("Failed to create temp dir");
            let store = Arc::new(LocalStateStore::with_base_dir(temp.path()));
            Self { _temp: temp, store }
        }

        async fn state(&self) -> StateSnapshot {
            self.store
                .load()
                .await
                .expect("load")
                .unwrap_or_else(|| StateSnapshot::new("demo", "dev"))
        }

        async fn plan(&self, decls: &[ResourceDecl]) -> ExecutionPlan {
            let registry = registry();
            let state = self.state().await;
            let graph = GraphBuilder::from_declarations(decls)
                .expect("parse")
                .build()
                .expect("build");
            let diff = DiffEngine::new(&registry)
                .compute_diff(&graph, &state)
                .expect("diff");
            PlanScheduler::new()
                .schedule(diff, &graph, &state, "hash")
                .expect("schedule")
        }

        async fn executor(&self, provider: Arc<dyn Provider>) -> ApplyExecutor {
            let ledger = Arc::new(StateLedger::new(self.store.clone(), self.state().await));
            ApplyExecutor::new(provider, ledger)
        }
    }

    fn memory() -> Arc<InMemoryProvider> {
        Arc::new(InMemoryProvider::new().with_registry(registry()))
    }

    #[tokio::test]
    async fn test_apply_creates_and_resolves_references() {
        let harness = Harness::new();
        let provider = memory();
        let plan = harness.plan(&[decl("a", None), decl("b", Some("a"))]).await;

        let report = harness.executor(provider.clone()).await.execute(&plan).await;
        assert!(report.is_success());
        assert_eq!(report.changed(), 2);

        let state = harness.state().await;
        let a = state.get(&id("a")).expect("a recorded");
        let b = state.get(&id("b")).expect("b recorded");
        assert_eq!(b.inputs["parent"], a.outputs["out"]);
        assert_eq!(b.dependencies, vec![id("a").key()]);
        assert_eq!(state.history.len(), 1);
        assert!(state.history[0].success);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let harness = Harness::new();
        let provider = memory();
        provider.fail_on(ProviderOp::Create, &id("a"), ProviderError::api_error(500, "boom"));

        let plan = harness
            .plan(&[
                decl("a", None),
                decl("b", Some("a")),
                decl("c", Some("b")),
                decl("d", None),
            ])
            .await;
        let report = harness.executor(provider.clone()).await.execute(&plan).await;

        assert!(matches!(
            report.outcome(&id("a")).map(|o| &o.state),
            Some(StepState::Failed { .. })
        ));
        assert_eq!(
            report.outcome(&id("b")).map(|o| o.state.clone()),
            Some(StepState::Skipped {
                reason: SkipReason::DependencyFailed(id("a"))
            })
        );
        assert_eq!(
            report.outcome(&id("c")).map(|o| o.state.clone()),
            Some(StepState::Skipped {
                reason: SkipReason::DependencyFailed(id("b"))
            })
        );
        assert_eq!(
            report.outcome(&id("d")).map(|o| o.state.clone()),
            Some(StepState::Succeeded)
        );
        assert!(provider.calls_for(&id("b")).is_empty());
        assert!(provider.calls_for(&id("c")).is_empty());

        let state = harness.state().await;
        assert!(state.get(&id("d")).is_some());
        assert!(state.get(&id("a")).is_none());
        assert!(!state.history[0].success);
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let harness = Harness::new();
        let provider = Arc::new(
            InMemoryProvider::new()
                .with_registry(registry())
                .with_latency(Duration::from_millis(20)),
        );
        let decls: Vec<ResourceDecl> = (0..8).map(|i| decl(&format!("r{i}"), None)).collect();
        let plan = harness.plan(&decls).await;

        let report = harness
            .executor(provider.clone())
            .await
            .with_concurrency(3)
            .execute(&plan)
            .await;

        assert!(report.is_success());
        assert!(provider.max_in_flight() <= 3);
        assert!(provider.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let harness = Harness::new();
        let provider = memory();
        let plan = harness.plan(&[decl("a", None), decl("b", Some("a"))]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = harness
            .executor(provider.clone())
            .await
            .with_cancellation(cancel)
            .execute(&plan)
            .await;

        assert!(report.cancelled);
        assert_eq!(report.skipped(), 2);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_replace_deletes_then_creates() {
        let harness = Harness::new();
        let provider = memory();
        let first = harness.plan(&[decl("a", None)]).await;
        harness.executor(provider.clone()).await.execute(&first).await;
        let old_id = harness
            .state()
            .await
            .get(&id("a"))
            .map(|r| r.provider_id.clone())
            .expect("recorded");

        let mut changed = decl("a", None);
        changed.attributes.insert(String::from("value"), json!("renamed"));
        let registry = SchemaRegistry::new().with_schema(
            "t",
            ResourceSchema::new()
                .with_field("value", FieldSchema::optional().force_replace())
                .with_field("parent", FieldSchema::optional())
                .with_field("out", FieldSchema::output()),
        );
        let state = harness.state().await;
        let graph = GraphBuilder::from_declarations(&[changed])
            .expect("parse")
            .build()
            .expect("build");
        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph, &state)
            .expect("diff");
        let plan = PlanScheduler::new()
            .schedule(diff, &graph, &state, "hash")
            .expect("schedule");
        assert_eq!(plan.action_for(&id("a")), Some(StepAction::Replace));

        provider.clear_calls();
        let report = harness.executor(provider.clone()).await.execute(&plan).await;
        assert!(report.is_success());
        assert_eq!(
            provider.calls_for(&id("a")),
            vec![ProviderOp::Delete, ProviderOp::Create]
        );
        let new_id = harness
            .state()
            .await
            .get(&id("a"))
            .map(|r| r.provider_id.clone())
            .expect("recorded");
        assert_ne!(old_id, new_id);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_resource() {
        let harness = Harness::new();
        let provider = memory();
        let first = harness.plan(&[decl("a", None)]).await;
        harness.executor(provider.clone()).await.execute(&first).await;
        assert!(provider.remove_out_of_band(&id("a")));

        let plan = harness.plan(&[]).await;
        let report = harness.executor(provider.clone()).await.execute(&plan).await;

        assert!(report.is_success());
        assert!(harness.state().await.is_empty());
    }

    #[tokio::test]
    async fn test_noop_makes_no_provider_calls() {
        let harness = Harness::new();
        let first = harness.plan(&[decl("a", None)]).await;
        harness.executor(memory()).await.execute(&first).await;

        let mut provider = MockProvider::new();
        provider.expect_create().never();
        provider.expect_update().never();
        provider.expect_delete().never();
        provider.expect_name().return_const("mock");

        let plan = harness.plan(&[decl("a", None)]).await;
        assert!(!plan.has_changes());
        let report = harness.executor(Arc::new(provider)).await.execute(&plan).await;
        assert!(report.is_success());
        assert_eq!(report.changed(), 0);
    }
}
