//! Wave partitioning of diff steps.
//!
//! A step's wave is one more than the deepest wave among its dependencies.
//! Declared resources depend on the resources they reference; a delete
//! depends on every recorded resource that referenced it when last applied,
//! so deletions run after their consumers have been handled. A replace
//! likewise waits for the deletion of recorded consumers that are going away.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::{KeelError, Result};
use crate::graph::{ResourceGraph, ResourceId, topological_order};
use crate::state::StateSnapshot;

use super::diff::DiffResult;
use super::plan::{ExecutionPlan, PlanStep, StepAction};

/// Scheduler that turns a diff into an [`ExecutionPlan`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanScheduler;

impl PlanScheduler {
    /// Creates a new scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Assigns dependencies and waves to every step.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::GraphError::Cycle`] if the combined
    /// dependencies are cyclic, which only stored state can cause.
    pub fn schedule(
        &self,
        diff: DiffResult,
        graph: &ResourceGraph,
        state: &StateSnapshot,
        config_hash: &str,
    ) -> Result<ExecutionPlan> {
        let mut steps: BTreeMap<ResourceId, PlanStep> = BTreeMap::new();
        for step in diff.steps {
            if steps.contains_key(&step.id) {
                return Err(KeelError::internal(format!(
                    "diff produced two steps for {}",
                    step.id
                )));
            }
            steps.insert(step.id.clone(), step);
        }

        let mut dependencies = Self::dependencies(&steps, graph, state);
        let order = topological_order(steps.keys(), &dependencies)?;

        let mut waves_by_id: HashMap<&ResourceId, usize> = HashMap::with_capacity(order.len());
        for id in &order {
            let wave = dependencies
                .get(id)
                .into_iter()
                .flatten()
                .filter_map(|dep| waves_by_id.get(dep))
                .map(|w| w + 1)
                .max()
                .unwrap_or(0);
            waves_by_id.insert(id, wave);
        }

        let wave_count = waves_by_id.values().max().map_or(0, |w| w + 1);
        let mut waves: Vec<Vec<PlanStep>> = vec![Vec::new(); wave_count];
        for (id, mut step) in steps {
            let wave = waves_by_id.get(&id).copied().unwrap_or(0);
            step.wave = wave;
            step.dependencies = dependencies.remove(&id).unwrap_or_default();
            waves[wave].push(step);
        }

        debug!(
            "Scheduled {} steps into {wave_count} waves",
            waves.iter().map(Vec::len).sum::<usize>()
        );
        Ok(ExecutionPlan::new(config_hash, waves))
    }

    /// Dependency lists per step, restricted to steps in the plan.
    fn dependencies(
        steps: &BTreeMap<ResourceId, PlanStep>,
        graph: &ResourceGraph,
        state: &StateSnapshot,
    ) -> BTreeMap<ResourceId, Vec<ResourceId>> {
        let mut deps: BTreeMap<ResourceId, Vec<ResourceId>> = BTreeMap::new();

        for (id, step) in steps {
            let entry = deps.entry(id.clone()).or_default();
            if step.action != StepAction::Delete {
                entry.extend(graph.dependencies_of(id).into_iter().cloned());
            }
        }

        for record in state.records() {
            let consumer = record.id();
            if !steps.contains_key(&consumer) {
                continue;
            }
            let consumer_deleted = steps
                .get(&consumer)
                .is_some_and(|s| s.action == StepAction::Delete);
            for producer in record.dependency_ids() {
                // A replace deletes the old instance before creating the new one.
                let deleting = steps.get(&producer).is_some_and(|s| match s.action {
                    StepAction::Delete => true,
                    StepAction::Replace => consumer_deleted,
                    _ => false,
                });
                if deleting && producer != consumer {
                    deps.entry(producer).or_default().push(consumer.clone());
                }
            }
        }

        for list in deps.values_mut() {
            list.sort();
            list.dedup();
        }
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDecl;
    use crate::error::GraphError;
    use crate::graph::{Attributes, GraphBuilder};
    use crate::planner::DiffEngine;
    use crate::registry::{FieldSchema, ResourceSchema, SchemaRegistry};
    use crate::state::StateRecord;
    use serde_json::json;

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

    fn plan(decls: &[ResourceDecl], state: &StateSnapshot) -> Result<ExecutionPlan> {
        let registry = registry();
        let graph = GraphBuilder::from_declarations(decls)?.build()?;
        let diff = DiffEngine::new(&registry).compute_diff(&graph, state)?;
        PlanScheduler::new().schedule(diff, &graph, state, "hash")
    }

    fn record(name: &str, deps: &[&str]) -> StateRecord {
        StateRecord::new(
            &ResourceId::new("t", name),
            format!("id-{name}"),
            Attributes::from([(String::from("value"), json!(name))]),
            Attributes::from([(String::from("out"), json!(format!("out-{name}")))]),
            deps.iter().map(|d| ResourceId::new("t", *d).key()).collect(),
        )
    }

    fn id(name: &str) -> ResourceId {
        ResourceId::new("t", name)
    }

    #[test]
    fn test_chain_gets_one_wave_per_level() {
        let plan = plan(
            &[decl("a", None), decl("b", Some("a")), decl("c", Some("b"))],
            &StateSnapshot::new("demo", "dev"),
        )
        .expect("plan should build");

        assert_eq!(plan.wave_count(), 3);
        assert_eq!(plan.wave_of(&id("a")), Some(0));
        assert_eq!(plan.wave_of(&id("b")), Some(1));
        assert_eq!(plan.wave_of(&id("c")), Some(2));
    }

    #[test]
    fn test_independent_roots_share_a_wave_sorted() {
        let plan = plan(
            &[decl("z", None), decl("m", None), decl("a", Some("z"))],
            &StateSnapshot::new("demo", "dev"),
        )
        .expect("plan should build");

        let wave0: Vec<&str> = plan.waves[0].iter().map(|s| s.id.name.as_str()).collect();
        assert_eq!(wave0, vec!["m", "z"]);
        assert_eq!(plan.wave_of(&id("a")), Some(1));
    }

    #[test]
    fn test_every_edge_crosses_waves_forward() {
        let decls = [
            decl("root", None),
            decl("left", Some("root")),
            decl("right", Some("root")),
            decl("leaf", Some("left")),
            decl("solo", None),
        ];
        let plan = plan(&decls, &StateSnapshot::new("demo", "dev")).expect("plan should build");

        for step in plan.steps() {
            for dep in &step.dependencies {
                let dep_wave = plan.wave_of(dep).expect("dependency scheduled");
                assert!(dep_wave < step.wave, "{dep} must precede {}", step.id);
            }
        }
    }

    #[test]
    fn test_deletes_run_in_reverse_dependency_order() {
        let mut state = StateSnapshot::new("demo", "dev");
        state.upsert(record("a", &[]));
        state.upsert(record("b", &["a"]));
        state.upsert(record("c", &["b"]));

        let plan = plan(&[], &state).expect("plan should build");

        assert_eq!(plan.count(StepAction::Delete), 3);
        assert_eq!(plan.wave_of(&id("c")), Some(0));
        assert_eq!(plan.wave_of(&id("b")), Some(1));
        assert_eq!(plan.wave_of(&id("a")), Some(2));
    }

    #[test]
    fn test_delete_waits_for_consumer_moving_away() {
        let mut state = StateSnapshot::new("demo", "dev");
        state.upsert(record("old", &[]));
        state.upsert(record("new", &[]));
        state.upsert(record("user", &["old"]));

        let plan = plan(&[decl("new", None), decl("user", Some("new"))], &state)
            .expect("plan should build");

        let user_wave = plan.wave_of(&id("user")).expect("user scheduled");
        let old_wave = plan.wave_of(&id("old")).expect("old scheduled");
        assert_eq!(plan.action_for(&id("old")), Some(StepAction::Delete));
        assert!(old_wave > user_wave);
    }

    #[test]
    fn test_cyclic_stored_dependencies_rejected() {
        let mut state = StateSnapshot::new("demo", "dev");
        state.upsert(record("a", &["b"]));
        state.upsert(record("b", &["a"]));

        let err = plan(&[], &state).expect_err("cycle should be rejected");
        assert!(matches!(err, KeelError::Graph(GraphError::Cycle { .. })));
    }
    #[test]
    fn test_replace_waits_for_deleted_consumer() {
        let mut state = StateSnapshot::new("demo", "dev");
        state.upsert(record("p", &[]));
        state.upsert(record("c", &["p"]));

        // "p" changes a force-replace field while "c" is no longer declared.
        let registry = SchemaRegistry::new().with_schema(
            "t",
            ResourceSchema::new()
                .with_field("value", FieldSchema::optional().force_replace())
                .with_field("out", FieldSchema::output()),
        );
        let decls = [ResourceDecl::new("t", "p").with_attr("value", json!("p-v2"))];
        let graph = GraphBuilder::from_declarations(&decls)
            .expect("parse")
            .build()
            .expect("build");
        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph, &state)
            .expect("diff");
        let plan = PlanScheduler::new()
            .schedule(diff, &graph, &state, "hash")
            .expect("plan should build");

        assert_eq!(plan.action_for(&id("p")), Some(StepAction::Replace));
        assert_eq!(plan.action_for(&id("c")), Some(StepAction::Delete));
        assert_eq!(plan.wave_of(&id("c")), Some(0));
        assert_eq!(plan.wave_of(&id("p")), Some(1));
        assert_eq!(plan.step(&id("p")).map(|s| s.dependencies.clone()), Some(vec![id("c")]));
    }
}
