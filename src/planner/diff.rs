//! Diff engine for comparing the desired graph against stored state.
//!
//! Each declared resource is classified against its state record, producers
//! before consumers, so a consumer can see what is about to happen to the
//! resources it references. Records with no declaration become deletes.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::{KeelError, Result, SchemaError};
use crate::graph::{AttrValue, ResourceGraph, ResourceId, ResourceNode};
use crate::registry::{ResourceSchema, SchemaRegistry};
use crate::state::{StateRecord, StateSnapshot};

use super::plan::{FieldChange, PlanStep, StepAction};

/// Engine for computing per-resource actions.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    registry: &'a SchemaRegistry,
}

/// Complete diff result, before scheduling.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// One unscheduled step per resource, declared resources first.
    pub steps: Vec<PlanStep>,
}

/// A desired value after resolving references against stored state.
#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Known(serde_json::Value),
    /// The producer is being created or replaced.
    AfterApply,
    /// The producer exists but has not reported this output.
    Missing,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine over a registry.
    #[must_use]
    pub const fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Validates every declared resource against its schema.
    ///
    /// # Errors
    ///
    /// Returns the first schema violation, including references to fields
    /// that are not outputs of the target type.
    pub fn validate(&self, graph: &ResourceGraph) -> Result<()> {
        for node in graph.nodes() {
            let schema = self.registry.require(&node.id)?;
            schema.validate(&node.id, &node.attributes)?;

            for (field, reference) in node.references() {
                let target_schema = self.registry.require(&reference.target)?;
                if !target_schema.is_output(&reference.field) {
                    return Err(KeelError::Schema(SchemaError::UnknownOutput {
                        consumer: node.id.to_string(),
                        field: field.to_string(),
                        target: reference.target.to_string(),
                        output: reference.field.clone(),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Computes the action for every declared and every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns a schema violation for invalid declarations, or a corruption
    /// error if a state record fails verification.
    pub fn compute_diff(&self, graph: &ResourceGraph, state: &StateSnapshot) -> Result<DiffResult> {
        state.verify()?;
        self.validate(graph)?;

        let mut actions: HashMap<ResourceId, StepAction> = HashMap::new();
        let mut steps = Vec::with_capacity(graph.len() + state.len());

        for id in graph.topological_order() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let schema = self.registry.require(id)?;
            let step = Self::diff_node(node, schema, state, &actions);
            debug!("{} -> {}", step.id, step.action);
            actions.insert(step.id.clone(), step.action);
            steps.push(step);
        }

        for record in state.records() {
            let id = record.id();
            if graph.contains(&id) {
                continue;
            }
            debug!("{id} is no longer declared");
            let mut step = PlanStep::new(StepAction::Delete, id, "no longer declared");
            step.provider_id = Some(record.provider_id.clone());
            steps.push(step);
        }

        Ok(DiffResult { steps })
    }

    fn diff_node(
        node: &ResourceNode,
        schema: &ResourceSchema,
        state: &StateSnapshot,
        actions: &HashMap<ResourceId, StepAction>,
    ) -> PlanStep {
        let resolved = Self::resolve(node, state, actions);

        let Some(record) = state.get(&node.id) else {
            let mut step = PlanStep::new(StepAction::Create, node.id.clone(), "not yet created");
            step.changes = resolved
                .iter()
                .map(|(field, value)| change(field, None, value, schema.forces_replace(field)))
                .collect();
            step.attributes = node.attributes.clone();
            return step;
        };

        let changes = Self::field_changes(schema, record, &resolved);
        let replaced_producers: Vec<&ResourceId> = node
            .references()
            .map(|(_, r)| &r.target)
            .filter(|target| {
                matches!(
                    actions.get(*target),
                    Some(StepAction::Create | StepAction::Replace)
                )
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let (action, reason) = if let Some(producer) = replaced_producers.first() {
            (
                StepAction::Replace,
                format!("referenced resource {producer} is being recreated"),
            )
        } else if let Some(forcing) = changes.iter().find(|c| c.forces_replace) {
            (
                StepAction::Replace,
                format!("'{}' forces replacement", forcing.field),
            )
        } else if changes.is_empty() {
            (StepAction::Noop, String::new())
        } else {
            let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
            (StepAction::Update, format!("changed: {}", fields.join(", ")))
        };

        let mut step = PlanStep::new(action, node.id.clone(), reason);
        step.changes = changes;
        step.provider_id = Some(record.provider_id.clone());
        step.attributes = node.attributes.clone();
        step
    }

    /// Resolves each declared attribute as far as possible before apply.
    fn resolve(
        node: &ResourceNode,
        state: &StateSnapshot,
        actions: &HashMap<ResourceId, StepAction>,
    ) -> Vec<(String, Resolved)> {
        node.attributes
            .iter()
            .map(|(field, value)| {
                let resolved = match value {
                    AttrValue::Literal(v) => Resolved::Known(v.clone()),
                    AttrValue::Reference(r) => match actions.get(&r.target) {
                        Some(StepAction::Create | StepAction::Replace) => Resolved::AfterApply,
                        _ => state
                            .get(&r.target)
                            .and_then(|producer| producer.outputs.get(&r.field))
                            .map_or(Resolved::Missing, |v| Resolved::Known(v.clone())),
                    },
                };
                (field.clone(), resolved)
            })
            .collect()
    }

    /// Compares resolved inputs against the last-applied inputs.
    fn field_changes(
        schema: &ResourceSchema,
        record: &StateRecord,
        resolved: &[(String, Resolved)],
    ) -> Vec<FieldChange> {
        let mut changes = Vec::new();

        for (field, value) in resolved {
            if schema.is_output(field) {
                continue;
            }
            let before = record.inputs.get(field);
            // Nothing known on either side: no evidence of a change.
            let unchanged = match value {
                Resolved::Known(v) => Some(v) == before,
                Resolved::Missing => before.is_none(),
                Resolved::AfterApply => false,
            };
            if !unchanged {
                changes.push(change(field, before, value, schema.forces_replace(field)));
            }
        }

        for (field, before) in &record.inputs {
            if schema.is_output(field) || resolved.iter().any(|(f, _)| f == field) {
                continue;
            }
            changes.push(FieldChange {
                field: field.clone(),
                before: Some(before.clone()),
                after: None,
                known_after_apply: false,
                forces_replace: schema.forces_replace(field),
            });
        }

        changes.sort_by(|a, b| a.field.cmp(&b.field));
        changes
    }
}

fn change(
    field: &str,
    before: Option<&serde_json::Value>,
    value: &Resolved,
    forces_replace: bool,
) -> FieldChange {
    let (after, known_after_apply) = match value {
        Resolved::Known(v) => (Some(v.clone()), false),
        Resolved::AfterApply | Resolved::Missing => (None, true),
    };
    FieldChange {
        field: field.to_string(),
        before: before.cloned(),
        after,
        known_after_apply,
        forces_replace,
    }
}

impl DiffResult {
    /// Number of steps with the given action.
    #[must_use]
    pub fn count(&self, action: StepAction) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    /// Action computed for a resource.
    #[must_use]
    pub fn action_for(&self, id: &ResourceId) -> Option<StepAction> {
        self.steps.iter().find(|s| &s.id == id).map(|s| s.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDecl;
    use crate::error::StateError;
    use crate::graph::{Attributes, GraphBuilder};
    use crate::registry::FieldSchema;
    use serde_json::json;

    const ROLE: &str = "aws:iam/Role";
    const FUNC: &str = "aws:lambda/Function";

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with_schema(
                ROLE,
                ResourceSchema::new()
                    .with_field("name", FieldSchema::required().force_replace())
                    .with_field("assume_role_policy", FieldSchema::required())
                    .with_field("arn", FieldSchema::output()),
            )
            .with_schema(
                FUNC,
                ResourceSchema::new()
                    .with_field("handler", FieldSchema::required())
                    .with_field("role", FieldSchema::required())
                    .with_field("runtime", FieldSchema::optional())
                    .with_field("arn", FieldSchema::output()),
            )
    }

    fn role_id() -> ResourceId {
        ResourceId::new(ROLE, "lambda_role")
    }

    fn func_id() -> ResourceId {
        ResourceId::new(FUNC, "test_pulumi")
    }

    fn graph(role_name: &str, handler: &str) -> ResourceGraph {
        let decls = vec![
            ResourceDecl::new(ROLE, "lambda_role")
                .with_attr("name", json!(role_name))
                .with_attr("assume_role_policy", json!("{}")),
            ResourceDecl::new(FUNC, "test_pulumi")
                .with_attr("handler", json!(handler))
                .with_attr("role", json!("${aws:iam/Role::lambda_role.arn}")),
        ];
        GraphBuilder::from_declarations(&decls)
            .expect("declarations should parse")
            .build()
            .expect("graph should build")
    }

    fn applied_state() -> StateSnapshot {
        let mut state = StateSnapshot::new("demo", "dev");
        state.upsert(StateRecord::new(
            &role_id(),
            "r-1",
            Attributes::from([
                (String::from("name"), json!("lambda_role")),
                (String::from("assume_role_policy"), json!("{}")),
            ]),
            Attributes::from([(String::from("arn"), json!("arn:r-1"))]),
            vec![],
        ));
        state.upsert(StateRecord::new(
            &func_id(),
            "f-1",
            Attributes::from([
                (String::from("handler"), json!("bootstrap")),
                (String::from("role"), json!("arn:r-1")),
            ]),
            Attributes::new(),
            vec![role_id().key()],
        ));
        state
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let registry = registry();
        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph("lambda_role", "bootstrap"), &StateSnapshot::new("demo", "dev"))
            .expect("diff should succeed");

        assert_eq!(diff.action_for(&role_id()), Some(StepAction::Create));
        assert_eq!(diff.action_for(&func_id()), Some(StepAction::Create));

        let func = diff.steps.iter().find(|s| s.id == func_id()).expect("func step");
        let role_change = func
            .changes
            .iter()
            .find(|c| c.field == "role")
            .expect("role change");
        assert!(role_change.known_after_apply);
    }

    #[test]
    fn test_unchanged_is_noop() {
        let registry = registry();
        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph("lambda_role", "bootstrap"), &applied_state())
            .expect("diff should succeed");

        assert_eq!(diff.count(StepAction::Noop), 2);
    }

    #[test]
    fn test_plain_field_change_is_update() {
        let registry = registry();
        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph("lambda_role", "main"), &applied_state())
            .expect("diff should succeed");

        assert_eq!(diff.action_for(&role_id()), Some(StepAction::Noop));
        assert_eq!(diff.action_for(&func_id()), Some(StepAction::Update));
    }

    #[test]
    fn test_force_replace_cascades_to_consumer() {
        let registry = registry();
        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph("renamed_role", "bootstrap"), &applied_state())
            .expect("diff should succeed");

        assert_eq!(diff.action_for(&role_id()), Some(StepAction::Replace));
        assert_eq!(diff.action_for(&func_id()), Some(StepAction::Replace));
    }

    #[test]
    fn test_output_only_fields_ignored() {
        let registry = registry();
        let mut state = applied_state();
        state.upsert(StateRecord::new(
            &role_id(),
            "r-1",
            Attributes::from([
                (String::from("name"), json!("lambda_role")),
                (String::from("assume_role_policy"), json!("{}")),
                (String::from("arn"), json!("arn:r-1")),
            ]),
            Attributes::from([(String::from("arn"), json!("arn:r-1"))]),
            vec![],
        ));

        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph("lambda_role", "bootstrap"), &state)
            .expect("diff should succeed");
        assert_eq!(diff.count(StepAction::Noop), 2);
    }

    #[test]
    fn test_removed_field_is_update() {
        let registry = registry();
        let mut state = applied_state();
        if let Some(record) = state.resources.remove(&func_id().key()) {
            let mut inputs = record.inputs.clone();
            inputs.insert(String::from("runtime"), json!("provided.al2"));
            state.upsert(StateRecord::new(
                &func_id(),
                record.provider_id,
                inputs,
                record.outputs,
                record.dependencies,
            ));
        }

        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph("lambda_role", "bootstrap"), &state)
            .expect("diff should succeed");
        assert_eq!(diff.action_for(&func_id()), Some(StepAction::Update));
    }

    #[test]
    fn test_undeclared_record_is_delete() {
        let registry = registry();
        let only_role = GraphBuilder::from_declarations(&[ResourceDecl::new(ROLE, "lambda_role")
            .with_attr("name", json!("lambda_role"))
            .with_attr("assume_role_policy", json!("{}"))])
        .expect("declarations should parse")
        .build()
        .expect("graph should build");

        let diff = DiffEngine::new(&registry)
            .compute_diff(&only_role, &applied_state())
            .expect("diff should succeed");

        assert_eq!(diff.action_for(&func_id()), Some(StepAction::Delete));
        let delete = diff.steps.iter().find(|s| s.id == func_id()).expect("step");
        assert_eq!(delete.provider_id.as_deref(), Some("f-1"));
    }

    #[test]
    fn test_schema_violations() {
        let registry = registry();
        let engine = DiffEngine::new(&registry);

        let unknown_field = GraphBuilder::from_declarations(&[ResourceDecl::new(ROLE, "r")
            .with_attr("name", json!("r"))
            .with_attr("assume_role_policy", json!("{}"))
            .with_attr("color", json!("blue"))])
        .expect("parse")
        .build()
        .expect("build");
        assert!(matches!(
            engine.validate(&unknown_field),
            Err(KeelError::Schema(SchemaError::UnknownField { .. }))
        ));

        let output_set = GraphBuilder::from_declarations(&[ResourceDecl::new(ROLE, "r")
            .with_attr("name", json!("r"))
            .with_attr("assume_role_policy", json!("{}"))
            .with_attr("arn", json!("arn:fake"))])
        .expect("parse")
        .build()
        .expect("build");
        assert!(matches!(
            engine.validate(&output_set),
            Err(KeelError::Schema(SchemaError::OutputOnlySet { .. }))
        ));

        let unknown_type = GraphBuilder::from_declarations(&[ResourceDecl::new("gcp:Bucket", "b")])
            .expect("parse")
            .build()
            .expect("build");
        assert!(matches!(
            engine.validate(&unknown_type),
            Err(KeelError::Schema(SchemaError::UnknownType { .. }))
        ));
    }

    #[test]
    fn test_reference_to_non_output_field() {
        let registry = registry();
        let decls = vec![
            ResourceDecl::new(ROLE, "lambda_role")
                .with_attr("name", json!("lambda_role"))
                .with_attr("assume_role_policy", json!("{}")),
            ResourceDecl::new(FUNC, "f")
                .with_attr("handler", json!("bootstrap"))
                .with_attr("role", json!("${aws:iam/Role::lambda_role.name}")),
        ];
        let graph = GraphBuilder::from_declarations(&decls)
            .expect("parse")
            .build()
            .expect("build");

        assert!(matches!(
            DiffEngine::new(&registry).validate(&graph),
            Err(KeelError::Schema(SchemaError::UnknownOutput { .. }))
        ));
    }

    #[test]
    fn test_corrupted_record_rejected() {
        let registry = registry();
        let mut state = applied_state();
        if let Some(record) = state.resources.get_mut(&role_id().key()) {
            record.inputs_hash = String::from("0000");
        }

        let err = DiffEngine::new(&registry)
            .compute_diff(&graph("lambda_role", "bootstrap"), &state)
            .expect_err("should be rejected");
        assert!(matches!(err, KeelError::State(StateError::Corrupted { .. })));
    }
    #[test]
    fn test_unknown_reference_on_both_sides_is_not_a_change() {
        let registry = registry();
        let mut state = StateSnapshot::new("demo", "dev");
        state.upsert(StateRecord::new(
            &role_id(),
            "r-1",
            Attributes::from([
                (String::from("name"), json!("lambda_role")),
                (String::from("assume_role_policy"), json!("{}")),
            ]),
            Attributes::new(),
            vec![],
        ));
        state.upsert(StateRecord::new(
            &func_id(),
            "f-1",
            Attributes::from([(String::from("handler"), json!("bootstrap"))]),
            Attributes::new(),
            vec![role_id().key()],
        ));

        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph("lambda_role", "bootstrap"), &state)
            .expect("diff");
        assert_eq!(diff.action_for(&func_id()), Some(StepAction::Noop));
    }
}
