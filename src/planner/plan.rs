//! Execution plan types.
//!
//! A plan is a list of waves. Every step in a wave depends only on steps in
//! earlier waves, so a wave's steps may run concurrently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::graph::{AttrValue, ResourceId};

/// What a step does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Resource has no record and will be created.
    Create,
    /// Resource will be changed in place.
    Update,
    /// Resource will be deleted and created again.
    Replace,
    /// Recorded resource is no longer declared and will be deleted.
    Delete,
    /// Nothing to do.
    Noop,
}

/// A single field-level change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    /// Attribute name.
    pub field: String,
    /// Last-applied value, if any.
    pub before: Option<serde_json::Value>,
    /// Desired value, if known before apply.
    pub after: Option<serde_json::Value>,
    /// The desired value comes from an output that only exists after apply.
    pub known_after_apply: bool,
    /// Changing this field forces replacement.
    pub forces_replace: bool,
}

/// One step of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    /// Action to perform.
    pub action: StepAction,
    /// Target resource.
    pub id: ResourceId,
    /// Field-level changes (Update and Replace; Create lists every field).
    pub changes: Vec<FieldChange>,
    /// Steps that must finish successfully first.
    pub dependencies: Vec<ResourceId>,
    /// Wave index.
    pub wave: usize,
    /// Why this action was chosen.
    pub reason: String,
    /// Provider ID of the existing resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Declared attributes, resolved at execution time. Empty for deletes.
    #[serde(skip)]
    pub attributes: BTreeMap<String, AttrValue>,
}

/// A complete wave-partitioned plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// Steps grouped by wave, in execution order.
    pub waves: Vec<Vec<PlanStep>>,
}

impl StepAction {
    /// Returns true if the step calls the provider.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::Noop)
    }

    /// Symbol used in plan listings.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::Noop => " ",
        }
    }
}

impl PlanStep {
    /// Creates a step with no changes, dependencies or wave yet.
    #[must_use]
    pub fn new(action: StepAction, id: ResourceId, reason: impl Into<String>) -> Self {
        Self {
            action,
            id,
            changes: Vec::new(),
            dependencies: Vec::new(),
            wave: 0,
            reason: reason.into(),
            provider_id: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Identities this step's resource references, deduplicated.
    #[must_use]
    pub fn referenced(&self) -> Vec<ResourceId> {
        let mut targets: Vec<ResourceId> = self
            .attributes
            .values()
            .filter_map(AttrValue::as_reference)
            .map(|r| r.target.clone())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Returns a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            StepAction::Create => format!("Create {}", self.id),
            StepAction::Update => format!("Update {} in place", self.id),
            StepAction::Replace => format!("Replace {}", self.id),
            StepAction::Delete => format!("Delete {}", self.id),
            StepAction::Noop => format!("No change for {}", self.id),
        }
    }
}

impl ExecutionPlan {
    /// Creates a plan from already-partitioned waves.
    #[must_use]
    pub fn new(config_hash: &str, waves: Vec<Vec<PlanStep>>) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            waves,
        }
    }

    /// All steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.waves.iter().flatten()
    }

    /// Finds the step for a resource.
    #[must_use]
    pub fn step(&self, id: &ResourceId) -> Option<&PlanStep> {
        self.steps().find(|s| &s.id == id)
    }

    /// Action planned for a resource.
    #[must_use]
    pub fn action_for(&self, id: &ResourceId) -> Option<StepAction> {
        self.step(id).map(|s| s.action)
    }

    /// Wave a resource's step is in.
    #[must_use]
    pub fn wave_of(&self, id: &ResourceId) -> Option<usize> {
        self.step(id).map(|s| s.wave)
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    /// Returns the number of waves.
    #[must_use]
    pub const fn wave_count(&self) -> usize {
        self.waves.len()
    }

    /// Number of steps with the given action.
    #[must_use]
    pub fn count(&self, action: StepAction) -> usize {
        self.steps().filter(|s| s.action == action).count()
    }

    /// Returns true if some step calls the provider.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.steps().any(|s| s.action.is_change())
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:>3} {}", self.action.symbol(), self.id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for FieldChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let render = |v: Option<&serde_json::Value>| {
            v.map_or_else(|| String::from("(none)"), ToString::to_string)
        };
        let after = if self.known_after_apply {
            String::from("(known after apply)")
        } else {
            render(self.after.as_ref())
        };
        write!(f, "{}: {} => {after}", self.field, render(self.before.as_ref()))?;
        if self.forces_replace {
            write!(f, " [forces replacement]")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(
            f,
            "Execution plan ({} steps in {} waves):",
            self.step_count(),
            self.wave_count()
        )?;
        for (i, wave) in self.waves.iter().enumerate() {
            writeln!(f, "  wave {i}:")?;
            for step in wave {
                writeln!(f, "    {step}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(action: StepAction, name: &str, wave: usize) -> PlanStep {
        let mut step = PlanStep::new(action, ResourceId::new("t", name), "");
        step.wave = wave;
        step
    }

    #[test]
    fn test_plan_queries() {
        let plan = ExecutionPlan::new(
            "hash",
            vec![
                vec![step(StepAction::Noop, "a", 0), step(StepAction::Create, "b", 0)],
                vec![step(StepAction::Replace, "c", 1)],
            ],
        );

        assert_eq!(plan.step_count(), 3);
        assert_eq!(plan.wave_count(), 2);
        assert_eq!(plan.count(StepAction::Create), 1);
        assert_eq!(plan.wave_of(&ResourceId::new("t", "c")), Some(1));
        assert_eq!(
            plan.action_for(&ResourceId::new("t", "a")),
            Some(StepAction::Noop)
        );
        assert!(plan.has_changes());
    }

    #[test]
    fn test_all_noop_plan_has_no_changes() {
        let plan = ExecutionPlan::new("hash", vec![vec![step(StepAction::Noop, "a", 0)]]);
        assert!(!plan.has_changes());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_field_change_display() {
        let change = FieldChange {
            field: String::from("name"),
            before: Some(serde_json::json!("old")),
            after: None,
            known_after_apply: true,
            forces_replace: true,
        };
        assert_eq!(
            change.to_string(),
            "name: \"old\" => (known after apply) [forces replacement]"
        );
    }
}
