//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::engine::{ApplyOutcome, DriftReport, PlanOutcome, RefreshReport};
use crate::planner::{ExecutionPlan, StepAction, StepState};
use crate::state::StateSnapshot;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "Wave")]
    wave: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Wave")]
    wave: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Time")]
    time: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, outcome: &PlanOutcome, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outcome).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = Self::format_refresh(&outcome.refresh);
                output.push_str(&Self::format_plan_text(&outcome.plan, detailed));
                output
            }
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ExecutionPlan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nExecution Plan");
        let _ = write!(
            output,
            "   Config hash: {}\n\n",
            Self::truncate(&plan.config_hash, 8)
        );

        let rows: Vec<PlanStepRow> = plan
            .steps()
            .filter(|s| s.action.is_change())
            .map(|s| PlanStepRow {
                wave: s.wave,
                action: Self::format_action(s.action),
                resource: s.id.to_string(),
                reason: Self::truncate(&s.reason, 50),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for step in plan.steps().filter(|s| !s.changes.is_empty()) {
                let _ = writeln!(output, "  {} {}", step.action.symbol(), step.id);
                for change in &step.changes {
                    let _ = writeln!(output, "      {change}");
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged ({} waves)\n",
            plan.count(StepAction::Create).to_string().green(),
            plan.count(StepAction::Update).to_string().yellow(),
            plan.count(StepAction::Replace).to_string().yellow(),
            plan.count(StepAction::Delete).to_string().red(),
            plan.count(StepAction::Noop),
            plan.wave_count()
        );

        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_apply(&self, outcome: &ApplyOutcome) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outcome).unwrap_or_default(),
            OutputFormat::Text => {
                let report = &outcome.report;
                let mut output = String::new();

                let rows: Vec<OutcomeRow> = report
                    .outcomes
                    .iter()
                    .filter(|o| o.action.is_change() || o.state != StepState::Succeeded)
                    .map(|o| OutcomeRow {
                        wave: o.wave,
                        action: Self::format_action(o.action),
                        resource: o.id.to_string(),
                        result: Self::format_state_cell(&o.state),
                        time: format!("{}ms", o.duration_ms),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let status = if report.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else if report.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply failed", "✗".red())
                };
                let _ = writeln!(output, "\n{status}: {}", report.summary());
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected - state is converged.\n", "✓".green());
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for id in &report.refresh.removed {
                    let _ = writeln!(output, "   - {id}: {}", "missing on provider".red());
                }
                for id in &report.refresh.drifted {
                    let _ = writeln!(output, "   - {id}: {}", "changed outside of keel".yellow());
                }
                for id in &report.refresh.adopted {
                    let _ = writeln!(output, "   - {id}: exists but was not recorded");
                }
                for (id, action) in &report.pending {
                    let _ = writeln!(output, "   - {id}: pending {}", Self::format_action(*action));
                }
                let _ = write!(
                    output,
                    "\n{} declared resources checked.\n",
                    report.total_resources
                );
                output
            }
        }
    }

    /// Formats the stored state.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => state.to_json().unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    state.project, state.environment
                );
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(
                    output,
                    "   Config hash: {}",
                    Self::truncate(&state.config_hash, 8)
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} changed)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the recorded resources as a table.
    #[must_use]
    pub fn format_resources(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => {
                let keys: Vec<&String> = state.resources.keys().collect();
                serde_json::to_string_pretty(&keys).unwrap_or_default()
            }
            OutputFormat::Text => {
                if state.is_empty() {
                    return String::from("No resources recorded.\n");
                }
                let rows: Vec<ResourceRow> = state
                    .records()
                    .map(|r| ResourceRow {
                        resource: r.id().to_string(),
                        provider_id: Self::truncate(&r.provider_id, 24),
                        dependencies: r.dependencies.join(", "),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    fn format_refresh(report: &RefreshReport) -> String {
        if report.is_clean() {
            String::new()
        } else {
            format!("{} Refreshed state: {report}\n", "⚠".yellow())
        }
    }

    /// Formats an action with color.
    fn format_action(action: StepAction) -> String {
        let label = format!("{}{action}", action.symbol().trim());
        match action {
            StepAction::Create => label.green().to_string(),
            StepAction::Update | StepAction::Replace => label.yellow().to_string(),
            StepAction::Delete => label.red().to_string(),
            StepAction::Noop => label.dimmed().to_string(),
        }
    }

    fn format_state_cell(state: &StepState) -> String {
        match state {
            StepState::Succeeded => "ok".green().to_string(),
            StepState::Failed { error } => {
                format!("{} {}", "failed:".red(), Self::truncate(error, 60))
            }
            StepState::Skipped { .. } => state.to_string().yellow().to_string(),
            StepState::Pending | StepState::InFlight => state.to_string().dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}
