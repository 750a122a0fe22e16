//! Planning and execution.
//!
//! The diff engine compares the resource graph with recorded state, the
//! scheduler partitions the resulting steps into waves, and the executor
//! applies those waves against a provider.

mod diff;
mod executor;
mod plan;
mod scheduler;

pub use diff::{DiffEngine, DiffResult};
pub use executor::{ApplyExecutor, ApplyReport, SkipReason, StepOutcome, StepState};
pub use plan::{ExecutionPlan, FieldChange, PlanStep, StepAction};
pub use scheduler::PlanScheduler;
