// ============================================================================
// Linting
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![warn(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]
#![allow(clippy::module_name_repetitions)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Keel
//!
//! A declarative, idempotent resource-provisioning core.
//!
//! ## Overview
//!
//! Resources are declared in a YAML file. Attributes may reference outputs of
//! other resources with `${<type>::<name>.<field>}`; those references become
//! the edges of a dependency graph. Keel then:
//!
//! - Validates every resource against the schema of its type
//! - Diffs the desired graph against persisted state
//! - Schedules the resulting steps into waves that respect dependencies
//! - Applies wave after wave against a provider, with bounded concurrency,
//!   persisting each success before it counts
//!
//! ## Modules
//!
//! - [`registry`]: Resource type schemas
//! - [`graph`]: Reference parsing and the desired-state graph
//! - [`config`]: Configuration parsing, validation and hashing
//! - [`state`]: State snapshots and storage backends (local, S3)
//! - [`provider`]: Provider trait with HTTP and in-memory implementations
//! - [`planner`]: Diff engine, wave scheduler and apply executor
//! - [`engine`]: Run orchestration, refresh and drift detection
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: my-service
//!   environment: prod
//!
//! schemas:
//!   aws:iam/Role:
//!     fields:
//!       name: { required: true, force_replace: true }
//!       arn: { output_only: true }
//!
//! resources:
//!   - type: aws:iam/Role
//!     name: exec
//!     attributes:
//!       name: my-service-exec
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod registry;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig};
pub use engine::{ApplyOutcome, DriftReport, Engine, PlanOutcome, RefreshReport};
pub use error::{KeelError, Result};
pub use graph::{GraphBuilder, ResourceGraph, ResourceId};
pub use planner::{ApplyExecutor, ApplyReport, DiffEngine, ExecutionPlan, PlanScheduler, StepAction};
pub use provider::{HttpProvider, InMemoryProvider, Provider};
pub use registry::SchemaRegistry;
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
