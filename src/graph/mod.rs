//! Desired-state graph.
//!
//! Declarations become [`ResourceNode`]s; every `${type::name.field}`
//! reference becomes a [`DependencyEdge`] from consumer to producer.

mod builder;
mod types;

pub use builder::{GraphBuilder, ResourceGraph};
pub(crate) use builder::topological_order;
pub use types::{AttrValue, Attributes, DependencyEdge, OutputRef, ResourceId, ResourceNode};
