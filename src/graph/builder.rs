//! Desired-state graph construction.
//!
//! Turns declarations into a validated DAG. Every reference becomes a
//! dependency edge; references to undeclared resources and cycles fail the
//! build before anything else happens.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::ResourceDecl;
use crate::error::{GraphError, KeelError, Result};

use super::types::{DependencyEdge, ResourceId, ResourceNode};

/// Collects declarations and validates them into a [`ResourceGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    /// Nodes in declaration order.
    nodes: Vec<ResourceNode>,
}

/// A validated, acyclic desired-state graph.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    /// Nodes by identity.
    nodes: BTreeMap<ResourceId, ResourceNode>,
    /// Consumer to producer edges.
    edges: BTreeSet<DependencyEdge>,
    /// Identities with every producer before its consumers.
    order: Vec<ResourceId>,
}

/// DFS colouring for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// On the current recursion stack.
    Visiting,
    /// Fully explored.
    Done,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Creates a builder from deploy-file declarations.
    ///
    /// # Errors
    ///
    /// Returns an error if a declaration holds a malformed reference.
    pub fn from_declarations(decls: &[ResourceDecl]) -> Result<Self> {
        let mut builder = Self::new();
        for decl in decls {
            builder.add_node(ResourceNode::from_decl(decl)?);
        }
        Ok(builder)
    }

    /// Adds a node.
    pub fn add_node(&mut self, node: ResourceNode) {
        self.nodes.push(node);
    }

    /// Adds a node, builder style.
    #[must_use]
    pub fn with_node(mut self, node: ResourceNode) -> Self {
        self.add_node(node);
        self
    }

    /// Validates the declarations and builds the graph.
    ///
    /// # Errors
    ///
    /// - [`GraphError::DuplicateResource`] if an identity is declared twice
    /// - [`GraphError::UnknownReference`] if a reference targets an
    ///   undeclared resource
    /// - [`GraphError::Cycle`] if the references form a cycle
    pub fn build(self) -> Result<ResourceGraph> {
        let mut nodes = BTreeMap::new();
        for node in self.nodes {
            if nodes.contains_key(&node.id) {
                return Err(KeelError::Graph(GraphError::DuplicateResource {
                    id: node.id.to_string(),
                }));
            }
            nodes.insert(node.id.clone(), node);
        }

        let mut edges = BTreeSet::new();
        for node in nodes.values() {
            for (field, reference) in node.references() {
                if !nodes.contains_key(&reference.target) {
                    return Err(KeelError::Graph(GraphError::UnknownReference {
                        consumer: node.id.to_string(),
                        field: field.to_string(),
                        target: reference.target.to_string(),
                    }));
                }
                edges.insert(DependencyEdge {
                    consumer: node.id.clone(),
                    producer: reference.target.clone(),
                });
            }
        }

        let producers = adjacency(&edges);
        let order = topological_order(nodes.keys(), &producers)?;

        debug!(
            "Built resource graph: {} nodes, {} edges",
            nodes.len(),
            edges.len()
        );

        Ok(ResourceGraph {
            nodes,
            edges,
            order,
        })
    }
}

/// Consumer to sorted producers.
fn adjacency(edges: &BTreeSet<DependencyEdge>) -> BTreeMap<ResourceId, Vec<ResourceId>> {
    let mut producers: BTreeMap<ResourceId, Vec<ResourceId>> = BTreeMap::new();
    for edge in edges {
        producers
            .entry(edge.consumer.clone())
            .or_default()
            .push(edge.producer.clone());
    }
    producers
}

/// Depth-first post-order over producers, failing on a back edge.
///
/// The returned order lists every producer before its consumers.
///
/// # Errors
///
/// Returns [`GraphError::Cycle`] with the offending path.
pub(crate) fn topological_order<'a, I>(
    ids: I,
    producers: &BTreeMap<ResourceId, Vec<ResourceId>>,
) -> Result<Vec<ResourceId>>
where
    I: IntoIterator<Item = &'a ResourceId>,
{
    let mut marks: BTreeMap<ResourceId, Mark> = BTreeMap::new();
    let mut order = Vec::new();

    for root in ids {
        if marks.contains_key(root) {
            continue;
        }

        // Explicit stack of (node, next producer index) keeps deep graphs
        // off the call stack. `path` mirrors the recursion stack.
        let mut stack: Vec<(ResourceId, usize)> = vec![(root.clone(), 0)];
        let mut path: Vec<ResourceId> = vec![root.clone()];
        marks.insert(root.clone(), Mark::Visiting);

        while let Some((current, next)) = stack.last_mut() {
            let deps = producers.get(current).map_or(&[][..], Vec::as_slice);

            if let Some(dep) = deps.get(*next) {
                *next += 1;
                match marks.get(dep) {
                    Some(Mark::Visiting) => {
                        let start = path.iter().position(|id| id == dep).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(ToString::to_string).collect();
                        cycle.push(dep.to_string());
                        return Err(KeelError::Graph(GraphError::Cycle { path: cycle }));
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(dep.clone(), Mark::Visiting);
                        path.push(dep.clone());
                        stack.push((dep.clone(), 0));
                    }
                }
            } else {
                let finished = current.clone();
                stack.pop();
                path.pop();
                marks.insert(finished.clone(), Mark::Done);
                order.push(finished);
            }
        }
    }

    Ok(order)
}

impl ResourceGraph {
    /// Looks up a node.
    #[must_use]
    pub fn node(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Returns true if the identity is declared.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    /// All nodes, ordered by identity.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// All dependency edges.
    #[must_use]
    pub const fn edges(&self) -> &BTreeSet<DependencyEdge> {
        &self.edges
    }

    /// Producers referenced by `id`.
    #[must_use]
    pub fn dependencies_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.edges
            .iter()
            .filter(|e| &e.consumer == id)
            .map(|e| &e.producer)
            .collect()
    }

    /// Consumers referencing `id`.
    #[must_use]
    pub fn dependents_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.edges
            .iter()
            .filter(|e| &e.producer == id)
            .map(|e| &e.consumer)
            .collect()
    }

    /// Identities with every producer before its consumers.
    #[must_use]
    pub fn topological_order(&self) -> &[ResourceId] {
        &self.order
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
