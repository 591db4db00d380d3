//! Dependency graph of resource descriptors.
//!
//! Edges point from a predecessor to the resource that must be created after
//! it. They come from two places: the explicit `depends_on` list, and the
//! output references held by a resource's inputs (a container naming an
//! image digest or a network name depends on that image or network).

use crate::types::{is_valid_object_name, Attribute, Reference, Resource, ResourceKind};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate resource name: {0}")]
    Duplicate(String),

    #[error("Resource '{resource}' depends on unknown resource '{target}'")]
    UnknownDependency { resource: String, target: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid name '{name}' for resource '{resource}'")]
    InvalidName { resource: String, name: String },

    /// `add` only links to resources already present, so a graph built
    /// through it is acyclic; the sort still reports one rather than panic.
    #[error("Dependency cycle involving resource '{0}'")]
    Cycle(String),

    #[error("Output '{attribute}' of resource '{resource}' is not available")]
    UnresolvedOutput {
        resource: String,
        attribute: Attribute,
    },
}

impl From<Reference> for GraphError {
    fn from(reference: Reference) -> Self {
        GraphError::UnresolvedOutput {
            resource: reference.resource,
            attribute: reference.attribute,
        }
    }
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Why one resource follows another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edge {
    /// Listed in `depends_on`
    DependsOn,
    /// An input references an output of the predecessor
    Reference(Attribute),
}

#[derive(Debug, Default)]
pub struct ResourceGraph {
    graph: DiGraph<Resource, Edge>,
    index: HashMap<String, NodeIndex>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource. Every resource it depends on must already be present.
    pub fn add(&mut self, resource: Resource) -> GraphResult<()> {
        if self.index.contains_key(&resource.name) {
            return Err(GraphError::Duplicate(resource.name));
        }
        validate_names(&resource)?;

        let mut edges = Vec::new();
        for target in &resource.depends_on {
            edges.push((self.predecessor(&resource.name, target)?, Edge::DependsOn));
        }
        for reference in resource.references() {
            edges.push((
                self.predecessor(&resource.name, &reference.resource)?,
                Edge::Reference(reference.attribute),
            ));
        }

        let name = resource.name.clone();
        let node = self.graph.add_node(resource);
        for (from, edge) in edges {
            self.graph.update_edge(from, node, edge);
        }
        self.index.insert(name, node);
        Ok(())
    }

    fn predecessor(&self, resource: &str, target: &str) -> GraphResult<NodeIndex> {
        self.index
            .get(target)
            .copied()
            .ok_or_else(|| GraphError::UnknownDependency {
                resource: resource.to_string(),
                target: target.to_string(),
            })
    }

    pub fn get(&self, name: &str) -> GraphResult<&Resource> {
        let node = self
            .index
            .get(name)
            .ok_or_else(|| GraphError::NotFound(name.to_string()))?;
        Ok(&self.graph[*node])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Resources in insertion order
    pub fn resources(&self) -> Vec<&Resource> {
        self.graph.node_weights().collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Direct predecessors of `name`, explicit and implicit, in insertion order
    pub fn dependencies_of(&self, name: &str) -> GraphResult<Vec<String>> {
        let node = self
            .index
            .get(name)
            .ok_or_else(|| GraphError::NotFound(name.to_string()))?;

        let mut preds: Vec<NodeIndex> = self
            .graph
            .edges_directed(*node, Direction::Incoming)
            .map(|edge| edge.source())
            .collect();
        preds.sort();
        preds.dedup();
        Ok(preds
            .into_iter()
            .map(|idx| self.graph[idx].name.clone())
            .collect())
    }

    /// Whether `from` must be created before `to`, directly or transitively
    pub fn precedes(&self, from: &str, to: &str) -> GraphResult<bool> {
        let from = *self
            .index
            .get(from)
            .ok_or_else(|| GraphError::NotFound(from.to_string()))?;
        let to = *self
            .index
            .get(to)
            .ok_or_else(|| GraphError::NotFound(to.to_string()))?;
        Ok(from != to && petgraph::algo::has_path_connecting(&self.graph, from, to, None))
    }

    /// A valid creation order
    pub fn topological_order(&self) -> GraphResult<Vec<String>> {
        Ok(self
            .layers()?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Resources grouped into waves; every predecessor of a resource sits in
    /// an earlier wave, so members of one wave are mutually independent.
    pub fn layers(&self) -> GraphResult<Vec<Vec<String>>> {
        let order = toposort(&self.graph, None)
            .map_err(|cycle| GraphError::Cycle(self.graph[cycle.node_id()].name.clone()))?;

        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for node in &order {
            let level = self
                .graph
                .neighbors_directed(*node, Direction::Incoming)
                .map(|pred| depth[&pred] + 1)
                .max()
                .unwrap_or(0);
            depth.insert(*node, level);
        }

        let count = depth.values().max().map_or(0, |max| max + 1);
        let mut layers = vec![Vec::new(); count];
        for node in self.graph.node_indices() {
            layers[depth[&node]].push(self.graph[node].name.clone());
        }
        Ok(layers)
    }
}

fn validate_names(resource: &Resource) -> GraphResult<()> {
    let object_name = match &resource.kind {
        ResourceKind::Network(network) => Some(&network.name),
        ResourceKind::Container(container) => Some(&container.name),
        _ => None,
    };

    match object_name {
        Some(name) if !is_valid_object_name(name) => Err(GraphError::InvalidName {
            resource: resource.name.clone(),
            name: name.clone(),
        }),
        _ => Ok(()),
    }
}
