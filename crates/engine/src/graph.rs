//! The resolved dependency graph.
//!
//! Nodes are resources with their compiled properties; an edge `A -> B` means
//! A must exist before B. A [`DependencyGraph`] can only be built acyclic.

use indexmap::{IndexMap, IndexSet};

use crate::{
    error::TemplateError,
    model::ResourceNode,
    resolve::Expr,
    scheduler::{self, DependencyMap, WorkQueue},
};

/// A resource with its references resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub resource: ResourceNode,
    pub properties: IndexMap<String, Expr>,
    /// Explicit `DependsOn` entries plus every resource referenced by a property.
    pub dependencies: IndexSet<String>,
}

impl GraphNode {
    pub fn logical_id(&self) -> &str {
        &self.resource.logical_id
    }

    pub fn resource_type(&self) -> &str {
        &self.resource.resource_type
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: IndexMap<String, GraphNode>,
    creation_order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph, rejecting reference cycles.
    pub fn build(nodes: Vec<GraphNode>) -> Result<Self, TemplateError> {
        let mut by_id = IndexMap::with_capacity(nodes.len());
        for node in nodes {
            let logical_id = node.logical_id().to_string();
            if by_id.insert(logical_id.clone(), node).is_some() {
                return Err(TemplateError::malformed(format!("duplicate resource '{logical_id}'")));
            }
        }
        for node in by_id.values() {
            if let Some(missing) = node.dependencies.iter().find(|dependency| !by_id.contains_key(*dependency)) {
                return Err(TemplateError::unresolved(missing, format!("resource '{}'", node.logical_id())));
            }
        }

        let dependencies = dependency_map(&by_id);
        let creation_order = scheduler::creation_order(&dependencies)?;
        Ok(Self {
            nodes: by_id,
            creation_order,
        })
    }

    pub fn get(&self, logical_id: &str) -> Option<&GraphNode> {
        self.nodes.get(logical_id)
    }

    pub fn contains(&self, logical_id: &str) -> bool {
        self.nodes.contains_key(logical_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn dependency_map(&self) -> DependencyMap {
        dependency_map(&self.nodes)
    }

    /// Transitive dependents of a node.
    pub fn dependents_of(&self, logical_id: &str) -> IndexSet<String> {
        scheduler::transitive_dependents(&self.dependency_map(), logical_id)
    }

    pub fn creation_order(&self) -> &[String] {
        &self.creation_order
    }

    pub fn deletion_order(&self) -> Vec<String> {
        self.creation_order.iter().rev().cloned().collect()
    }

    /// Scheduler for provisioning this graph.
    pub fn creation_queue(&self) -> WorkQueue {
        WorkQueue::with_order(&self.creation_order, &self.dependency_map())
    }

    /// `(prerequisite, dependent)` pairs in declaration order.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.nodes
            .values()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .map(move |dependency| (dependency.clone(), node.logical_id().to_string()))
            })
            .collect()
    }
}

fn dependency_map(nodes: &IndexMap<String, GraphNode>) -> DependencyMap {
    nodes
        .iter()
        .map(|(id, node)| (id.clone(), node.dependencies.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use strata_types::DeletionPolicy;

    fn node(id: &str, index: usize, dependencies: &[&str]) -> GraphNode {
        GraphNode {
            resource: ResourceNode {
                logical_id: id.into(),
                resource_type: "AWS::EC2::SecurityGroup".into(),
                properties: Map::new(),
                depends_on: Vec::new(),
                declaration_index: index,
                deletion_policy: DeletionPolicy::Delete,
            },
            properties: IndexMap::new(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn two_resource_reference_orders_target_first() {
        let graph = DependencyGraph::build(vec![node("B", 0, &["A"]), node("A", 1, &[])]).unwrap();
        assert_eq!(graph.creation_order(), &["A".to_string(), "B".to_string()]);
        assert_eq!(graph.deletion_order(), vec!["B".to_string(), "A".to_string()]);
        assert_eq!(graph.edges(), vec![("A".to_string(), "B".to_string())]);
    }

    #[test]
    fn rejects_cycles_and_dangling_edges() {
        let error = DependencyGraph::build(vec![node("A", 0, &["B"]), node("B", 1, &["A"])]).unwrap_err();
        assert!(matches!(error, TemplateError::CyclicDependency { .. }));

        let error = DependencyGraph::build(vec![node("A", 0, &["Ghost"])]).unwrap_err();
        assert!(matches!(error, TemplateError::UnresolvedReference { .. }));
    }

    #[test]
    fn dependents_are_transitive() {
        let graph = DependencyGraph::build(vec![node("A", 0, &[]), node("B", 1, &["A"]), node("C", 2, &["B"]), node("D", 3, &[])]).unwrap();
        let dependents: Vec<String> = graph.dependents_of("A").into_iter().collect();
        assert_eq!(dependents, vec!["B", "C"]);
        assert!(graph.dependents_of("D").is_empty());
    }
}
