//! Resource graph construction.
//!
//! [`ResourceGraph::build`] turns an ordered list of declarations into a
//! directed acyclic graph whose edges run from a referencing resource to the
//! resource it references.

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

use super::declaration::ResourceDeclaration;
use crate::error::GraphError;

/// A reference edge between two resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    /// Id of the referencing resource.
    pub from: String,
    /// Id of the referenced resource.
    pub to: String,
    /// Property holding the reference.
    pub property: String,
}

/// All declarations of a stack plus the reference edges between them.
///
/// Serialized as the ordered list of declarations; deserializing rebuilds the
/// edges and re-runs every build check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<ResourceDeclaration>", into = "Vec<ResourceDeclaration>")]
pub struct ResourceGraph {
    declarations: Vec<ResourceDeclaration>,
    index: HashMap<String, NodeIndex>,
    graph: DiGraph<usize, String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

impl ResourceGraph {
    /// Builds a graph from declarations.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateId`] if two declarations share an id,
    /// [`GraphError::UnresolvedReference`] if a reference names an undeclared
    /// id, and [`GraphError::CyclicDependency`] if references form a cycle.
    pub fn build(declarations: Vec<ResourceDeclaration>) -> Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(declarations.len(), declarations.len());
        let mut index = HashMap::with_capacity(declarations.len());

        for (position, decl) in declarations.iter().enumerate() {
            if index.contains_key(&decl.id) {
                return Err(GraphError::DuplicateId {
                    id: decl.id.clone(),
                });
            }
            index.insert(decl.id.clone(), graph.add_node(position));
        }

        for decl in &declarations {
            let from = index[&decl.id];
            for (property, target) in decl.references() {
                let to = *index
                    .get(target)
                    .ok_or_else(|| GraphError::UnresolvedReference {
                        id: decl.id.clone(),
                        property: property.to_string(),
                        target: target.to_string(),
                    })?;
                graph.add_edge(from, to, property.to_string());
            }
        }

        let built = Self {
            declarations,
            index,
            graph,
        };

        if let Some(cycle) = built.find_cycle() {
            return Err(GraphError::CyclicDependency { cycle });
        }

        debug!(
            resources = built.len(),
            edges = built.graph.edge_count(),
            "Resource graph built"
        );
        Ok(built)
    }

    /// Returns a graph with no resources.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            declarations: Vec::new(),
            index: HashMap::new(),
            graph: DiGraph::new(),
        }
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Looks up a declaration by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceDeclaration> {
        self.index.get(id).map(|&node| self.decl(node))
    }

    /// Returns true if a resource with this id exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Declarations in their original order.
    #[must_use]
    pub fn declarations(&self) -> &[ResourceDeclaration] {
        &self.declarations
    }

    /// Consumes the graph and returns its declarations.
    #[must_use]
    pub fn into_declarations(self) -> Vec<ResourceDeclaration> {
        self.declarations
    }

    /// Every reference edge, in declaration order.
    #[must_use]
    pub fn edges(&self) -> Vec<Edge> {
        self.graph
            .edge_references()
            .map(|edge| Edge {
                from: self.decl(edge.source()).id.clone(),
                to: self.decl(edge.target()).id.clone(),
                property: edge.weight().clone(),
            })
            .collect()
    }

    /// Ids this resource references, in declaration order.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Ids of resources that reference this one, in declaration order.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Declarations ordered so every resource comes after the resources it
    /// references. Ties keep declaration order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&ResourceDeclaration> {
        let mut waiting: Vec<usize> = self
            .graph
            .node_indices()
            .map(|node| self.graph.edges_directed(node, Direction::Outgoing).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = waiting
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(position, _)| Reverse(position))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(position)) = ready.pop() {
            let node = NodeIndex::new(position);
            order.push(self.decl(node));
            for edge in self.graph.edges_directed(node, Direction::Incoming) {
                let dependent = edge.source().index();
                waiting[dependent] -= 1;
                if waiting[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        order
    }

    fn decl(&self, node: NodeIndex) -> &ResourceDeclaration {
        &self.declarations[self.graph[node]]
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&str> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(node, direction).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes.into_iter().map(|n| self.decl(n).id.as_str()).collect()
    }

    /// Depth-first search for a reference cycle. Returns the ids on the first
    /// cycle found, starting from the resource where the search entered it.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }

            marks[start.index()] = Mark::OnPath;
            let mut path = vec![start];
            let mut pending = vec![self.targets_in_visit_order(start)];

            while let Some(targets) = pending.last_mut() {
                if let Some(next) = targets.pop() {
                    match marks[next.index()] {
                        Mark::OnPath => {
                            let entry = path.iter().position(|&n| n == next).unwrap_or(0);
                            return Some(
                                path[entry..]
                                    .iter()
                                    .map(|&n| self.decl(n).id.clone())
                                    .collect(),
                            );
                        }
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::OnPath;
                            path.push(next);
                            pending.push(self.targets_in_visit_order(next));
                        }
                        Mark::Done => {}
                    }
                } else {
                    pending.pop();
                    if let Some(finished) = path.pop() {
                        marks[finished.index()] = Mark::Done;
                    }
                }
            }
        }
        None
    }

    /// Outgoing targets sorted so that popping yields declaration order.
    fn targets_in_visit_order(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut targets: Vec<NodeIndex> = self.graph.neighbors(node).collect();
        targets.sort_unstable_by(|a, b| b.cmp(a));
        targets.dedup();
        targets
    }
}

impl Default for ResourceGraph {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for ResourceGraph {
    fn eq(&self, other: &Self) -> bool {
        self.declarations == other.declarations
    }
}

impl Eq for ResourceGraph {}

impl TryFrom<Vec<ResourceDeclaration>> for ResourceGraph {
    type Error = GraphError;

    fn try_from(declarations: Vec<ResourceDeclaration>) -> Result<Self, Self::Error> {
        Self::build(declarations)
    }
}

impl From<ResourceGraph> for Vec<ResourceDeclaration> {
    fn from(graph: ResourceGraph) -> Self {
        graph.declarations
    }
}
