//! Entity graph: bodies are nodes, constraints are edges.
//!
//! An undirected multigraph over entities, partitioned into connected
//! components — the islands that are simulated in parallel. Nodes flagged
//! *non-connecting* (static, kinematic and external bodies) do not propagate
//! connectivity: two connecting nodes joined only through a non-connecting
//! node land in different components, while the non-connecting node itself is
//! pulled into every component that borders it.
//!
//! Indices are stable across insertion and removal of unrelated items;
//! removed indices are recycled. Component discovery walks nodes in insertion
//! order, which makes island splits reproducible for a given operation
//! sequence.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use skerry_types::{EdgeIndex, Entity, NodeIndex};

/// Errors from graph mutation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    /// A node index did not refer to a live node.
    #[error("node index {0:?} is not in the graph")]
    InvalidNode(NodeIndex),

    /// An edge index did not refer to a live edge.
    #[error("edge index {0:?} is not in the graph")]
    InvalidEdge(EdgeIndex),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    entity: Entity,
    non_connecting: bool,
    adjacency: Vec<EdgeIndex>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Edge {
    entity: Entity,
    nodes: [NodeIndex; 2],
}

/// One connected component of the graph: the connecting nodes discovered by
/// the walk, their non-connecting neighbors, and every edge incident to the
/// component's connecting nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectedComponent {
    /// Body entities, connecting nodes first in discovery order.
    pub nodes: Vec<Entity>,
    /// Constraint and manifold entities.
    pub edges: Vec<Entity>,
}

impl ConnectedComponent {
    /// Total number of resident entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }

    /// Whether the component is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// Undirected multigraph over entities with non-connecting node semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityGraph {
    nodes: Vec<Option<Node>>,
    node_free: Vec<u32>,
    edges: Vec<Option<Edge>>,
    edge_free: Vec<u32>,
    /// Live node indices in insertion order; the deterministic walk order.
    insertion_order: Vec<NodeIndex>,
}

impl EntityGraph {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.insertion_order.len()
    }

    /// Number of live edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.iter().filter(|e| e.is_some()).count()
    }

    fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.to_usize()).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, index: NodeIndex) -> Option<&mut Node> {
        self.nodes.get_mut(index.to_usize()).and_then(Option::as_mut)
    }

    fn edge(&self, index: EdgeIndex) -> Option<&Edge> {
        self.edges.get(index.to_usize()).and_then(Option::as_ref)
    }

    /// Insert a node for `entity`. Non-connecting nodes do not propagate
    /// connectivity.
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert_node(&mut self, entity: Entity, non_connecting: bool) -> NodeIndex {
        let node = Node {
            entity,
            non_connecting,
            adjacency: Vec::new(),
        };
        let index = match self.node_free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeIndex(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeIndex((self.nodes.len() - 1) as u32)
            }
        };
        self.insertion_order.push(index);
        index
    }

    /// Remove a node. Any remaining incident edges are removed as well.
    pub fn remove_node(&mut self, index: NodeIndex) {
        debug_assert!(self.node(index).is_some(), "removing a dead node");
        self.remove_all_edges(index);
        if let Some(slot) = self.nodes.get_mut(index.to_usize()) {
            if slot.take().is_some() {
                self.node_free.push(index.0);
                self.insertion_order.retain(|n| *n != index);
            }
        }
    }

    /// Entity stored at a node.
    #[must_use]
    pub fn node_entity(&self, index: NodeIndex) -> Option<Entity> {
        self.node(index).map(|n| n.entity)
    }

    /// Whether a node propagates connectivity.
    #[must_use]
    pub fn is_connecting_node(&self, index: NodeIndex) -> bool {
        self.node(index).is_some_and(|n| !n.non_connecting)
    }

    /// Insert an edge for `entity` between two live nodes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert_edge(
        &mut self,
        entity: Entity,
        node_a: NodeIndex,
        node_b: NodeIndex,
    ) -> Result<EdgeIndex, GraphError> {
        if self.node(node_a).is_none() {
            return Err(GraphError::InvalidNode(node_a));
        }
        if self.node(node_b).is_none() {
            return Err(GraphError::InvalidNode(node_b));
        }

        let edge = Edge {
            entity,
            nodes: [node_a, node_b],
        };
        let index = match self.edge_free.pop() {
            Some(slot) => {
                self.edges[slot as usize] = Some(edge);
                EdgeIndex(slot)
            }
            None => {
                self.edges.push(Some(edge));
                EdgeIndex((self.edges.len() - 1) as u32)
            }
        };

        if let Some(node) = self.node_mut(node_a) {
            node.adjacency.push(index);
        }
        if node_b != node_a {
            if let Some(node) = self.node_mut(node_b) {
                node.adjacency.push(index);
            }
        }
        Ok(index)
    }

    /// Remove an edge.
    pub fn remove_edge(&mut self, index: EdgeIndex) {
        let Some(edge) = self.edges.get_mut(index.to_usize()).and_then(Option::take) else {
            debug_assert!(false, "removing a dead edge");
            return;
        };
        self.edge_free.push(index.0);
        for node_index in edge.nodes {
            if let Some(node) = self.node_mut(node_index) {
                node.adjacency.retain(|e| *e != index);
            }
        }
    }

    /// Remove every edge incident to a node.
    pub fn remove_all_edges(&mut self, index: NodeIndex) {
        let incident = match self.node(index) {
            Some(node) => node.adjacency.clone(),
            None => return,
        };
        for edge in incident {
            self.remove_edge(edge);
        }
    }

    /// Visit every edge incident to a node.
    pub fn visit_edges(&self, index: NodeIndex, mut visit: impl FnMut(EdgeIndex)) {
        if let Some(node) = self.node(index) {
            for edge in &node.adjacency {
                visit(*edge);
            }
        }
    }

    /// Whether any edge joins the two nodes.
    #[must_use]
    pub fn has_adjacency(&self, a: NodeIndex, b: NodeIndex) -> bool {
        let Some(node) = self.node(a) else {
            return false;
        };
        node.adjacency.iter().any(|edge| {
            self.edge(*edge)
                .is_some_and(|e| e.nodes[0] == b || e.nodes[1] == b)
        })
    }

    /// Entity stored at an edge.
    #[must_use]
    pub fn edge_entity(&self, index: EdgeIndex) -> Option<Entity> {
        self.edge(index).map(|e| e.entity)
    }

    /// The node entities at an edge's endpoints.
    #[must_use]
    pub fn edge_node_entities(&self, index: EdgeIndex) -> Option<(Entity, Entity)> {
        let edge = self.edge(index)?;
        let a = self.node_entity(edge.nodes[0])?;
        let b = self.node_entity(edge.nodes[1])?;
        Some((a, b))
    }

    /// The node indices at an edge's endpoints.
    #[must_use]
    pub fn edge_nodes(&self, index: EdgeIndex) -> Option<(NodeIndex, NodeIndex)> {
        self.edge(index).map(|e| (e.nodes[0], e.nodes[1]))
    }

    /// Iterate live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, Entity)> + '_ {
        self.insertion_order
            .iter()
            .filter_map(|i| self.node(*i).map(|n| (*i, n.entity)))
    }

    /// Partition the graph into connected components.
    ///
    /// The walk seeds from connecting nodes in insertion order and only
    /// traverses *through* connecting nodes. Each discovered component then
    /// pulls in every adjacent non-connecting node, so a non-connecting node
    /// can appear in several components. Dangling non-connecting nodes
    /// (no connecting neighbor) appear in none.
    #[must_use]
    pub fn connected_components(&self) -> Vec<ConnectedComponent> {
        let mut components = Vec::new();
        let mut visited = vec![false; self.nodes.len()];
        // Stamp of the component that last included a node, so non-connecting
        // nodes are listed at most once per component.
        let mut included_in = vec![u32::MAX; self.nodes.len()];
        let mut edge_seen = vec![u32::MAX; self.edges.len()];

        #[allow(clippy::cast_possible_truncation)]
        for seed in &self.insertion_order {
            let Some(seed_node) = self.node(*seed) else {
                continue;
            };
            if seed_node.non_connecting || visited[seed.to_usize()] {
                continue;
            }

            let stamp = components.len() as u32;
            let mut component = ConnectedComponent::default();
            let mut queue = std::collections::VecDeque::new();

            visited[seed.to_usize()] = true;
            included_in[seed.to_usize()] = stamp;
            component.nodes.push(seed_node.entity);
            queue.push_back(*seed);

            while let Some(current) = queue.pop_front() {
                let Some(node) = self.node(current) else {
                    continue;
                };

                for edge_index in &node.adjacency {
                    let Some(edge) = self.edge(*edge_index) else {
                        continue;
                    };

                    if edge_seen[edge_index.to_usize()] != stamp {
                        edge_seen[edge_index.to_usize()] = stamp;
                        component.edges.push(edge.entity);
                    }

                    let other = if edge.nodes[0] == current {
                        edge.nodes[1]
                    } else {
                        edge.nodes[0]
                    };
                    let Some(other_node) = self.node(other) else {
                        continue;
                    };

                    if other_node.non_connecting {
                        if included_in[other.to_usize()] != stamp {
                            included_in[other.to_usize()] = stamp;
                            component.nodes.push(other_node.entity);
                        }
                    } else if !visited[other.to_usize()] {
                        visited[other.to_usize()] = true;
                        included_in[other.to_usize()] = stamp;
                        component.nodes.push(other_node.entity);
                        queue.push_back(other);
                    }
                }
            }

            components.push(component);
        }

        components
    }

    /// Cheap check used by split detection: whether all connecting nodes fall
    /// in one component. Vacuously true with no connecting nodes.
    #[must_use]
    pub fn is_single_connected_component(&self) -> bool {
        let mut total = 0usize;
        let mut first = None;
        for index in &self.insertion_order {
            if let Some(node) = self.node(*index) {
                if !node.non_connecting {
                    total += 1;
                    if first.is_none() {
                        first = Some(*index);
                    }
                }
            }
        }
        let Some(first) = first else {
            return true;
        };
        if total == 1 {
            return true;
        }

        let mut visited = vec![false; self.nodes.len()];
        let mut reached = 1usize;
        let mut queue = std::collections::VecDeque::new();
        visited[first.to_usize()] = true;
        queue.push_back(first);

        while let Some(current) = queue.pop_front() {
            let Some(node) = self.node(current) else {
                continue;
            };
            for edge_index in &node.adjacency {
                let Some(edge) = self.edge(*edge_index) else {
                    continue;
                };
                let other = if edge.nodes[0] == current {
                    edge.nodes[1]
                } else {
                    edge.nodes[0]
                };
                let Some(other_node) = self.node(other) else {
                    continue;
                };
                if other_node.non_connecting || visited[other.to_usize()] {
                    continue;
                }
                visited[other.to_usize()] = true;
                reached += 1;
                queue.push_back(other);
            }
        }

        reached == total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(index: u32) -> Entity {
        Entity::from_parts(index, 0)
    }

    #[test]
    fn test_insert_and_remove_node() {
        let mut graph = EntityGraph::new();
        let a = graph.insert_node(entity(1), false);
        let b = graph.insert_node(entity(2), false);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.node_entity(a), Some(entity(1)));

        graph.remove_node(a);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.node_entity(a), None);
        assert_eq!(graph.node_entity(b), Some(entity(2)));

        // Recycled index still points at the new node only.
        let c = graph.insert_node(entity(3), false);
        assert_eq!(c, a);
        assert_eq!(graph.node_entity(c), Some(entity(3)));
    }

    #[test]
    fn test_edges_and_adjacency() {
        let mut graph = EntityGraph::new();
        let a = graph.insert_node(entity(1), false);
        let b = graph.insert_node(entity(2), false);
        let c = graph.insert_node(entity(3), false);

        let e1 = graph.insert_edge(entity(10), a, b).unwrap();
        let e2 = graph.insert_edge(entity(11), a, b).unwrap(); // multigraph
        let _e3 = graph.insert_edge(entity(12), b, c).unwrap();

        assert!(graph.has_adjacency(a, b));
        assert!(graph.has_adjacency(b, c));
        assert!(!graph.has_adjacency(a, c));
        assert_eq!(graph.edge_node_entities(e1), Some((entity(1), entity(2))));

        let mut visited = Vec::new();
        graph.visit_edges(a, |e| visited.push(e));
        assert_eq!(visited, vec![e1, e2]);

        graph.remove_edge(e1);
        assert!(graph.has_adjacency(a, b), "second edge remains");
        graph.remove_edge(e2);
        assert!(!graph.has_adjacency(a, b));
    }

    #[test]
    fn test_insert_edge_rejects_dead_node() {
        let mut graph = EntityGraph::new();
        let a = graph.insert_node(entity(1), false);
        let b = graph.insert_node(entity(2), false);
        graph.remove_node(b);
        assert_eq!(
            graph.insert_edge(entity(10), a, b),
            Err(GraphError::InvalidNode(b))
        );
    }

    #[test]
    fn test_remove_node_removes_incident_edges() {
        let mut graph = EntityGraph::new();
        let a = graph.insert_node(entity(1), false);
        let b = graph.insert_node(entity(2), false);
        let e = graph.insert_edge(entity(10), a, b).unwrap();

        graph.remove_node(a);
        assert_eq!(graph.edge_entity(e), None);
        assert_eq!(graph.edge_count(), 0);

        let mut visited = Vec::new();
        graph.visit_edges(b, |e| visited.push(e));
        assert!(visited.is_empty());
    }

    #[test]
    fn test_two_components() {
        let mut graph = EntityGraph::new();
        let a = graph.insert_node(entity(1), false);
        let b = graph.insert_node(entity(2), false);
        let c = graph.insert_node(entity(3), false);
        let d = graph.insert_node(entity(4), false);
        graph.insert_edge(entity(10), a, b).unwrap();
        graph.insert_edge(entity(11), c, d).unwrap();

        let components = graph.connected_components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].nodes, vec![entity(1), entity(2)]);
        assert_eq!(components[1].nodes, vec![entity(3), entity(4)]);
        assert!(!graph.is_single_connected_component());
    }

    #[test]
    fn test_non_connecting_node_does_not_propagate() {
        // a — ground — b: two components, ground in both.
        let mut graph = EntityGraph::new();
        let a = graph.insert_node(entity(1), false);
        let ground = graph.insert_node(entity(2), true);
        let b = graph.insert_node(entity(3), false);
        graph.insert_edge(entity(10), a, ground).unwrap();
        graph.insert_edge(entity(11), b, ground).unwrap();

        let components = graph.connected_components();
        assert_eq!(components.len(), 2);
        assert!(components[0].nodes.contains(&entity(1)));
        assert!(components[0].nodes.contains(&entity(2)));
        assert!(components[1].nodes.contains(&entity(3)));
        assert!(components[1].nodes.contains(&entity(2)));
        assert!(!components[0].nodes.contains(&entity(3)));
        assert!(!graph.is_single_connected_component());
    }

    #[test]
    fn test_isolated_connecting_node_is_a_component() {
        let mut graph = EntityGraph::new();
        graph.insert_node(entity(1), false);
        let components = graph.connected_components();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].nodes, vec![entity(1)]);
        assert!(components[0].edges.is_empty());
        assert!(graph.is_single_connected_component());
    }

    #[test]
    fn test_dangling_non_connecting_node_in_no_component() {
        let mut graph = EntityGraph::new();
        graph.insert_node(entity(1), true);
        let components = graph.connected_components();
        assert!(components.is_empty());
        assert!(graph.is_single_connected_component());
    }

    #[test]
    fn test_component_walk_is_deterministic_by_insertion_order() {
        let build = || {
            let mut graph = EntityGraph::new();
            let n: Vec<_> = (0..6)
                .map(|i| graph.insert_node(entity(i), false))
                .collect();
            graph.insert_edge(entity(10), n[0], n[2]).unwrap();
            graph.insert_edge(entity(11), n[2], n[4]).unwrap();
            graph.insert_edge(entity(12), n[1], n[3]).unwrap();
            graph.insert_edge(entity(13), n[3], n[5]).unwrap();
            graph
        };

        let a = build().connected_components();
        let b = build().connected_components();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].nodes, vec![entity(0), entity(2), entity(4)]);
    }

    #[test]
    fn test_edges_assigned_to_their_component() {
        let mut graph = EntityGraph::new();
        let a = graph.insert_node(entity(1), false);
        let ground = graph.insert_node(entity(2), true);
        let b = graph.insert_node(entity(3), false);
        let ea = graph.insert_edge(entity(10), a, ground).unwrap();
        let eb = graph.insert_edge(entity(11), b, ground).unwrap();

        let components = graph.connected_components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].edges, vec![graph.edge_entity(ea).unwrap()]);
        assert_eq!(components[1].edges, vec![graph.edge_entity(eb).unwrap()]);
    }
}
