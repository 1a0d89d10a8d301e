//! DAG validation.
//!
//! A graph passes when every edge endpoint is one of its vertices and the
//! edges contain no directed cycle. The check peels zero in-degree vertices
//! (Kahn's algorithm) off an in-memory snapshot. It never reads the store
//! mid-computation and never touches vertices or edges.

use crate::error::{DagError, DagResult};
use crate::storage::GraphStore;
use crate::types::{GraphId, VertexId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;

/// Why a topology is not a DAG
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// An edge names a vertex outside the vertex set
    UnknownEndpoint(VertexId),
    /// Peeling stopped with these vertices left; each lies on or behind a cycle
    Cycle(Vec<VertexId>),
}

/// Order the vertices so every edge points forward.
///
/// Ties between zero in-degree vertices go to the lowest id, so the order is
/// deterministic. Runs in O(V + E).
pub fn topological_order(
    vertices: &BTreeSet<VertexId>,
    edges: &[(VertexId, VertexId)],
) -> Result<Vec<VertexId>, Rejection> {
    let mut in_degree: BTreeMap<VertexId, usize> = vertices.iter().map(|&v| (v, 0)).collect();
    let mut outgoing: BTreeMap<VertexId, Vec<VertexId>> = BTreeMap::new();

    for &(tail, head) in edges {
        for endpoint in [tail, head] {
            if !vertices.contains(&endpoint) {
                return Err(Rejection::UnknownEndpoint(endpoint));
            }
        }
        if let Some(degree) = in_degree.get_mut(&head) {
            *degree += 1;
        }
        outgoing.entry(tail).or_default().push(head);
    }

    let mut queue: BinaryHeap<Reverse<VertexId>> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&v, _)| Reverse(v))
        .collect();
    let mut order = Vec::with_capacity(vertices.len());

    while let Some(Reverse(vertex)) = queue.pop() {
        order.push(vertex);

        for head in outgoing.get(&vertex).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(head) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push(Reverse(*head));
                }
            }
        }
    }

    if order.len() < vertices.len() {
        let remaining = in_degree
            .into_iter()
            .filter(|&(_, degree)| degree > 0)
            .map(|(v, _)| v)
            .collect();
        return Err(Rejection::Cycle(remaining));
    }

    Ok(order)
}

/// True iff the edges only reference known vertices and form no cycle.
pub fn is_dag(vertices: &BTreeSet<VertexId>, edges: &[(VertexId, VertexId)]) -> bool {
    topological_order(vertices, edges).is_ok()
}

/// Validates stored graphs and records the verdict on the graph.
pub struct Validator {
    store: Arc<dyn GraphStore>,
}

impl Validator {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Validate a graph, returning the verdict.
    ///
    /// Store failures and a concurrent topology change are errors; a graph
    /// that is not a DAG is `Ok(false)`.
    pub fn validate(&self, graph_id: GraphId) -> DagResult<bool> {
        match self.check(graph_id) {
            Ok(_) => Ok(true),
            Err(DagError::CycleDetected { .. }) | Err(DagError::UnknownEndpoint { .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Validate a graph, returning its topological order or the reason it
    /// was rejected.
    pub fn check(&self, graph_id: GraphId) -> DagResult<Vec<VertexId>> {
        let topology = self.store.fetch_topology(graph_id)?;
        let verdict = topological_order(&topology.vertices, &topology.edges);

        let applied = self
            .store
            .record_verdict(graph_id, topology.revision, verdict.is_ok())?;
        if !applied {
            tracing::warn!(
                "Graph {} changed during validation (checked revision {})",
                graph_id,
                topology.revision
            );
            return Err(DagError::TopologyChanged(graph_id));
        }

        match verdict {
            Ok(order) => {
                tracing::info!(
                    "Graph {} validated: {} vertices, {} edges",
                    graph_id,
                    topology.vertices.len(),
                    topology.edges.len()
                );
                Ok(order)
            }
            Err(Rejection::Cycle(remaining)) => {
                tracing::warn!("Graph {} rejected: cycle through {:?}", graph_id, remaining);
                Err(DagError::CycleDetected {
                    graph: graph_id,
                    remaining,
                })
            }
            Err(Rejection::UnknownEndpoint(vertex)) => {
                tracing::warn!("Graph {} rejected: unknown vertex {}", graph_id, vertex);
                Err(DagError::UnknownEndpoint {
                    graph: graph_id,
                    vertex,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RedbGraphStore;
    use crate::types::InputSpec;
    use tempfile::TempDir;

    const A: VertexId = VertexId(1);
    const B: VertexId = VertexId(2);
    const C: VertexId = VertexId(3);
    const D: VertexId = VertexId(4);

    fn abcd() -> BTreeSet<VertexId> {
        [A, B, C, D].into_iter().collect()
    }

    #[test]
    fn test_acyclic_graph_passes() {
        let edges = [(A, B), (A, C), (C, B), (B, D)];
        assert!(is_dag(&abcd(), &edges));
        assert_eq!(topological_order(&abcd(), &edges).unwrap(), vec![A, C, B, D]);
    }

    #[test]
    fn test_cycle_fails() {
        // A -> C -> B -> A
        let edges = [(B, A), (A, C), (C, B), (B, D)];
        assert!(!is_dag(&abcd(), &edges));
        assert_eq!(
            topological_order(&abcd(), &edges),
            Err(Rejection::Cycle(vec![A, B, C, D]))
        );
    }

    #[test]
    fn test_multiple_sinks_pass() {
        assert!(is_dag(&abcd(), &[(B, A), (A, C), (B, C), (B, D)]));
    }

    #[test]
    fn test_multiple_sources_pass() {
        assert!(is_dag(&abcd(), &[(A, B), (A, C), (C, B), (D, B)]));
    }

    #[test]
    fn test_self_loop_fails() {
        let vertices: BTreeSet<VertexId> = [A].into_iter().collect();
        assert!(!is_dag(&vertices, &[(A, A)]));
        assert!(!is_dag(&abcd(), &[(A, B), (C, C)]));
    }

    #[test]
    fn test_empty_and_disconnected_graphs_pass() {
        assert!(is_dag(&BTreeSet::new(), &[]));
        assert!(is_dag(&abcd(), &[(A, B), (C, D)]));
        assert!(is_dag(&abcd(), &[]));
    }

    #[test]
    fn test_unknown_endpoint_fails() {
        let vertices: BTreeSet<VertexId> = [A, B].into_iter().collect();
        assert_eq!(
            topological_order(&vertices, &[(A, B), (B, VertexId(42))]),
            Err(Rejection::UnknownEndpoint(VertexId(42)))
        );
    }

    fn store_with_graph(edges: &[(usize, usize)]) -> (TempDir, Arc<RedbGraphStore>, GraphId) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RedbGraphStore::new(temp_dir.path().join("dagrun.redb")).unwrap());
        let graph = store.create_graph("g", None).unwrap();
        let ids: Vec<VertexId> = ["A", "B", "C", "D"]
            .iter()
            .map(|name| {
                store
                    .add_vertex(graph.id, name, InputSpec::default(), "true")
                    .unwrap()
                    .id
            })
            .collect();
        for &(tail, head) in edges {
            store.add_edge(graph.id, ids[tail], ids[head]).unwrap();
        }
        (temp_dir, store, graph.id)
    }

    #[test]
    fn test_validator_marks_graph() {
        let (_dir, store, graph_id) = store_with_graph(&[(0, 1), (0, 2), (2, 1), (1, 3)]);
        let validator = Validator::new(store.clone());

        assert!(validator.validate(graph_id).unwrap());
        assert!(store.get_graph(graph_id).unwrap().unwrap().validated);

        // Unchanged topology, same verdict
        assert!(validator.validate(graph_id).unwrap());
        assert!(store.get_graph(graph_id).unwrap().unwrap().validated);
    }

    #[test]
    fn test_validator_rejects_cycle() {
        let (_dir, store, graph_id) = store_with_graph(&[(1, 0), (0, 2), (2, 1), (1, 3)]);
        let validator = Validator::new(store.clone());

        assert!(!validator.validate(graph_id).unwrap());
        assert!(!validator.validate(graph_id).unwrap());
        assert!(!store.get_graph(graph_id).unwrap().unwrap().validated);

        let err = validator.check(graph_id).unwrap_err();
        assert!(matches!(err, DagError::CycleDetected { .. }));
    }

    #[test]
    fn test_edit_after_validation_clears_flag() {
        let (_dir, store, graph_id) = store_with_graph(&[(0, 1)]);
        let validator = Validator::new(store.clone());
        assert!(validator.validate(graph_id).unwrap());

        let vertices = store.list_vertices(graph_id).unwrap();
        store.add_edge(graph_id, vertices[1].id, vertices[0].id).unwrap();
        assert!(!store.get_graph(graph_id).unwrap().unwrap().validated);
        assert!(!validator.validate(graph_id).unwrap());
    }

    #[test]
    fn test_missing_graph_is_an_error() {
        let (_dir, store, _) = store_with_graph(&[]);
        let validator = Validator::new(store);
        assert!(matches!(
            validator.validate(GraphId(77)),
            Err(DagError::GraphNotFound(_))
        ));
    }
}
