use crate::types::{Topology, VertexId};
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

/// Directed view of a graph's topology
pub struct Dag {
    graph: DiGraphMap<VertexId, ()>,
}

impl Dag {
    /// Build the view from a topology snapshot
    pub fn from_topology(topology: &Topology) -> Self {
        let mut graph = DiGraphMap::new();

        for &vertex in &topology.vertices {
            graph.add_node(vertex);
        }
        for &(tail, head) in &topology.edges {
            graph.add_edge(tail, head, ());
        }

        Self { graph }
    }

    pub fn contains(&self, vertex: VertexId) -> bool {
        self.graph.contains_node(vertex)
    }

    /// Vertices with an edge into `vertex`, ascending
    pub fn predecessors(&self, vertex: VertexId) -> Vec<VertexId> {
        self.neighbors(vertex, Direction::Incoming)
    }

    /// Vertices `vertex` has an edge to, ascending
    pub fn successors(&self, vertex: VertexId) -> Vec<VertexId> {
        self.neighbors(vertex, Direction::Outgoing)
    }

    fn neighbors(&self, vertex: VertexId, direction: Direction) -> Vec<VertexId> {
        if !self.contains(vertex) {
            return Vec::new();
        }
        let mut found: Vec<VertexId> = self.graph.neighbors_directed(vertex, direction).collect();
        found.sort();
        found.dedup();
        found
    }

    pub fn in_degree(&self, vertex: VertexId) -> usize {
        self.predecessors(vertex).len()
    }

    /// Vertices with no incoming edge (possible start vertices)
    pub fn sources(&self) -> Vec<VertexId> {
        let mut sources: Vec<VertexId> = self
            .graph
            .nodes()
            .filter(|&v| self.in_degree(v) == 0)
            .collect();
        sources.sort();
        sources
    }

    /// Vertices with no outgoing edge
    pub fn sinks(&self) -> Vec<VertexId> {
        let mut sinks: Vec<VertexId> = self
            .graph
            .nodes()
            .filter(|&v| self.successors(v).is_empty())
            .collect();
        sinks.sort();
        sinks
    }

    /// `start` and every vertex reachable from it
    pub fn reachable_from(&self, start: VertexId) -> BTreeSet<VertexId> {
        let mut reachable = BTreeSet::new();
        if !self.contains(start) {
            return reachable;
        }

        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(vertex) = dfs.next(&self.graph) {
            reachable.insert(vertex);
        }
        reachable
    }

    /// Every vertex reachable from `vertex`, excluding itself
    pub fn descendants(&self, vertex: VertexId) -> BTreeSet<VertexId> {
        let mut descendants = self.reachable_from(vertex);
        descendants.remove(&vertex);
        descendants
    }
}

/// Dispatch bookkeeping for one pipeline run.
///
/// Only vertices reachable from the start vertex are scheduled. A vertex
/// becomes ready once every predecessor has succeeded, so a join waits for all
/// of its inputs. `next_ready` hands each vertex out at most once.
pub struct Frontier<'a> {
    dag: &'a Dag,
    reachable: BTreeSet<VertexId>,
    /// Unmet predecessor count of vertices not yet ready
    pending: BTreeMap<VertexId, usize>,
    ready: VecDeque<VertexId>,
    dispatched: HashSet<VertexId>,
    succeeded: BTreeSet<VertexId>,
    failed: BTreeSet<VertexId>,
    skipped: BTreeSet<VertexId>,
}

impl<'a> Frontier<'a> {
    /// Seed the frontier, treating `succeeded` as already done (resume).
    pub fn new(dag: &'a Dag, start: VertexId, succeeded: BTreeSet<VertexId>) -> Self {
        let reachable = dag.reachable_from(start);
        let mut pending = BTreeMap::new();
        let mut ready = VecDeque::new();

        for &vertex in &reachable {
            if succeeded.contains(&vertex) {
                continue;
            }
            let unmet = dag
                .predecessors(vertex)
                .iter()
                .filter(|p| !succeeded.contains(p))
                .count();
            if unmet == 0 {
                ready.push_back(vertex);
            } else {
                pending.insert(vertex, unmet);
            }
        }

        Self {
            dag,
            reachable,
            pending,
            ready,
            dispatched: HashSet::new(),
            succeeded,
            failed: BTreeSet::new(),
            skipped: BTreeSet::new(),
        }
    }

    /// Take the next runnable vertex, marking it dispatched.
    pub fn next_ready(&mut self) -> Option<VertexId> {
        while let Some(vertex) = self.ready.pop_front() {
            if self.skipped.contains(&vertex) {
                continue;
            }
            // Check-and-set: a vertex is handed out exactly once
            if self.dispatched.insert(vertex) {
                return Some(vertex);
            }
        }
        None
    }

    /// Record a success and return the successors it made ready.
    pub fn succeed(&mut self, vertex: VertexId) -> Vec<VertexId> {
        self.succeeded.insert(vertex);

        let mut released = Vec::new();
        for successor in self.dag.successors(vertex) {
            if !self.reachable.contains(&successor) {
                continue;
            }
            let Some(unmet) = self.pending.get_mut(&successor) else {
                continue;
            };
            *unmet -= 1;
            if *unmet == 0 {
                self.pending.remove(&successor);
                if !self.skipped.contains(&successor) {
                    self.ready.push_back(successor);
                    released.push(successor);
                }
            }
        }
        released
    }

    /// Record a failure. The vertex will not be handed out again.
    pub fn fail(&mut self, vertex: VertexId) {
        self.failed.insert(vertex);
        self.dispatched.insert(vertex);
    }

    /// Withdraw every not-yet-dispatched descendant of `vertex`.
    pub fn skip_descendants(&mut self, vertex: VertexId) -> Vec<VertexId> {
        let mut skipped = Vec::new();
        for descendant in self.dag.descendants(vertex) {
            if !self.reachable.contains(&descendant)
                || self.dispatched.contains(&descendant)
                || self.succeeded.contains(&descendant)
            {
                continue;
            }
            if self.skipped.insert(descendant) {
                self.pending.remove(&descendant);
                skipped.push(descendant);
            }
        }
        skipped
    }

    /// Joins still waiting on a predecessor. Non-empty once nothing is
    /// ready or running means the run is stalled.
    pub fn waiting(&self) -> Vec<VertexId> {
        self.pending.keys().copied().collect()
    }

    pub fn has_ready(&self) -> bool {
        self.ready.iter().any(|v| !self.skipped.contains(v) && !self.dispatched.contains(v))
    }

    pub fn succeeded(&self) -> &BTreeSet<VertexId> {
        &self.succeeded
    }

    pub fn failed(&self) -> &BTreeSet<VertexId> {
        &self.failed
    }

    pub fn skipped(&self) -> &BTreeSet<VertexId> {
        &self.skipped
    }
}
