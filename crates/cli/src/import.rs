//! Graph documents: a whole graph described in one JSON file.
//!
//! ```json
//! {
//!   "name": "etl",
//!   "description": "nightly load",
//!   "vertices": [
//!     {"name": "extract", "script": "./extract.sh"},
//!     {"name": "load", "script": "./load.sh", "input": {"table": {"type": "string", "required": true}}}
//!   ],
//!   "edges": [{"tail": "extract", "head": "load"}]
//! }
//! ```

use anyhow::{bail, Context, Result};
use dagrun_core::storage::GraphStore;
use dagrun_core::{Graph, GraphId, InputSpec, VertexId};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct GraphDocument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub vertices: Vec<VertexDocument>,
    #[serde(default)]
    pub edges: Vec<EdgeDocument>,
}

#[derive(Debug, Deserialize)]
pub struct VertexDocument {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub input: InputSpec,
}

/// Edge between two vertices of the same document, by name
#[derive(Debug, Deserialize)]
pub struct EdgeDocument {
    pub tail: String,
    pub head: String,
}

impl GraphDocument {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse graph document")
    }

    /// Create the graph, its vertices and its edges.
    ///
    /// Names and edges are checked before anything is written. If a later
    /// write still fails, the partly created graph is deleted again.
    pub fn import(&self, store: &dyn GraphStore) -> Result<Graph> {
        self.check()?;
        self.create(store)
    }

    fn create(&self, store: &dyn GraphStore) -> Result<Graph> {
        let graph = store.create_graph(&self.name, self.description.as_deref())?;
        if let Err(err) = self.populate(store, graph.id) {
            if let Err(cleanup_err) = store.delete_graph(graph.id) {
                tracing::error!(
                    "Failed to remove partly imported graph {}: {}",
                    graph.id,
                    cleanup_err
                );
            }
            return Err(err);
        }

        tracing::info!(
            "Imported graph {} '{}': {} vertices, {} edges",
            graph.id,
            graph.name,
            self.vertices.len(),
            self.edges.len()
        );

        Ok(store.get_graph(graph.id)?.unwrap_or(graph))
    }

    fn check(&self) -> Result<()> {
        let mut known: HashSet<&str> = HashSet::new();
        for vertex in &self.vertices {
            if !known.insert(vertex.name.as_str()) {
                bail!("vertex '{}' is declared twice", vertex.name);
            }
        }

        let mut pairs: HashSet<(&str, &str)> = HashSet::new();
        for edge in &self.edges {
            for name in [&edge.tail, &edge.head] {
                if !known.contains(name.as_str()) {
                    bail!("edge references unknown vertex '{}'", name);
                }
            }
            if !pairs.insert((edge.tail.as_str(), edge.head.as_str())) {
                bail!("edge '{}' -> '{}' is declared twice", edge.tail, edge.head);
            }
        }
        Ok(())
    }

    fn populate(&self, store: &dyn GraphStore, graph_id: GraphId) -> Result<()> {
        let mut ids: HashMap<&str, VertexId> = HashMap::new();
        for vertex in &self.vertices {
            let created = store
                .add_vertex(graph_id, &vertex.name, vertex.input.clone(), &vertex.script)
                .with_context(|| format!("Failed to add vertex '{}'", vertex.name))?;
            ids.insert(vertex.name.as_str(), created.id);
        }
        for edge in &self.edges {
            let (tail, head) = (ids[edge.tail.as_str()], ids[edge.head.as_str()]);
            store
                .add_edge(graph_id, tail, head)
                .with_context(|| format!("Failed to add edge {} -> {}", edge.tail, edge.head))?;
        }
        Ok(())
    }
}
