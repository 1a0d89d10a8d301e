use crate::error::{DagError, DagResult};
use crate::types::{
    Edge, EdgeId, Graph, GraphId, InputSpec, NewTrack, Pipeline, PipelineId, State, Topology,
    Track, TrackId, Vertex, VertexId,
};
use anyhow::Context;
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

type RecordTable = TableDefinition<'static, u64, &'static [u8]>;

const GRAPHS_TABLE: RecordTable = TableDefinition::new("graphs");
const VERTICES_TABLE: RecordTable = TableDefinition::new("vertices");
const EDGES_TABLE: RecordTable = TableDefinition::new("edges");
const PIPELINES_TABLE: RecordTable = TableDefinition::new("pipelines");
const TRACKS_TABLE: RecordTable = TableDefinition::new("tracks");
const SEQUENCES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Persistence contract the validator and executor are written against.
///
/// Every mutation is atomic: on error nothing it wrote is kept. Structural
/// mutations (vertices and edges) clear the owning graph's `validated` flag
/// and are refused while a pipeline of that graph is unfinished.
pub trait GraphStore: Send + Sync {
    fn create_graph(&self, name: &str, description: Option<&str>) -> DagResult<Graph>;

    fn get_graph(&self, graph_id: GraphId) -> DagResult<Option<Graph>>;

    fn list_graphs(&self) -> DagResult<Vec<Graph>>;

    /// Delete a graph with its vertices, edges, pipelines and track rows.
    fn delete_graph(&self, graph_id: GraphId) -> DagResult<Option<Graph>>;

    fn add_vertex(
        &self,
        graph_id: GraphId,
        name: &str,
        input: InputSpec,
        script: &str,
    ) -> DagResult<Vertex>;

    fn get_vertex(&self, vertex_id: VertexId) -> DagResult<Option<Vertex>>;

    fn list_vertices(&self, graph_id: GraphId) -> DagResult<Vec<Vertex>>;

    /// Delete a vertex together with every edge touching it.
    fn delete_vertex(&self, vertex_id: VertexId) -> DagResult<Option<Vertex>>;

    fn add_edge(&self, graph_id: GraphId, tail: VertexId, head: VertexId) -> DagResult<Edge>;

    fn list_edges(&self, graph_id: GraphId) -> DagResult<Vec<Edge>>;

    fn delete_edge(&self, edge_id: EdgeId) -> DagResult<Option<Edge>>;

    /// Read the vertex set and edge list of a graph in one transaction.
    fn fetch_topology(&self, graph_id: GraphId) -> DagResult<Topology>;

    /// Store a validator verdict computed against `revision`.
    ///
    /// Returns `false` without writing if the graph changed since.
    fn record_verdict(&self, graph_id: GraphId, revision: u64, passed: bool) -> DagResult<bool>;

    fn create_pipeline(
        &self,
        graph_id: GraphId,
        start_vertex: VertexId,
        params: Map<String, Value>,
    ) -> DagResult<Pipeline>;

    fn get_pipeline(&self, pipeline_id: PipelineId) -> DagResult<Option<Pipeline>>;

    fn list_pipelines(&self, graph_id: GraphId) -> DagResult<Vec<Pipeline>>;

    fn update_pipeline(
        &self,
        pipeline_id: PipelineId,
        state: State,
        current_vertex: VertexId,
    ) -> DagResult<Pipeline>;

    fn append_track(&self, track: NewTrack) -> DagResult<Track>;

    /// Append a track row and move the pipeline to the track's state and
    /// vertex in a single transaction.
    fn record_attempt(&self, track: NewTrack) -> DagResult<Track>;

    /// Track rows of a pipeline in insertion order.
    fn list_tracks(&self, pipeline_id: PipelineId) -> DagResult<Vec<Track>>;
}

/// Graph store backed by an embedded redb database
#[derive(Clone)]
pub struct RedbGraphStore {
    db: Arc<Database>,
}

impl RedbGraphStore {
    pub fn new(path: PathBuf) -> DagResult<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            for table in [
                GRAPHS_TABLE,
                VERTICES_TABLE,
                EDGES_TABLE,
                PIPELINES_TABLE,
                TRACKS_TABLE,
            ] {
                write_txn
                    .open_table(table)
                    .context("Failed to open record table")?;
            }
            write_txn
                .open_table(SEQUENCES_TABLE)
                .context("Failed to open sequences table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Run `body` inside a write transaction.
    ///
    /// Commits when the body succeeds; aborts and returns the body's error
    /// otherwise.
    fn write<T>(&self, body: impl FnOnce(&WriteTransaction) -> DagResult<T>) -> DagResult<T> {
        let txn = self
            .db
            .begin_write()
            .context("Failed to begin write transaction")?;

        match body(&txn) {
            Ok(value) => {
                txn.commit().context("Failed to commit transaction")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = txn.abort() {
                    tracing::error!("Failed to abort transaction: {}", abort_err);
                }
                Err(err)
            }
        }
    }

    fn read(&self) -> DagResult<ReadTransaction> {
        Ok(self
            .db
            .begin_read()
            .context("Failed to begin read transaction")?)
    }

    fn read_one<T: DeserializeOwned>(&self, def: RecordTable, id: u64) -> DagResult<Option<T>> {
        let txn = self.read()?;
        let table = txn.open_table(def).context("Failed to open table")?;
        load(&table, id)
    }

    fn read_all<T: DeserializeOwned>(&self, def: RecordTable) -> DagResult<Vec<T>> {
        let txn = self.read()?;
        let table = txn.open_table(def).context("Failed to open table")?;
        scan(&table)
    }
}

fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> DagResult<Option<T>> {
    let record = match table.get(id).context("Failed to get record")? {
        Some(guard) => Some(serde_json::from_slice(guard.value())?),
        None => None,
    };
    Ok(record)
}

/// All records of a table in ascending key order.
fn scan<T: DeserializeOwned>(table: &impl ReadableTable<u64, &'static [u8]>) -> DagResult<Vec<T>> {
    let mut records = Vec::new();
    for item in table.iter().context("Failed to iterate table")? {
        let (_key, value) = item.context("Failed to read item")?;
        records.push(serde_json::from_slice(value.value())?);
    }
    Ok(records)
}

fn load_in<T: DeserializeOwned>(
    txn: &WriteTransaction,
    def: RecordTable,
    id: u64,
) -> DagResult<Option<T>> {
    let table = txn.open_table(def).context("Failed to open table")?;
    load(&table, id)
}

fn scan_in<T: DeserializeOwned>(txn: &WriteTransaction, def: RecordTable) -> DagResult<Vec<T>> {
    let table = txn.open_table(def).context("Failed to open table")?;
    scan(&table)
}

fn put<T: Serialize>(txn: &WriteTransaction, def: RecordTable, id: u64, record: &T) -> DagResult<()> {
    let value = serde_json::to_vec(record)?;
    let mut table = txn.open_table(def).context("Failed to open table")?;
    table
        .insert(id, value.as_slice())
        .context("Failed to insert record")?;
    Ok(())
}

fn remove(txn: &WriteTransaction, def: RecordTable, id: u64) -> DagResult<()> {
    let mut table = txn.open_table(def).context("Failed to open table")?;
    table.remove(id).context("Failed to remove record")?;
    Ok(())
}

fn next_id(txn: &WriteTransaction, sequence: &str) -> DagResult<u64> {
    let mut table = txn
        .open_table(SEQUENCES_TABLE)
        .context("Failed to open sequences table")?;
    let current = table
        .get(sequence)
        .context("Failed to read sequence")?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table
        .insert(sequence, next)
        .context("Failed to advance sequence")?;
    Ok(next)
}

fn require_graph(txn: &WriteTransaction, graph_id: GraphId) -> DagResult<Graph> {
    load_in(txn, GRAPHS_TABLE, graph_id.0)?.ok_or(DagError::GraphNotFound(graph_id))
}

fn require_pipeline(txn: &WriteTransaction, pipeline_id: PipelineId) -> DagResult<Pipeline> {
    load_in(txn, PIPELINES_TABLE, pipeline_id.0)?.ok_or(DagError::PipelineNotFound(pipeline_id))
}

/// Refuse structural edits while any pipeline of the graph is unfinished.
fn ensure_idle(txn: &WriteTransaction, graph_id: GraphId) -> DagResult<()> {
    let pipelines: Vec<Pipeline> = scan_in(txn, PIPELINES_TABLE)?;
    match pipelines
        .iter()
        .find(|p| p.graph_id == graph_id && !p.state.is_terminal())
    {
        Some(pipeline) => Err(DagError::GraphBusy {
            graph: graph_id,
            pipeline: pipeline.id,
        }),
        None => Ok(()),
    }
}

/// Record a structural change: bump the revision and drop the verdict.
fn invalidate(txn: &WriteTransaction, mut graph: Graph) -> DagResult<()> {
    graph.validated = false;
    graph.revision += 1;
    put(txn, GRAPHS_TABLE, graph.id.0, &graph)
}

/// Endpoint of a new edge, checked against the edge's graph.
fn edge_endpoint(
    txn: &WriteTransaction,
    graph_id: GraphId,
    vertex_id: VertexId,
    side: &str,
) -> DagResult<Vertex> {
    let vertex: Vertex =
        load_in(txn, VERTICES_TABLE, vertex_id.0)?.ok_or_else(|| DagError::Structural {
            graph: graph_id,
            reason: format!("{} vertex {} does not exist", side, vertex_id),
        })?;
    if vertex.graph_id != graph_id {
        return Err(DagError::Structural {
            graph: graph_id,
            reason: format!(
                "{} vertex {} belongs to graph {}",
                side, vertex_id, vertex.graph_id
            ),
        });
    }
    Ok(vertex)
}

fn set_pipeline_state(
    txn: &WriteTransaction,
    pipeline_id: PipelineId,
    state: State,
    current_vertex: VertexId,
) -> DagResult<Pipeline> {
    let mut pipeline = require_pipeline(txn, pipeline_id)?;

    let vertex: Option<Vertex> = load_in(txn, VERTICES_TABLE, current_vertex.0)?;
    match vertex {
        Some(v) if v.graph_id == pipeline.graph_id => {}
        _ => {
            return Err(DagError::Structural {
                graph: pipeline.graph_id,
                reason: format!(
                    "vertex {} is not part of pipeline {}'s graph",
                    current_vertex, pipeline_id
                ),
            })
        }
    }

    pipeline.state = state;
    pipeline.current_vertex_id = current_vertex;
    pipeline.updated_at = chrono::Utc::now();
    put(txn, PIPELINES_TABLE, pipeline.id.0, &pipeline)?;
    Ok(pipeline)
}

fn insert_track(txn: &WriteTransaction, new: NewTrack) -> DagResult<Track> {
    require_pipeline(txn, new.pipeline_id)?;

    let track = Track {
        id: TrackId(next_id(txn, "track")?),
        pipeline_id: new.pipeline_id,
        vertex_id: new.vertex_id,
        attempt: new.attempt,
        input: new.input,
        output: new.output,
        state: new.state,
        recorded_at: chrono::Utc::now(),
    };
    put(txn, TRACKS_TABLE, track.id.0, &track)?;
    Ok(track)
}

impl GraphStore for RedbGraphStore {
    fn create_graph(&self, name: &str, description: Option<&str>) -> DagResult<Graph> {
        let graph = self.write(|txn| {
            let graph = Graph {
                id: GraphId(next_id(txn, "graph")?),
                name: name.to_string(),
                description: description.map(str::to_string),
                validated: false,
                revision: 0,
                created_at: chrono::Utc::now(),
            };
            put(txn, GRAPHS_TABLE, graph.id.0, &graph)?;
            Ok(graph)
        })?;

        tracing::info!("Created graph {} ({})", graph.id, graph.name);
        Ok(graph)
    }

    fn get_graph(&self, graph_id: GraphId) -> DagResult<Option<Graph>> {
        self.read_one(GRAPHS_TABLE, graph_id.0)
    }

    fn list_graphs(&self) -> DagResult<Vec<Graph>> {
        self.read_all(GRAPHS_TABLE)
    }

    fn delete_graph(&self, graph_id: GraphId) -> DagResult<Option<Graph>> {
        let deleted = self.write(|txn| {
            let graph: Graph = match load_in(txn, GRAPHS_TABLE, graph_id.0)? {
                Some(graph) => graph,
                None => return Ok(None),
            };
            ensure_idle(txn, graph_id)?;

            let pipelines: Vec<PipelineId> = scan_in::<Pipeline>(txn, PIPELINES_TABLE)?
                .into_iter()
                .filter(|p| p.graph_id == graph_id)
                .map(|p| p.id)
                .collect();
            let tracks: Vec<TrackId> = scan_in::<Track>(txn, TRACKS_TABLE)?
                .into_iter()
                .filter(|t| pipelines.contains(&t.pipeline_id))
                .map(|t| t.id)
                .collect();
            let edges: Vec<EdgeId> = scan_in::<Edge>(txn, EDGES_TABLE)?
                .into_iter()
                .filter(|e| e.graph_id == graph_id)
                .map(|e| e.id)
                .collect();
            let vertices: Vec<VertexId> = scan_in::<Vertex>(txn, VERTICES_TABLE)?
                .into_iter()
                .filter(|v| v.graph_id == graph_id)
                .map(|v| v.id)
                .collect();

            for id in &tracks {
                remove(txn, TRACKS_TABLE, id.0)?;
            }
            for id in &pipelines {
                remove(txn, PIPELINES_TABLE, id.0)?;
            }
            for id in &edges {
                remove(txn, EDGES_TABLE, id.0)?;
            }
            for id in &vertices {
                remove(txn, VERTICES_TABLE, id.0)?;
            }
            remove(txn, GRAPHS_TABLE, graph_id.0)?;
            Ok(Some(graph))
        })?;

        if deleted.is_some() {
            tracing::info!("Deleted graph {}", graph_id);
        }
        Ok(deleted)
    }

    fn add_vertex(
        &self,
        graph_id: GraphId,
        name: &str,
        input: InputSpec,
        script: &str,
    ) -> DagResult<Vertex> {
        let vertex = self.write(|txn| {
            let graph = require_graph(txn, graph_id)?;
            ensure_idle(txn, graph_id)?;

            let existing: Vec<Vertex> = scan_in(txn, VERTICES_TABLE)?;
            if existing
                .iter()
                .any(|v| v.graph_id == graph_id && v.name == name)
            {
                return Err(DagError::Structural {
                    graph: graph_id,
                    reason: format!("vertex name '{}' is already taken", name),
                });
            }

            let vertex = Vertex {
                id: VertexId(next_id(txn, "vertex")?),
                graph_id,
                name: name.to_string(),
                script: script.to_string(),
                input,
            };
            put(txn, VERTICES_TABLE, vertex.id.0, &vertex)?;
            invalidate(txn, graph)?;
            Ok(vertex)
        })?;

        tracing::debug!("Added vertex {} '{}' to graph {}", vertex.id, vertex.name, graph_id);
        Ok(vertex)
    }

    fn get_vertex(&self, vertex_id: VertexId) -> DagResult<Option<Vertex>> {
        self.read_one(VERTICES_TABLE, vertex_id.0)
    }

    fn list_vertices(&self, graph_id: GraphId) -> DagResult<Vec<Vertex>> {
        let vertices: Vec<Vertex> = self.read_all(VERTICES_TABLE)?;
        Ok(vertices
            .into_iter()
            .filter(|v| v.graph_id == graph_id)
            .collect())
    }

    fn delete_vertex(&self, vertex_id: VertexId) -> DagResult<Option<Vertex>> {
        let deleted = self.write(|txn| {
            let vertex: Vertex = match load_in(txn, VERTICES_TABLE, vertex_id.0)? {
                Some(vertex) => vertex,
                None => return Ok(None),
            };
            let graph = require_graph(txn, vertex.graph_id)?;
            ensure_idle(txn, vertex.graph_id)?;

            let edges: Vec<Edge> = scan_in(txn, EDGES_TABLE)?;
            let incident: Vec<EdgeId> = edges
                .iter()
                .filter(|e| e.tail == vertex_id || e.head == vertex_id)
                .map(|e| e.id)
                .collect();
            for edge_id in &incident {
                remove(txn, EDGES_TABLE, edge_id.0)?;
            }
            remove(txn, VERTICES_TABLE, vertex_id.0)?;
            invalidate(txn, graph)?;

            tracing::debug!(
                "Deleted vertex {} and {} incident edges",
                vertex_id,
                incident.len()
            );
            Ok(Some(vertex))
        })?;

        Ok(deleted)
    }

    fn add_edge(&self, graph_id: GraphId, tail: VertexId, head: VertexId) -> DagResult<Edge> {
        self.write(|txn| {
            let graph = require_graph(txn, graph_id)?;
            ensure_idle(txn, graph_id)?;

            let id = EdgeId(next_id(txn, "edge")?);
            edge_endpoint(txn, graph_id, tail, "tail")?;
            edge_endpoint(txn, graph_id, head, "head")?;

            let edges: Vec<Edge> = scan_in(txn, EDGES_TABLE)?;
            if edges
                .iter()
                .any(|e| e.graph_id == graph_id && e.tail == tail && e.head == head)
            {
                return Err(DagError::Structural {
                    graph: graph_id,
                    reason: format!("edge {} -> {} already exists", tail, head),
                });
            }

            let edge = Edge {
                id,
                graph_id,
                tail,
                head,
            };
            put(txn, EDGES_TABLE, edge.id.0, &edge)?;
            invalidate(txn, graph)?;
            Ok(edge)
        })
    }

    fn list_edges(&self, graph_id: GraphId) -> DagResult<Vec<Edge>> {
        let edges: Vec<Edge> = self.read_all(EDGES_TABLE)?;
        Ok(edges
            .into_iter()
            .filter(|e| e.graph_id == graph_id)
            .collect())
    }

    fn delete_edge(&self, edge_id: EdgeId) -> DagResult<Option<Edge>> {
        self.write(|txn| {
            let edge: Edge = match load_in(txn, EDGES_TABLE, edge_id.0)? {
                Some(edge) => edge,
                None => return Ok(None),
            };
            let graph = require_graph(txn, edge.graph_id)?;
            ensure_idle(txn, edge.graph_id)?;

            remove(txn, EDGES_TABLE, edge_id.0)?;
            invalidate(txn, graph)?;
            Ok(Some(edge))
        })
    }

    fn fetch_topology(&self, graph_id: GraphId) -> DagResult<Topology> {
        let txn = self.read()?;

        let graphs = txn.open_table(GRAPHS_TABLE).context("Failed to open table")?;
        let graph: Graph = load(&graphs, graph_id.0)?.ok_or(DagError::GraphNotFound(graph_id))?;

        let vertices: Vec<Vertex> = scan(&txn.open_table(VERTICES_TABLE).context("Failed to open table")?)?;
        let edges: Vec<Edge> = scan(&txn.open_table(EDGES_TABLE).context("Failed to open table")?)?;

        Ok(Topology {
            revision: graph.revision,
            vertices: vertices
                .into_iter()
                .filter(|v| v.graph_id == graph_id)
                .map(|v| v.id)
                .collect(),
            edges: edges
                .into_iter()
                .filter(|e| e.graph_id == graph_id)
                .map(|e| (e.tail, e.head))
                .collect(),
        })
    }

    fn record_verdict(&self, graph_id: GraphId, revision: u64, passed: bool) -> DagResult<bool> {
        self.write(|txn| {
            let mut graph = require_graph(txn, graph_id)?;
            if graph.revision != revision {
                return Ok(false);
            }
            graph.validated = passed;
            put(txn, GRAPHS_TABLE, graph.id.0, &graph)?;
            Ok(true)
        })
    }

    fn create_pipeline(
        &self,
        graph_id: GraphId,
        start_vertex: VertexId,
        params: Map<String, Value>,
    ) -> DagResult<Pipeline> {
        self.write(|txn| {
            require_graph(txn, graph_id)?;
            let vertex: Vertex = load_in(txn, VERTICES_TABLE, start_vertex.0)?
                .ok_or(DagError::VertexNotFound(start_vertex))?;
            if vertex.graph_id != graph_id {
                return Err(DagError::InvalidStartVertex {
                    vertex: start_vertex,
                    reason: format!("it belongs to graph {}", vertex.graph_id),
                });
            }

            let now = chrono::Utc::now();
            let pipeline = Pipeline {
                id: PipelineId(next_id(txn, "pipeline")?),
                graph_id,
                start_vertex_id: start_vertex,
                current_vertex_id: start_vertex,
                state: State::Waiting,
                params,
                created_at: now,
                updated_at: now,
            };
            put(txn, PIPELINES_TABLE, pipeline.id.0, &pipeline)?;
            Ok(pipeline)
        })
    }

    fn get_pipeline(&self, pipeline_id: PipelineId) -> DagResult<Option<Pipeline>> {
        self.read_one(PIPELINES_TABLE, pipeline_id.0)
    }

    fn list_pipelines(&self, graph_id: GraphId) -> DagResult<Vec<Pipeline>> {
        let pipelines: Vec<Pipeline> = self.read_all(PIPELINES_TABLE)?;
        Ok(pipelines
            .into_iter()
            .filter(|p| p.graph_id == graph_id)
            .collect())
    }

    fn update_pipeline(
        &self,
        pipeline_id: PipelineId,
        state: State,
        current_vertex: VertexId,
    ) -> DagResult<Pipeline> {
        self.write(|txn| set_pipeline_state(txn, pipeline_id, state, current_vertex))
    }

    fn append_track(&self, track: NewTrack) -> DagResult<Track> {
        self.write(|txn| insert_track(txn, track))
    }

    fn record_attempt(&self, track: NewTrack) -> DagResult<Track> {
        self.write(|txn| {
            set_pipeline_state(txn, track.pipeline_id, track.state, track.vertex_id)?;
            insert_track(txn, track)
        })
    }

    fn list_tracks(&self, pipeline_id: PipelineId) -> DagResult<Vec<Track>> {
        let tracks: Vec<Track> = self.read_all(TRACKS_TABLE)?;
        Ok(tracks
            .into_iter()
            .filter(|t| t.pipeline_id == pipeline_id)
            .collect())
    }
}
