//! Graph, vertex and edge command handlers

use anyhow::{Context, Result};
use clap::Subcommand;
use dagrun_core::storage::GraphStore;
use dagrun_core::{EdgeId, GraphId, InputSpec, VertexId};
use serde_json::json;
use std::path::PathBuf;

use super::print_json;
use crate::config::AppState;
use crate::import::GraphDocument;

#[derive(Subcommand, Debug)]
pub enum GraphCommands {
    /// Create an empty graph
    Create {
        name: String,

        #[arg(short, long)]
        description: Option<String>,
    },
    /// List all graphs
    List,
    /// Show a graph with its vertices and edges
    Show { id: GraphId },
    /// Check that a graph is a DAG and record the verdict
    Validate { id: GraphId },
    /// Delete a graph with its vertices, edges, pipelines and tracks
    Delete { id: GraphId },
    /// Create a graph from a JSON graph document
    Import {
        path: PathBuf,

        /// Validate the graph after importing it
        #[arg(long)]
        validate: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum VertexCommands {
    /// Add a vertex to a graph
    Add {
        graph: GraphId,
        name: String,

        /// Command text, or a JSON object with `script` and `next`
        #[arg(short, long)]
        script: String,

        /// Input parameter declarations as JSON
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Delete a vertex and its incident edges
    Delete { id: VertexId },
}

#[derive(Subcommand, Debug)]
pub enum EdgeCommands {
    /// Add an edge: `tail` must complete before `head` starts
    Add {
        graph: GraphId,
        tail: VertexId,
        head: VertexId,
    },
    /// Delete an edge
    Delete { id: EdgeId },
}

pub fn handle_graph(command: GraphCommands, state: &AppState) -> Result<()> {
    match command {
        GraphCommands::Create { name, description } => {
            let graph = state.store.create_graph(&name, description.as_deref())?;
            print_json(&graph)
        }
        GraphCommands::List => print_json(&state.store.list_graphs()?),
        GraphCommands::Show { id } => {
            let graph = state
                .store
                .get_graph(id)?
                .with_context(|| format!("Graph {} not found", id))?;
            print_json(&json!({
                "graph": graph,
                "vertices": state.store.list_vertices(id)?,
                "edges": state.store.list_edges(id)?,
            }))
        }
        GraphCommands::Validate { id } => {
            let order = state
                .validator
                .check(id)
                .with_context(|| format!("Graph {} failed validation", id))?;
            print_json(&json!({ "graph": id, "validated": true, "order": order }))
        }
        GraphCommands::Delete { id } => {
            let graph = state
                .store
                .delete_graph(id)?
                .with_context(|| format!("Graph {} not found", id))?;
            print_json(&graph)
        }
        GraphCommands::Import { path, validate } => {
            let document = GraphDocument::from_file(&path)?;
            let mut graph = document.import(&*state.store)?;
            if validate {
                graph.validated = state.validator.validate(graph.id)?;
            }
            print_json(&graph)
        }
    }
}

pub fn handle_vertex(command: VertexCommands, state: &AppState) -> Result<()> {
    match command {
        VertexCommands::Add {
            graph,
            name,
            script,
            input,
        } => {
            let input = InputSpec::parse(input.as_deref().unwrap_or_default())?;
            let vertex = state.store.add_vertex(graph, &name, input, &script)?;
            print_json(&vertex)
        }
        VertexCommands::Delete { id } => {
            let vertex = state
                .store
                .delete_vertex(id)?
                .with_context(|| format!("Vertex {} not found", id))?;
            print_json(&vertex)
        }
    }
}

pub fn handle_edge(command: EdgeCommands, state: &AppState) -> Result<()> {
    match command {
        EdgeCommands::Add { graph, tail, head } => {
            print_json(&state.store.add_edge(graph, tail, head)?)
        }
        EdgeCommands::Delete { id } => {
            let edge = state
                .store
                .delete_edge(id)?
                .with_context(|| format!("Edge {} not found", id))?;
            print_json(&edge)
        }
    }
}
