//! Error type shared by the store, the validator and the executor.
//!
//! A vertex attempt whose script fails is not an error: it is recorded as a
//! `Failed` track row and reported through the pipeline outcome.

use crate::types::{GraphId, PipelineId, VertexId};

pub type DagResult<T> = Result<T, DagError>;

#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("graph {0} not found")]
    GraphNotFound(GraphId),

    #[error("vertex {0} not found")]
    VertexNotFound(VertexId),

    #[error("pipeline {0} not found")]
    PipelineNotFound(PipelineId),

    /// A mutation would break an invariant of the graph's structure.
    #[error("structural error in graph {graph}: {reason}")]
    Structural { graph: GraphId, reason: String },

    /// Structural edits are refused while a pipeline of the graph is unfinished.
    #[error("graph {graph} is in use by unfinished pipeline {pipeline}")]
    GraphBusy { graph: GraphId, pipeline: PipelineId },

    #[error("graph {graph} contains a cycle through vertices {remaining:?}")]
    CycleDetected {
        graph: GraphId,
        remaining: Vec<VertexId>,
    },

    #[error("graph {graph} has an edge referencing unknown vertex {vertex}")]
    UnknownEndpoint { graph: GraphId, vertex: VertexId },

    #[error("graph {0} has not been validated")]
    GraphNotValidated(GraphId),

    /// The topology changed between the validator's snapshot and its verdict.
    #[error("graph {0} changed while it was being validated")]
    TopologyChanged(GraphId),

    #[error("vertex {vertex} cannot start a pipeline: {reason}")]
    InvalidStartVertex { vertex: VertexId, reason: String },

    #[error("pipeline {0} is already finished")]
    PipelineFinished(PipelineId),

    /// Another driver is already running the pipeline.
    #[error("pipeline {0} is already running")]
    PipelineActive(PipelineId),

    /// Join vertices that can never fire because a predecessor never ran.
    #[error("pipeline {pipeline} stalled: vertices {waiting:?} wait on predecessors that cannot run")]
    UnreachablePredecessor {
        pipeline: PipelineId,
        waiting: Vec<VertexId>,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
