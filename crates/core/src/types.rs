use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::DagError;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }
    };
}

record_id!(
    /// Unique identifier for a graph
    GraphId
);
record_id!(
    /// Unique identifier for a vertex
    VertexId
);
record_id!(
    /// Unique identifier for an edge
    EdgeId
);
record_id!(
    /// Unique identifier for a pipeline run
    PipelineId
);
record_id!(
    /// Unique identifier for a track row
    TrackId
);

/// Execution state shared by pipelines and track rows.
///
/// `Waiting -> Running -> {Succeed | Failed} -> Finished`. `Succeed` and
/// `Failed` mark the end of one vertex attempt; only `Finished` ends a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Waiting,
    Running,
    Succeed,
    Failed,
    Finished,
}

impl State {
    /// Numeric column value for this state.
    pub fn code(self) -> u8 {
        match self {
            State::Waiting => 0,
            State::Running => 1,
            State::Succeed => 2,
            State::Failed => 3,
            State::Finished => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == State::Finished
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Waiting => "waiting",
            State::Running => "running",
            State::Succeed => "succeed",
            State::Failed => "failed",
            State::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// A named DAG definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub id: GraphId,
    pub name: String,
    pub description: Option<String>,
    /// True only if the validator passed against the current `revision`.
    pub validated: bool,
    /// Bumped by every structural mutation.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

/// A unit of work inside a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vertex {
    pub id: VertexId,
    pub graph_id: GraphId,
    pub name: String,
    pub script: String,
    pub input: InputSpec,
}

/// Ordering constraint: `tail` must complete before `head` may start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub graph_id: GraphId,
    pub tail: VertexId,
    pub head: VertexId,
}

/// A running or finished instantiation of a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub graph_id: GraphId,
    pub start_vertex_id: VertexId,
    pub current_vertex_id: VertexId,
    pub state: State,
    /// Caller supplied parameters applied to every vertex input.
    #[serde(default)]
    pub params: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable record of one vertex attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub pipeline_id: PipelineId,
    pub vertex_id: VertexId,
    pub attempt: u32,
    pub input: Value,
    pub output: Value,
    pub state: State,
    pub recorded_at: DateTime<Utc>,
}

/// Track row before the store assigns it an id
#[derive(Debug, Clone)]
pub struct NewTrack {
    pub pipeline_id: PipelineId,
    pub vertex_id: VertexId,
    pub attempt: u32,
    pub input: Value,
    pub output: Value,
    pub state: State,
}

/// Snapshot of one graph's structure, detached from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub revision: u64,
    pub vertices: BTreeSet<VertexId>,
    pub edges: Vec<(VertexId, VertexId)>,
}

/// Declared type of a vertex input parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParamType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }
}

/// Descriptor for one input parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type", default = "default_param_type")]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_param_type() -> ParamType {
    ParamType::Any
}

/// Declared input of a vertex: parameter name to descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputSpec(pub BTreeMap<String, ParamSpec>);

impl InputSpec {
    /// Parse the textual form. Blank text declares no parameters.
    pub fn parse(text: &str) -> Result<Self, DagError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(text)
            .map_err(|e| DagError::InvalidPayload(format!("input spec: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build the concrete input for one attempt.
    ///
    /// Later layers override earlier ones: declared defaults, then `params`,
    /// then each upstream output object in the order given. Returns an error
    /// message when a required parameter is missing or a value has the wrong
    /// type.
    pub fn resolve<'a>(
        &self,
        params: &Map<String, Value>,
        upstream: impl IntoIterator<Item = &'a Value>,
    ) -> Result<Value, String> {
        let mut input = Map::new();
        for (name, spec) in &self.0 {
            if let Some(default) = &spec.default {
                input.insert(name.clone(), default.clone());
            }
        }
        for (key, value) in params {
            input.insert(key.clone(), value.clone());
        }
        for output in upstream {
            if let Some(object) = output.as_object() {
                for (key, value) in object {
                    input.insert(key.clone(), value.clone());
                }
            }
        }

        for (name, spec) in &self.0 {
            match input.get(name) {
                None if spec.required => {
                    return Err(format!("missing required input '{}'", name));
                }
                Some(value) if !spec.kind.accepts(value) => {
                    return Err(format!(
                        "input '{}' expected {:?}, got {}",
                        name, spec.kind, value
                    ));
                }
                _ => {}
            }
        }

        Ok(Value::Object(input))
    }
}

/// Structured view of a vertex script.
///
/// A script is either plain text (the command itself) or a JSON object with a
/// `script` field and an optional `next` hint naming the intended successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPayload {
    pub command: String,
    pub next: Option<String>,
}

impl ScriptPayload {
    pub fn parse(text: &str) -> Self {
        #[derive(Deserialize)]
        struct Structured {
            script: String,
            #[serde(default)]
            next: Option<Value>,
        }

        if text.trim_start().starts_with('{') {
            if let Ok(structured) = serde_json::from_str::<Structured>(text) {
                let next = structured.next.and_then(|next| match next {
                    Value::String(name) => Some(name),
                    Value::Number(id) => Some(id.to_string()),
                    _ => None,
                });
                return Self {
                    command: structured.script,
                    next,
                };
            }
        }

        Self {
            command: text.to_string(),
            next: None,
        }
    }
}
