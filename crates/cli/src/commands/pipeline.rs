//! Pipeline command handlers

use anyhow::{Context, Result};
use clap::Subcommand;
use dagrun_core::storage::GraphStore;
use dagrun_core::workflow::{PipelineOutcome, PipelineReport};
use dagrun_core::{GraphId, PipelineId, VertexId};
use serde_json::{json, Map, Value};

use super::{parse_param, print_json};
use crate::config::AppState;

#[derive(Subcommand, Debug)]
pub enum PipelineCommands {
    /// Create a pipeline at a source vertex of a validated graph
    Start {
        graph: GraphId,
        vertex: VertexId,

        /// Parameters as key=value pairs (e.g., region=eu limit=10)
        #[arg(short, long, value_parser = parse_param)]
        param: Vec<(String, Value)>,

        /// Run the pipeline right away
        #[arg(long)]
        run: bool,
    },
    /// Run or resume a pipeline until it finishes
    Run { id: PipelineId },
    /// Stop a pipeline
    Cancel { id: PipelineId },
    /// Show a pipeline
    Show { id: PipelineId },
    /// List the track rows of a pipeline
    Tracks { id: PipelineId },
    /// List the pipelines of a graph
    List { graph: GraphId },
}

pub async fn handle_pipeline(command: PipelineCommands, state: &AppState) -> Result<()> {
    match command {
        PipelineCommands::Start {
            graph,
            vertex,
            param,
            run,
        } => {
            let params: Map<String, Value> = param.into_iter().collect();
            let pipeline = state.executor.start(graph, vertex, params)?;
            if run {
                run_to_end(state, pipeline.id).await
            } else {
                print_json(&pipeline)
            }
        }
        PipelineCommands::Run { id } => run_to_end(state, id).await,
        PipelineCommands::Cancel { id } => {
            state.executor.cancel(id).await?;
            print_json(&state.executor.pipeline(id)?)
        }
        PipelineCommands::Show { id } => print_json(&state.executor.pipeline(id)?),
        PipelineCommands::Tracks { id } => print_json(&state.executor.tracks(id)?),
        PipelineCommands::List { graph } => print_json(&state.store.list_pipelines(graph)?),
    }
}

/// Run a pipeline, cancelling it on Ctrl-C
async fn run_to_end(state: &AppState, id: PipelineId) -> Result<()> {
    let run = state.executor.run(id);
    tokio::pin!(run);

    let report = tokio::select! {
        report = &mut run => report,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling pipeline {}", id);
            state.executor.cancel(id).await?;
            run.await
        }
    }
    .with_context(|| format!("Pipeline {} did not complete", id))?;

    print_report(&report)
}

fn print_report(report: &PipelineReport) -> Result<()> {
    let outcome = match &report.outcome {
        PipelineOutcome::Completed => json!({ "status": "completed" }),
        PipelineOutcome::Failed { vertex } => json!({ "status": "failed", "vertex": vertex }),
        PipelineOutcome::Cancelled => json!({ "status": "cancelled" }),
        PipelineOutcome::Contained { failed, skipped } => json!({
            "status": "contained",
            "failed": failed,
            "skipped": skipped,
        }),
    };

    print_json(&json!({
        "pipeline": report.pipeline,
        "outcome": outcome,
        "tracks": report.tracks,
    }))
}
