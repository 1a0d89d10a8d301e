use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod import;

use commands::graph::{EdgeCommands, GraphCommands, VertexCommands};
use commands::pipeline::PipelineCommands;
use config::{AppConfig, AppState};

#[derive(Parser, Debug)]
#[command(name = "dagrun")]
#[command(about = "Workflow graphs validated as DAGs and run as pipelines", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "dagrun.toml", env = "DAGRUN_CONFIG")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "DAGRUN_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage graphs
    #[command(subcommand)]
    Graph(GraphCommands),
    /// Manage vertices
    #[command(subcommand)]
    Vertex(VertexCommands),
    /// Manage edges
    #[command(subcommand)]
    Edge(EdgeCommands),
    /// Start, run and inspect pipelines
    #[command(subcommand)]
    Pipeline(PipelineCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so command output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dagrun=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::debug!("Data directory: {}", args.data_dir.display());

    let config = AppConfig::load(&args.config, args.data_dir)?;
    let state = AppState::new(&config)?;

    match args.command {
        Command::Graph(command) => commands::graph::handle_graph(command, &state),
        Command::Vertex(command) => commands::graph::handle_vertex(command, &state),
        Command::Edge(command) => commands::graph::handle_edge(command, &state),
        Command::Pipeline(command) => commands::pipeline::handle_pipeline(command, &state).await,
    }
}
