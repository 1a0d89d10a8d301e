use super::dag::{Dag, Frontier};
use super::runner::Runner;
use super::step_executor::{StepExecutor, StepJob, StepResult};
use crate::config::{ExecutorConfig, FailurePolicy};
use crate::error::{DagError, DagResult};
use crate::storage::GraphStore;
use crate::types::{GraphId, Pipeline, PipelineId, State, Track, Vertex, VertexId};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;

/// How a finished pipeline ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every reachable vertex succeeded
    Completed,
    /// Fail-fast stop on this vertex
    Failed { vertex: VertexId },
    /// Dispatch stopped on request
    Cancelled,
    /// Some branches failed and their descendants were skipped; the rest ran
    Contained {
        failed: Vec<VertexId>,
        skipped: Vec<VertexId>,
    },
}

/// Final pipeline record, its outcome, and every track row it wrote
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: Pipeline,
    pub outcome: PipelineOutcome,
    pub tracks: Vec<Track>,
}

/// Drives pipelines over validated graphs
pub struct PipelineExecutor {
    store: Arc<dyn GraphStore>,
    step_executor: StepExecutor,
    config: Arc<ExecutorConfig>,
    // Track active pipelines for cancellation
    active_runs: Arc<RwLock<HashMap<PipelineId, watch::Sender<bool>>>>,
}

impl PipelineExecutor {
    pub fn new(store: Arc<dyn GraphStore>, runner: Arc<dyn Runner>, config: ExecutorConfig) -> Self {
        let config = Arc::new(config);
        let step_executor = StepExecutor::new(store.clone(), runner, config.clone());

        Self {
            store,
            step_executor,
            config,
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a pipeline in `Waiting` at a source vertex of a validated graph
    pub fn start(
        &self,
        graph_id: GraphId,
        start_vertex: VertexId,
        params: Map<String, Value>,
    ) -> DagResult<Pipeline> {
        let graph = self
            .store
            .get_graph(graph_id)?
            .ok_or(DagError::GraphNotFound(graph_id))?;
        if !graph.validated {
            return Err(DagError::GraphNotValidated(graph_id));
        }

        let dag = Dag::from_topology(&self.store.fetch_topology(graph_id)?);
        if !dag.contains(start_vertex) {
            return Err(DagError::InvalidStartVertex {
                vertex: start_vertex,
                reason: format!("it is not part of graph {}", graph_id),
            });
        }
        let predecessors = dag.predecessors(start_vertex);
        if !predecessors.is_empty() {
            return Err(DagError::InvalidStartVertex {
                vertex: start_vertex,
                reason: format!("it has incoming edges from {:?}", predecessors),
            });
        }

        let pipeline = self.store.create_pipeline(graph_id, start_vertex, params)?;
        tracing::info!(
            "Created pipeline {} for graph {} at vertex {}",
            pipeline.id,
            graph_id,
            start_vertex
        );
        Ok(pipeline)
    }

    /// Start a pipeline and run it to completion
    pub async fn execute(
        &self,
        graph_id: GraphId,
        start_vertex: VertexId,
        params: Map<String, Value>,
    ) -> DagResult<PipelineReport> {
        let pipeline = self.start(graph_id, start_vertex, params)?;
        self.run(pipeline.id).await
    }

    /// Drive a pipeline to `Finished`, resuming from its track rows.
    ///
    /// A pipeline has at most one driver; a second `run` while one is active
    /// gives `PipelineActive`.
    pub async fn run(&self, pipeline_id: PipelineId) -> DagResult<PipelineReport> {
        let (pipeline, cancel_rx) = self.register(pipeline_id).await?;
        let result = self.run_registered(pipeline, cancel_rx).await;

        // Deregister only after the final state is committed
        self.active_runs.write().await.remove(&pipeline_id);
        result
    }

    /// Claim the pipeline for this driver.
    ///
    /// The active check, the finished check and the insert happen under one
    /// write lock, which `cancel` also takes.
    async fn register(
        &self,
        pipeline_id: PipelineId,
    ) -> DagResult<(Pipeline, watch::Receiver<bool>)> {
        let mut active_runs = self.active_runs.write().await;
        if active_runs.contains_key(&pipeline_id) {
            return Err(DagError::PipelineActive(pipeline_id));
        }

        let pipeline = self.pipeline(pipeline_id)?;
        if pipeline.state.is_terminal() {
            return Err(DagError::PipelineFinished(pipeline_id));
        }

        // Create cancellation channel
        let (cancel_tx, cancel_rx) = watch::channel(false);
        active_runs.insert(pipeline_id, cancel_tx);
        Ok((pipeline, cancel_rx))
    }

    async fn run_registered(
        &self,
        pipeline: Pipeline,
        cancel_rx: watch::Receiver<bool>,
    ) -> DagResult<PipelineReport> {
        let pipeline_id = pipeline.id;
        let graph = self
            .store
            .get_graph(pipeline.graph_id)?
            .ok_or(DagError::GraphNotFound(pipeline.graph_id))?;
        if !graph.validated {
            return Err(DagError::GraphNotValidated(graph.id));
        }

        let dag = Dag::from_topology(&self.store.fetch_topology(graph.id)?);
        let vertices: HashMap<VertexId, Vertex> = self
            .store
            .list_vertices(graph.id)?
            .into_iter()
            .map(|v| (v.id, v))
            .collect();

        // Rebuild progress from committed attempts
        let history = self.store.list_tracks(pipeline_id)?;
        let mut latest: BTreeMap<VertexId, State> = BTreeMap::new();
        let mut outputs: HashMap<VertexId, Value> = HashMap::new();
        for track in &history {
            latest.insert(track.vertex_id, track.state);
            if track.state == State::Succeed {
                outputs.insert(track.vertex_id, track.output.clone());
            }
        }
        let succeeded: BTreeSet<VertexId> = latest
            .iter()
            .filter(|(_, &state)| state == State::Succeed)
            .map(|(&v, _)| v)
            .collect();

        let mut frontier = Frontier::new(&dag, pipeline.start_vertex_id, succeeded);
        let mut first_failure = None;
        for (&vertex, _) in latest.iter().filter(|(_, &state)| state == State::Failed) {
            frontier.fail(vertex);
            match self.config.failure_policy {
                FailurePolicy::FailFast => {
                    first_failure.get_or_insert(vertex);
                }
                FailurePolicy::ContinueIndependent => {
                    frontier.skip_descendants(vertex);
                }
            }
        }

        if history.is_empty() {
            tracing::info!("Starting pipeline: pipeline_id={}", pipeline_id);
        } else {
            tracing::info!(
                "Resuming pipeline: pipeline_id={}, recorded_attempts={}",
                pipeline_id,
                history.len()
            );
        }

        let result = self
            .drive(
                &pipeline,
                &dag,
                &vertices,
                &mut frontier,
                outputs,
                first_failure,
                cancel_rx,
            )
            .await;

        let (outcome, last_vertex) = match result {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(
                    "Pipeline execution aborted: pipeline_id={}, error={}",
                    pipeline_id,
                    e
                );
                return Err(e);
            }
        };

        let waiting = frontier.waiting();
        let pipeline = self
            .store
            .update_pipeline(pipeline_id, State::Finished, last_vertex)?;

        let stalled = matches!(
            outcome,
            PipelineOutcome::Completed | PipelineOutcome::Contained { .. }
        ) && !waiting.is_empty();
        if stalled {
            tracing::error!(
                "Pipeline stalled: pipeline_id={}, waiting={:?}",
                pipeline_id,
                waiting
            );
            return Err(DagError::UnreachablePredecessor {
                pipeline: pipeline_id,
                waiting,
            });
        }

        match &outcome {
            PipelineOutcome::Completed => {
                tracing::info!("Pipeline completed: pipeline_id={}", pipeline_id)
            }
            PipelineOutcome::Cancelled => {
                tracing::warn!("Pipeline cancelled: pipeline_id={}", pipeline_id)
            }
            other => tracing::warn!(
                "Pipeline finished with failures: pipeline_id={}, outcome={:?}",
                pipeline_id,
                other
            ),
        }

        Ok(PipelineReport {
            pipeline,
            outcome,
            tracks: self.store.list_tracks(pipeline_id)?,
        })
    }

    /// Driver loop. It alone touches the frontier, so joins are evaluated
    /// and dispatched one completion at a time.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        pipeline: &Pipeline,
        dag: &Dag,
        vertices: &HashMap<VertexId, Vertex>,
        frontier: &mut Frontier<'_>,
        mut outputs: HashMap<VertexId, Value>,
        mut first_failure: Option<VertexId>,
        cancel_rx: watch::Receiver<bool>,
    ) -> DagResult<(PipelineOutcome, VertexId)> {
        let max_parallel = self.config.max_parallel.max(1);
        let fail_fast = self.config.failure_policy == FailurePolicy::FailFast;
        let mut in_flight: JoinSet<DagResult<StepResult>> = JoinSet::new();
        let mut last_vertex = pipeline.current_vertex_id;
        let mut cancelled = false;

        loop {
            if !cancelled && *cancel_rx.borrow() {
                tracing::warn!(
                    "Stopping dispatch for cancelled pipeline: pipeline_id={}",
                    pipeline.id
                );
                cancelled = true;
            }

            let halted = cancelled || (fail_fast && first_failure.is_some());
            if !halted {
                while in_flight.len() < max_parallel {
                    let Some(vertex_id) = frontier.next_ready() else {
                        break;
                    };
                    let job = self.prepare(pipeline, dag, vertices, &outputs, vertex_id)?;
                    let step = self.step_executor.clone();
                    last_vertex = vertex_id;
                    in_flight.spawn(async move { step.execute(job).await });
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let result = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    in_flight.shutdown().await;
                    return Err(e);
                }
                Err(e) => {
                    in_flight.shutdown().await;
                    return Err(DagError::Internal(format!("step task failed: {}", e)));
                }
            };

            last_vertex = result.vertex_id;
            if result.state == State::Succeed {
                outputs.insert(result.vertex_id, result.output);
                let released = frontier.succeed(result.vertex_id);
                if !released.is_empty() {
                    tracing::debug!("Vertex {} released {:?}", result.vertex_id, released);
                }
            } else {
                frontier.fail(result.vertex_id);
                if fail_fast {
                    first_failure.get_or_insert(result.vertex_id);
                } else {
                    let skipped = frontier.skip_descendants(result.vertex_id);
                    tracing::warn!(
                        "Vertex {} failed after {} attempt(s), skipping {:?}",
                        result.vertex_id,
                        result.attempts,
                        skipped
                    );
                }
            }
        }

        let outcome = if let Some(vertex) = first_failure.filter(|_| fail_fast) {
            PipelineOutcome::Failed { vertex }
        } else if cancelled {
            PipelineOutcome::Cancelled
        } else if !frontier.failed().is_empty() {
            PipelineOutcome::Contained {
                failed: frontier.failed().iter().copied().collect(),
                skipped: frontier.skipped().iter().copied().collect(),
            }
        } else {
            PipelineOutcome::Completed
        };

        Ok((outcome, last_vertex))
    }

    fn prepare(
        &self,
        pipeline: &Pipeline,
        dag: &Dag,
        vertices: &HashMap<VertexId, Vertex>,
        outputs: &HashMap<VertexId, Value>,
        vertex_id: VertexId,
    ) -> DagResult<StepJob> {
        let vertex = vertices
            .get(&vertex_id)
            .cloned()
            .ok_or(DagError::VertexNotFound(vertex_id))?;

        let upstream: Vec<&Value> = dag
            .predecessors(vertex_id)
            .iter()
            .filter_map(|p| outputs.get(p))
            .collect();
        let input = vertex.input.resolve(&pipeline.params, upstream);

        let successors = dag
            .successors(vertex_id)
            .into_iter()
            .filter_map(|s| vertices.get(&s).map(|v| (s, v.name.clone())))
            .collect();

        Ok(StepJob {
            pipeline_id: pipeline.id,
            vertex,
            input,
            successors,
        })
    }

    /// Stop a pipeline.
    ///
    /// A running pipeline stops dispatching at the next step boundary; one
    /// that is not running is finished directly.
    pub async fn cancel(&self, pipeline_id: PipelineId) -> DagResult<()> {
        // Held until the direct finish is committed so no driver can
        // register in between
        let active_runs = self.active_runs.write().await;
        if let Some(cancel_tx) = active_runs.get(&pipeline_id) {
            let _ = cancel_tx.send(true);
            tracing::info!("Cancellation signal sent for pipeline {}", pipeline_id);
            return Ok(());
        }

        let pipeline = self.pipeline(pipeline_id)?;
        if pipeline.state.is_terminal() {
            return Err(DagError::PipelineFinished(pipeline_id));
        }
        self.store
            .update_pipeline(pipeline_id, State::Finished, pipeline.current_vertex_id)?;
        drop(active_runs);
        tracing::info!("Pipeline {} finished without running", pipeline_id);
        Ok(())
    }

    pub fn pipeline(&self, pipeline_id: PipelineId) -> DagResult<Pipeline> {
        self.store
            .get_pipeline(pipeline_id)?
            .ok_or(DagError::PipelineNotFound(pipeline_id))
    }

    /// Track rows of a pipeline in the order they were written
    pub fn tracks(&self, pipeline_id: PipelineId) -> DagResult<Vec<Track>> {
        self.pipeline(pipeline_id)?;
        self.store.list_tracks(pipeline_id)
    }

    pub async fn is_active(&self, pipeline_id: PipelineId) -> bool {
        self.active_runs.read().await.contains_key(&pipeline_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NextHintPolicy, RetryPolicy};
    use crate::storage::RedbGraphStore;
    use crate::types::{InputSpec, NewTrack};
    use crate::workflow::runner::RunOutcome;
    use crate::workflow::validator::Validator;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Runner driven by the command text: `ok NAME`, `fail NAME`, `error`,
    /// `flaky N`, `sleep MS`, `block`, and anything else echoes its input.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        flaky_calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        started: Notify,
        release: Notify,
    }

    impl ScriptedRunner {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Runner for ScriptedRunner {
        async fn run(&self, command: &str, input: &Value) -> anyhow::Result<RunOutcome> {
            self.calls.lock().unwrap().push(command.to_string());
            let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));

            match verb {
                "ok" => Ok(RunOutcome::success(json!({ "from": arg }))),
                "fail" => Ok(RunOutcome::failure(json!({ "reason": arg }))),
                "error" => Err(anyhow::anyhow!("runner exploded")),
                "flaky" => {
                    let failures: usize = arg.parse()?;
                    if self.flaky_calls.fetch_add(1, Ordering::SeqCst) < failures {
                        Ok(RunOutcome::failure(json!({ "reason": "flaky" })))
                    } else {
                        Ok(RunOutcome::success(json!({ "from": "flaky" })))
                    }
                }
                "sleep" => {
                    let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_running.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(arg.parse()?)).await;
                    self.running.fetch_sub(1, Ordering::SeqCst);
                    Ok(RunOutcome::success(json!({ "slept": arg })))
                }
                "block" => {
                    self.started.notify_one();
                    self.release.notified().await;
                    Ok(RunOutcome::success(json!({})))
                }
                _ => Ok(RunOutcome::success(input.clone())),
            }
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        store: Arc<RedbGraphStore>,
        runner: Arc<ScriptedRunner>,
        graph: GraphId,
        ids: HashMap<&'static str, VertexId>,
    }

    /// Build and validate a graph from (name, script, input spec) triples
    fn fixture(vertices: &[(&'static str, &str, &str)], edges: &[(&str, &str)]) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RedbGraphStore::new(temp_dir.path().join("dagrun.redb")).unwrap());
        let graph = store.create_graph("test", None).unwrap().id;

        let mut ids = HashMap::new();
        for &(name, script, input) in vertices {
            let vertex = store
                .add_vertex(graph, name, InputSpec::parse(input).unwrap(), script)
                .unwrap();
            ids.insert(name, vertex.id);
        }
        for &(tail, head) in edges {
            store.add_edge(graph, ids[tail], ids[head]).unwrap();
        }
        assert!(Validator::new(store.clone()).validate(graph).unwrap());

        Fixture {
            _temp_dir: temp_dir,
            store,
            runner: Arc::new(ScriptedRunner::default()),
            graph,
            ids,
        }
    }

    impl Fixture {
        fn executor(&self, config: ExecutorConfig) -> PipelineExecutor {
            PipelineExecutor::new(self.store.clone(), self.runner.clone(), config)
        }

        fn id(&self, name: &str) -> VertexId {
            self.ids[name]
        }

        fn name(&self, id: VertexId) -> &'static str {
            self.ids
                .iter()
                .find(|(_, &v)| v == id)
                .map(|(&name, _)| name)
                .unwrap()
        }

        fn summary(&self, tracks: &[Track]) -> Vec<(&'static str, State)> {
            tracks.iter().map(|t| (self.name(t.vertex_id), t.state)).collect()
        }

        async fn run_from(&self, executor: &PipelineExecutor, start: &str) -> PipelineReport {
            executor
                .execute(self.graph, self.id(start), Map::new())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_linear_pipeline_completes() {
        let f = fixture(&[("A", "ok A", ""), ("B", "ok B", "")], &[("A", "B")]);
        let executor = f.executor(ExecutorConfig::default());

        let report = f.run_from(&executor, "A").await;

        assert_eq!(report.outcome, PipelineOutcome::Completed);
        assert_eq!(report.pipeline.state, State::Finished);
        assert_eq!(report.pipeline.current_vertex_id, f.id("B"));
        assert_eq!(
            f.summary(&report.tracks),
            vec![("A", State::Succeed), ("B", State::Succeed)]
        );
        assert_eq!(report.tracks[1].output, json!({"from": "B"}));
        assert_eq!(f.runner.calls(), vec!["ok A", "ok B"]);
    }

    #[tokio::test]
    async fn test_failure_stops_pipeline() {
        let f = fixture(&[("A", "fail A", ""), ("B", "ok B", "")], &[("A", "B")]);
        let executor = f.executor(ExecutorConfig::default());

        let report = f.run_from(&executor, "A").await;

        assert_eq!(report.outcome, PipelineOutcome::Failed { vertex: f.id("A") });
        assert_eq!(report.pipeline.state, State::Finished);
        assert_eq!(f.summary(&report.tracks), vec![("A", State::Failed)]);
        assert_eq!(f.runner.calls(), vec!["fail A"]);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_sibling_branches() {
        let f = fixture(
            &[("S", "ok S", ""), ("A", "fail A", ""), ("B", "ok B", "")],
            &[("S", "A"), ("S", "B")],
        );
        let executor = f.executor(ExecutorConfig::default());

        let report = f.run_from(&executor, "S").await;

        assert_eq!(report.outcome, PipelineOutcome::Failed { vertex: f.id("A") });
        assert_eq!(
            f.summary(&report.tracks),
            vec![("S", State::Succeed), ("A", State::Failed)]
        );
    }

    #[tokio::test]
    async fn test_join_never_fires_on_unreachable_predecessor() {
        let f = fixture(
            &[("A", "ok A", ""), ("B", "ok B", ""), ("C", "ok C", "")],
            &[("A", "C"), ("B", "C")],
        );
        let executor = f.executor(ExecutorConfig::default());
        let pipeline = executor.start(f.graph, f.id("A"), Map::new()).unwrap();

        let err = executor.run(pipeline.id).await.unwrap_err();

        match err {
            DagError::UnreachablePredecessor { pipeline: id, waiting } => {
                assert_eq!(id, pipeline.id);
                assert_eq!(waiting, vec![f.id("C")]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.runner.calls(), vec!["ok A"]);
        assert_eq!(executor.pipeline(pipeline.id).unwrap().state, State::Finished);
    }

    #[tokio::test]
    async fn test_diamond_join_runs_once_after_both_branches() {
        let f = fixture(
            &[
                ("S", "ok S", ""),
                ("A", "sleep 20", ""),
                ("B", "sleep 20", ""),
                ("C", "ok C", ""),
            ],
            &[("S", "A"), ("S", "B"), ("A", "C"), ("B", "C")],
        );
        let executor = f.executor(ExecutorConfig {
            max_parallel: 4,
            ..Default::default()
        });

        let report = f.run_from(&executor, "S").await;

        assert_eq!(report.outcome, PipelineOutcome::Completed);
        assert_eq!(report.tracks.len(), 4);
        assert_eq!(f.name(report.tracks[0].vertex_id), "S");
        assert_eq!(f.name(report.tracks[3].vertex_id), "C");
        assert_eq!(f.runner.calls().iter().filter(|c| *c == "ok C").count(), 1);
        // Both fork branches were in flight together
        assert_eq!(f.runner.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sequential_fork_runs_one_at_a_time() {
        let f = fixture(
            &[("S", "ok S", ""), ("A", "sleep 5", ""), ("B", "sleep 5", "")],
            &[("S", "A"), ("S", "B")],
        );
        let executor = f.executor(ExecutorConfig::default());

        let report = f.run_from(&executor, "S").await;

        assert_eq!(report.outcome, PipelineOutcome::Completed);
        assert_eq!(f.runner.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_continue_independent_skips_descendants() {
        let f = fixture(
            &[
                ("S", "ok S", ""),
                ("A", "fail A", ""),
                ("B", "ok B", ""),
                ("C", "ok C", ""),
            ],
            &[("S", "A"), ("S", "B"), ("A", "C")],
        );
        let executor = f.executor(ExecutorConfig {
            failure_policy: FailurePolicy::ContinueIndependent,
            ..Default::default()
        });

        let report = f.run_from(&executor, "S").await;

        assert_eq!(
            report.outcome,
            PipelineOutcome::Contained {
                failed: vec![f.id("A")],
                skipped: vec![f.id("C")],
            }
        );
        assert_eq!(
            f.summary(&report.tracks),
            vec![("S", State::Succeed), ("A", State::Failed), ("B", State::Succeed)]
        );
        assert_eq!(report.pipeline.state, State::Finished);
    }

    #[tokio::test]
    async fn test_retry_writes_track_per_attempt() {
        let f = fixture(&[("A", "flaky 2", ""), ("B", "ok B", "")], &[("A", "B")]);
        let executor = f.executor(ExecutorConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_ms: 1,
            },
            ..Default::default()
        });

        let report = f.run_from(&executor, "A").await;

        assert_eq!(report.outcome, PipelineOutcome::Completed);
        let attempts: Vec<(u32, State)> = report
            .tracks
            .iter()
            .filter(|t| t.vertex_id == f.id("A"))
            .map(|t| (t.attempt, t.state))
            .collect();
        assert_eq!(
            attempts,
            vec![(1, State::Failed), (2, State::Failed), (3, State::Succeed)]
        );
    }

    #[tokio::test]
    async fn test_retry_exhausted_fails() {
        let f = fixture(&[("A", "fail A", "")], &[]);
        let executor = f.executor(ExecutorConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_ms: 1,
            },
            ..Default::default()
        });

        let report = f.run_from(&executor, "A").await;

        assert_eq!(report.outcome, PipelineOutcome::Failed { vertex: f.id("A") });
        assert_eq!(
            f.summary(&report.tracks),
            vec![("A", State::Failed), ("A", State::Failed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_attempt() {
        let f = fixture(&[("A", "sleep 5000", "")], &[]);
        let executor = f.executor(ExecutorConfig {
            step_timeout_secs: Some(1),
            ..Default::default()
        });

        let report = f.run_from(&executor, "A").await;

        assert_eq!(report.outcome, PipelineOutcome::Failed { vertex: f.id("A") });
        assert_eq!(
            report.tracks[0].output,
            json!({"error": "timed out after 1 seconds"})
        );
    }

    #[tokio::test]
    async fn test_runner_error_is_failed_attempt() {
        let f = fixture(&[("A", "error", "")], &[]);
        let executor = f.executor(ExecutorConfig::default());

        let report = f.run_from(&executor, "A").await;

        assert_eq!(report.tracks[0].state, State::Failed);
        assert_eq!(report.tracks[0].output, json!({"error": "runner exploded"}));
    }

    #[tokio::test]
    async fn test_input_layers_defaults_params_and_upstream() {
        let f = fixture(
            &[
                ("A", "ok A", ""),
                ("B", "echo", r#"{"limit": {"type": "integer", "default": 10}}"#),
            ],
            &[("A", "B")],
        );
        let executor = f.executor(ExecutorConfig::default());
        let mut params = Map::new();
        params.insert("region".into(), json!("eu"));
        params.insert("from".into(), json!("params"));

        let report = executor.execute(f.graph, f.id("A"), params).await.unwrap();

        let expected = json!({"limit": 10, "region": "eu", "from": "A"});
        assert_eq!(report.tracks[1].input, expected);
        assert_eq!(report.tracks[1].output, expected);
    }

    #[tokio::test]
    async fn test_missing_required_input_skips_runner() {
        let f = fixture(
            &[
                ("A", "ok A", ""),
                ("B", "echo", r#"{"token": {"type": "string", "required": true}}"#),
            ],
            &[("A", "B")],
        );
        let executor = f.executor(ExecutorConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_ms: 1,
            },
            ..Default::default()
        });

        let report = f.run_from(&executor, "A").await;

        assert_eq!(report.outcome, PipelineOutcome::Failed { vertex: f.id("B") });
        assert_eq!(
            f.summary(&report.tracks),
            vec![("A", State::Succeed), ("B", State::Failed)]
        );
        assert_eq!(f.runner.calls(), vec!["ok A"]);
    }

    #[tokio::test]
    async fn test_strict_next_hint_mismatch_fails() {
        let script = r#"{"script": "ok A", "next": "Z"}"#;
        let f = fixture(&[("A", script, ""), ("B", "ok B", "")], &[("A", "B")]);
        let executor = f.executor(ExecutorConfig {
            next_hint: NextHintPolicy::Strict,
            ..Default::default()
        });

        let report = f.run_from(&executor, "A").await;

        assert_eq!(report.outcome, PipelineOutcome::Failed { vertex: f.id("A") });
        assert_eq!(f.runner.calls(), vec!["ok A"]);
    }

    #[tokio::test]
    async fn test_next_hint_is_advisory_by_default() {
        let script = r#"{"script": "ok A", "next": "Z"}"#;
        let f = fixture(&[("A", script, ""), ("B", "ok B", "")], &[("A", "B")]);
        let executor = f.executor(ExecutorConfig::default());

        let report = f.run_from(&executor, "A").await;

        assert_eq!(report.outcome, PipelineOutcome::Completed);
        assert_eq!(f.runner.calls(), vec!["ok A", "ok B"]);
    }

    #[tokio::test]
    async fn test_strict_next_hint_accepts_successor() {
        let script = r#"{"script": "ok A", "next": "B"}"#;
        let f = fixture(&[("A", script, ""), ("B", "ok B", "")], &[("A", "B")]);
        let executor = f.executor(ExecutorConfig {
            next_hint: NextHintPolicy::Strict,
            ..Default::default()
        });

        let report = f.run_from(&executor, "A").await;

        assert_eq!(report.outcome, PipelineOutcome::Completed);
    }

    #[tokio::test]
    async fn test_start_requires_validated_graph() {
        let f = fixture(&[("A", "ok A", ""), ("B", "ok B", "")], &[]);
        f.store.add_edge(f.graph, f.id("A"), f.id("B")).unwrap();
        let executor = f.executor(ExecutorConfig::default());

        let err = executor.start(f.graph, f.id("A"), Map::new()).unwrap_err();
        assert!(matches!(err, DagError::GraphNotValidated(_)));

        let err = executor.start(GraphId(99), f.id("A"), Map::new()).unwrap_err();
        assert!(matches!(err, DagError::GraphNotFound(_)));
    }

    #[tokio::test]
    async fn test_start_vertex_must_be_source() {
        let f = fixture(&[("A", "ok A", ""), ("B", "ok B", "")], &[("A", "B")]);
        let executor = f.executor(ExecutorConfig::default());

        let err = executor.start(f.graph, f.id("B"), Map::new()).unwrap_err();
        assert!(matches!(err, DagError::InvalidStartVertex { .. }));

        let err = executor.start(f.graph, VertexId(999), Map::new()).unwrap_err();
        assert!(matches!(err, DagError::InvalidStartVertex { .. }));

        let pipeline = executor.start(f.graph, f.id("A"), Map::new()).unwrap();
        assert_eq!(pipeline.state, State::Waiting);
        assert_eq!(pipeline.current_vertex_id, f.id("A"));
    }

    #[tokio::test]
    async fn test_finished_pipeline_is_rejected() {
        let f = fixture(&[("A", "ok A", "")], &[]);
        let executor = f.executor(ExecutorConfig::default());
        let report = f.run_from(&executor, "A").await;

        let err = executor.run(report.pipeline.id).await.unwrap_err();
        assert!(matches!(err, DagError::PipelineFinished(_)));
        let err = executor.cancel(report.pipeline.id).await.unwrap_err();
        assert!(matches!(err, DagError::PipelineFinished(_)));
    }

    #[tokio::test]
    async fn test_cancel_idle_pipeline_finishes_it() {
        let f = fixture(&[("A", "ok A", "")], &[]);
        let executor = f.executor(ExecutorConfig::default());
        let pipeline = executor.start(f.graph, f.id("A"), Map::new()).unwrap();

        executor.cancel(pipeline.id).await.unwrap();

        assert_eq!(executor.pipeline(pipeline.id).unwrap().state, State::Finished);
        assert!(executor.tracks(pipeline.id).unwrap().is_empty());
        assert!(f.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_pipeline() {
        let f = fixture(
            &[("A", "block", ""), ("B", "ok B", "")],
            &[("A", "B")],
        );
        let executor = Arc::new(f.executor(ExecutorConfig::default()));
        let pipeline = executor.start(f.graph, f.id("A"), Map::new()).unwrap();

        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(pipeline.id).await })
        };

        f.runner.started.notified().await;
        assert!(executor.is_active(pipeline.id).await);
        executor.cancel(pipeline.id).await.unwrap();
        f.runner.release.notify_one();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.outcome, PipelineOutcome::Cancelled);
        assert_eq!(report.pipeline.state, State::Finished);
        // The in-flight attempt is still recorded
        assert_eq!(f.summary(&report.tracks), vec![("A", State::Succeed)]);
        assert!(!executor.is_active(pipeline.id).await);
    }

    #[tokio::test]
    async fn test_second_driver_is_rejected() {
        let f = fixture(&[("A", "block", ""), ("B", "ok B", "")], &[("A", "B")]);
        let executor = Arc::new(f.executor(ExecutorConfig::default()));
        let pipeline = executor.start(f.graph, f.id("A"), Map::new()).unwrap();

        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(pipeline.id).await })
        };
        f.runner.started.notified().await;

        let err = executor.run(pipeline.id).await.unwrap_err();
        assert!(matches!(err, DagError::PipelineActive(id) if id == pipeline.id));

        f.runner.release.notify_one();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.outcome, PipelineOutcome::Completed);
        assert_eq!(
            f.summary(&report.tracks),
            vec![("A", State::Succeed), ("B", State::Succeed)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_runs_dispatch_each_vertex_once() {
        let f = fixture(&[("A", "sleep 50", ""), ("B", "ok B", "")], &[("A", "B")]);
        let executor = Arc::new(f.executor(ExecutorConfig::default()));
        let pipeline = executor.start(f.graph, f.id("A"), Map::new()).unwrap();

        let first = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(pipeline.id).await })
        };
        let second = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(pipeline.id).await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(DagError::PipelineActive(_)) | Err(DagError::PipelineFinished(_))
        )));

        let tracks = executor.tracks(pipeline.id).unwrap();
        assert_eq!(
            f.summary(&tracks),
            vec![("A", State::Succeed), ("B", State::Succeed)]
        );
        assert_eq!(f.runner.calls(), vec!["sleep 50", "ok B"]);
        assert_eq!(executor.pipeline(pipeline.id).unwrap().state, State::Finished);
    }

    #[tokio::test]
    async fn test_resume_reuses_committed_outputs() {
        let f = fixture(&[("A", "ok A", ""), ("B", "echo", "")], &[("A", "B")]);
        let executor = f.executor(ExecutorConfig::default());
        let pipeline = executor.start(f.graph, f.id("A"), Map::new()).unwrap();
        f.store
            .record_attempt(NewTrack {
                pipeline_id: pipeline.id,
                vertex_id: f.id("A"),
                attempt: 1,
                input: json!({}),
                output: json!({"from": "earlier"}),
                state: State::Succeed,
            })
            .unwrap();

        let report = executor.run(pipeline.id).await.unwrap();

        assert_eq!(report.outcome, PipelineOutcome::Completed);
        assert_eq!(f.runner.calls(), vec!["echo"]);
        assert_eq!(report.tracks.len(), 2);
        assert_eq!(report.tracks[1].input, json!({"from": "earlier"}));
    }

    #[tokio::test]
    async fn test_resume_after_failure_finishes_failed() {
        let f = fixture(&[("A", "ok A", ""), ("B", "ok B", "")], &[("A", "B")]);
        let executor = f.executor(ExecutorConfig::default());
        let pipeline = executor.start(f.graph, f.id("A"), Map::new()).unwrap();
        f.store
            .record_attempt(NewTrack {
                pipeline_id: pipeline.id,
                vertex_id: f.id("A"),
                attempt: 1,
                input: json!({}),
                output: json!({"reason": "crash"}),
                state: State::Failed,
            })
            .unwrap();

        let report = executor.run(pipeline.id).await.unwrap();

        assert_eq!(report.outcome, PipelineOutcome::Failed { vertex: f.id("A") });
        assert!(f.runner.calls().is_empty());
        assert_eq!(report.pipeline.state, State::Finished);
    }

    #[tokio::test]
    async fn test_structural_edit_refused_while_running() {
        let f = fixture(&[("A", "block", "")], &[]);
        let executor = Arc::new(f.executor(ExecutorConfig::default()));
        let pipeline = executor.start(f.graph, f.id("A"), Map::new()).unwrap();

        let err = f
            .store
            .add_vertex(f.graph, "late", InputSpec::default(), "ok")
            .unwrap_err();
        assert!(matches!(err, DagError::GraphBusy { .. }));

        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(pipeline.id).await })
        };
        f.runner.started.notified().await;
        f.runner.release.notify_one();
        handle.await.unwrap().unwrap();

        f.store
            .add_vertex(f.graph, "late", InputSpec::default(), "ok")
            .unwrap();
    }
}
