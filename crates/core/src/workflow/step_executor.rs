use super::runner::{RunOutcome, Runner};
use crate::config::{ExecutorConfig, NextHintPolicy};
use crate::error::DagResult;
use crate::storage::GraphStore;
use crate::types::{NewTrack, PipelineId, ScriptPayload, State, Vertex, VertexId};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Everything one vertex needs to run, detached from the driver loop
#[derive(Debug, Clone)]
pub struct StepJob {
    pub pipeline_id: PipelineId,
    pub vertex: Vertex,
    /// Resolved input, or why it could not be resolved
    pub input: Result<Value, String>,
    /// Successor ids and names, for checking the `next` hint
    pub successors: Vec<(VertexId, String)>,
}

/// Final state of a vertex after all of its attempts
#[derive(Debug, Clone)]
pub struct StepResult {
    pub vertex_id: VertexId,
    pub state: State,
    pub output: Value,
    pub attempts: u32,
}

/// Step executor with retry and timeout logic
#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn GraphStore>,
    runner: Arc<dyn Runner>,
    config: Arc<ExecutorConfig>,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        runner: Arc<dyn Runner>,
        config: Arc<ExecutorConfig>,
    ) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// Run a vertex until it succeeds or its attempts are used up.
    ///
    /// Each attempt moves the pipeline to `Running` first and ends by writing
    /// its own track row. Only store failures are returned as errors.
    pub async fn execute(&self, job: StepJob) -> DagResult<StepResult> {
        let payload = ScriptPayload::parse(&job.vertex.script);
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            self.store
                .update_pipeline(job.pipeline_id, State::Running, job.vertex.id)?;

            tracing::info!(
                "Executing vertex {} '{}' (attempt {}) for pipeline {}",
                job.vertex.id,
                job.vertex.name,
                attempt,
                job.pipeline_id
            );

            let (input, outcome) = match &job.input {
                Ok(input) => {
                    let outcome = self.attempt(&job, &payload, input).await;
                    (input.clone(), outcome)
                }
                Err(reason) => {
                    tracing::warn!("Vertex {} input rejected: {}", job.vertex.id, reason);
                    (Value::Null, RunOutcome::failure(json!({ "error": reason })))
                }
            };

            let outcome = if outcome.succeeded {
                self.check_next_hint(&job, &payload, outcome)
            } else {
                outcome
            };
            let state = if outcome.succeeded {
                State::Succeed
            } else {
                State::Failed
            };

            self.store.record_attempt(NewTrack {
                pipeline_id: job.pipeline_id,
                vertex_id: job.vertex.id,
                attempt,
                input,
                output: outcome.output.clone(),
                state,
            })?;

            // A bad input fails the same way every time
            let will_retry =
                state == State::Failed && job.input.is_ok() && attempt < max_attempts;
            if !will_retry {
                return Ok(StepResult {
                    vertex_id: job.vertex.id,
                    state,
                    output: outcome.output,
                    attempts: attempt,
                });
            }

            let backoff = self.config.retry.backoff(attempt);
            tracing::info!(
                "Retrying vertex {} after {:?} (attempt {})",
                job.vertex.id,
                backoff,
                attempt + 1
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// One runner call, bounded by the configured timeout
    async fn attempt(&self, job: &StepJob, payload: &ScriptPayload, input: &Value) -> RunOutcome {
        let call = self.runner.run(&payload.command, input);

        let result = if let Some(timeout_secs) = self.config.step_timeout_secs {
            match timeout(Duration::from_secs(timeout_secs), call).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("Vertex {} timed out", job.vertex.id);
                    return RunOutcome::failure(json!({
                        "error": format!("timed out after {} seconds", timeout_secs)
                    }));
                }
            }
        } else {
            call.await
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Runner failed on vertex {}: {:#}", job.vertex.id, e);
                RunOutcome::failure(json!({ "error": format!("{:#}", e) }))
            }
        }
    }

    fn check_next_hint(
        &self,
        job: &StepJob,
        payload: &ScriptPayload,
        outcome: RunOutcome,
    ) -> RunOutcome {
        let Some(hint) = &payload.next else {
            return outcome;
        };
        if self.config.next_hint == NextHintPolicy::Ignore {
            return outcome;
        }

        let matches = job
            .successors
            .iter()
            .any(|(id, name)| name == hint || id.to_string() == *hint);
        if matches {
            return outcome;
        }

        match self.config.next_hint {
            NextHintPolicy::Strict => {
                tracing::warn!(
                    "Vertex {} names next '{}' which is not a successor",
                    job.vertex.id,
                    hint
                );
                RunOutcome::failure(json!({
                    "error": format!("next '{}' is not a successor", hint),
                    "output": outcome.output,
                }))
            }
            _ => {
                tracing::warn!(
                    "Vertex {} names next '{}' which is not a successor; following edges",
                    job.vertex.id,
                    hint
                );
                outcome
            }
        }
    }
}
