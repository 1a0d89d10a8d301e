use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to the rest of a pipeline when a vertex attempt fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching and finish the pipeline on the first failure
    #[default]
    FailFast,
    /// Skip the failed vertex's descendants; independent branches keep running
    ContinueIndependent,
}

/// How a script's `next` hint is checked against the graph's edges.
///
/// Edges always decide what runs next; the hint can only be verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextHintPolicy {
    Ignore,
    #[default]
    Warn,
    /// A hint that names no successor fails the attempt
    Strict,
}

/// Retry policy wrapped around a single vertex attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Tuning knobs for the pipeline executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Fork successors run concurrently up to this many at once; 1 is sequential
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Runner calls exceeding this are failed attempts
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,

    #[serde(default)]
    pub next_hint: NextHintPolicy,
}

fn default_max_parallel() -> usize {
    1
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            failure_policy: FailurePolicy::default(),
            retry: RetryPolicy::default(),
            step_timeout_secs: None,
            next_hint: NextHintPolicy::default(),
        }
    }
}
