use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Result of running one vertex script
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub output: Value,
    pub succeeded: bool,
}

impl RunOutcome {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            succeeded: true,
        }
    }

    pub fn failure(output: Value) -> Self {
        Self {
            output,
            succeeded: false,
        }
    }
}

/// External capability that executes a vertex's work.
///
/// A script that runs and reports failure is `Ok` with `succeeded == false`.
/// `Err` means the runner could not run it at all; the executor records both
/// as a failed attempt.
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, command: &str, input: &Value) -> Result<RunOutcome>;
}

/// Runs commands through a shell.
///
/// The input is written to stdin as JSON and exported as `DAGRUN_INPUT`.
/// Stdout becomes the output, parsed as JSON when it is valid JSON.
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait::async_trait]
impl Runner for ShellRunner {
    async fn run(&self, command: &str, input: &Value) -> Result<RunOutcome> {
        let input_json = serde_json::to_string(input).context("Failed to encode input")?;

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .env("DAGRUN_INPUT", &input_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.shell))?;

        // Fed from its own task so a script that writes before reading its
        // input cannot block on a full stdout pipe
        let writer = child.stdin.take().map(|mut stdin| {
            let payload = input_json.into_bytes();
            tokio::spawn(async move {
                // Scripts are free to exit without reading their input
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!("Script closed stdin early: {}", e);
                }
            })
        });

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for script")?;

        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::debug!("Stdin writer did not finish: {}", e);
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            let value = if stdout.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&stdout).unwrap_or(Value::String(stdout))
            };
            Ok(RunOutcome::success(value))
        } else {
            Ok(RunOutcome::failure(json!({
                "exit_code": output.status.code(),
                "stderr": stderr,
                "stdout": stdout,
            })))
        }
    }
}
