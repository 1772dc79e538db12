//! Subprocess definition evaluator.
//!
//! Runs a configured command to turn action sources and invocations into
//! definitions. The protocol is JSON over stdin/stdout:
//!
//! - `<command> <args...> action`: action source on stdin, decoded
//!   `ActionDefinition` JSON on stdout
//! - `<command> <args...> workflow <name> <instance id>`: certs JSON on
//!   stdin, `WorkflowDefinition` JSON on stdout
//!
//! stdout/stderr are captured whole; a non-zero exit is an evaluation
//! error carrying the captured stderr.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use cicero_core::evaluator::{DefinitionEvaluator, EvalError, EvalOutput};
use cicero_core::types::{ActionDefinition, WorkflowDefinition};

/// Definition evaluator shelling out to a configured command.
pub struct CommandEvaluator {
    command: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandEvaluator {
    /// Create an evaluator for the given command.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            timeout: None,
        }
    }

    /// Kill evaluations that run longer than this.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, extra_args: &[String], stdin_payload: &[u8]) -> Result<Captured, EvalError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.args(extra_args);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| EvalError::Io(format!("failed to spawn '{}': {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(stdin_payload)
                .await
                .map_err(|e| EvalError::Io(format!("write to evaluator stdin failed: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| EvalError::Io(format!("close evaluator stdin failed: {e}")))?;
        }

        let output = match self.timeout {
            Some(limit) => timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| EvalError::Io("evaluator timed out".to_string()))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| EvalError::Io(format!("wait for evaluator failed: {e}")))?;

        Ok(Captured {
            status: output.status.code().unwrap_or(-1),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

struct Captured {
    status: i32,
    success: bool,
    stdout: String,
    stderr: String,
}

impl Captured {
    fn output(&self) -> EvalOutput {
        EvalOutput {
            stdout: (!self.stdout.is_empty()).then(|| self.stdout.clone()),
            stderr: (!self.stderr.is_empty()).then(|| self.stderr.clone()),
        }
    }
}

#[async_trait]
impl DefinitionEvaluator for CommandEvaluator {
    async fn parse_action(&self, source: &str) -> Result<ActionDefinition, EvalError> {
        let captured = self
            .run(&["action".to_string()], source.as_bytes())
            .await?;
        if !captured.success {
            return Err(EvalError::Failed {
                status: captured.status,
                stderr: captured.stderr,
            });
        }
        serde_json::from_str(&captured.stdout).map_err(|e| EvalError::Output(e.to_string()))
    }

    async fn evaluate(
        &self,
        workflow: &str,
        instance_id: u64,
        certs: &Map<String, Value>,
    ) -> (EvalOutput, Result<WorkflowDefinition, EvalError>) {
        let payload = match serde_json::to_vec(certs) {
            Ok(payload) => payload,
            Err(e) => {
                return (
                    EvalOutput::default(),
                    Err(EvalError::Output(e.to_string())),
                )
            }
        };

        let args = vec![
            "workflow".to_string(),
            workflow.to_string(),
            instance_id.to_string(),
        ];
        let captured = match self.run(&args, &payload).await {
            Ok(captured) => captured,
            Err(e) => return (EvalOutput::default(), Err(e)),
        };

        let output = captured.output();
        if !captured.success {
            return (
                output,
                Err(EvalError::Failed {
                    status: captured.status,
                    stderr: captured.stderr,
                }),
            );
        }

        let definition = serde_json::from_str(&captured.stdout)
            .map_err(|e| EvalError::Output(e.to_string()));
        (output, definition)
    }
}
