//! Invocation ledger types
//!
//! Invocation, StepInstance and Run record what happened when an action
//! fired: the evaluation attempt, the per-step materialization, and the
//! job submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One evaluation attempt of an action with a specific binding.
///
/// An invocation surviving without a run means the evaluation did not lead
/// to a live job: a decision-only definition or an evaluator failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Unique identifier for this invocation
    pub id: Uuid,
    /// The action that was evaluated
    pub action_id: Uuid,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Captured evaluator stdout
    #[serde(default)]
    pub eval_stdout: Option<String>,
    /// Captured evaluator stderr
    #[serde(default)]
    pub eval_stderr: Option<String>,
    /// The input binding the evaluator was invoked with, in recorded form
    pub binding: Value,
}

impl Invocation {
    /// Record a fresh evaluation attempt.
    pub fn new(action_id: Uuid, binding: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_id,
            created_at: Utc::now(),
            eval_stdout: None,
            eval_stderr: None,
            binding,
        }
    }
}

/// Per-step materialization within one workflow invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInstance {
    /// Unique identifier; doubles as the job id handed to the runner
    pub id: Uuid,
    /// Numeric workflow instance id carried by the invoke subject
    pub workflow_instance_id: u64,
    /// Step name within the workflow definition
    pub name: String,
    /// The certs payload the step was invoked with
    pub certs: Value,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Set when the step is torn down or completes
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepInstance {
    /// Materialize a step about to be submitted.
    pub fn new(workflow_instance_id: u64, name: impl Into<String>, certs: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_instance_id,
            name: name.into(),
            certs,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether the step has been closed out.
    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// A record of one job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// The job id under which the runner knows this run
    pub job_id: Uuid,
    /// The invocation that produced this run
    pub invocation_id: Uuid,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Set by the event consumer on terminal allocation state
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Fact template to publish when the job completes
    #[serde(default)]
    pub success: Option<Value>,
    /// Fact template to publish when the job fails
    #[serde(default)]
    pub failure: Option<Value>,
}

impl Run {
    /// Record a job submission.
    pub fn new(
        job_id: Uuid,
        invocation_id: Uuid,
        success: Option<Value>,
        failure: Option<Value>,
    ) -> Self {
        Self {
            job_id,
            invocation_id,
            created_at: Utc::now(),
            finished_at: None,
            success,
            failure,
        }
    }

    /// Whether the run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// A raw job-runner event persisted for dedupe and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerEvent {
    /// 16-byte digest of the event payload
    pub uid: [u8; 16],
    /// Monotone index assigned by the runner
    pub index: u64,
    /// The raw event payload
    pub payload: Value,
    /// Whether the domain handler processed this event
    pub handled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_terminality_follows_finished_at() {
        let mut run = Run::new(Uuid::new_v4(), Uuid::new_v4(), Some(json!({})), None);
        assert!(!run.is_terminal());
        run.finished_at = Some(Utc::now());
        assert!(run.is_terminal());
    }

    #[test]
    fn test_step_instance_starts_open() {
        let step = StepInstance::new(7, "build", json!({"a": 1}));
        assert!(!step.is_terminal());
        assert_eq!(step.workflow_instance_id, 7);
    }
}
