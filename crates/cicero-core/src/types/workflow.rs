//! Workflow definition types
//!
//! The definition evaluator turns an action plus a concrete input binding
//! into a `WorkflowDefinition`: ordered steps that are either decisions
//! (outputs computed by pure evaluation) or runnable jobs.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::runner::JobSpec;

/// The evaluated definition of one invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Free-form metadata
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Steps in declaration order
    #[serde(default)]
    pub steps: Steps,
}

/// Ordered mapping from step name to step.
pub type Steps = IndexMap<String, Step>;

/// The success/failure fact templates a step publishes on completion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunOutput {
    /// Template published when the run completes
    #[serde(default)]
    pub success: Option<Value>,
    /// Template published when the run fails
    #[serde(default)]
    pub failure: Option<Value>,
}

impl RunOutput {
    /// The template for a decided outcome; success wins when both exist.
    pub fn decided(&self) -> Option<&Value> {
        self.success.as_ref().or(self.failure.as_ref())
    }
}

/// One step of a workflow definition.
///
/// A step either carries a job specification to submit, or it is a
/// decision whose outputs the evaluator already computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StepRepr", into = "StepRepr")]
pub enum Step {
    /// Outputs were computed by pure evaluation; nothing to submit.
    Decision {
        /// The computed outputs
        output: RunOutput,
    },
    /// A job must be submitted to the runner.
    Runnable {
        /// The job specification to register
        job: JobSpec,
        /// Templates to publish once the job reaches a terminal state
        output: RunOutput,
    },
}

impl Step {
    /// Whether this step submits a job.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Step::Runnable { .. })
    }

    /// The output templates of this step.
    pub fn output(&self) -> &RunOutput {
        match self {
            Step::Decision { output } | Step::Runnable { output, .. } => output,
        }
    }

    /// The job specification, when the step is runnable.
    pub fn job(&self) -> Option<&JobSpec> {
        match self {
            Step::Decision { .. } => None,
            Step::Runnable { job, .. } => Some(job),
        }
    }
}

/// Wire shape of a step: a nullable job plus outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepRepr {
    #[serde(default)]
    job: Option<JobSpec>,
    #[serde(default)]
    output: RunOutput,
}

impl From<StepRepr> for Step {
    fn from(repr: StepRepr) -> Self {
        match repr.job {
            None => Step::Decision {
                output: repr.output,
            },
            Some(job) => Step::Runnable {
                job,
                output: repr.output,
            },
        }
    }
}

impl From<Step> for StepRepr {
    fn from(step: Step) -> Self {
        match step {
            Step::Decision { output } => StepRepr { job: None, output },
            Step::Runnable { job, output } => StepRepr {
                job: Some(job),
                output,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_without_job_is_a_decision() {
        let step: Step = serde_json::from_value(json!({
            "output": {"success": {"decided": true}}
        }))
        .expect("decode");
        assert!(!step.is_runnable());
        assert_eq!(step.output().decided(), Some(&json!({"decided": true})));
    }

    #[test]
    fn test_step_with_job_is_runnable() {
        let step: Step = serde_json::from_value(json!({
            "job": {"name": "build", "task_groups": []},
            "output": {"failure": {"broke": true}}
        }))
        .expect("decode");
        assert!(step.is_runnable());
        assert_eq!(step.job().map(|job| job.name.as_str()), Some("build"));
    }

    #[test]
    fn test_workflow_definition_keeps_step_order() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "steps": {
                "fetch": {"output": {}},
                "build": {"job": {"name": "build", "task_groups": []}, "output": {}},
                "notify": {"output": {}}
            }
        }))
        .expect("decode");
        let names: Vec<&String> = definition.steps.keys().collect();
        assert_eq!(names, vec!["fetch", "build", "notify"]);
    }

    #[test]
    fn test_decided_prefers_success() {
        let output = RunOutput {
            success: Some(json!(1)),
            failure: Some(json!(2)),
        };
        assert_eq!(output.decided(), Some(&json!(1)));
    }
}
