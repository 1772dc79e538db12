//! Evaluator trait seams
//!
//! Two opaque collaborators are modelled here:
//! - the constraint evaluator deciding whether a fact satisfies a match
//!   expression (hidden process-global state; all calls serialize through
//!   one mutex owned by the matcher)
//! - the definition evaluator turning an action source into its decoded
//!   definition, and an action plus binding into a workflow definition

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{ActionDefinition, Binding, Fact, WorkflowDefinition};

/// Evaluator error types
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Invalid match expression: {0}")]
    Expression(String),

    #[error("Invalid definition source: {0}")]
    Source(String),

    #[error("Evaluator exited with {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    #[error("Evaluator produced invalid output: {0}")]
    Output(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Decides whether a candidate fact satisfies a match expression.
///
/// The underlying engine is not reentrant: the matcher wraps every
/// implementation in a single mutex and recompiles per match instead of
/// passing compiled values across the boundary.
pub trait ConstraintEvaluator: Send {
    /// Evaluate `expr` against a candidate fact with the earlier bound
    /// inputs exposed as named values.
    fn matches(&self, expr: &str, candidate: &Fact, prior: &Binding) -> Result<bool, EvalError>;

    /// Check that an expression compiles in an empty scope.
    fn check(&self, expr: &str) -> Result<(), EvalError> {
        let probe = Fact {
            id: uuid::Uuid::nil(),
            run_id: None,
            created_at: chrono::DateTime::<chrono::Utc>::MIN_UTC,
            value: Value::Null,
            binary_hash: None,
        };
        self.matches(expr, &probe, &Binding::new()).map(|_| ())
    }
}

/// Captured evaluator process output, recorded on the invocation whether
/// or not evaluation succeeded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Produces decoded definitions from opaque action sources.
#[async_trait]
pub trait DefinitionEvaluator: Send + Sync {
    /// Parse an action source into its definition, without inputs.
    async fn parse_action(&self, source: &str) -> Result<ActionDefinition, EvalError>;

    /// Evaluate the workflow definition for one invocation.
    ///
    /// The process output is returned alongside the result so callers can
    /// record it even when evaluation fails.
    async fn evaluate(
        &self,
        workflow: &str,
        instance_id: u64,
        certs: &Map<String, Value>,
    ) -> (EvalOutput, Result<WorkflowDefinition, EvalError>);
}
