//! Input matching
//!
//! Decides whether an action is runnable against a snapshot of the fact
//! log and, if so, with which input binding. Inputs are evaluated in
//! declaration order so later match expressions can reference earlier
//! bound inputs.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::evaluator::{ConstraintEvaluator, EvalError};
use crate::store::{FactStore, InvocationStore, StoreError};
use crate::types::{Action, Binding, InputDefinition};

/// Matcher error types
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),
}

/// Evaluates action inputs against the fact log.
///
/// The constraint engine underneath carries process-global state, so every
/// compile/evaluate call goes through one shared mutex. The lock is
/// released and reacquired at input boundaries to keep a slow action from
/// blocking the engine for unrelated work.
pub struct Matcher {
    evaluator: Arc<Mutex<dyn ConstraintEvaluator>>,
}

impl Matcher {
    /// Create a matcher over a shared constraint evaluator.
    pub fn new(evaluator: Arc<Mutex<dyn ConstraintEvaluator>>) -> Self {
        Self { evaluator }
    }

    /// Match an action against the current fact log.
    ///
    /// Returns the binding that satisfies the action, or `None` when the
    /// action is not runnable. For a fixed fact log the outcome is
    /// deterministic: required and optional inputs take the oldest
    /// matching fact not already consumed for the same `(action, input)`
    /// pair.
    pub async fn match_action(
        &self,
        action: &Action,
        facts: &dyn FactStore,
        invocations: &dyn InvocationStore,
    ) -> Result<Option<Binding>, MatchError> {
        let log = facts.scan().await?;

        let mut binding = Binding::new();
        for (name, def) in action.definition.inputs.iter() {
            // Store lookups happen outside the evaluator lock.
            let used = if def.not {
                Vec::new()
            } else {
                invocations.used_fact_ids(action.id, name).await?
            };

            let found = {
                let evaluator = self.evaluator.lock().await;
                let mut hit = None;
                // The log is ordered oldest-first; the first hit is the
                // deterministic pick.
                for fact in &log {
                    if !def.not && used.contains(&fact.id) {
                        continue;
                    }
                    if evaluator.matches(&def.match_expr, fact, &binding)? {
                        hit = Some(fact.clone());
                        break;
                    }
                }
                hit
            };

            if !Self::apply_policy(&mut binding, name, def, found) {
                return Ok(None);
            }
        }

        Ok(Some(binding))
    }

    /// The four-way policy on `(not, optional)`. Returns false when the
    /// action is not runnable.
    fn apply_policy(
        binding: &mut Binding,
        name: &str,
        def: &InputDefinition,
        found: Option<crate::types::Fact>,
    ) -> bool {
        match (def.not, def.optional, found) {
            // Required input: a fact must exist.
            (false, false, Some(fact)) => {
                binding.bind(name, fact);
                true
            }
            (false, false, None) => false,
            // Optional input: bind when found, absent otherwise.
            (false, true, Some(fact)) => {
                binding.bind(name, fact);
                true
            }
            (false, true, None) => {
                binding.bind_absent(name);
                true
            }
            // Negated required input: any match inhibits the action.
            (true, false, Some(_)) => false,
            // Negated optional input never fails.
            (true, _, _) => {
                binding.bind_absent(name);
                true
            }
        }
    }
}
