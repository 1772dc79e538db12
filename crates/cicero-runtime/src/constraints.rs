//! Built-in development constraint evaluator.
//!
//! The production constraint engine is an external collaborator; this
//! evaluator stands in for it in development and tests. It understands a
//! deliberately small expression form:
//!
//! - `any`: matches every fact
//! - `<path> == <path-or-literal>`: equality between two resolved sides
//!
//! Paths: `value.<keys...>` resolves into the candidate fact,
//! `_inputs.<name>.value.<keys...>` into an earlier bound input, and
//! `_inputs.<name>.id` to that input's fact id. Literals are
//! double-quoted strings, numbers, `true`, `false` and `null`.

use serde_json::Value;

use cicero_core::evaluator::{ConstraintEvaluator, EvalError};
use cicero_core::types::{Binding, Fact};

/// Path-equality evaluator for development use.
pub struct EqualityEvaluator;

fn resolve<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |value, key| value.get(key))
}

impl EqualityEvaluator {
    fn eval_side(side: &str, candidate: &Fact, prior: &Binding) -> Result<Option<Value>, EvalError> {
        if let Some(literal) = side.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            return Ok(Some(Value::String(literal.to_string())));
        }
        if side == "true" || side == "false" || side == "null" {
            return serde_json::from_str(side)
                .map(Some)
                .map_err(|e| EvalError::Expression(e.to_string()));
        }
        if side
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_digit() || first == '-')
        {
            return serde_json::from_str(side)
                .map(Some)
                .map_err(|e| EvalError::Expression(format!("bad literal '{side}': {e}")));
        }

        let segments: Vec<&str> = side.split('.').collect();
        match segments.as_slice() {
            ["value", rest @ ..] => Ok(resolve(&candidate.value, rest).cloned()),
            ["_inputs", name, "id"] => Ok(prior
                .get(name)
                .and_then(|input| input.fact())
                .map(|fact| Value::String(fact.id.to_string()))),
            ["_inputs", name, "value", rest @ ..] => Ok(prior
                .get(name)
                .and_then(|input| input.fact())
                .and_then(|fact| resolve(&fact.value, rest))
                .cloned()),
            _ => Err(EvalError::Expression(format!("unresolvable path '{side}'"))),
        }
    }
}

impl ConstraintEvaluator for EqualityEvaluator {
    fn matches(&self, expr: &str, candidate: &Fact, prior: &Binding) -> Result<bool, EvalError> {
        let expr = expr.trim();
        if expr == "any" {
            return Ok(true);
        }
        let (lhs, rhs) = expr
            .split_once("==")
            .ok_or_else(|| EvalError::Expression(format!("expected '==' in '{expr}'")))?;
        let lhs = Self::eval_side(lhs.trim(), candidate, prior)?;
        let rhs = Self::eval_side(rhs.trim(), candidate, prior)?;
        Ok(lhs.is_some() && lhs == rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn fact(value: Value) -> Fact {
        Fact {
            id: Uuid::new_v4(),
            run_id: None,
            created_at: Utc::now(),
            value,
            binary_hash: None,
        }
    }

    #[test]
    fn test_any_matches_everything() {
        let evaluator = EqualityEvaluator;
        assert!(evaluator
            .matches("any", &fact(json!(null)), &Binding::new())
            .expect("eval"));
    }

    #[test]
    fn test_string_equality_on_candidate_value() {
        let evaluator = EqualityEvaluator;
        let hello = fact(json!({"kind": "hello"}));
        assert!(evaluator
            .matches(r#"value.kind == "hello""#, &hello, &Binding::new())
            .expect("eval"));
        assert!(!evaluator
            .matches(r#"value.kind == "bye""#, &hello, &Binding::new())
            .expect("eval"));
    }

    #[test]
    fn test_missing_path_never_matches() {
        let evaluator = EqualityEvaluator;
        let empty = fact(json!({}));
        assert!(!evaluator
            .matches(r#"value.kind == "hello""#, &empty, &Binding::new())
            .expect("eval"));
    }

    #[test]
    fn test_reference_to_prior_input() {
        let evaluator = EqualityEvaluator;
        let parent = fact(json!({"id": "p-1"}));
        let mut prior = Binding::new();
        prior.bind("a", parent);

        let child = fact(json!({"parent": "p-1"}));
        assert!(evaluator
            .matches("value.parent == _inputs.a.value.id", &child, &prior)
            .expect("eval"));
    }

    #[test]
    fn test_numeric_and_bool_literals() {
        let evaluator = EqualityEvaluator;
        let numbered = fact(json!({"n": 7, "ok": true}));
        assert!(evaluator
            .matches("value.n == 7", &numbered, &Binding::new())
            .expect("eval"));
        assert!(evaluator
            .matches("value.ok == true", &numbered, &Binding::new())
            .expect("eval"));
    }

    #[test]
    fn test_bad_expression_is_an_error() {
        let evaluator = EqualityEvaluator;
        assert!(evaluator
            .matches("kind is hello", &fact(json!({})), &Binding::new())
            .is_err());
    }
}
