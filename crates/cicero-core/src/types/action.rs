//! Action type definitions
//!
//! An action is a persisted reactive rule: a set of input predicates over
//! the fact log plus an opaque source the definition evaluator understands.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A persisted reactive rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Unique identifier for this action
    pub id: Uuid,
    /// Human-readable name; doubles as the workflow name on the wire
    pub name: String,
    /// The opaque definition source the evaluator understands
    pub source: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Whether the matcher considers this action at all
    pub active: bool,
    /// The decoded definition
    #[serde(flatten)]
    pub definition: ActionDefinition,
}

impl Action {
    /// Create an active action from its parsed definition.
    pub fn new(name: impl Into<String>, source: impl Into<String>, definition: ActionDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source: source.into(),
            created_at: Utc::now(),
            active: true,
            definition,
        }
    }
}

/// The decoded shape of an action source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionDefinition {
    /// Free-form metadata
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Input predicates, in declaration order
    #[serde(default)]
    pub inputs: InputDefinitions,
}

/// One input predicate of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    /// The input must NOT be satisfiable by any fact
    #[serde(default)]
    pub not: bool,
    /// Absence of a matching fact does not block the action
    #[serde(default)]
    pub optional: bool,
    /// Opaque predicate over a candidate fact and earlier bound inputs
    #[serde(rename = "match")]
    pub match_expr: String,
}

impl InputDefinition {
    /// A plain required input.
    pub fn required(match_expr: impl Into<String>) -> Self {
        Self {
            not: false,
            optional: false,
            match_expr: match_expr.into(),
        }
    }

    /// An input that binds when present but never blocks.
    pub fn optional(match_expr: impl Into<String>) -> Self {
        Self {
            not: false,
            optional: true,
            match_expr: match_expr.into(),
        }
    }

    /// An input that blocks while a matching fact exists.
    pub fn negated(match_expr: impl Into<String>) -> Self {
        Self {
            not: true,
            optional: false,
            match_expr: match_expr.into(),
        }
    }
}

/// Ordered mapping from input name to definition.
///
/// Declaration order is semantically relevant: later inputs may reference
/// earlier bound inputs inside their match expressions, so this is an
/// insertion-ordered map rather than a hash map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputDefinitions(IndexMap<String, InputDefinition>);

impl InputDefinitions {
    /// Create an empty input set.
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Append an input, keeping declaration order.
    pub fn insert(&mut self, name: impl Into<String>, def: InputDefinition) {
        self.0.insert(name.into(), def);
    }

    /// Iterate inputs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &InputDefinition)> {
        self.0.iter().map(|(name, def)| (name.as_str(), def))
    }

    /// Look up an input by name.
    pub fn get(&self, name: &str) -> Option<&InputDefinition> {
        self.0.get(name)
    }

    /// Number of declared inputs.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the action declares no inputs.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, InputDefinition)> for InputDefinitions {
    fn from_iter<I: IntoIterator<Item = (String, InputDefinition)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_definitions_preserve_declaration_order() {
        let raw = json!({
            "zebra": {"match": "a"},
            "apple": {"not": true, "match": "b"},
            "mango": {"optional": true, "match": "c"}
        });
        let inputs: InputDefinitions = serde_json::from_value(raw).expect("decode");
        let names: Vec<&str> = inputs.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["zebra", "apple", "mango"]);
        assert!(inputs.get("apple").map(|d| d.not).unwrap_or(false));
    }

    #[test]
    fn test_input_definitions_round_trip_keeps_order() {
        let mut inputs = InputDefinitions::new();
        inputs.insert("b", InputDefinition::required("x"));
        inputs.insert("a", InputDefinition::optional("y"));
        let encoded = serde_json::to_string(&inputs).expect("encode");
        let decoded: InputDefinitions = serde_json::from_str(&encoded).expect("decode");
        let names: Vec<&str> = decoded.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_action_definition_decodes_flags() {
        let raw = json!({
            "meta": {"description": "build it"},
            "inputs": {
                "commit": {"match": "value: kind: \"push\""}
            }
        });
        let def: ActionDefinition = serde_json::from_value(raw).expect("decode");
        assert_eq!(def.meta.get("description"), Some(&json!("build it")));
        let commit = def.inputs.get("commit").expect("commit input");
        assert!(!commit.not);
        assert!(!commit.optional);
    }
}
