//! Input bindings
//!
//! A binding records which facts satisfied an action's inputs. Optional
//! and negated inputs bind to "absent".

use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::Fact;

/// The resolution of one input.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundInput {
    /// The input was satisfied by this fact.
    Fact(Fact),
    /// The input bound to no fact (optional or negated input).
    Absent,
}

impl BoundInput {
    /// The bound fact, if any.
    pub fn fact(&self) -> Option<&Fact> {
        match self {
            BoundInput::Fact(fact) => Some(fact),
            BoundInput::Absent => None,
        }
    }
}

/// Ordered mapping from input name to the fact that satisfied it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Binding(Vec<(String, BoundInput)>);

impl Binding {
    /// Create an empty binding.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Bind an input to a fact.
    pub fn bind(&mut self, name: impl Into<String>, fact: Fact) {
        self.0.push((name.into(), BoundInput::Fact(fact)));
    }

    /// Bind an input to "absent".
    pub fn bind_absent(&mut self, name: impl Into<String>) {
        self.0.push((name.into(), BoundInput::Absent));
    }

    /// Look up an input by name.
    pub fn get(&self, name: &str) -> Option<&BoundInput> {
        self.0
            .iter()
            .find(|(bound, _)| bound == name)
            .map(|(_, input)| input)
    }

    /// Iterate bound inputs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BoundInput)> {
        self.0.iter().map(|(name, input)| (name.as_str(), input))
    }

    /// Number of bound inputs, absent ones included.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The facts bound by name, skipping absent inputs.
    pub fn facts(&self) -> impl Iterator<Item = (&str, &Fact)> {
        self.iter()
            .filter_map(|(name, input)| input.fact().map(|fact| (name, fact)))
    }

    /// The certs payload published on the invoke subject:
    /// `{input name: fact value}`, absent inputs omitted.
    pub fn to_certs(&self) -> Map<String, Value> {
        self.facts()
            .map(|(name, fact)| (name.to_string(), fact.value.clone()))
            .collect()
    }

    /// The recorded form persisted on the invocation:
    /// `{input name: {"fact_id": ..., "value": ...} | null}`.
    pub fn to_recorded(&self) -> Value {
        let mut map = Map::new();
        for (name, input) in self.iter() {
            let entry = match input {
                BoundInput::Fact(fact) => json!({
                    "fact_id": fact.id,
                    "value": fact.value,
                }),
                BoundInput::Absent => Value::Null,
            };
            map.insert(name.to_string(), entry);
        }
        Value::Object(map)
    }

    /// The fact id recorded for an input inside a recorded binding value.
    pub fn fact_id_from_recorded(recorded: &Value, input: &str) -> Option<Uuid> {
        recorded
            .get(input)?
            .get("fact_id")?
            .as_str()
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

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
    fn test_certs_omit_absent_inputs() {
        let mut binding = Binding::new();
        binding.bind("a", fact(json!({"kind": "hello"})));
        binding.bind_absent("b");

        let certs = binding.to_certs();
        assert_eq!(certs.get("a"), Some(&json!({"kind": "hello"})));
        assert!(!certs.contains_key("b"));
    }

    #[test]
    fn test_recorded_binding_round_trips_fact_ids() {
        let first = fact(json!(1));
        let mut binding = Binding::new();
        binding.bind("a", first.clone());
        binding.bind_absent("b");

        let recorded = binding.to_recorded();
        assert_eq!(
            Binding::fact_id_from_recorded(&recorded, "a"),
            Some(first.id)
        );
        assert_eq!(Binding::fact_id_from_recorded(&recorded, "b"), None);
        assert_eq!(Binding::fact_id_from_recorded(&recorded, "missing"), None);
    }

    #[test]
    fn test_binding_preserves_declaration_order() {
        let mut binding = Binding::new();
        binding.bind("z", fact(json!(1)));
        binding.bind("a", fact(json!(2)));
        let names: Vec<&str> = binding.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["z", "a"]);
    }
}
