//! Fact type definitions
//!
//! A fact is a durable, immutable observation. Facts only ever get
//! appended; the id, timestamp and value of a stored fact never change.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An immutable observation in the fact log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Unique identifier for this fact
    pub id: Uuid,
    /// The run that produced this fact, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// The structured value of the observation
    pub value: Value,
    /// Content address of the attached binary blob, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_hash: Option<String>,
}

/// A fact that has not been stored yet.
///
/// The store assigns the id and timestamp on insert unless an explicit id
/// is provided, and content-addresses the binary blob into `binary_hash`.
#[derive(Debug, Clone, Default)]
pub struct NewFact {
    /// Explicit id; inserts with an id that already exists are rejected.
    pub id: Option<Uuid>,
    /// The run that produced this fact, if any
    pub run_id: Option<Uuid>,
    /// The structured value of the observation
    pub value: Value,
    /// Opaque binary payload to store alongside the value
    pub binary: Option<Bytes>,
}

impl NewFact {
    /// Create a new fact candidate from a value.
    pub fn new(value: Value) -> Self {
        Self {
            id: None,
            run_id: None,
            value,
            binary: None,
        }
    }

    /// Attach the run that produced this fact.
    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Attach a binary payload.
    pub fn with_binary(mut self, binary: impl Into<Bytes>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    /// Split a combined byte buffer into the JSON value prefix and the
    /// trailing binary payload.
    ///
    /// The buffer must start with one JSON document; everything after it is
    /// treated as the binary blob. With `trim_whitespace`, leading
    /// whitespace between the document and the blob is discarded.
    pub fn from_bytes(buf: &[u8], trim_whitespace: bool) -> Result<Self, serde_json::Error> {
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
        let value = match stream.next() {
            // An empty or all-whitespace buffer holds no document; re-parse
            // to surface the usual "expected value" error.
            None => return serde_json::from_slice::<Value>(buf).map(Self::new),
            Some(value) => value?,
        };

        let mut rest = &buf[stream.byte_offset()..];
        if trim_whitespace {
            while let [b' ' | b'\t' | b'\r' | b'\n', tail @ ..] = rest {
                rest = tail;
            }
        }

        let mut fact = Self::new(value);
        if !rest.is_empty() {
            fact.binary = Some(Bytes::copy_from_slice(rest));
        }
        Ok(fact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_bytes_value_only() {
        let fact = NewFact::from_bytes(br#"{"kind":"hello"}"#, true).expect("parse");
        assert_eq!(fact.value, json!({"kind": "hello"}));
        assert!(fact.binary.is_none());
    }

    #[test]
    fn test_from_bytes_splits_trailing_binary() {
        let fact = NewFact::from_bytes(b"{\"kind\":\"artifact\"}\n\x01\x02\x03", true)
            .expect("parse");
        assert_eq!(fact.value, json!({"kind": "artifact"}));
        assert_eq!(fact.binary.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_from_bytes_keeps_whitespace_when_asked() {
        let fact = NewFact::from_bytes(b"7 binary", false).expect("parse");
        assert_eq!(fact.value, json!(7));
        assert_eq!(fact.binary.as_deref(), Some(&b" binary"[..]));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(NewFact::from_bytes(b"not json", true).is_err());
        assert!(NewFact::from_bytes(b"", true).is_err());
    }

    #[test]
    fn test_fact_serde_omits_empty_optionals() {
        let fact = Fact {
            id: Uuid::new_v4(),
            run_id: None,
            created_at: Utc::now(),
            value: json!({"ok": true}),
            binary_hash: None,
        };
        let encoded = serde_json::to_value(&fact).expect("encode");
        assert!(encoded.get("run_id").is_none());
        assert!(encoded.get("binary_hash").is_none());
    }
}
