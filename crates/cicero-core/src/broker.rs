//! Stream broker abstraction
//!
//! The broker carries three kinds of traffic:
//! - `workflow.<name>.<id>.invoke`: bindings ready to be invoked
//! - `workflow.<name>.<id>.cert`: certificates published post-invocation
//! - `fact.created`: every freshly committed fact
//!
//! Implementations live in `cicero-stores`.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Subject every committed fact is announced on.
pub const FACT_CREATED: &str = "fact.created";

/// Subject pattern the invoker subscribes to.
pub const INVOKE_PATTERN: &str = "workflow.*.*.invoke";

/// Broker error types
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Subscription closed: {0}")]
    Closed(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Malformed subject: {0}")]
    Subject(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// A parsed stream subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// `workflow.<name>.<id>.invoke`
    Invoke {
        workflow: String,
        instance_id: u64,
    },
    /// `workflow.<name>.<id>.cert`
    Cert {
        workflow: String,
        instance_id: u64,
    },
    /// `fact.created`
    FactCreated,
}

impl Subject {
    /// Build the invoke subject for a workflow instance.
    pub fn invoke(workflow: impl Into<String>, instance_id: u64) -> Self {
        Subject::Invoke {
            workflow: workflow.into(),
            instance_id,
        }
    }

    /// Build the cert subject for a workflow instance.
    pub fn cert(workflow: impl Into<String>, instance_id: u64) -> Self {
        Subject::Cert {
            workflow: workflow.into(),
            instance_id,
        }
    }

    /// Parse a raw subject by splitting on `.`.
    ///
    /// Segments 1 and 2 carry the workflow name and the numeric instance
    /// id. Anything unparseable is an error; callers drop such messages
    /// with a warning.
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        if raw == FACT_CREATED {
            return Ok(Subject::FactCreated);
        }

        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            ["workflow", workflow, id, kind] if !workflow.is_empty() => {
                let instance_id: u64 = id
                    .parse()
                    .map_err(|_| BrokerError::Subject(raw.to_string()))?;
                match *kind {
                    "invoke" => Ok(Subject::invoke(*workflow, instance_id)),
                    "cert" => Ok(Subject::cert(*workflow, instance_id)),
                    _ => Err(BrokerError::Subject(raw.to_string())),
                }
            }
            _ => Err(BrokerError::Subject(raw.to_string())),
        }
    }

    /// Whether a concrete subject matches a `*`-wildcard pattern.
    pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
        let mut pattern_parts = pattern.split('.');
        let mut subject_parts = subject.split('.');
        loop {
            match (pattern_parts.next(), subject_parts.next()) {
                (None, None) => return true,
                (Some("*"), Some(_)) => continue,
                (Some(expected), Some(actual)) if expected == actual => continue,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Invoke {
                workflow,
                instance_id,
            } => write!(f, "workflow.{workflow}.{instance_id}.invoke"),
            Subject::Cert {
                workflow,
                instance_id,
            } => write!(f, "workflow.{workflow}.{instance_id}.cert"),
            Subject::FactCreated => f.write_str(FACT_CREATED),
        }
    }
}

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct Message {
    /// The concrete subject this message was published on
    pub subject: String,
    /// The raw payload
    pub payload: Bytes,
}

/// StreamBroker trait - async publish/subscribe over wildcard subjects.
///
/// Subscriptions start at "latest received": only messages published after
/// the subscription was set up are delivered. An `Err` item in the stream
/// signals a broker-level failure the consumer treats as fatal.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Publish a payload on a concrete subject.
    async fn publish(&self, subject: &Subject, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to all subjects matching a `*`-wildcard pattern.
    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<Result<Message, BrokerError>>, BrokerError>;
}
