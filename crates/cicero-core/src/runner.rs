//! Job runner abstraction
//!
//! The external job manager is opaque: it accepts job registrations,
//! deregistrations, and exposes a monotonically-indexed event stream.
//! Only the slice of its surface the engine needs is modelled here.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Runner error types
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Registration failed: {0}")]
    Register(String),

    #[error("Deregistration failed: {0}")]
    Deregister(String),

    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Malformed event payload: {0}")]
    Payload(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// A job specification submitted to the runner.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job id; the invoker sets this to the step-instance id
    #[serde(default)]
    pub id: Option<String>,
    /// Human-readable job name
    #[serde(default)]
    pub name: String,
    /// Task groups scheduled together
    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,
}

/// A group of tasks scheduled onto one allocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// One task within a group.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<TaskLifecycle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Template>,
}

/// Task lifecycle hook configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLifecycle {
    pub hook: String,
    #[serde(default)]
    pub sidecar: bool,
}

/// Task resource limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: u32,
    pub memory_mb: u32,
}

/// A file rendered into the task directory before start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub dest_path: String,
    pub embedded_tmpl: String,
}

/// Client-side allocation status reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

impl ClientStatus {
    /// Whether the allocation will never progress further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientStatus::Complete | ClientStatus::Failed | ClientStatus::Lost
        )
    }
}

/// The allocation payload of an allocation-updated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// The id of the job this allocation belongs to
    #[serde(rename = "JobID")]
    pub job_id: String,
    /// Client-side status
    #[serde(rename = "ClientStatus")]
    pub client_status: ClientStatus,
    /// Last modification time, nanoseconds since epoch
    #[serde(rename = "ModifyTime")]
    pub modify_time: i64,
}

impl Allocation {
    /// Whether the allocation reached a client-terminal status.
    pub fn client_terminal_status(&self) -> bool {
        self.client_status.is_terminal()
    }
}

/// Event topic carrying allocation updates.
pub const TOPIC_ALLOCATION: &str = "Allocation";

/// Event type carrying allocation updates.
pub const TYPE_ALLOCATION_UPDATED: &str = "AllocationUpdated";

/// One event from the runner's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerStreamEvent {
    /// Event topic, e.g. `Allocation`
    pub topic: String,
    /// Event type within the topic, e.g. `AllocationUpdated`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Monotone index assigned by the runner
    pub index: u64,
    /// The raw event payload
    pub payload: Value,
}

impl RunnerStreamEvent {
    /// Decode the allocation payload of an `AllocationUpdated` event.
    ///
    /// Returns `None` for events of any other topic/type.
    pub fn allocation(&self) -> Result<Option<Allocation>, RunnerError> {
        if self.topic != TOPIC_ALLOCATION || self.event_type != TYPE_ALLOCATION_UPDATED {
            return Ok(None);
        }
        let raw = self
            .payload
            .get("Allocation")
            .ok_or_else(|| RunnerError::Payload("missing Allocation payload".to_string()))?;
        serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| RunnerError::Payload(e.to_string()))
    }
}

/// A batch of events sharing one stream index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Index of this batch; the consumer's cursor is driven by it
    pub index: u64,
    /// Events contained in the batch
    pub events: Vec<RunnerStreamEvent>,
}

/// The live stream of event batches.
pub type RunnerEventStream = BoxStream<'static, Result<EventBatch, RunnerError>>;

/// JobRunner trait - the register/deregister/event-stream surface of the
/// external job manager.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Register a job. Returns runner warnings, which callers log.
    async fn register(&self, job: &JobSpec) -> Result<Vec<String>, RunnerError>;

    /// Deregister a job, optionally purging its history.
    async fn deregister(&self, job_id: &str, purge: bool) -> Result<(), RunnerError>;

    /// Open the event stream starting at the given index.
    ///
    /// The runner is known to re-emit the last event even when the start
    /// index is past it; consumers skip indices below their cursor.
    async fn event_stream(&self, start_index: u64) -> Result<RunnerEventStream, RunnerError>;
}
