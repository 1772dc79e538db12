//! Store trait seams
//!
//! This module defines the persistence abstractions:
//! - one read/insert trait per table (facts, actions, runs, invocations,
//!   step instances, runner events)
//! - `Database` / `StorageTx`: the transaction seam for the operations
//!   that must commit atomically with an external side effect
//!
//! Note: Implementations are in the cicero-stores crate

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Action, Fact, Invocation, NewFact, Run, RunnerEvent, StepInstance};

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Append-only repository of facts.
///
/// Insert is atomic; callers that need the commit announced on the
/// `fact.created` subject go through the runtime fact service, which
/// publishes after this trait's insert returns.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Append a fact. Binary payloads are stored by content address and
    /// the returned fact carries the resulting `binary_hash`. An explicit
    /// id that already exists is rejected with [`StoreError::Conflict`].
    async fn insert(&self, fact: NewFact) -> Result<Fact, StoreError>;

    /// Look up a fact by id.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Fact>, StoreError>;

    /// All facts produced by a run.
    async fn get_by_run(&self, run_id: Uuid) -> Result<Vec<Fact>, StoreError>;

    /// Snapshot of the fact log, oldest first.
    async fn scan(&self) -> Result<Vec<Fact>, StoreError>;

    /// Fetch a stored binary payload by content address.
    async fn get_binary(&self, hash: &str) -> Result<Option<Bytes>, StoreError>;
}

/// Stores action definitions. The registry never evaluates matches.
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Persist a new action.
    async fn save(&self, action: &Action) -> Result<(), StoreError>;

    /// Look up an action by id.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Action>, StoreError>;

    /// The most recently created action with this name.
    async fn get_latest_by_name(&self, name: &str) -> Result<Option<Action>, StoreError>;

    /// All currently active actions.
    async fn list_active(&self) -> Result<Vec<Action>, StoreError>;

    /// Flip the active flag.
    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), StoreError>;

    /// Allocate the next numeric workflow instance id.
    async fn next_instance_id(&self) -> Result<u64, StoreError>;
}

/// Reads over the run ledger; writes go through [`StorageTx`].
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Look up a run by the job id the runner knows it under.
    async fn get_by_job_id(&self, job_id: Uuid) -> Result<Option<Run>, StoreError>;
}

/// Reads over recorded invocations; writes go through [`StorageTx`].
#[async_trait]
pub trait InvocationStore: Send + Sync {
    /// Look up an invocation by id.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Invocation>, StoreError>;

    /// Ids of facts a prior invocation of this action already consumed
    /// for the given input. The matcher's oldest-first tie-break skips
    /// these.
    async fn used_fact_ids(
        &self,
        action_id: Uuid,
        input: &str,
    ) -> Result<Vec<Uuid>, StoreError>;
}

/// Reads over step instances; writes go through [`StorageTx`].
#[async_trait]
pub trait StepInstanceStore: Send + Sync {
    /// The step row for `(step name, workflow instance)`, if any. This is
    /// the idempotency probe for duplicate invoke deliveries.
    async fn get_by_name_and_instance(
        &self,
        name: &str,
        workflow_instance_id: u64,
    ) -> Result<Option<StepInstance>, StoreError>;
}

/// Reads over persisted runner events; writes go through [`StorageTx`].
#[async_trait]
pub trait RunnerEventStore: Send + Sync {
    /// The highest processed event index, if any event was processed.
    async fn last_index(&self) -> Result<Option<u64>, StoreError>;

    /// Whether an event with this digest was already saved.
    async fn contains(&self, uid: &[u8; 16]) -> Result<bool, StoreError>;
}

/// Opens transactions over the whole persisted state.
#[async_trait]
pub trait Database: Send + Sync {
    /// Begin a transaction.
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError>;
}

/// One open transaction.
///
/// Mutations become visible only on `commit`; dropping or rolling back an
/// open transaction discards them. External side effects (job
/// registration, deregistration, fact publication) are issued between the
/// mutations and `commit`, so a failing side effect aborts the whole
/// unit.
#[async_trait]
pub trait StorageTx: Send {
    async fn insert_invocation(&mut self, invocation: &Invocation) -> Result<(), StoreError>;

    /// Insert a step row. A row with the same `(name, workflow instance)`
    /// key is a conflict.
    async fn insert_step_instance(&mut self, step: &StepInstance) -> Result<(), StoreError>;

    /// Stamp `finished_at` on a step row.
    async fn finish_step_instance(
        &mut self,
        id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_run(&mut self, run: &Run) -> Result<(), StoreError>;

    /// Full replacement of a run row.
    async fn update_run(&mut self, run: &Run) -> Result<(), StoreError>;

    /// Save a raw runner event keyed by its digest. Saving an event whose
    /// digest is already present is a no-op, so replays do not poison the
    /// transaction.
    async fn save_runner_event(&mut self, event: &RunnerEvent) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
