//! In-memory storage for development and testing.
//!
//! One `MemoryStorage` implements every store trait plus the transaction
//! seam; clones share state. Transactions buffer their mutations and
//! apply them under a single write lock on commit, so a failing external
//! side effect issued before `commit` leaves no trace.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use cicero_core::store::{
    ActionStore, Database, FactStore, InvocationStore, RunStore, RunnerEventStore,
    StepInstanceStore, StorageTx, StoreError,
};
use cicero_core::types::{
    Action, Binding, Fact, Invocation, NewFact, Run, RunnerEvent, StepInstance,
};

#[derive(Default)]
struct State {
    facts: Vec<Fact>,
    binaries: HashMap<String, Bytes>,
    actions: Vec<Action>,
    invocations: Vec<Invocation>,
    step_instances: Vec<StepInstance>,
    runs: Vec<Run>,
    runner_events: Vec<RunnerEvent>,
    instance_seq: u64,
}

/// Shared in-memory storage.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<State>>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }
}

fn content_address(binary: &Bytes) -> String {
    let mut hasher = Sha256::new();
    hasher.update(binary);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl FactStore for MemoryStorage {
    async fn insert(&self, fact: NewFact) -> Result<Fact, StoreError> {
        let mut state = self.write()?;

        let id = fact.id.unwrap_or_else(Uuid::new_v4);
        if state.facts.iter().any(|existing| existing.id == id) {
            return Err(StoreError::Conflict(format!("fact {id} already exists")));
        }

        let binary_hash = fact.binary.map(|binary| {
            let hash = content_address(&binary);
            state.binaries.insert(hash.clone(), binary);
            hash
        });

        let stored = Fact {
            id,
            run_id: fact.run_id,
            created_at: Utc::now(),
            value: fact.value,
            binary_hash,
        };
        state.facts.push(stored.clone());
        Ok(stored)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Fact>, StoreError> {
        Ok(self.read()?.facts.iter().find(|fact| fact.id == id).cloned())
    }

    async fn get_by_run(&self, run_id: Uuid) -> Result<Vec<Fact>, StoreError> {
        Ok(self
            .read()?
            .facts
            .iter()
            .filter(|fact| fact.run_id == Some(run_id))
            .cloned()
            .collect())
    }

    async fn scan(&self) -> Result<Vec<Fact>, StoreError> {
        let mut log = self.read()?.facts.clone();
        log.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(log)
    }

    async fn get_binary(&self, hash: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.read()?.binaries.get(hash).cloned())
    }
}

#[async_trait]
impl ActionStore for MemoryStorage {
    async fn save(&self, action: &Action) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.actions.iter().any(|existing| existing.id == action.id) {
            return Err(StoreError::Conflict(format!(
                "action {} already exists",
                action.id
            )));
        }
        state.actions.push(action.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Action>, StoreError> {
        Ok(self
            .read()?
            .actions
            .iter()
            .find(|action| action.id == id)
            .cloned())
    }

    async fn get_latest_by_name(&self, name: &str) -> Result<Option<Action>, StoreError> {
        Ok(self
            .read()?
            .actions
            .iter()
            .filter(|action| action.name == name)
            .max_by_key(|action| action.created_at)
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<Action>, StoreError> {
        let mut active: Vec<Action> = self
            .read()?
            .actions
            .iter()
            .filter(|action| action.active)
            .cloned()
            .collect();
        active.sort_by_key(|action| action.created_at);
        Ok(active)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let mut state = self.write()?;
        match state.actions.iter_mut().find(|action| action.id == id) {
            Some(action) => {
                action.active = active;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("action {id}"))),
        }
    }

    async fn next_instance_id(&self) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        state.instance_seq += 1;
        Ok(state.instance_seq)
    }
}

#[async_trait]
impl RunStore for MemoryStorage {
    async fn get_by_job_id(&self, job_id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self
            .read()?
            .runs
            .iter()
            .find(|run| run.job_id == job_id)
            .cloned())
    }
}

#[async_trait]
impl InvocationStore for MemoryStorage {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Invocation>, StoreError> {
        Ok(self
            .read()?
            .invocations
            .iter()
            .find(|invocation| invocation.id == id)
            .cloned())
    }

    async fn used_fact_ids(&self, action_id: Uuid, input: &str) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .read()?
            .invocations
            .iter()
            .filter(|invocation| invocation.action_id == action_id)
            .filter_map(|invocation| Binding::fact_id_from_recorded(&invocation.binding, input))
            .collect())
    }
}

#[async_trait]
impl StepInstanceStore for MemoryStorage {
    async fn get_by_name_and_instance(
        &self,
        name: &str,
        workflow_instance_id: u64,
    ) -> Result<Option<StepInstance>, StoreError> {
        Ok(self
            .read()?
            .step_instances
            .iter()
            .find(|step| step.name == name && step.workflow_instance_id == workflow_instance_id)
            .cloned())
    }
}

#[async_trait]
impl RunnerEventStore for MemoryStorage {
    async fn last_index(&self) -> Result<Option<u64>, StoreError> {
        Ok(self
            .read()?
            .runner_events
            .iter()
            .map(|event| event.index)
            .max())
    }

    async fn contains(&self, uid: &[u8; 16]) -> Result<bool, StoreError> {
        Ok(self
            .read()?
            .runner_events
            .iter()
            .any(|event| &event.uid == uid))
    }
}

#[async_trait]
impl Database for MemoryStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            state: Arc::clone(&self.state),
            ops: Vec::new(),
        }))
    }
}

enum Op {
    InsertInvocation(Invocation),
    InsertStepInstance(StepInstance),
    FinishStepInstance(Uuid, DateTime<Utc>),
    InsertRun(Run),
    UpdateRun(Run),
    SaveRunnerEvent(RunnerEvent),
}

/// Buffered transaction over [`MemoryStorage`].
struct MemoryTx {
    state: Arc<RwLock<State>>,
    ops: Vec<Op>,
}

impl MemoryTx {
    fn apply(state: &mut State, op: &Op) -> Result<(), StoreError> {
        match op {
            Op::InsertInvocation(invocation) => {
                if state.invocations.iter().any(|i| i.id == invocation.id) {
                    return Err(StoreError::Conflict(format!(
                        "invocation {} already exists",
                        invocation.id
                    )));
                }
                state.invocations.push(invocation.clone());
            }
            Op::InsertStepInstance(step) => {
                let clash = state.step_instances.iter().any(|existing| {
                    existing.id == step.id
                        || (existing.name == step.name
                            && existing.workflow_instance_id == step.workflow_instance_id)
                });
                if clash {
                    return Err(StoreError::Conflict(format!(
                        "step instance {}/{} already exists",
                        step.name, step.workflow_instance_id
                    )));
                }
                state.step_instances.push(step.clone());
            }
            Op::FinishStepInstance(id, finished_at) => {
                match state.step_instances.iter_mut().find(|step| step.id == *id) {
                    Some(step) => step.finished_at = Some(*finished_at),
                    None => return Err(StoreError::NotFound(format!("step instance {id}"))),
                }
            }
            Op::InsertRun(run) => {
                if state.runs.iter().any(|existing| existing.job_id == run.job_id) {
                    return Err(StoreError::Conflict(format!(
                        "run {} already exists",
                        run.job_id
                    )));
                }
                state.runs.push(run.clone());
            }
            Op::UpdateRun(run) => {
                match state
                    .runs
                    .iter_mut()
                    .find(|existing| existing.job_id == run.job_id)
                {
                    Some(existing) => *existing = run.clone(),
                    None => return Err(StoreError::NotFound(format!("run {}", run.job_id))),
                }
            }
            Op::SaveRunnerEvent(event) => {
                // Replayed events carry the same digest; keep the first copy.
                if !state.runner_events.iter().any(|e| e.uid == event.uid) {
                    state.runner_events.push(event.clone());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn insert_invocation(&mut self, invocation: &Invocation) -> Result<(), StoreError> {
        self.ops.push(Op::InsertInvocation(invocation.clone()));
        Ok(())
    }

    async fn insert_step_instance(&mut self, step: &StepInstance) -> Result<(), StoreError> {
        self.ops.push(Op::InsertStepInstance(step.clone()));
        Ok(())
    }

    async fn finish_step_instance(
        &mut self,
        id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ops.push(Op::FinishStepInstance(id, finished_at));
        Ok(())
    }

    async fn insert_run(&mut self, run: &Run) -> Result<(), StoreError> {
        self.ops.push(Op::InsertRun(run.clone()));
        Ok(())
    }

    async fn update_run(&mut self, run: &Run) -> Result<(), StoreError> {
        self.ops.push(Op::UpdateRun(run.clone()));
        Ok(())
    }

    async fn save_runner_event(&mut self, event: &RunnerEvent) -> Result<(), StoreError> {
        self.ops.push(Op::SaveRunnerEvent(event.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        // Validate against a scratch copy first so a failing op leaves the
        // shared state untouched.
        let mut staged = State {
            facts: state.facts.clone(),
            binaries: state.binaries.clone(),
            actions: state.actions.clone(),
            invocations: state.invocations.clone(),
            step_instances: state.step_instances.clone(),
            runs: state.runs.clone(),
            runner_events: state.runner_events.clone(),
            instance_seq: state.instance_seq,
        };
        for op in &self.ops {
            Self::apply(&mut staged, op)?;
        }
        *state = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
