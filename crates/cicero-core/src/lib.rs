//! # Cicero Core
//!
//! Core abstractions and deterministic logic for the Cicero scheduling
//! engine.
//!
//! This crate contains:
//! - Fact / Action / Binding / Run / Invocation definitions
//! - Store, broker, job-runner and evaluator trait seams
//! - The input-matching logic that decides when an action is runnable
//!
//! This crate does NOT care about:
//! - How facts and runs are persisted (see `cicero-stores`)
//! - How the long-lived loops are scheduled (see `cicero-runtime`)
//! - How jobs actually execute

pub mod broker;
pub mod evaluator;
pub mod matcher;
pub mod runner;
pub mod store;
pub mod types;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::broker::{
        BrokerError, Message, StreamBroker, Subject, FACT_CREATED, INVOKE_PATTERN,
    };
    pub use crate::evaluator::{
        ConstraintEvaluator, DefinitionEvaluator, EvalError, EvalOutput,
    };
    pub use crate::matcher::{MatchError, Matcher};
    pub use crate::runner::{
        Allocation, ClientStatus, EventBatch, JobRunner, JobSpec, RunnerError, RunnerStreamEvent,
    };
    pub use crate::store::{
        ActionStore, Database, FactStore, InvocationStore, RunStore, RunnerEventStore,
        StepInstanceStore, StorageTx, StoreError,
    };
    pub use crate::types::{
        Action, ActionDefinition, Binding, BoundInput, Fact, InputDefinition, InputDefinitions,
        Invocation, NewFact, Run, RunOutput, RunnerEvent, Step, StepInstance, WorkflowDefinition,
    };
}

pub use broker::{BrokerError, Message, StreamBroker, Subject};
pub use evaluator::{ConstraintEvaluator, DefinitionEvaluator, EvalError};
pub use matcher::Matcher;
pub use runner::{JobRunner, JobSpec, RunnerError};
pub use store::{Database, FactStore, StorageTx, StoreError};
pub use types::{Action, Binding, Fact, Invocation, Run, StepInstance, WorkflowDefinition};
