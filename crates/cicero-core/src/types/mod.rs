//! Domain type definitions
//!
//! The persisted shapes of the fact log and the run ledger:
//! - Fact: an immutable observation
//! - Action: a reactive rule over the fact log
//! - Binding: the facts chosen to satisfy an action's inputs
//! - WorkflowDefinition / Step: the evaluated definition of one invocation
//! - Invocation / StepInstance / Run: the invocation ledger

mod action;
mod binding;
mod fact;
mod run;
mod workflow;

pub use action::{Action, ActionDefinition, InputDefinition, InputDefinitions};
pub use binding::{Binding, BoundInput};
pub use fact::{Fact, NewFact};
pub use run::{Invocation, Run, RunnerEvent, StepInstance};
pub use workflow::{RunOutput, Step, Steps, WorkflowDefinition};
