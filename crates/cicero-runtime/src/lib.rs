//! # Cicero Runtime
//!
//! Long-lived components of the Cicero scheduling engine:
//! - FactListener: re-matches actions when facts arrive, publishes invokes
//! - Invoker: consumes invoke messages, evaluates definitions, submits runs
//! - EventConsumer: turns terminal job-runner events back into facts
//! - PriorityLimiter / Supervisor: rate control and restart supervision

mod actions;
mod bootstrap;
mod constraints;
mod consumer;
mod evaluator;
mod facts;
mod invoker;
mod limiter;
mod listener;
mod logging;
mod supervisor;

pub use actions::{ActionError, ActionService};
pub use bootstrap::{BootstrapError, RuntimeApp};
pub use constraints::EqualityEvaluator;
pub use consumer::{ConsumerError, EventConsumer};
pub use evaluator::CommandEvaluator;
pub use facts::{FactError, FactService};
pub use invoker::{Invoker, InvokerError};
pub use limiter::{AcquireError, Permit, Priority, PriorityLimiter};
pub use listener::{FactListener, ListenerError};
pub use logging::add_logging;
pub use supervisor::{ComponentError, Supervisor, SupervisorError};

// Re-export CancellationToken for convenience
pub use tokio_util::sync::CancellationToken;
