//! # Cicero Stores
//!
//! Store and broker implementations for the Cicero scheduling engine.
//!
//! This crate provides:
//! - In-memory storage (every store trait plus the transaction seam)
//! - PostgreSQL storage backed by sqlx
//! - In-process broadcast stream broker

mod broker;
mod memory;
mod postgres;

pub use broker::BroadcastStreamBroker;
pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

// Re-export core traits for convenience
pub use cicero_core::broker::{BrokerError, Message, StreamBroker, Subject};
pub use cicero_core::store::{
    ActionStore, Database, FactStore, InvocationStore, RunStore, RunnerEventStore,
    StepInstanceStore, StorageTx, StoreError,
};
