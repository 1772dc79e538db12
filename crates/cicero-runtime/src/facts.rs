//! Fact service.
//!
//! Pairs the durable fact store with the broker: every committed fact is
//! announced on `fact.created` so matchers re-check their actions. The
//! store remains the source of truth; the announcement is wake-up traffic.

use std::sync::Arc;

use thiserror::Error;

use cicero_core::broker::{BrokerError, StreamBroker, Subject};
use cicero_core::store::{FactStore, StoreError};
use cicero_core::types::{Fact, NewFact};

/// Fact service error types
#[derive(Debug, Error)]
pub enum FactError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Inserts facts and announces them.
pub struct FactService {
    store: Arc<dyn FactStore>,
    broker: Arc<dyn StreamBroker>,
}

impl FactService {
    /// Create a fact service over a store and a broker.
    pub fn new(store: Arc<dyn FactStore>, broker: Arc<dyn StreamBroker>) -> Self {
        Self { store, broker }
    }

    /// Insert a fact and announce it on `fact.created`.
    ///
    /// The insert commits first; a failed announcement surfaces as an
    /// error but the fact stays durable.
    pub async fn publish(&self, fact: NewFact) -> Result<Fact, FactError> {
        let stored = self.store.insert(fact).await?;
        tracing::debug!(fact_id = %stored.id, "fact created");

        let payload = serde_json::to_vec(&stored)?;
        self.broker
            .publish(&Subject::FactCreated, payload.into())
            .await?;
        Ok(stored)
    }

    /// The underlying store, for read access.
    pub fn store(&self) -> &Arc<dyn FactStore> {
        &self.store
    }
}
