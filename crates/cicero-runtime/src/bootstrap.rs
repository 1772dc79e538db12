//! Bootstrap helpers for starting Cicero from a single YAML config.
//!
//! The external collaborators stay injected: the embedder supplies the
//! constraint evaluator and the job runner client, everything else is
//! built from configuration.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use cicero_config::CiceroConfig;
use cicero_core::broker::StreamBroker;
use cicero_core::evaluator::{ConstraintEvaluator, DefinitionEvaluator};
use cicero_core::matcher::Matcher;
use cicero_core::runner::JobRunner;
use cicero_core::store::{
    ActionStore, Database, FactStore, InvocationStore, RunStore, RunnerEventStore,
    StepInstanceStore, StoreError,
};
use cicero_stores::{BroadcastStreamBroker, MemoryStorage, PostgresStorage};

use crate::actions::ActionService;
use crate::consumer::EventConsumer;
use crate::evaluator::CommandEvaluator;
use crate::facts::FactService;
use crate::invoker::Invoker;
use crate::limiter::PriorityLimiter;
use crate::listener::FactListener;
use crate::supervisor::{Supervisor, SupervisorError};

/// Bootstrap error types
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("unsupported db backend: {0}")]
    UnsupportedBackend(String),
    #[error("missing connection_url for db backend {0}")]
    MissingConnectionUrl(String),
}

/// Every store seam, backed by one storage implementation.
struct StorageHandles {
    facts: Arc<dyn FactStore>,
    actions: Arc<dyn ActionStore>,
    runs: Arc<dyn RunStore>,
    invocations: Arc<dyn InvocationStore>,
    steps: Arc<dyn StepInstanceStore>,
    events: Arc<dyn RunnerEventStore>,
    db: Arc<dyn Database>,
}

impl StorageHandles {
    fn from_memory(storage: MemoryStorage) -> Self {
        let storage = Arc::new(storage);
        Self {
            facts: storage.clone(),
            actions: storage.clone(),
            runs: storage.clone(),
            invocations: storage.clone(),
            steps: storage.clone(),
            events: storage.clone(),
            db: storage,
        }
    }

    fn from_postgres(storage: PostgresStorage) -> Self {
        let storage = Arc::new(storage);
        Self {
            facts: storage.clone(),
            actions: storage.clone(),
            runs: storage.clone(),
            invocations: storage.clone(),
            steps: storage.clone(),
            events: storage.clone(),
            db: storage,
        }
    }

    async fn build(config: &CiceroConfig) -> Result<Self, BootstrapError> {
        match config.db.backend.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => Ok(Self::from_memory(MemoryStorage::new())),
            "postgres" => {
                let url = config
                    .db
                    .connection_url
                    .as_deref()
                    .filter(|url| !url.trim().is_empty())
                    .ok_or_else(|| BootstrapError::MissingConnectionUrl("postgres".to_string()))?;
                Ok(Self::from_postgres(PostgresStorage::new(url).await?))
            }
            other => Err(BootstrapError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// The assembled engine: services for embedding, components for running.
pub struct RuntimeApp {
    pub facts: Arc<FactService>,
    pub actions: Arc<ActionService>,
    pub broker: Arc<dyn StreamBroker>,
    invoker: Arc<Invoker>,
    consumer: Arc<EventConsumer>,
    listener: Arc<FactListener>,
}

impl RuntimeApp {
    /// Build the engine from configuration plus the injected external
    /// collaborators.
    pub async fn build(
        config: &CiceroConfig,
        constraint_evaluator: Arc<Mutex<dyn ConstraintEvaluator>>,
        runner: Arc<dyn JobRunner>,
    ) -> Result<Self, BootstrapError> {
        let storage = StorageHandles::build(config).await?;
        let broker: Arc<dyn StreamBroker> =
            Arc::new(BroadcastStreamBroker::new(config.broker.capacity));

        let mut evaluator = CommandEvaluator::new(
            config.evaluator.command.clone(),
            config.evaluator.args.clone(),
        );
        if let Some(timeout_ms) = config.evaluator.timeout_ms {
            evaluator = evaluator.with_timeout(Duration::from_millis(timeout_ms));
        }
        let evaluator: Arc<dyn DefinitionEvaluator> = Arc::new(evaluator);

        let facts = Arc::new(FactService::new(storage.facts.clone(), broker.clone()));
        let actions = Arc::new(ActionService::new(
            storage.actions.clone(),
            evaluator.clone(),
        ));
        let limiter = Arc::new(PriorityLimiter::new(config.invoker.slots));

        let invoker = Arc::new(Invoker::new(
            broker.clone(),
            evaluator,
            storage.actions.clone(),
            storage.steps.clone(),
            storage.db.clone(),
            runner.clone(),
            facts.clone(),
            limiter,
            config.logging.loki_url.clone(),
        ));
        let consumer = Arc::new(EventConsumer::new(
            runner,
            storage.events.clone(),
            storage.runs.clone(),
            storage.db.clone(),
            facts.clone(),
        ));
        let listener = Arc::new(FactListener::new(
            broker.clone(),
            Matcher::new(constraint_evaluator),
            storage.actions.clone(),
            storage.facts.clone(),
            storage.invocations.clone(),
            actions.activation_sender(),
        ));

        Ok(Self {
            facts,
            actions,
            broker,
            invoker,
            consumer,
            listener,
        })
    }

    /// Run the supervised component set until the token is cancelled or a
    /// component exhausts its restart budget.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        let mut supervisor = Supervisor::new(cancel);

        let invoker = self.invoker;
        supervisor.supervise("invoker", move |token| {
            let invoker = Arc::clone(&invoker);
            async move { invoker.run(token).await.map_err(Into::into) }
        });

        let consumer = self.consumer;
        supervisor.supervise("event-consumer", move |token| {
            let consumer = Arc::clone(&consumer);
            async move { consumer.run(token).await.map_err(Into::into) }
        });

        let listener = self.listener;
        supervisor.supervise("fact-listener", move |token| {
            let listener = Arc::clone(&listener);
            async move { listener.run(token).await.map_err(Into::into) }
        });

        supervisor.join().await
    }
}
