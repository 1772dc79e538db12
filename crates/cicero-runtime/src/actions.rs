//! Action registry service.
//!
//! Owns action definitions: creating one parses the opaque source through
//! the definition evaluator; activation changes are announced so the fact
//! listener can re-check. Match evaluation never happens here.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use cicero_core::evaluator::{DefinitionEvaluator, EvalError};
use cicero_core::store::{ActionStore, StoreError};
use cicero_core::types::Action;

/// Action service error types
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),
}

/// Owns action definitions.
pub struct ActionService {
    store: Arc<dyn ActionStore>,
    evaluator: Arc<dyn DefinitionEvaluator>,
    activations: broadcast::Sender<Uuid>,
}

impl ActionService {
    /// Create an action service over a store and a definition evaluator.
    pub fn new(store: Arc<dyn ActionStore>, evaluator: Arc<dyn DefinitionEvaluator>) -> Self {
        let (activations, _) = broadcast::channel(64);
        Self {
            store,
            evaluator,
            activations,
        }
    }

    /// Parse a source into its definition and persist the action.
    pub async fn create(
        &self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Action, ActionError> {
        let source = source.into();
        let definition = self.evaluator.parse_action(&source).await?;
        let action = Action::new(name, source, definition);
        self.store.save(&action).await?;
        tracing::info!(action_id = %action.id, name = %action.name, "action created");

        // A fresh action is active; give the listener a nudge.
        let _ = self.activations.send(action.id);
        Ok(action)
    }

    /// Flip the active flag. Activation triggers a matcher re-check.
    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<(), ActionError> {
        self.store.set_active(id, active).await?;
        if active {
            let _ = self.activations.send(id);
        }
        Ok(())
    }

    /// Look up an action by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Action>, ActionError> {
        Ok(self.store.get_by_id(id).await?)
    }

    /// All currently active actions.
    pub async fn list_active(&self) -> Result<Vec<Action>, ActionError> {
        Ok(self.store.list_active().await?)
    }

    /// Subscribe to activation announcements.
    pub fn activation_feed(&self) -> broadcast::Receiver<Uuid> {
        self.activations.subscribe()
    }

    /// The activation sender, for components that resubscribe on restart.
    pub fn activation_sender(&self) -> broadcast::Sender<Uuid> {
        self.activations.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cicero_core::evaluator::EvalOutput;
    use cicero_core::types::{ActionDefinition, InputDefinition, InputDefinitions, WorkflowDefinition};
    use cicero_stores::MemoryStorage;
    use serde_json::{Map, Value};

    struct FixedEvaluator;

    #[async_trait]
    impl DefinitionEvaluator for FixedEvaluator {
        async fn parse_action(&self, source: &str) -> Result<ActionDefinition, EvalError> {
            if source == "broken" {
                return Err(EvalError::Source("does not parse".to_string()));
            }
            let mut inputs = InputDefinitions::new();
            inputs.insert("a", InputDefinition::required("any"));
            Ok(ActionDefinition {
                meta: Map::new(),
                inputs,
            })
        }

        async fn evaluate(
            &self,
            _workflow: &str,
            _instance_id: u64,
            _certs: &Map<String, Value>,
        ) -> (EvalOutput, Result<WorkflowDefinition, EvalError>) {
            (EvalOutput::default(), Ok(WorkflowDefinition::default()))
        }
    }

    #[tokio::test]
    async fn test_create_parses_source_and_announces() {
        let storage = Arc::new(MemoryStorage::new());
        let service = ActionService::new(storage.clone(), Arc::new(FixedEvaluator));
        let mut feed = service.activation_feed();

        let action = service.create("build", "source").await.expect("create");
        assert!(action.active);
        assert_eq!(action.definition.inputs.len(), 1);
        assert_eq!(feed.recv().await.expect("announcement"), action.id);

        let listed = service.list_active().await.expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_unparseable_source() {
        let storage = Arc::new(MemoryStorage::new());
        let service = ActionService::new(storage, Arc::new(FixedEvaluator));
        assert!(matches!(
            service.create("bad", "broken").await,
            Err(ActionError::Eval(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivation_does_not_announce() {
        let storage = Arc::new(MemoryStorage::new());
        let service = ActionService::new(storage, Arc::new(FixedEvaluator));
        let action = service.create("build", "source").await.expect("create");
        let mut feed = service.activation_feed();

        service.set_active(action.id, false).await.expect("flip");
        assert!(service.list_active().await.expect("list").is_empty());
        assert!(feed.try_recv().is_err());

        service.set_active(action.id, true).await.expect("flip");
        assert_eq!(feed.try_recv().expect("announced"), action.id);
    }
}
