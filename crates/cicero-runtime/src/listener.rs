//! Fact listener.
//!
//! Reacts to `fact.created` announcements and action activations by
//! re-matching the active actions against the fact log. Every fresh
//! binding is published on the action's invoke subject; de-duplication is
//! the invoker's responsibility.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cicero_core::broker::{BrokerError, StreamBroker, Subject, FACT_CREATED};
use cicero_core::matcher::{MatchError, Matcher};
use cicero_core::store::{ActionStore, FactStore, InvocationStore, StoreError};
use cicero_core::types::Action;

/// Listener error types
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Match error: {0}")]
    Match(#[from] MatchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fact subscription closed")]
    SubscriptionClosed,
}

/// Re-matches actions when the fact log grows.
pub struct FactListener {
    broker: Arc<dyn StreamBroker>,
    matcher: Matcher,
    actions: Arc<dyn ActionStore>,
    facts: Arc<dyn FactStore>,
    invocations: Arc<dyn InvocationStore>,
    activations: broadcast::Sender<Uuid>,
}

impl FactListener {
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        matcher: Matcher,
        actions: Arc<dyn ActionStore>,
        facts: Arc<dyn FactStore>,
        invocations: Arc<dyn InvocationStore>,
        activations: broadcast::Sender<Uuid>,
    ) -> Self {
        Self {
            broker,
            matcher,
            actions,
            facts,
            invocations,
            activations,
        }
    }

    /// Subscribe to fact announcements and activations, then react until
    /// cancelled. A sweep over all active actions runs first to catch
    /// facts that arrived while nobody listened.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ListenerError> {
        tracing::info!(subject = FACT_CREATED, "fact listener subscribing");
        let mut subscription = self.broker.subscribe(FACT_CREATED).await?;
        let mut activations = self.activations.subscribe();

        self.match_active_actions().await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("fact listener stopping");
                    return Ok(());
                }
                message = subscription.recv() => match message {
                    None => return Err(ListenerError::SubscriptionClosed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => self.match_active_actions().await?,
                },
                activation = activations.recv() => match activation {
                    Ok(action_id) => self.match_action_by_id(action_id).await?,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "activation feed lagged, re-matching everything");
                        self.match_active_actions().await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ListenerError::SubscriptionClosed);
                    }
                },
            }
        }
    }

    /// Re-match every active action.
    pub async fn match_active_actions(&self) -> Result<(), ListenerError> {
        for action in self.actions.list_active().await? {
            self.try_invoke(&action).await?;
        }
        Ok(())
    }

    async fn match_action_by_id(&self, action_id: Uuid) -> Result<(), ListenerError> {
        match self.actions.get_by_id(action_id).await? {
            Some(action) if action.active => self.try_invoke(&action).await,
            _ => Ok(()),
        }
    }

    /// Match one action; publish an invoke message when runnable.
    pub async fn try_invoke(&self, action: &Action) -> Result<(), ListenerError> {
        let binding = match self
            .matcher
            .match_action(action, self.facts.as_ref(), self.invocations.as_ref())
            .await?
        {
            Some(binding) => binding,
            None => return Ok(()),
        };

        let instance_id = self.actions.next_instance_id().await?;
        let payload = serde_json::to_vec(&binding.to_recorded())?;
        self.broker
            .publish(&Subject::invoke(&action.name, instance_id), payload.into())
            .await?;
        tracing::info!(
            action = %action.name,
            action_id = %action.id,
            instance_id,
            "action runnable, invoke published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cicero_core::evaluator::ConstraintEvaluator;
    use cicero_core::types::{
        ActionDefinition, Binding, Fact, InputDefinition, InputDefinitions, NewFact,
    };
    use cicero_stores::{BroadcastStreamBroker, MemoryStorage};
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    use crate::constraints::EqualityEvaluator;

    fn listener_over(
        storage: &Arc<MemoryStorage>,
        broker: &Arc<BroadcastStreamBroker>,
    ) -> FactListener {
        let evaluator: Arc<Mutex<dyn ConstraintEvaluator>> =
            Arc::new(Mutex::new(EqualityEvaluator));
        let (activations, _) = broadcast::channel(8);
        FactListener::new(
            broker.clone(),
            Matcher::new(evaluator),
            storage.clone(),
            storage.clone(),
            storage.clone(),
            activations,
        )
    }

    fn hello_action() -> Action {
        let mut inputs = InputDefinitions::new();
        inputs.insert("a", InputDefinition::required(r#"value.kind == "hello""#));
        Action::new(
            "hello",
            "source",
            ActionDefinition {
                meta: Default::default(),
                inputs,
            },
        )
    }

    #[tokio::test]
    async fn test_matching_action_publishes_invoke_with_binding() {
        let storage = Arc::new(MemoryStorage::new());
        let broker = Arc::new(BroadcastStreamBroker::default());
        let listener = listener_over(&storage, &broker);

        let fact = storage
            .insert(NewFact::new(json!({"kind": "hello"})))
            .await
            .expect("insert");
        storage.save(&hello_action()).await.expect("save");

        let mut invokes = broker
            .subscribe("workflow.*.*.invoke")
            .await
            .expect("subscribe");
        listener.match_active_actions().await.expect("match");

        let message = invokes.recv().await.expect("recv").expect("invoke");
        let subject = Subject::parse(&message.subject).expect("subject");
        assert!(matches!(subject, Subject::Invoke { ref workflow, .. } if workflow == "hello"));

        let payload: Value = serde_json::from_slice(&message.payload).expect("decode");
        assert_eq!(
            Binding::fact_id_from_recorded(&payload, "a"),
            Some(fact.id)
        );
        assert_eq!(
            payload.get("a").and_then(|entry| entry.get("value")),
            Some(&json!({"kind": "hello"}))
        );
    }

    #[tokio::test]
    async fn test_inactive_actions_are_not_matched() {
        let storage = Arc::new(MemoryStorage::new());
        let broker = Arc::new(BroadcastStreamBroker::default());
        let listener = listener_over(&storage, &broker);

        storage
            .insert(NewFact::new(json!({"kind": "hello"})))
            .await
            .expect("insert");
        let action = hello_action();
        storage.save(&action).await.expect("save");
        storage.set_active(action.id, false).await.expect("flip");

        let mut invokes = broker
            .subscribe("workflow.*.*.invoke")
            .await
            .expect("subscribe");
        listener.match_active_actions().await.expect("match");
        assert!(invokes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsatisfied_action_publishes_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let broker = Arc::new(BroadcastStreamBroker::default());
        let listener = listener_over(&storage, &broker);

        storage
            .insert(NewFact::new(json!({"kind": "other"})))
            .await
            .expect("insert");
        storage.save(&hello_action()).await.expect("save");

        let mut invokes = broker
            .subscribe("workflow.*.*.invoke")
            .await
            .expect("subscribe");
        listener.match_active_actions().await.expect("match");
        assert!(invokes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_instance_ids_are_fresh_per_invoke() {
        let storage = Arc::new(MemoryStorage::new());
        let broker = Arc::new(BroadcastStreamBroker::default());
        let listener = listener_over(&storage, &broker);

        storage
            .insert(NewFact::new(json!({"kind": "hello"})))
            .await
            .expect("insert");
        storage.save(&hello_action()).await.expect("save");

        let mut invokes = broker
            .subscribe("workflow.*.*.invoke")
            .await
            .expect("subscribe");

        // Two sweeps produce two invokes with distinct instance ids; the
        // invoker's idempotency key is what collapses duplicates.
        listener.match_active_actions().await.expect("match");
        listener.match_active_actions().await.expect("match");

        let first = invokes.recv().await.expect("recv").expect("invoke");
        let second = invokes.recv().await.expect("recv").expect("invoke");
        assert_ne!(first.subject, second.subject);
    }

    #[tokio::test]
    async fn test_facts_stay_immutable_across_sweeps() {
        let storage = Arc::new(MemoryStorage::new());
        let broker = Arc::new(BroadcastStreamBroker::default());
        let listener = listener_over(&storage, &broker);

        let fact = storage
            .insert(NewFact::new(json!({"kind": "hello"})))
            .await
            .expect("insert");
        storage.save(&hello_action()).await.expect("save");
        listener.match_active_actions().await.expect("match");

        let snapshot = storage.scan().await.expect("scan");
        let reread = snapshot
            .iter()
            .find(|candidate| candidate.id == fact.id)
            .expect("fact still present");
        assert_eq!(reread.value, json!({"kind": "hello"}));
        assert_eq!(reread.created_at, fact.created_at);
    }
}
