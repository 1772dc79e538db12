//! Invoker.
//!
//! Consumes `workflow.*.*.invoke` messages, evaluates the workflow
//! definition for the carried binding, and drives each step: runnable
//! steps are submitted to the job runner atomically with their ledger
//! rows, inhibited steps are torn down, decisions publish their outputs
//! directly. One certificate is published per message.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use cicero_core::broker::{BrokerError, Message, StreamBroker, Subject, INVOKE_PATTERN};
use cicero_core::evaluator::DefinitionEvaluator;
use cicero_core::runner::{JobRunner, RunnerError};
use cicero_core::store::{ActionStore, Database, StepInstanceStore, StoreError};
use cicero_core::types::{Invocation, NewFact, Run, Step, StepInstance};

use crate::facts::{FactError, FactService};
use crate::limiter::{AcquireError, Priority, PriorityLimiter};
use crate::logging::add_logging;

/// Invoker error types
#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Fact error: {0}")]
    Fact(#[from] FactError),

    #[error("Limiter error: {0}")]
    Limiter(#[from] AcquireError),

    #[error("Job logging augmentation failed: {0}")]
    Logging(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invoke subscription closed")]
    SubscriptionClosed,
}

/// Consumes invoke messages and materializes runs.
pub struct Invoker {
    broker: Arc<dyn StreamBroker>,
    evaluator: Arc<dyn DefinitionEvaluator>,
    actions: Arc<dyn ActionStore>,
    steps: Arc<dyn StepInstanceStore>,
    db: Arc<dyn Database>,
    runner: Arc<dyn JobRunner>,
    facts: Arc<FactService>,
    limiter: Arc<PriorityLimiter>,
    loki_url: String,
}

impl Invoker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        evaluator: Arc<dyn DefinitionEvaluator>,
        actions: Arc<dyn ActionStore>,
        steps: Arc<dyn StepInstanceStore>,
        db: Arc<dyn Database>,
        runner: Arc<dyn JobRunner>,
        facts: Arc<FactService>,
        limiter: Arc<PriorityLimiter>,
        loki_url: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            evaluator,
            actions,
            steps,
            db,
            runner,
            facts,
            limiter,
            loki_url: loki_url.into(),
        }
    }

    /// Subscribe to the invoke pattern and process messages until
    /// cancelled. Broker-level failures and transient I/O errors return;
    /// the supervisor restarts the task.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), InvokerError> {
        tracing::info!(pattern = INVOKE_PATTERN, "invoker subscribing");
        let mut subscription = self.broker.subscribe(INVOKE_PATTERN).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("invoker stopping");
                    return Ok(());
                }
                message = subscription.recv() => match message {
                    None => return Err(InvokerError::SubscriptionClosed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(message)) => self.handle_message(message, &cancel).await?,
                }
            }
        }
    }

    /// Handle one invoke message. Malformed input is logged and dropped;
    /// everything else propagates.
    pub async fn handle_message(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<(), InvokerError> {
        let (workflow, instance_id) = match Subject::parse(&message.subject) {
            Ok(Subject::Invoke {
                workflow,
                instance_id,
            }) => (workflow, instance_id),
            Ok(_) | Err(_) => {
                tracing::warn!(subject = %message.subject, "unparseable invoke subject, ignoring");
                return Ok(());
            }
        };

        let binding = match serde_json::from_slice::<Value>(&message.payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!(subject = %message.subject, "invalid invoke payload, ignoring");
                return Ok(());
            }
        };

        self.invoke_workflow(&workflow, instance_id, binding, cancel)
            .await
    }

    async fn invoke_workflow(
        &self,
        workflow: &str,
        instance_id: u64,
        binding: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<(), InvokerError> {
        let _permit = self.limiter.acquire(Priority::High, cancel).await?;

        let action = match self.actions.get_latest_by_name(workflow).await? {
            Some(action) => action,
            None => {
                tracing::warn!(workflow, "invoke for unknown action, ignoring");
                return Ok(());
            }
        };

        // The wire carries the recorded binding; the evaluator sees only
        // the plain certs.
        let certs = certs_from_binding(&binding);

        let (output, result) = self
            .evaluator
            .evaluate(workflow, instance_id, &certs)
            .await;

        let mut invocation = Invocation::new(action.id, Value::Object(binding));
        invocation.eval_stdout = output.stdout;
        invocation.eval_stderr = output.stderr;
        let mut tx = self.db.begin().await?;
        tx.insert_invocation(&invocation).await?;
        tx.commit().await?;

        let definition = match result {
            Ok(definition) => definition,
            Err(e) => {
                tracing::warn!(workflow, instance_id, error = %e, "definition evaluation failed");
                self.publish_cert(
                    workflow,
                    instance_id,
                    Value::Object(Map::from_iter([(
                        "error".to_string(),
                        Value::String(e.to_string()),
                    )])),
                )
                .await?;
                return Ok(());
            }
        };

        let certs_value = Value::Object(certs);
        let mut certificates = Map::new();
        for (step_name, step) in &definition.steps {
            tracing::debug!(
                workflow,
                instance_id,
                step = %step_name,
                runnable = step.is_runnable(),
                "checking step runnability"
            );
            self.invoke_step(instance_id, &invocation, step_name, step, &certs_value)
                .await?;
            if let Some(template) = step.output().success.as_ref() {
                certificates.insert(step_name.clone(), template.clone());
            }
        }

        self.publish_cert(workflow, instance_id, Value::Object(certificates))
            .await?;
        Ok(())
    }

    async fn invoke_step(
        &self,
        instance_id: u64,
        invocation: &Invocation,
        step_name: &str,
        step: &Step,
        certs: &Value,
    ) -> Result<(), InvokerError> {
        let existing = self
            .steps
            .get_by_name_and_instance(step_name, instance_id)
            .await?;

        match step {
            Step::Runnable { job, output } => {
                if let Some(row) = existing {
                    // Duplicate delivery; the first delivery owns the
                    // submission.
                    tracing::debug!(
                        step = step_name,
                        instance_id,
                        terminal = row.is_terminal(),
                        "step row already present, skipping submission"
                    );
                    return Ok(());
                }

                let instance = StepInstance::new(instance_id, step_name, certs.clone());
                let mut job = job.clone();
                add_logging(&mut job, &self.loki_url)?;
                job.id = Some(instance.id.to_string());

                let run = Run::new(
                    instance.id,
                    invocation.id,
                    output.success.clone(),
                    output.failure.clone(),
                );

                let mut tx = self.db.begin().await?;
                tx.insert_step_instance(&instance).await?;
                tx.insert_run(&run).await?;
                match self.runner.register(&job).await {
                    Ok(warnings) => {
                        for warning in warnings {
                            tracing::warn!(step = step_name, %warning, "runner warning");
                        }
                        tx.commit().await?;
                        tracing::info!(
                            step = step_name,
                            instance_id,
                            job_id = %instance.id,
                            "step submitted"
                        );
                        Ok(())
                    }
                    Err(e) => {
                        tx.rollback().await?;
                        Err(e.into())
                    }
                }
            }
            Step::Decision { output } => {
                if let Some(row) = existing.filter(|row| !row.is_terminal()) {
                    // A previously runnable step is now inhibited: tear
                    // the job down and close the row atomically.
                    let mut tx = self.db.begin().await?;
                    tx.finish_step_instance(row.id, Utc::now()).await?;
                    match self.runner.deregister(&row.id.to_string(), false).await {
                        Ok(()) => {
                            tx.commit().await?;
                            tracing::info!(step = step_name, instance_id, "step torn down");
                            Ok(())
                        }
                        Err(e) => {
                            tx.rollback().await?;
                            Err(e.into())
                        }
                    }
                } else {
                    // A pure decision: the evaluator already computed the
                    // outcome; publishing it is the sole side effect.
                    if let Some(value) = output.decided() {
                        self.facts.publish(NewFact::new(value.clone())).await?;
                    }
                    Ok(())
                }
            }
        }
    }

    async fn publish_cert(
        &self,
        workflow: &str,
        instance_id: u64,
        payload: Value,
    ) -> Result<(), InvokerError> {
        let encoded = serde_json::to_vec(&payload)?;
        self.broker
            .publish(&Subject::cert(workflow, instance_id), encoded.into())
            .await?;
        Ok(())
    }
}

/// Project the recorded binding down to `{input name: fact value}`.
fn certs_from_binding(binding: &Map<String, Value>) -> Map<String, Value> {
    binding
        .iter()
        .filter_map(|(name, entry)| {
            entry
                .get("value")
                .map(|value| (name.clone(), value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use cicero_core::evaluator::{DefinitionEvaluator, EvalError, EvalOutput};
    use cicero_core::runner::{EventBatch, JobSpec, RunnerEventStream};
    use cicero_core::store::{FactStore, RunStore};
    use cicero_core::types::{Action, ActionDefinition, WorkflowDefinition};
    use cicero_stores::{BroadcastStreamBroker, MemoryStorage};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    /// Counts register/deregister calls; registration can be primed to
    /// fail.
    pub(crate) struct RecordingRunner {
        pub registered: StdMutex<Vec<JobSpec>>,
        pub deregistered: StdMutex<Vec<String>>,
        pub fail_register: bool,
    }

    impl RecordingRunner {
        pub(crate) fn new() -> Self {
            Self {
                registered: StdMutex::new(Vec::new()),
                deregistered: StdMutex::new(Vec::new()),
                fail_register: false,
            }
        }
    }

    #[async_trait]
    impl JobRunner for RecordingRunner {
        async fn register(&self, job: &JobSpec) -> Result<Vec<String>, RunnerError> {
            if self.fail_register {
                return Err(RunnerError::Register("runner unavailable".to_string()));
            }
            self.registered.lock().expect("lock").push(job.clone());
            Ok(Vec::new())
        }

        async fn deregister(&self, job_id: &str, _purge: bool) -> Result<(), RunnerError> {
            self.deregistered
                .lock()
                .expect("lock")
                .push(job_id.to_string());
            Ok(())
        }

        async fn event_stream(
            &self,
            _start_index: u64,
        ) -> Result<RunnerEventStream, RunnerError> {
            let batches: Vec<Result<EventBatch, RunnerError>> = Vec::new();
            Ok(Box::pin(futures_util::stream::iter(batches)))
        }
    }

    /// Returns a fixed definition for every evaluation.
    struct FixedDefinition(WorkflowDefinition);

    #[async_trait]
    impl DefinitionEvaluator for FixedDefinition {
        async fn parse_action(&self, _source: &str) -> Result<ActionDefinition, EvalError> {
            Ok(ActionDefinition::default())
        }

        async fn evaluate(
            &self,
            _workflow: &str,
            _instance_id: u64,
            _certs: &Map<String, Value>,
        ) -> (EvalOutput, Result<WorkflowDefinition, EvalError>) {
            (
                EvalOutput {
                    stdout: Some("evaluated".to_string()),
                    stderr: None,
                },
                Ok(self.0.clone()),
            )
        }
    }

    struct FailingDefinition;

    #[async_trait]
    impl DefinitionEvaluator for FailingDefinition {
        async fn parse_action(&self, _source: &str) -> Result<ActionDefinition, EvalError> {
            Ok(ActionDefinition::default())
        }

        async fn evaluate(
            &self,
            _workflow: &str,
            _instance_id: u64,
            _certs: &Map<String, Value>,
        ) -> (EvalOutput, Result<WorkflowDefinition, EvalError>) {
            (
                EvalOutput {
                    stdout: None,
                    stderr: Some("boom".to_string()),
                },
                Err(EvalError::Failed {
                    status: 1,
                    stderr: "boom".to_string(),
                }),
            )
        }
    }

    fn runnable_definition() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "steps": {
                "build": {
                    "job": {"name": "build", "task_groups": [{"name": "main", "tasks": []}]},
                    "output": {"success": {"built": true}, "failure": {"built": false}}
                }
            }
        }))
        .expect("definition")
    }

    fn decision_definition() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "steps": {
                "decide": {"output": {"success": {"decided": true}}}
            }
        }))
        .expect("definition")
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        broker: Arc<BroadcastStreamBroker>,
        runner: Arc<RecordingRunner>,
        invoker: Invoker,
        cancel: CancellationToken,
    }

    async fn fixture(evaluator: Arc<dyn DefinitionEvaluator>, runner: RecordingRunner) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let broker = Arc::new(BroadcastStreamBroker::default());
        let runner = Arc::new(runner);
        let facts = Arc::new(FactService::new(storage.clone(), broker.clone()));

        let action = Action::new("build", "source", ActionDefinition::default());
        storage.save(&action).await.expect("save action");

        let invoker = Invoker::new(
            broker.clone(),
            evaluator,
            storage.clone(),
            storage.clone(),
            storage.clone(),
            runner.clone(),
            facts,
            Arc::new(PriorityLimiter::default()),
            "http://loki.example:3100",
        );
        Fixture {
            storage,
            broker,
            runner,
            invoker,
            cancel: CancellationToken::new(),
        }
    }

    fn invoke_message(payload: Value) -> Message {
        Message {
            subject: "workflow.build.1.invoke".to_string(),
            payload: Bytes::from(serde_json::to_vec(&payload).expect("encode")),
        }
    }

    #[tokio::test]
    async fn test_runnable_step_inserts_rows_and_registers_once() {
        let f = fixture(
            Arc::new(FixedDefinition(runnable_definition())),
            RecordingRunner::new(),
        )
        .await;

        let payload = json!({"a": {"fact_id": Uuid::new_v4(), "value": {"kind": "hello"}}});
        f.invoker
            .handle_message(invoke_message(payload), &f.cancel)
            .await
            .expect("handle");

        let step = f
            .storage
            .get_by_name_and_instance("build", 1)
            .await
            .expect("lookup")
            .expect("step row");
        assert!(!step.is_terminal());

        let run = f
            .storage
            .get_by_job_id(step.id)
            .await
            .expect("lookup")
            .expect("run row");
        assert_eq!(run.success, Some(json!({"built": true})));

        let registered = f.runner.registered.lock().expect("lock");
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].id.as_deref(), Some(step.id.to_string().as_str()));
        // The sidecar went along with the submission.
        assert!(registered[0].task_groups[0]
            .tasks
            .iter()
            .any(|task| task.name == "promtail"));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_registers_once() {
        let f = fixture(
            Arc::new(FixedDefinition(runnable_definition())),
            RecordingRunner::new(),
        )
        .await;

        let payload = json!({"a": {"fact_id": Uuid::new_v4(), "value": {"kind": "hello"}}});
        f.invoker
            .handle_message(invoke_message(payload.clone()), &f.cancel)
            .await
            .expect("first delivery");
        f.invoker
            .handle_message(invoke_message(payload), &f.cancel)
            .await
            .expect("second delivery");

        assert_eq!(f.runner.registered.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_registration_rolls_back_the_rows() {
        let mut runner = RecordingRunner::new();
        runner.fail_register = true;
        let f = fixture(Arc::new(FixedDefinition(runnable_definition())), runner).await;

        let payload = json!({"a": {"fact_id": Uuid::new_v4(), "value": 1}});
        let outcome = f
            .invoker
            .handle_message(invoke_message(payload), &f.cancel)
            .await;
        assert!(matches!(outcome, Err(InvokerError::Runner(_))));

        // Neither the step row nor the run row survived the rollback.
        assert!(f
            .storage
            .get_by_name_and_instance("build", 1)
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn test_decision_publishes_fact_without_registering() {
        let f = fixture(
            Arc::new(FixedDefinition(decision_definition())),
            RecordingRunner::new(),
        )
        .await;

        f.invoker
            .handle_message(invoke_message(json!({})), &f.cancel)
            .await
            .expect("handle");

        assert!(f.runner.registered.lock().expect("lock").is_empty());
        let log = f.storage.scan().await.expect("scan");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].value, json!({"decided": true}));
    }

    #[tokio::test]
    async fn test_eval_failure_publishes_failure_cert() {
        let f = fixture(Arc::new(FailingDefinition), RecordingRunner::new()).await;
        let mut certs = f
            .broker
            .subscribe("workflow.*.*.cert")
            .await
            .expect("subscribe");

        f.invoker
            .handle_message(invoke_message(json!({})), &f.cancel)
            .await
            .expect("handle");

        let message = certs.recv().await.expect("recv").expect("cert");
        let payload: Value = serde_json::from_slice(&message.payload).expect("decode");
        assert!(payload.get("error").is_some());
        assert!(f.runner.registered.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let f = fixture(
            Arc::new(FixedDefinition(runnable_definition())),
            RecordingRunner::new(),
        )
        .await;

        let message = Message {
            subject: "workflow.build.1.invoke".to_string(),
            payload: Bytes::from_static(b"not json"),
        };
        f.invoker
            .handle_message(message, &f.cancel)
            .await
            .expect("dropped");
        assert!(f.runner.registered.lock().expect("lock").is_empty());

        let message = Message {
            subject: "workflow.build.nope.invoke".to_string(),
            payload: Bytes::from_static(b"{}"),
        };
        f.invoker
            .handle_message(message, &f.cancel)
            .await
            .expect("dropped");
    }
}
