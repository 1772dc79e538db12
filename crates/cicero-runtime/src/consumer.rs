//! Runner event consumer.
//!
//! Consumes the job runner's event stream at a persisted cursor and turns
//! terminal allocation states into facts. Each event is handled and saved
//! in one transaction; the cursor advances only after the commit, so a
//! crash replays from the last processed index.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use md5::{Digest, Md5};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cicero_core::runner::{
    Allocation, ClientStatus, JobRunner, RunnerError, RunnerStreamEvent,
};
use cicero_core::store::{Database, RunStore, RunnerEventStore, StorageTx, StoreError};
use cicero_core::types::{NewFact, RunnerEvent};

use crate::facts::{FactError, FactService};

/// Event consumer error types
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Fact error: {0}")]
    Fact(#[from] FactError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid allocation modify time: {0}")]
    ModifyTime(i64),

    #[error("Runner event stream closed")]
    StreamClosed,
}

/// Consumes runner events and closes out runs.
pub struct EventConsumer {
    runner: Arc<dyn JobRunner>,
    events: Arc<dyn RunnerEventStore>,
    runs: Arc<dyn RunStore>,
    db: Arc<dyn Database>,
    facts: Arc<FactService>,
}

impl EventConsumer {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        events: Arc<dyn RunnerEventStore>,
        runs: Arc<dyn RunStore>,
        db: Arc<dyn Database>,
        facts: Arc<FactService>,
    ) -> Self {
        Self {
            runner,
            events,
            runs,
            db,
            facts,
        }
    }

    /// Open the event stream at the persisted cursor and process batches
    /// until cancelled. Any processing error returns with the failed
    /// event un-advanced; the supervisor restarts the task and the cursor
    /// causes re-processing.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        let mut index = match self.events.last_index().await? {
            Some(last) => last + 1,
            None => 1,
        };
        tracing::info!(index, "listening to runner events");

        let mut stream = self.runner.event_stream(index).await?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("event consumer stopping");
                    return Ok(());
                }
                batch = stream.next() => {
                    let batch = match batch {
                        None => return Err(ConsumerError::StreamClosed),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(batch)) => batch,
                    };

                    // The runner re-emits the last event on resume even
                    // when the start index is past it.
                    if batch.index < index {
                        continue;
                    }

                    for event in &batch.events {
                        self.process_event(event).await?;
                    }
                    index = batch.index;
                }
            }
        }
    }

    /// Dispatch one event to the domain handler and save the raw event,
    /// in a single transaction.
    pub async fn process_event(&self, event: &RunnerStreamEvent) -> Result<(), ConsumerError> {
        tracing::debug!(index = event.index, topic = %event.topic, "processing runner event");

        let mut tx = self.db.begin().await?;
        let outcome = self.handle_event(event, tx.as_mut()).await;
        match outcome {
            Ok(handled) => {
                tx.save_runner_event(&raw_event_record(event, handled)?)
                    .await?;
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn handle_event(
        &self,
        event: &RunnerStreamEvent,
        tx: &mut dyn StorageTx,
    ) -> Result<bool, ConsumerError> {
        match event.allocation()? {
            Some(allocation) => self.handle_allocation(allocation, tx).await,
            None => Ok(false),
        }
    }

    async fn handle_allocation(
        &self,
        allocation: Allocation,
        tx: &mut dyn StorageTx,
    ) -> Result<bool, ConsumerError> {
        if !allocation.client_terminal_status() {
            tracing::debug!(
                status = ?allocation.client_status,
                "ignoring allocation event with non-terminal client status"
            );
            return Ok(false);
        }

        // Jobs we did not submit carry ids that are not UUIDs.
        let job_id = match Uuid::parse_str(&allocation.job_id) {
            Ok(id) => id,
            Err(_) => return Ok(false),
        };

        let mut run = match self.runs.get_by_job_id(job_id).await? {
            Some(run) => run,
            None => {
                tracing::debug!(%job_id, "ignoring event for job with no run");
                return Ok(false);
            }
        };

        let template = match allocation.client_status {
            ClientStatus::Complete => {
                run.failure = None;
                run.success.clone()
            }
            ClientStatus::Failed => {
                run.success = None;
                run.failure.clone()
            }
            // Other terminal statuses produce no fact and close nothing.
            _ => return Ok(false),
        };

        run.finished_at = Some(modify_time_to_utc(allocation.modify_time)?);
        tx.update_run(&run).await?;

        if let Some(value) = template {
            self.facts
                .publish(NewFact::new(value).with_run(job_id))
                .await?;
        }

        self.runner.deregister(&allocation.job_id, false).await?;
        tracing::info!(%job_id, status = ?allocation.client_status, "run closed");
        Ok(true)
    }
}

fn raw_event_record(
    event: &RunnerStreamEvent,
    handled: bool,
) -> Result<RunnerEvent, ConsumerError> {
    let payload = serde_json::to_value(event)?;
    let encoded = serde_json::to_vec(&payload)?;
    let uid: [u8; 16] = Md5::digest(&encoded).into();
    Ok(RunnerEvent {
        uid,
        index: event.index,
        payload,
        handled,
    })
}

fn modify_time_to_utc(nanos: i64) -> Result<DateTime<Utc>, ConsumerError> {
    let secs = nanos.div_euclid(1_000_000_000);
    let subsec = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, subsec).ok_or(ConsumerError::ModifyTime(nanos))
}
