//! In-process development job runner.
//!
//! Stands in for the external job manager when none is configured: every
//! registered job immediately reaches `complete`, and the matching
//! allocation event appears on the event stream. This closes the reactive
//! loop end-to-end on a single machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use cicero_core::runner::{
    EventBatch, JobRunner, JobSpec, RunnerError, RunnerEventStream, RunnerStreamEvent,
    TOPIC_ALLOCATION, TYPE_ALLOCATION_UPDATED,
};

pub struct DevRunner {
    index: AtomicU64,
    events_tx: mpsc::UnboundedSender<Result<EventBatch, RunnerError>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<EventBatch, RunnerError>>>>,
}

impl DevRunner {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            index: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn now_nanos() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobRunner for DevRunner {
    async fn register(&self, job: &JobSpec) -> Result<Vec<String>, RunnerError> {
        let job_id = job
            .id
            .clone()
            .ok_or_else(|| RunnerError::Register("job without id".to_string()))?;
        let index = self.index.fetch_add(1, Ordering::SeqCst);
        tracing::info!(%job_id, index, "dev runner completing job");

        let event = RunnerStreamEvent {
            topic: TOPIC_ALLOCATION.to_string(),
            event_type: TYPE_ALLOCATION_UPDATED.to_string(),
            index,
            payload: json!({
                "Allocation": {
                    "JobID": job_id,
                    "ClientStatus": "complete",
                    "ModifyTime": Self::now_nanos(),
                }
            }),
        };
        let _ = self.events_tx.send(Ok(EventBatch {
            index,
            events: vec![event],
        }));
        Ok(Vec::new())
    }

    async fn deregister(&self, job_id: &str, _purge: bool) -> Result<(), RunnerError> {
        tracing::debug!(%job_id, "dev runner deregistered job");
        Ok(())
    }

    async fn event_stream(&self, _start_index: u64) -> Result<RunnerEventStream, RunnerError> {
        let rx = self
            .events_rx
            .lock()
            .map_err(|e| RunnerError::Stream(e.to_string()))?
            .take()
            .ok_or_else(|| RunnerError::Stream("event stream already taken".to_string()))?;
        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}
