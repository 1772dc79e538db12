//! In-process stream broker.
//!
//! The broadcast broker complements the durable stores: facts and runs
//! live in the database, the broker only pushes wake-up traffic to live
//! subscribers. Subscriptions start at "latest received" by construction.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use cicero_core::broker::{BrokerError, Message, StreamBroker, Subject};

const SUBSCRIBE_BUFFER: usize = 256;

/// In-process StreamBroker based on tokio broadcast channels.
pub struct BroadcastStreamBroker {
    tx: broadcast::Sender<Message>,
    capacity: usize,
}

impl BroadcastStreamBroker {
    /// Create a new broadcast broker with channel capacity.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Return the configured channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BroadcastStreamBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl StreamBroker for BroadcastStreamBroker {
    async fn publish(&self, subject: &Subject, payload: Bytes) -> Result<(), BrokerError> {
        let message = Message {
            subject: subject.to_string(),
            payload,
        };
        // Ignore "no receiver" as a non-error; the stores remain the
        // source of truth.
        match self.tx.send(message) {
            Ok(_) => Ok(()),
            Err(broadcast::error::SendError(_)) => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<Result<Message, BrokerError>>, BrokerError> {
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if !Subject::matches_pattern(&pattern, &message.subject) {
                            continue;
                        }
                        if out_tx.send(Ok(message)).await.is_err() {
                            // Subscriber dropped its receiver.
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let err = BrokerError::Closed(format!(
                            "subscription on {pattern} lagged by {missed} messages"
                        ));
                        let _ = out_tx.send(Err(err)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(out_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscription_filters_by_pattern() {
        tokio_test::block_on(async {
            let broker = BroadcastStreamBroker::new(16);
            let mut invokes = broker.subscribe("workflow.*.*.invoke").await.expect("sub");

            broker
                .publish(&Subject::cert("build", 1), Bytes::from_static(b"{}"))
                .await
                .expect("publish cert");
            let payload = serde_json::to_vec(&json!({"a": 1})).expect("encode");
            broker
                .publish(&Subject::invoke("build", 1), payload.into())
                .await
                .expect("publish invoke");

            let message = invokes.recv().await.expect("recv").expect("message");
            assert_eq!(message.subject, "workflow.build.1.invoke");
        });
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        tokio_test::block_on(async {
            let broker = BroadcastStreamBroker::new(4);
            broker
                .publish(&Subject::invoke("build", 2), Bytes::from_static(b"{}"))
                .await
                .expect("publish");
        });
    }

    #[test]
    fn test_subscription_starts_at_latest_received() {
        tokio_test::block_on(async {
            let broker = BroadcastStreamBroker::new(16);
            broker
                .publish(&Subject::invoke("build", 1), Bytes::from_static(b"early"))
                .await
                .expect("publish");

            let mut invokes = broker.subscribe("workflow.*.*.invoke").await.expect("sub");
            broker
                .publish(&Subject::invoke("build", 2), Bytes::from_static(b"late"))
                .await
                .expect("publish");

            let message = invokes.recv().await.expect("recv").expect("message");
            assert_eq!(message.subject, "workflow.build.2.invoke");
            assert_eq!(message.payload.as_ref(), b"late");
        });
    }
}
