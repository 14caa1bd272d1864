//! Receive and send helpers shared by the bulk operations

use std::time::Duration;

use bl_broker::{BrokerMessage, BrokerResult, MessageReceiver, MessageSender, OutgoingMessage};
use tracing::{debug, warn};

/// Extra time granted to the transport beyond its own receive timeout
const RECEIVE_GRACE: Duration = Duration::from_millis(500);

/// Receive one batch, bounded by `timeout`. A timeout, or a no-data signal
/// from the transport, reads as an empty batch.
pub async fn receive_batch(
    receiver: &mut dyn MessageReceiver,
    max_messages: usize,
    timeout: Duration,
) -> BrokerResult<Vec<BrokerMessage>> {
    match tokio::time::timeout(timeout + RECEIVE_GRACE, receiver.receive(max_messages, timeout)).await {
        Ok(Ok(batch)) => Ok(batch),
        Ok(Err(e)) if e.is_no_data() => {
            debug!(error = %e, "Receive returned no data");
            Ok(Vec::new())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "Receive timed out");
            Ok(Vec::new())
        }
    }
}

/// Outcome of sending one chunk
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub sent: usize,
    /// Set when a fault would fail every remaining message the same way
    pub fatal: Option<String>,
}

/// Send one chunk as a single batch. If the batch is rejected, fall back to
/// sending each message on its own so one bad message cannot sink the rest.
pub async fn send_chunk(sender: &mut dyn MessageSender, chunk: Vec<OutgoingMessage>) -> ChunkOutcome {
    let size = chunk.len();
    let err = match sender.send_batch(chunk.clone()).await {
        Ok(()) => {
            return ChunkOutcome {
                sent: size,
                fatal: None,
            }
        }
        Err(e) => e,
    };

    if err.is_fatal() {
        return ChunkOutcome {
            sent: 0,
            fatal: Some(err.to_string()),
        };
    }

    warn!(error = %err, batch_size = size, "Batch send failed, falling back to individual sends");
    let mut outcome = ChunkOutcome::default();
    for message in chunk {
        match sender.send(message).await {
            Ok(()) => outcome.sent += 1,
            Err(e) if e.is_fatal() => {
                outcome.fatal = Some(e.to_string());
                break;
            }
            Err(e) => warn!(error = %e, "Individual send failed"),
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use bl_broker::{BrokerClient, BrokerConnector, InMemoryBroker, ReceiveMode};
    use bl_common::EntityPath;

    #[tokio::test]
    async fn test_fallback_sends_individually() {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders", false);
        broker.fail_batch_send(1);
        let client = broker.connect_shared_secret("cs").await.unwrap();
        let mut sender = client.open_sender("orders").await.unwrap();

        let chunk: Vec<OutgoingMessage> = (0..5).map(|i| OutgoingMessage::new(format!("m{}", i))).collect();
        let outcome = send_chunk(sender.as_mut(), chunk).await;

        assert_eq!(outcome, ChunkOutcome { sent: 5, fatal: None });
        assert_eq!(broker.stats().single_sends, 5);
        assert_eq!(broker.message_count(&EntityPath::queue("orders")), 5);
    }

    #[tokio::test]
    async fn test_rejected_message_is_skipped() {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders", false);
        broker.reject_message_id("poison");
        let client = broker.connect_shared_secret("cs").await.unwrap();
        let mut sender = client.open_sender("orders").await.unwrap();

        let mut poison = OutgoingMessage::new("bad");
        poison.message_id = Some("poison".to_string());
        let outcome = send_chunk(sender.as_mut(), vec![OutgoingMessage::new("ok"), poison]).await;

        assert_eq!(outcome.sent, 1);
        assert!(outcome.fatal.is_none());
    }

    #[tokio::test]
    async fn test_empty_receive_is_not_an_error() {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders", false);
        let client: std::sync::Arc<dyn BrokerClient> = broker.connect_shared_secret("cs").await.unwrap();
        let mut receiver = client
            .open_receiver(&EntityPath::queue("orders"), ReceiveMode::PeekLock)
            .await
            .unwrap();

        let batch = receive_batch(receiver.as_mut(), 10, Duration::from_millis(50)).await.unwrap();
        assert!(batch.is_empty());
    }
}
