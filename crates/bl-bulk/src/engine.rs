//! BulkEngine - purge, delete, resend and dead-letter resubmit
//!
//! None of the operations are transactional. Each runs its batches
//! sequentially, checks the cancellation token between batches, and reports
//! what actually happened in a [`BulkOperationResult`]. Faults that stop an
//! operation halfway are recorded on the result rather than returned, so the
//! caller always learns how much was done. Only failing to open the receiver
//! or sender is returned as an error.

use std::collections::BTreeSet;
use std::sync::Arc;

use bl_broker::{BrokerClient, BrokerMessage, MessageReceiver, OutgoingMessage, ReceiveMode};
use bl_common::{
    BulkConfig, BulkOperationKind, BulkOperationResult, EntityPath, MessageRecord, Result,
    StatusEvent, StatusSink,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batching::{receive_batch, send_chunk};

pub struct BulkEngine {
    config: BulkConfig,
    status: Arc<dyn StatusSink>,
}

impl BulkEngine {
    /// Batch sizes and `max_empty_batches` are raised to at least 1
    pub fn new(mut config: BulkConfig, status: Arc<dyn StatusSink>) -> Self {
        for size in [
            &mut config.purge_batch_size,
            &mut config.delete_batch_size,
            &mut config.send_batch_size,
            &mut config.resubmit_batch_size,
        ] {
            *size = (*size).max(1);
        }
        config.max_empty_batches = config.max_empty_batches.max(1);
        Self { config, status }
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Drain the entity in receive-and-delete mode until a receive comes back empty
    pub async fn purge(
        &self,
        client: &dyn BrokerClient,
        path: &EntityPath,
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        let mut result = BulkOperationResult::new(BulkOperationKind::Purge, 0);
        let mut receiver = client.open_receiver(path, ReceiveMode::ReceiveAndDelete).await?;
        info!(entity = %path, batch_size = self.config.purge_batch_size, "Starting purge");

        loop {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            match receive_batch(receiver.as_mut(), self.config.purge_batch_size, self.config.receive_timeout()).await {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => {
                    result.add_drained(batch.len());
                    self.progress(&result);
                }
                Err(e) => {
                    warn!(entity = %path, error = %e, "Purge stopped by broker fault");
                    result.fail(e.to_string());
                    break;
                }
            }
        }

        close_receiver(receiver, path).await;
        Ok(self.finish(result))
    }

    /// Complete exactly the requested sequence numbers. Every other message
    /// received along the way stays locked until the scan ends so it is not
    /// received twice, then is abandoned for other consumers.
    ///
    /// Held messages are invisible to other consumers for the length of the
    /// scan, and memory grows with the number of messages scanned. On a real
    /// broker, locks on a long scan may expire before the final abandon; those
    /// messages simply become visible again and the abandon fails quietly.
    pub async fn delete(
        &self,
        client: &dyn BrokerClient,
        path: &EntityPath,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        let mut pending: BTreeSet<i64> = sequence_numbers.iter().copied().collect();
        let mut result = BulkOperationResult::new(BulkOperationKind::Delete, pending.len());
        if pending.is_empty() {
            return Ok(self.finish(result));
        }

        let mut receiver = client.open_receiver(path, ReceiveMode::PeekLock).await?;
        info!(entity = %path, requested = pending.len(), "Starting delete");

        let mut held: Vec<BrokerMessage> = Vec::new();
        let mut empty_batches = 0u32;

        'scan: while !pending.is_empty() {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            let batch = match receive_batch(receiver.as_mut(), self.config.delete_batch_size, self.config.receive_timeout()).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(entity = %path, error = %e, "Delete stopped by broker fault");
                    result.fail(e.to_string());
                    break;
                }
            };

            if batch.is_empty() {
                empty_batches += 1;
                if empty_batches >= self.config.max_empty_batches {
                    debug!(entity = %path, empty_batches = empty_batches, "No more messages to scan");
                    break;
                }
                continue;
            }
            empty_batches = 0;

            for message in batch {
                let seq = message.sequence_number;
                if !pending.contains(&seq) {
                    held.push(message);
                    continue;
                }

                match receiver.complete(&message).await {
                    Ok(()) => {
                        pending.remove(&seq);
                        result.add_completed(1);
                    }
                    Err(e) if e.is_fatal() => {
                        warn!(entity = %path, error = %e, "Delete stopped by broker fault");
                        result.fail(e.to_string());
                        break 'scan;
                    }
                    Err(e) => warn!(entity = %path, sequence_number = seq, error = %e, "Failed to complete message"),
                }
            }
            self.progress(&result);
        }

        release_held(receiver.as_mut(), &held, path).await;
        close_receiver(receiver, path).await;

        if !result.cancelled && result.failure.is_none() {
            result.add_not_found(pending.len());
        }
        Ok(self.finish(result))
    }

    /// Republish peeked messages to `entity` with fresh message ids
    pub async fn resend(
        &self,
        client: &dyn BrokerClient,
        entity: &str,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        let mut result = BulkOperationResult::new(BulkOperationKind::Resend, messages.len());
        if messages.is_empty() {
            return Ok(self.finish(result));
        }

        let mut sender = client.open_sender(entity).await?;
        info!(entity = entity, requested = messages.len(), batch_size = self.config.send_batch_size, "Starting resend");

        for chunk in messages.chunks(self.config.send_batch_size) {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            let outgoing = chunk.iter().map(OutgoingMessage::republish).collect();
            let outcome = send_chunk(sender.as_mut(), outgoing).await;
            result.add_completed(outcome.sent);
            self.progress(&result);

            if let Some(fault) = outcome.fatal {
                warn!(entity = entity, error = %fault, "Resend stopped by broker fault");
                result.fail(fault);
                break;
            }
        }

        if let Err(e) = sender.close().await {
            debug!(entity = entity, error = %e, "Failed to close sender");
        }
        Ok(self.finish(result))
    }

    /// Move dead-lettered messages back to their main entity. `path` names
    /// the main entity; for a subscription the message is republished to its
    /// topic. The message id and properties are kept.
    pub async fn resubmit_dead_letter(
        &self,
        client: &dyn BrokerClient,
        path: &EntityPath,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        let mut result = BulkOperationResult::new(BulkOperationKind::ResubmitDeadLetter, sequence_numbers.len());
        if sequence_numbers.is_empty() {
            return Ok(self.finish(result));
        }

        let dead_letter_path = path.clone().dead_letter();
        let mut receiver = client.open_receiver(&dead_letter_path, ReceiveMode::PeekLock).await?;
        let mut sender = match client.open_sender(path.send_target()).await {
            Ok(sender) => sender,
            Err(e) => {
                close_receiver(receiver, &dead_letter_path).await;
                return Err(e.into());
            }
        };
        info!(entity = %dead_letter_path, target = path.send_target(), requested = sequence_numbers.len(), "Starting dead-letter resubmit");

        'chunks: for chunk in sequence_numbers.chunks(self.config.resubmit_batch_size) {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            for &seq in chunk {
                let message = match receiver.receive_deferred(seq).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        result.add_not_found(1);
                        continue;
                    }
                    Err(e) if e.is_no_data() => {
                        result.add_not_found(1);
                        continue;
                    }
                    Err(e) if e.is_fatal() => {
                        result.fail(e.to_string());
                        break 'chunks;
                    }
                    Err(e) => {
                        warn!(entity = %dead_letter_path, sequence_number = seq, error = %e, "Failed to receive dead-letter message");
                        continue;
                    }
                };

                if let Err(e) = sender.send(OutgoingMessage::resubmit(&message)).await {
                    warn!(entity = %dead_letter_path, sequence_number = seq, error = %e, "Failed to republish, leaving message dead-lettered");
                    if let Err(abandon_err) = receiver.abandon(&message).await {
                        debug!(sequence_number = seq, error = %abandon_err, "Failed to abandon dead-letter message");
                    }
                    if e.is_fatal() {
                        result.fail(e.to_string());
                        break 'chunks;
                    }
                    continue;
                }

                match receiver.complete(&message).await {
                    Ok(()) => result.add_completed(1),
                    Err(e) => {
                        // Already republished; the dead-letter copy stays behind
                        warn!(entity = %dead_letter_path, sequence_number = seq, error = %e, "Republished but failed to complete dead-letter message");
                        if e.is_fatal() {
                            result.fail(e.to_string());
                            break 'chunks;
                        }
                    }
                }
            }
            self.progress(&result);
        }

        if let Err(e) = sender.close().await {
            debug!(error = %e, "Failed to close sender");
        }
        close_receiver(receiver, &dead_letter_path).await;
        Ok(self.finish(result))
    }

    fn progress(&self, result: &BulkOperationResult) {
        self.status.notify(StatusEvent::BulkProgress {
            kind: result.kind,
            completed: result.completed,
            requested: result.requested,
        });
    }

    fn finish(&self, result: BulkOperationResult) -> BulkOperationResult {
        let operation = result.kind.as_str();
        metrics::counter!("buslens_bulk_messages_total", "operation" => operation).increment(result.completed as u64);
        if result.not_found > 0 {
            metrics::counter!("buslens_bulk_not_found_total", "operation" => operation).increment(result.not_found as u64);
        }

        info!(
            operation = operation,
            requested = result.requested,
            completed = result.completed,
            not_found = result.not_found,
            cancelled = result.cancelled,
            "{}",
            result.summary()
        );
        self.status.notify(StatusEvent::BulkFinished(result.clone()));
        result
    }
}

async fn release_held(receiver: &mut dyn MessageReceiver, held: &[BrokerMessage], path: &EntityPath) {
    let mut failed = 0usize;
    for message in held {
        if let Err(e) = receiver.abandon(message).await {
            failed += 1;
            debug!(sequence_number = message.sequence_number, error = %e, "Failed to abandon message");
        }
    }
    if failed > 0 {
        warn!(entity = %path, failed = failed, "Some scanned messages stay locked until their lock expires");
    }
}

async fn close_receiver(mut receiver: Box<dyn MessageReceiver>, path: &EntityPath) {
    if let Err(e) = receiver.close().await {
        debug!(entity = %path, error = %e, "Failed to close receiver");
    }
}
