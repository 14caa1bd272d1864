//! Peek helper shared by both authentication modes

use bl_broker::{BrokerClient, BrokerResult, SessionPeeker};
use bl_common::{MessageRecord, PeekRequest, SessionConfig};
use tracing::debug;

/// Non-destructive read for one page of records.
///
/// Plain entities read from the cursor; every record returned has a sequence
/// number at or above `from_sequence`. Session-bearing entities have no
/// cursor: up to `max_sessions` sessions are accepted and peeked in turn
/// until `count` records are collected, then all of them are released.
pub async fn peek_records(
    client: &dyn BrokerClient,
    request: &PeekRequest,
    sessions: &SessionConfig,
) -> BrokerResult<Vec<MessageRecord>> {
    if request.count == 0 {
        return Ok(Vec::new());
    }

    if request.uses_sessions() {
        peek_sessions(client, request, sessions).await
    } else {
        peek_plain(client, request).await
    }
}

async fn peek_plain(client: &dyn BrokerClient, request: &PeekRequest) -> BrokerResult<Vec<MessageRecord>> {
    let messages = client.peek(&request.path, request.count, request.from_sequence).await?;
    let floor = request.from_sequence.unwrap_or(i64::MIN);

    let records: Vec<MessageRecord> = messages
        .iter()
        .filter(|m| m.sequence_number >= floor)
        .take(request.count)
        .map(|m| m.to_record())
        .collect();

    if records.len() < messages.len() {
        debug!(
            entity = %request.path,
            dropped = messages.len() - records.len(),
            "Dropped records below the requested sequence number"
        );
    }
    Ok(records)
}

async fn peek_sessions(
    client: &dyn BrokerClient,
    request: &PeekRequest,
    sessions: &SessionConfig,
) -> BrokerResult<Vec<MessageRecord>> {
    let mut accepted: Vec<Box<dyn SessionPeeker>> = Vec::new();
    let merged = merge_sessions(client, request, sessions, &mut accepted).await;

    let session_count = accepted.len();
    for mut session in accepted {
        if let Err(e) = session.close().await {
            debug!(session_id = session.session_id(), error = %e, "Failed to release session");
        }
    }

    if let Ok(records) = &merged {
        debug!(entity = %request.path, sessions = session_count, count = records.len(), "Merged session peek");
    }
    merged
}

/// Sessions stay in `accepted` so the caller releases them whatever happens here
async fn merge_sessions(
    client: &dyn BrokerClient,
    request: &PeekRequest,
    sessions: &SessionConfig,
    accepted: &mut Vec<Box<dyn SessionPeeker>>,
) -> BrokerResult<Vec<MessageRecord>> {
    let mut records = Vec::with_capacity(request.count);

    while records.len() < request.count && accepted.len() < sessions.max_sessions {
        let session = match client.accept_next_session(&request.path, sessions.accept_timeout()).await {
            Ok(session) => session,
            Err(e) if e.is_no_data() => break,
            Err(e) => return Err(e),
        };
        accepted.push(session);

        let remaining = request.count - records.len();
        if let Some(session) = accepted.last_mut() {
            let messages = session.peek(remaining).await?;
            records.extend(messages.iter().map(|m| m.to_record()));
        }
    }

    Ok(records)
}
