//! In-memory broker emulator
//!
//! Implements the SDK traits over a mutex-guarded map of entities so the
//! paging and bulk engines can run without a live namespace. Mirrors the
//! broker behaviors the engines depend on:
//! - per-entity sequence numbers, assigned in send order
//! - topics fan out to every subscription
//! - peek-lock receive with complete/abandon, receive-and-delete
//! - session locks held until the session is closed
//! - dead-letter sub-queues keep the original sequence number
//!
//! Every call is counted in [`BrokerStats`], and a small fault plan can fail
//! chosen batch sends, connects, or client teardown.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bl_common::{BrokerError, EntityPath, QueueInfo, SubQueue, SubscriptionInfo, TopicInfo};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::sdk::{
    AdminClient, BrokerClient, BrokerConnector, BrokerMessage, BrokerResult, MessageReceiver,
    MessageSender, OutgoingMessage, ReceiveMode, SessionPeeker, TokenCredential,
};

/// Call counters, for asserting how the engines used the broker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub peek_calls: usize,
    pub session_accepts: usize,
    /// Size of every receive batch returned, empty ones included
    pub receive_batches: Vec<usize>,
    /// Size of every batched send attempted, failed ones included
    pub batch_sends: Vec<usize>,
    pub single_sends: usize,
    pub completes: usize,
    pub abandons: usize,
    pub clients_connected: usize,
    pub clients_closed: usize,
    pub admin_clients: usize,
}

#[derive(Debug, Default)]
struct FaultPlan {
    /// 1-based indexes of batched send calls that fail
    failing_batch_sends: HashSet<usize>,
    rejected_message_ids: HashSet<String>,
    failing_connects: usize,
    failing_closes: bool,
}

#[derive(Debug)]
struct StoredMessage {
    message: BrokerMessage,
    locked_by: Option<Uuid>,
}

#[derive(Debug, Default)]
struct EntityState {
    requires_session: bool,
    next_sequence: i64,
    active: BTreeMap<i64, StoredMessage>,
    dead_letter: BTreeMap<i64, StoredMessage>,
    locked_sessions: HashSet<String>,
}

impl EntityState {
    fn new(requires_session: bool) -> Self {
        Self {
            requires_session,
            ..Default::default()
        }
    }

    fn sub_queue(&self, sub_queue: SubQueue) -> &BTreeMap<i64, StoredMessage> {
        match sub_queue {
            SubQueue::Main => &self.active,
            SubQueue::DeadLetter => &self.dead_letter,
        }
    }

    fn sub_queue_mut(&mut self, sub_queue: SubQueue) -> &mut BTreeMap<i64, StoredMessage> {
        match sub_queue {
            SubQueue::Main => &mut self.active,
            SubQueue::DeadLetter => &mut self.dead_letter,
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    entities: BTreeMap<String, EntityState>,
    topics: BTreeMap<String, BTreeSet<String>>,
    /// Advances 1ms per enqueue so enqueue times are strictly increasing
    clock: DateTime<Utc>,
}

impl BrokerState {
    fn entity(&self, path: &EntityPath) -> BrokerResult<&EntityState> {
        let key = path.entity_key();
        self.entities.get(&key).ok_or(BrokerError::EntityNotFound(key))
    }

    fn entity_mut(&mut self, path: &EntityPath) -> BrokerResult<&mut EntityState> {
        let key = path.entity_key();
        self.entities.get_mut(&key).ok_or(BrokerError::EntityNotFound(key))
    }

    /// Entity keys a send to `entity` lands in
    fn send_targets(&self, entity: &str) -> BrokerResult<Vec<String>> {
        if let Some(subscriptions) = self.topics.get(entity) {
            return Ok(subscriptions
                .iter()
                .map(|sub| format!("{}/subscriptions/{}", entity, sub))
                .collect());
        }
        if self.entities.contains_key(entity) {
            return Ok(vec![entity.to_string()]);
        }
        Err(BrokerError::EntityNotFound(entity.to_string()))
    }

    fn enqueue(&mut self, entity: &str, outgoing: &OutgoingMessage) -> BrokerResult<Vec<i64>> {
        let targets = self.send_targets(entity)?;
        let mut assigned = Vec::with_capacity(targets.len());

        for target in targets {
            self.clock += chrono::Duration::milliseconds(1);
            let enqueued_time = self.clock;
            let Some(state) = self.entities.get_mut(&target) else {
                continue;
            };

            state.next_sequence += 1;
            let sequence_number = state.next_sequence;
            let message = BrokerMessage {
                message_id: outgoing
                    .message_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                sequence_number,
                enqueued_time,
                delivery_count: 0,
                session_id: outgoing.session_id.clone(),
                content_type: outgoing.content_type.clone(),
                correlation_id: outgoing.correlation_id.clone(),
                subject: outgoing.subject.clone(),
                to: outgoing.to.clone(),
                reply_to: outgoing.reply_to.clone(),
                reply_to_session_id: outgoing.reply_to_session_id.clone(),
                partition_key: outgoing.partition_key.clone(),
                time_to_live: outgoing.time_to_live,
                scheduled_enqueue_time: outgoing.scheduled_enqueue_time,
                dead_letter_source: None,
                dead_letter_reason: None,
                dead_letter_description: None,
                application_properties: outgoing.application_properties.clone(),
                body: outgoing.body.clone(),
                lock_token: None,
            };
            state.active.insert(sequence_number, StoredMessage { message, locked_by: None });
            assigned.push(sequence_number);
        }

        Ok(assigned)
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    stats: Mutex<BrokerStats>,
    faults: Mutex<FaultPlan>,
}

/// Shared handle to one emulated namespace. Clones see the same entities.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState {
                    entities: BTreeMap::new(),
                    topics: BTreeMap::new(),
                    clock: Utc::now(),
                }),
                stats: Mutex::new(BrokerStats::default()),
                faults: Mutex::new(FaultPlan::default()),
            }),
        }
    }

    pub fn create_queue(&self, name: &str, requires_session: bool) {
        self.inner
            .state
            .lock()
            .entities
            .entry(name.to_string())
            .or_insert_with(|| EntityState::new(requires_session));
    }

    pub fn create_topic(&self, name: &str) {
        self.inner.state.lock().topics.entry(name.to_string()).or_default();
    }

    pub fn create_subscription(&self, topic: &str, name: &str, requires_session: bool) {
        let mut state = self.inner.state.lock();
        state.topics.entry(topic.to_string()).or_default().insert(name.to_string());
        state
            .entities
            .entry(format!("{}/subscriptions/{}", topic, name))
            .or_insert_with(|| EntityState::new(requires_session));
    }

    /// Publish directly, bypassing clients and stats. Returns the sequence
    /// number assigned in each target entity.
    pub fn enqueue(&self, entity: &str, message: OutgoingMessage) -> BrokerResult<Vec<i64>> {
        self.inner.state.lock().enqueue(entity, &message)
    }

    /// Move an active message to the dead-letter sub-queue
    pub fn dead_letter(&self, entity_key: &str, sequence_number: i64, reason: &str, description: Option<&str>) -> bool {
        let mut state = self.inner.state.lock();
        let Some(entity) = state.entities.get_mut(entity_key) else {
            return false;
        };
        let Some(mut stored) = entity.active.remove(&sequence_number) else {
            return false;
        };

        stored.locked_by = None;
        stored.message.dead_letter_source = Some(entity_key.to_string());
        stored.message.dead_letter_reason = Some(reason.to_string());
        stored.message.dead_letter_description = description.map(str::to_string);
        entity.dead_letter.insert(sequence_number, stored);
        true
    }

    pub fn sequence_numbers(&self, path: &EntityPath) -> Vec<i64> {
        let state = self.inner.state.lock();
        state
            .entity(path)
            .map(|e| e.sub_queue(path.sub_queue).keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn message_count(&self, path: &EntityPath) -> usize {
        let state = self.inner.state.lock();
        state.entity(path).map(|e| e.sub_queue(path.sub_queue).len()).unwrap_or(0)
    }

    pub fn locked_count(&self, path: &EntityPath) -> usize {
        let state = self.inner.state.lock();
        state
            .entity(path)
            .map(|e| {
                e.sub_queue(path.sub_queue)
                    .values()
                    .filter(|m| m.locked_by.is_some())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn delivery_count(&self, path: &EntityPath, sequence_number: i64) -> Option<u32> {
        let state = self.inner.state.lock();
        state
            .entity(path)
            .ok()
            .and_then(|e| e.sub_queue(path.sub_queue).get(&sequence_number))
            .map(|m| m.message.delivery_count)
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.inner.stats.lock() = BrokerStats::default();
    }

    /// Fail the `call_index`-th batched send (1-based, counted from the last reset)
    pub fn fail_batch_send(&self, call_index: usize) {
        self.inner.faults.lock().failing_batch_sends.insert(call_index);
    }

    /// Reject any send containing this message id
    pub fn reject_message_id(&self, message_id: &str) {
        self.inner.faults.lock().rejected_message_ids.insert(message_id.to_string());
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.inner.faults.lock().failing_connects = count;
    }

    pub fn fail_client_close(&self, fail: bool) {
        self.inner.faults.lock().failing_closes = fail;
    }

    fn record(&self, update: impl FnOnce(&mut BrokerStats)) {
        update(&mut self.inner.stats.lock());
    }

    fn take_connect_fault(&self) -> BrokerResult<()> {
        let mut faults = self.inner.faults.lock();
        if faults.failing_connects > 0 {
            faults.failing_connects -= 1;
            return Err(BrokerError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    fn is_rejected(&self, message: &OutgoingMessage) -> bool {
        let faults = self.inner.faults.lock();
        message
            .message_id
            .as_ref()
            .is_some_and(|id| faults.rejected_message_ids.contains(id))
    }

    fn new_client(&self) -> Arc<dyn BrokerClient> {
        self.record(|s| s.clients_connected += 1);
        Arc::new(MemoryClient {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn new_admin(&self) -> Arc<dyn AdminClient> {
        self.record(|s| s.admin_clients += 1);
        Arc::new(MemoryAdmin { broker: self.clone() })
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect_shared_secret(&self, connection_string: &str) -> BrokerResult<Arc<dyn BrokerClient>> {
        if connection_string.trim().is_empty() {
            return Err(BrokerError::Unauthorized("empty connection string".to_string()));
        }
        self.take_connect_fault()?;
        Ok(self.new_client())
    }

    async fn connect_delegated(
        &self,
        namespace: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> BrokerResult<Arc<dyn BrokerClient>> {
        if namespace.trim().is_empty() || credential.identity().is_empty() {
            return Err(BrokerError::Unauthorized("missing namespace or credential".to_string()));
        }
        self.take_connect_fault()?;
        Ok(self.new_client())
    }

    async fn admin_shared_secret(&self, connection_string: &str) -> BrokerResult<Arc<dyn AdminClient>> {
        if connection_string.trim().is_empty() {
            return Err(BrokerError::Unauthorized("empty connection string".to_string()));
        }
        Ok(self.new_admin())
    }

    async fn admin_delegated(
        &self,
        namespace: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> BrokerResult<Arc<dyn AdminClient>> {
        if namespace.trim().is_empty() || credential.identity().is_empty() {
            return Err(BrokerError::Unauthorized("missing namespace or credential".to_string()));
        }
        Ok(self.new_admin())
    }
}

// ============================================================================
// Data-plane client
// ============================================================================

struct MemoryClient {
    broker: InMemoryBroker,
    closed: AtomicBool,
}

impl MemoryClient {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn peek(
        &self,
        path: &EntityPath,
        count: usize,
        from_sequence: Option<i64>,
    ) -> BrokerResult<Vec<BrokerMessage>> {
        self.ensure_open()?;
        self.broker.record(|s| s.peek_calls += 1);

        let state = self.broker.inner.state.lock();
        let queue = state.entity(path)?.sub_queue(path.sub_queue);
        let start = from_sequence.unwrap_or(i64::MIN);

        Ok(queue
            .range(start..)
            .take(count)
            .map(|(_, stored)| stored.message.clone())
            .collect())
    }

    async fn accept_next_session(
        &self,
        path: &EntityPath,
        _timeout: Duration,
    ) -> BrokerResult<Box<dyn SessionPeeker>> {
        self.ensure_open()?;
        self.broker.record(|s| s.session_accepts += 1);

        let mut state = self.broker.inner.state.lock();
        let entity = state.entity_mut(path)?;
        if !entity.requires_session {
            return Err(BrokerError::Transport(format!("{} is not session-enabled", path)));
        }

        // Sessions are offered in order of their oldest active message
        let candidate = entity
            .active
            .values()
            .filter_map(|stored| stored.message.session_id.as_ref())
            .find(|sid| !entity.locked_sessions.contains(*sid))
            .cloned();

        let Some(session_id) = candidate else {
            return Err(BrokerError::SessionAcceptTimeout(path.to_string()));
        };
        entity.locked_sessions.insert(session_id.clone());
        debug!(entity = %path, session_id = %session_id, "Session accepted");

        Ok(Box::new(MemorySession {
            broker: self.broker.clone(),
            path: path.clone(),
            session_id,
            last_peeked: None,
            closed: false,
        }))
    }

    async fn open_receiver(&self, path: &EntityPath, mode: ReceiveMode) -> BrokerResult<Box<dyn MessageReceiver>> {
        self.ensure_open()?;
        self.broker.inner.state.lock().entity(path)?;

        Ok(Box::new(MemoryReceiver {
            broker: self.broker.clone(),
            path: path.clone(),
            mode,
            id: Uuid::new_v4(),
            closed: false,
        }))
    }

    async fn open_sender(&self, entity: &str) -> BrokerResult<Box<dyn MessageSender>> {
        self.ensure_open()?;
        self.broker.inner.state.lock().send_targets(entity)?;

        Ok(Box::new(MemorySender {
            broker: self.broker.clone(),
            entity: entity.to_string(),
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.broker.record(|s| s.clients_closed += 1);
        self.closed.store(true, Ordering::SeqCst);
        if self.broker.inner.faults.lock().failing_closes {
            return Err(BrokerError::Transport("connection reset during close".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Sessions, receivers, senders
// ============================================================================

struct MemorySession {
    broker: InMemoryBroker,
    path: EntityPath,
    session_id: String,
    last_peeked: Option<i64>,
    closed: bool,
}

impl MemorySession {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.broker.inner.state.lock();
        if let Ok(entity) = state.entity_mut(&self.path) {
            entity.locked_sessions.remove(&self.session_id);
        }
    }
}

#[async_trait]
impl SessionPeeker for MemorySession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn peek(&mut self, count: usize) -> BrokerResult<Vec<BrokerMessage>> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.broker.record(|s| s.peek_calls += 1);

        let messages: Vec<BrokerMessage> = {
            let state = self.broker.inner.state.lock();
            let entity = state.entity(&self.path)?;
            let start = self.last_peeked.map(|seq| seq + 1).unwrap_or(i64::MIN);
            entity
                .active
                .range(start..)
                .filter(|(_, stored)| stored.message.session_id.as_deref() == Some(self.session_id.as_str()))
                .take(count)
                .map(|(_, stored)| stored.message.clone())
                .collect()
        };

        if let Some(last) = messages.last() {
            self.last_peeked = Some(last.sequence_number);
        }
        Ok(messages)
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

struct MemoryReceiver {
    broker: InMemoryBroker,
    path: EntityPath,
    mode: ReceiveMode,
    id: Uuid,
    closed: bool,
}

impl MemoryReceiver {
    fn release_locks(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.broker.inner.state.lock();
        if let Ok(entity) = state.entity_mut(&self.path) {
            for stored in entity.sub_queue_mut(self.path.sub_queue).values_mut() {
                if stored.locked_by == Some(self.id) {
                    stored.locked_by = None;
                }
            }
        }
    }
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    async fn receive(&mut self, max_messages: usize, _timeout: Duration) -> BrokerResult<Vec<BrokerMessage>> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let batch = {
            let mut state = self.broker.inner.state.lock();
            let queue = state.entity_mut(&self.path)?.sub_queue_mut(self.path.sub_queue);
            let available: Vec<i64> = queue
                .iter()
                .filter(|(_, stored)| stored.locked_by.is_none())
                .take(max_messages)
                .map(|(seq, _)| *seq)
                .collect();

            let mut batch = Vec::with_capacity(available.len());
            for seq in available {
                match self.mode {
                    ReceiveMode::ReceiveAndDelete => {
                        if let Some(stored) = queue.remove(&seq) {
                            batch.push(stored.message);
                        }
                    }
                    ReceiveMode::PeekLock => {
                        if let Some(stored) = queue.get_mut(&seq) {
                            stored.locked_by = Some(self.id);
                            stored.message.delivery_count += 1;
                            let mut message = stored.message.clone();
                            message.lock_token = Some(self.id);
                            batch.push(message);
                        }
                    }
                }
            }
            batch
        };

        let received = batch.len();
        self.broker.record(|s| s.receive_batches.push(received));
        Ok(batch)
    }

    async fn complete(&mut self, message: &BrokerMessage) -> BrokerResult<()> {
        let seq = message.sequence_number;
        {
            let mut state = self.broker.inner.state.lock();
            let queue = state.entity_mut(&self.path)?.sub_queue_mut(self.path.sub_queue);
            let owned = queue.get(&seq).is_some_and(|stored| stored.locked_by == Some(self.id));
            if !owned {
                return Err(BrokerError::LockLost(seq));
            }
            queue.remove(&seq);
        }
        self.broker.record(|s| s.completes += 1);
        Ok(())
    }

    async fn abandon(&mut self, message: &BrokerMessage) -> BrokerResult<()> {
        let seq = message.sequence_number;
        {
            let mut state = self.broker.inner.state.lock();
            let queue = state.entity_mut(&self.path)?.sub_queue_mut(self.path.sub_queue);
            match queue.get_mut(&seq) {
                Some(stored) if stored.locked_by == Some(self.id) => stored.locked_by = None,
                _ => return Err(BrokerError::LockLost(seq)),
            }
        }
        self.broker.record(|s| s.abandons += 1);
        Ok(())
    }

    async fn receive_deferred(&mut self, sequence_number: i64) -> BrokerResult<Option<BrokerMessage>> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let mut state = self.broker.inner.state.lock();
        let queue = state.entity_mut(&self.path)?.sub_queue_mut(self.path.sub_queue);
        let Some(stored) = queue.get_mut(&sequence_number) else {
            return Ok(None);
        };
        if stored.locked_by.is_some_and(|owner| owner != self.id) {
            return Ok(None);
        }

        stored.locked_by = Some(self.id);
        stored.message.delivery_count += 1;
        let mut message = stored.message.clone();
        message.lock_token = Some(self.id);
        Ok(Some(message))
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.release_locks();
        Ok(())
    }
}

impl Drop for MemoryReceiver {
    fn drop(&mut self) {
        self.release_locks();
    }
}

struct MemorySender {
    broker: InMemoryBroker,
    entity: String,
}

#[async_trait]
impl MessageSender for MemorySender {
    async fn send_batch(&mut self, messages: Vec<OutgoingMessage>) -> BrokerResult<()> {
        let call_index = {
            let mut stats = self.broker.inner.stats.lock();
            stats.batch_sends.push(messages.len());
            stats.batch_sends.len()
        };

        if self.broker.inner.faults.lock().failing_batch_sends.contains(&call_index) {
            return Err(BrokerError::Transport(format!("batch send {} rejected", call_index)));
        }
        if messages.iter().any(|m| self.broker.is_rejected(m)) {
            return Err(BrokerError::Transport("batch contains a rejected message".to_string()));
        }

        let mut state = self.broker.inner.state.lock();
        state.send_targets(&self.entity)?;
        for message in &messages {
            state.enqueue(&self.entity, message)?;
        }
        Ok(())
    }

    async fn send(&mut self, message: OutgoingMessage) -> BrokerResult<()> {
        self.broker.record(|s| s.single_sends += 1);
        if self.broker.is_rejected(&message) {
            return Err(BrokerError::Transport("message rejected".to_string()));
        }
        self.broker.inner.state.lock().enqueue(&self.entity, &message)?;
        Ok(())
    }

    async fn close(&mut self) -> BrokerResult<()> {
        Ok(())
    }
}

// ============================================================================
// Admin client
// ============================================================================

struct MemoryAdmin {
    broker: InMemoryBroker,
}

#[async_trait]
impl AdminClient for MemoryAdmin {
    async fn list_queues(&self) -> BrokerResult<Vec<QueueInfo>> {
        let state = self.broker.inner.state.lock();
        Ok(state
            .entities
            .iter()
            .filter(|(key, _)| !key.contains("/subscriptions/"))
            .map(|(name, entity)| QueueInfo {
                name: name.clone(),
                requires_session: entity.requires_session,
                active_message_count: entity.active.len() as u64,
                dead_letter_message_count: entity.dead_letter.len() as u64,
            })
            .collect())
    }

    async fn list_topics(&self) -> BrokerResult<Vec<TopicInfo>> {
        let state = self.broker.inner.state.lock();
        Ok(state
            .topics
            .iter()
            .map(|(name, subscriptions)| TopicInfo {
                name: name.clone(),
                subscription_count: subscriptions.len(),
            })
            .collect())
    }

    async fn list_subscriptions(&self, topic: &str) -> BrokerResult<Vec<SubscriptionInfo>> {
        let state = self.broker.inner.state.lock();
        let subscriptions = state
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::EntityNotFound(topic.to_string()))?;

        Ok(subscriptions
            .iter()
            .filter_map(|name| {
                let entity = state.entities.get(&format!("{}/subscriptions/{}", topic, name))?;
                Some(SubscriptionInfo {
                    topic: topic.to_string(),
                    name: name.clone(),
                    requires_session: entity.requires_session,
                    active_message_count: entity.active.len() as u64,
                    dead_letter_message_count: entity.dead_letter.len() as u64,
                })
            })
            .collect())
    }
}
