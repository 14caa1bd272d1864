//! The broker SDK surface BusLens consumes.
//!
//! These traits are the seam to the vendor transport: one connector builds
//! pooled data-plane clients and unpooled admin clients for either
//! authentication mode; clients hand out peekers, receivers, and senders.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bl_common::{
    BrokerError, DeadLetterInfo, EntityPath, MessageConfiguration, MessageRecord, PropertyValue,
    QueueInfo, SubscriptionInfo, TopicInfo,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Messages stay on the entity, locked, until completed or abandoned
    PeekLock,
    /// Messages are removed as they are received
    ReceiveAndDelete,
}

/// A message as delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub message_id: String,
    pub sequence_number: i64,
    pub enqueued_time: DateTime<Utc>,
    pub delivery_count: u32,
    pub session_id: Option<String>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub subject: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub partition_key: Option<String>,
    pub time_to_live: Option<Duration>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub dead_letter_source: Option<String>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
    pub application_properties: BTreeMap<String, PropertyValue>,
    pub body: Vec<u8>,
    /// Set on messages received in peek-lock mode
    pub lock_token: Option<Uuid>,
}

impl BrokerMessage {
    pub fn to_record(&self) -> MessageRecord {
        let dead_letter = if self.dead_letter_source.is_some()
            || self.dead_letter_reason.is_some()
            || self.dead_letter_description.is_some()
        {
            Some(DeadLetterInfo {
                source: self.dead_letter_source.clone(),
                reason: self.dead_letter_reason.clone(),
                description: self.dead_letter_description.clone(),
            })
        } else {
            None
        };

        let mut record = MessageRecord::new(
            self.message_id.clone(),
            self.sequence_number,
            self.enqueued_time,
            self.body.clone(),
        );
        record.delivery_count = self.delivery_count;
        record.session_id = self.session_id.clone();
        record.content_type = self.content_type.clone();
        record.correlation_id = self.correlation_id.clone();
        record.subject = self.subject.clone();
        record.to = self.to.clone();
        record.reply_to = self.reply_to.clone();
        record.reply_to_session_id = self.reply_to_session_id.clone();
        record.partition_key = self.partition_key.clone();
        record.time_to_live = self.time_to_live;
        record.dead_letter = dead_letter;
        record.application_properties = self.application_properties.clone();
        record
    }
}

/// A message to publish. `None` fields are left at transport defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub message_id: Option<String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub subject: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub partition_key: Option<String>,
    pub time_to_live: Option<Duration>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub application_properties: BTreeMap<String, PropertyValue>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Overwrite every field the configuration sets
    pub fn with_configuration(mut self, config: &MessageConfiguration) -> Self {
        fn set<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if let Some(v) = value {
                *target = Some(v.clone());
            }
        }

        set(&mut self.content_type, &config.content_type);
        set(&mut self.correlation_id, &config.correlation_id);
        set(&mut self.message_id, &config.message_id);
        set(&mut self.session_id, &config.session_id);
        set(&mut self.subject, &config.subject);
        set(&mut self.to, &config.to);
        set(&mut self.reply_to, &config.reply_to);
        set(&mut self.reply_to_session_id, &config.reply_to_session_id);
        set(&mut self.partition_key, &config.partition_key);
        set(&mut self.time_to_live, &config.time_to_live);
        set(&mut self.scheduled_enqueue_time, &config.scheduled_enqueue_time);
        if let Some(props) = &config.application_properties {
            self.application_properties = props.clone();
        }
        self
    }

    /// Copy of a peeked message with a freshly generated message id
    pub fn republish(record: &MessageRecord) -> Self {
        Self {
            message_id: Some(Uuid::new_v4().to_string()),
            body: record.body.clone(),
            content_type: record.content_type.clone(),
            correlation_id: record.correlation_id.clone(),
            session_id: record.session_id.clone(),
            subject: record.subject.clone(),
            to: record.to.clone(),
            reply_to: record.reply_to.clone(),
            reply_to_session_id: record.reply_to_session_id.clone(),
            partition_key: record.partition_key.clone(),
            time_to_live: record.time_to_live,
            scheduled_enqueue_time: None,
            application_properties: record.application_properties.clone(),
        }
    }

    /// Copy of a received dead-letter message for its main entity. Keeps the
    /// message id; dead-letter stamps are not carried over.
    pub fn resubmit(message: &BrokerMessage) -> Self {
        Self {
            message_id: Some(message.message_id.clone()),
            body: message.body.clone(),
            content_type: message.content_type.clone(),
            correlation_id: message.correlation_id.clone(),
            session_id: message.session_id.clone(),
            subject: message.subject.clone(),
            to: message.to.clone(),
            reply_to: message.reply_to.clone(),
            reply_to_session_id: message.reply_to_session_id.clone(),
            partition_key: message.partition_key.clone(),
            time_to_live: message.time_to_live,
            scheduled_enqueue_time: None,
            application_properties: message.application_properties.clone(),
        }
    }
}

/// Delegated credential. Token acquisition belongs to the host's login flow;
/// the core only needs a stable identity to key pooled connections.
pub trait TokenCredential: Send + Sync + fmt::Debug {
    fn identity(&self) -> &str;
}

/// Credential identified by a fixed name, e.g. `tenant/client-id`
#[derive(Debug, Clone)]
pub struct NamedCredential {
    identity: String,
}

impl NamedCredential {
    pub fn new(identity: impl Into<String>) -> Self {
        Self { identity: identity.into() }
    }
}

impl TokenCredential for NamedCredential {
    fn identity(&self) -> &str {
        &self.identity
    }
}

/// Builds clients for both authentication modes
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect_shared_secret(&self, connection_string: &str) -> BrokerResult<Arc<dyn BrokerClient>>;

    async fn connect_delegated(
        &self,
        namespace: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> BrokerResult<Arc<dyn BrokerClient>>;

    async fn admin_shared_secret(&self, connection_string: &str) -> BrokerResult<Arc<dyn AdminClient>>;

    async fn admin_delegated(
        &self,
        namespace: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> BrokerResult<Arc<dyn AdminClient>>;
}

/// Data-plane client. Expensive to build; shared through the connection pool.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Non-destructive read. With `from_sequence`, starts at that sequence
    /// number (inclusive); otherwise from the head of the entity.
    async fn peek(
        &self,
        path: &EntityPath,
        count: usize,
        from_sequence: Option<i64>,
    ) -> BrokerResult<Vec<BrokerMessage>>;

    /// Lock the next available session. Fails with
    /// [`BrokerError::SessionAcceptTimeout`] when none is free.
    async fn accept_next_session(
        &self,
        path: &EntityPath,
        timeout: Duration,
    ) -> BrokerResult<Box<dyn SessionPeeker>>;

    async fn open_receiver(&self, path: &EntityPath, mode: ReceiveMode) -> BrokerResult<Box<dyn MessageReceiver>>;

    async fn open_sender(&self, entity: &str) -> BrokerResult<Box<dyn MessageSender>>;

    async fn close(&self) -> BrokerResult<()>;
}

/// An accepted session; the lock is held until `close`
#[async_trait]
pub trait SessionPeeker: Send {
    fn session_id(&self) -> &str;

    /// Continues from the last peeked message of this session
    async fn peek(&mut self, count: usize) -> BrokerResult<Vec<BrokerMessage>>;

    async fn close(&mut self) -> BrokerResult<()>;
}

#[async_trait]
pub trait MessageReceiver: Send {
    /// Waits up to `timeout`; an empty batch means nothing arrived in time
    async fn receive(&mut self, max_messages: usize, timeout: Duration) -> BrokerResult<Vec<BrokerMessage>>;

    async fn complete(&mut self, message: &BrokerMessage) -> BrokerResult<()>;

    async fn abandon(&mut self, message: &BrokerMessage) -> BrokerResult<()>;

    /// Lock a specific message by sequence number. `None` when it no longer exists.
    async fn receive_deferred(&mut self, sequence_number: i64) -> BrokerResult<Option<BrokerMessage>>;

    /// Releases every lock still held by this receiver
    async fn close(&mut self) -> BrokerResult<()>;
}

#[async_trait]
pub trait MessageSender: Send {
    /// All-or-nothing send of one batch
    async fn send_batch(&mut self, messages: Vec<OutgoingMessage>) -> BrokerResult<()>;

    async fn send(&mut self, message: OutgoingMessage) -> BrokerResult<()>;

    async fn close(&mut self) -> BrokerResult<()>;
}

/// Metadata client. Cheap and stateless; never pooled.
#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn list_queues(&self) -> BrokerResult<Vec<QueueInfo>>;

    async fn list_topics(&self) -> BrokerResult<Vec<TopicInfo>>;

    async fn list_subscriptions(&self, topic: &str) -> BrokerResult<Vec<SubscriptionInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> BrokerMessage {
        BrokerMessage {
            message_id: "m-1".to_string(),
            sequence_number: 7,
            enqueued_time: Utc::now(),
            delivery_count: 3,
            session_id: Some("s-1".to_string()),
            content_type: Some("application/json".to_string()),
            correlation_id: Some("c-1".to_string()),
            subject: Some("order.created".to_string()),
            to: None,
            reply_to: None,
            reply_to_session_id: None,
            partition_key: None,
            time_to_live: Some(Duration::from_secs(60)),
            scheduled_enqueue_time: None,
            dead_letter_source: Some("orders".to_string()),
            dead_letter_reason: Some("MaxDeliveryCountExceeded".to_string()),
            dead_letter_description: None,
            application_properties: BTreeMap::from([("tenant".to_string(), PropertyValue::from("acme"))]),
            body: b"{\"a\":1}".to_vec(),
            lock_token: None,
        }
    }

    #[test]
    fn test_to_record_carries_metadata() {
        let record = sample_message().to_record();
        assert_eq!(record.sequence_number, 7);
        assert_eq!(record.delivery_count, 3);
        assert_eq!(record.dead_letter_reason(), Some("MaxDeliveryCountExceeded"));
        assert_eq!(record.body_preview, "{\"a\":1}");
        assert_eq!(record.application_properties.len(), 1);
    }

    #[test]
    fn test_republish_regenerates_id() {
        let record = sample_message().to_record();
        let outgoing = OutgoingMessage::republish(&record);
        assert_ne!(outgoing.message_id.as_deref(), Some("m-1"));
        assert_eq!(outgoing.body, record.body);
        assert_eq!(outgoing.subject.as_deref(), Some("order.created"));
        assert_eq!(outgoing.session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn test_resubmit_keeps_id_and_properties() {
        let outgoing = OutgoingMessage::resubmit(&sample_message());
        assert_eq!(outgoing.message_id.as_deref(), Some("m-1"));
        assert_eq!(outgoing.application_properties.get("tenant"), Some(&PropertyValue::from("acme")));
    }

    #[test]
    fn test_configuration_overwrites_only_set_fields() {
        let config = MessageConfiguration {
            subject: Some("override".to_string()),
            time_to_live: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let mut base = OutgoingMessage::new("body");
        base.correlation_id = Some("keep".to_string());

        let configured = base.with_configuration(&config);
        assert_eq!(configured.subject.as_deref(), Some("override"));
        assert_eq!(configured.correlation_id.as_deref(), Some("keep"));
        assert_eq!(configured.time_to_live, Some(Duration::from_secs(5)));
        assert!(configured.message_id.is_none());
    }
}
