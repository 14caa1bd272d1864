use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub mod config;
pub mod logging;
pub mod status;

pub use config::{BulkConfig, ExplorerConfig, LoggingConfig, PagingConfig, SessionConfig};
pub use status::{ChannelStatusSink, NullStatusSink, StatusEvent, StatusSink, TracingStatusSink};

/// Maximum number of characters kept in a message body preview
pub const BODY_PREVIEW_MAX_CHARS: usize = 120;

// ============================================================================
// Message Types
// ============================================================================

/// Scalar value of an application property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Uuid(uuid::Uuid),
    String(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            PropertyValue::Uuid(v) => write!(f, "{}", v),
            PropertyValue::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

/// Dead-letter metadata stamped by the broker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterInfo {
    pub source: Option<String>,
    pub reason: Option<String>,
    pub description: Option<String>,
}

/// A peeked message as the UI sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    /// Broker-assigned, monotonically increasing within one entity
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
    pub dead_letter: Option<DeadLetterInfo>,
    pub application_properties: BTreeMap<String, PropertyValue>,
    pub body: Vec<u8>,
    /// Truncated, newline-collapsed body for list rendering
    pub body_preview: String,
}

impl MessageRecord {
    pub fn new(
        message_id: impl Into<String>,
        sequence_number: i64,
        enqueued_time: DateTime<Utc>,
        body: Vec<u8>,
    ) -> Self {
        let body_preview = body_preview(&body);
        Self {
            message_id: message_id.into(),
            sequence_number,
            enqueued_time,
            delivery_count: 0,
            session_id: None,
            content_type: None,
            correlation_id: None,
            subject: None,
            to: None,
            reply_to: None,
            reply_to_session_id: None,
            partition_key: None,
            time_to_live: None,
            dead_letter: None,
            application_properties: BTreeMap::new(),
            body,
            body_preview,
        }
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn dead_letter_reason(&self) -> Option<&str> {
        self.dead_letter.as_ref().and_then(|d| d.reason.as_deref())
    }

    /// Case-insensitive match against the fields the message list can filter on.
    /// `needle` must already be lowercase.
    pub fn matches_filter(&self, needle: &str) -> bool {
        if needle.is_empty() {
            return true;
        }

        let contains = |value: &str| value.to_lowercase().contains(needle);

        contains(&self.message_id)
            || contains(&self.body_text())
            || self.correlation_id.as_deref().is_some_and(contains)
            || self.subject.as_deref().is_some_and(contains)
            || self.dead_letter_reason().is_some_and(contains)
            || self.sequence_number.to_string().contains(needle)
    }
}

/// Collapse whitespace runs that contain a line break into one space and cap
/// the result at [`BODY_PREVIEW_MAX_CHARS`].
pub fn body_preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut collapsed = String::with_capacity(text.len().min(BODY_PREVIEW_MAX_CHARS * 4));
    let mut run = String::new();

    let flush = |run: &mut String, out: &mut String| {
        if run.is_empty() {
            return;
        }
        if run.contains(['\n', '\r']) {
            out.push(' ');
        } else {
            out.push_str(run);
        }
        run.clear();
    };

    for ch in text.chars() {
        if ch.is_whitespace() {
            run.push(ch);
        } else {
            flush(&mut run, &mut collapsed);
            collapsed.push(ch);
        }
    }
    flush(&mut run, &mut collapsed);

    let trimmed = collapsed.trim();
    if trimmed.chars().count() <= BODY_PREVIEW_MAX_CHARS {
        return trimmed.to_string();
    }

    let mut preview: String = trimmed.chars().take(BODY_PREVIEW_MAX_CHARS).collect();
    preview.push('…');
    preview
}

// ============================================================================
// Entity Addressing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SubQueue {
    #[default]
    Main,
    DeadLetter,
}

/// Address of a queue, a subscription, or one of their dead-letter sub-queues
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityPath {
    pub entity: String,
    pub subscription: Option<String>,
    pub sub_queue: SubQueue,
}

impl EntityPath {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            entity: name.into(),
            subscription: None,
            sub_queue: SubQueue::Main,
        }
    }

    pub fn subscription(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            entity: topic.into(),
            subscription: Some(subscription.into()),
            sub_queue: SubQueue::Main,
        }
    }

    pub fn dead_letter(mut self) -> Self {
        self.sub_queue = SubQueue::DeadLetter;
        self
    }

    pub fn with_dead_letter(self, dead_letter: bool) -> Self {
        if dead_letter {
            self.dead_letter()
        } else {
            self.main()
        }
    }

    /// Same entity, main sub-queue
    pub fn main(mut self) -> Self {
        self.sub_queue = SubQueue::Main;
        self
    }

    pub fn is_dead_letter(&self) -> bool {
        self.sub_queue == SubQueue::DeadLetter
    }

    /// Entity key without sub-queue suffix: `queue` or `topic/subscriptions/sub`
    pub fn entity_key(&self) -> String {
        match &self.subscription {
            Some(sub) => format!("{}/subscriptions/{}", self.entity, sub),
            None => self.entity.clone(),
        }
    }

    /// Where a message for this path is published: the queue, or the topic
    pub fn send_target(&self) -> &str {
        &self.entity
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entity_key())?;
        if self.is_dead_letter() {
            f.write_str("/$deadletterqueue")?;
        }
        Ok(())
    }
}

/// Arguments of a peek call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeekRequest {
    pub path: EntityPath,
    pub count: usize,
    /// Inclusive lower bound; ignored for session peeks
    pub from_sequence: Option<i64>,
    pub requires_session: bool,
}

impl PeekRequest {
    pub fn new(path: EntityPath, count: usize) -> Self {
        Self {
            path,
            count,
            from_sequence: None,
            requires_session: false,
        }
    }

    pub fn from_sequence(mut self, sequence: Option<i64>) -> Self {
        self.from_sequence = sequence;
        self
    }

    pub fn requires_session(mut self, requires_session: bool) -> Self {
        self.requires_session = requires_session;
        self
    }

    /// Dead-letter sub-queues are never session-bearing
    pub fn uses_sessions(&self) -> bool {
        self.requires_session && !self.path.is_dead_letter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub requires_session: bool,
    pub active_message_count: u64,
    pub dead_letter_message_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub name: String,
    pub subscription_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub topic: String,
    pub name: String,
    pub requires_session: bool,
    pub active_message_count: u64,
    pub dead_letter_message_count: u64,
}

// ============================================================================
// Send Configuration
// ============================================================================

/// Optional fields applied to an outgoing message. Unset fields keep the
/// transport defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageConfiguration {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub session_id: Option<String>,
    pub subject: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub partition_key: Option<String>,
    pub time_to_live: Option<Duration>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub application_properties: Option<BTreeMap<String, PropertyValue>>,
}

// ============================================================================
// Bulk Operation Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BulkOperationKind {
    Purge,
    Delete,
    Resend,
    ResubmitDeadLetter,
}

impl BulkOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOperationKind::Purge => "purge",
            BulkOperationKind::Delete => "delete",
            BulkOperationKind::Resend => "resend",
            BulkOperationKind::ResubmitDeadLetter => "resubmit_dead_letter",
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            BulkOperationKind::Purge => "Purged",
            BulkOperationKind::Delete => "Deleted",
            BulkOperationKind::Resend => "Resent",
            BulkOperationKind::ResubmitDeadLetter => "Resubmitted",
        }
    }
}

/// Outcome of a bulk mutation. Partial completion is a normal result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOperationResult {
    pub kind: BulkOperationKind,
    pub requested: usize,
    pub completed: usize,
    /// Requested messages that were no longer reachable
    pub not_found: usize,
    /// Fault that stopped the operation before it finished
    pub failure: Option<String>,
    pub cancelled: bool,
}

impl BulkOperationResult {
    pub fn new(kind: BulkOperationKind, requested: usize) -> Self {
        Self {
            kind,
            requested,
            completed: 0,
            not_found: 0,
            failure: None,
            cancelled: false,
        }
    }

    pub fn add_completed(&mut self, count: usize) {
        self.completed += count;
    }

    /// Purge has no up-front request size: everything drained was requested
    pub fn add_drained(&mut self, count: usize) {
        self.requested += count;
        self.completed += count;
    }

    pub fn add_not_found(&mut self, count: usize) {
        self.not_found += count;
    }

    pub fn fail(&mut self, failure: impl Into<String>) {
        self.failure = Some(failure.into());
    }

    pub fn is_complete_success(&self) -> bool {
        self.completed == self.requested && self.failure.is_none() && !self.cancelled
    }

    /// Status line for the host, e.g. "Deleted 40 of 50 messages"
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} {} of {} messages",
            self.kind.past_tense(),
            self.completed,
            self.requested
        );
        if self.not_found > 0 {
            line.push_str(&format!(" ({} not found)", self.not_found));
        }
        if self.cancelled {
            line.push_str(" - cancelled");
        }
        if let Some(failure) = &self.failure {
            line.push_str(&format!(" - stopped: {}", failure));
        }
        line
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// How a failure should be treated by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reported by the broker: surface as status, abort, no automatic retry
    BrokerFault,
    /// Control-flow signal: end of sessions or end of entity
    NoData,
    /// Transport or unknown failure: log with context, generic status
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Throttled by broker: {0}")]
    Throttled(String),

    #[error("Message lock lost for sequence number {0}")]
    LockLost(i64),

    #[error("No session available on {0}")]
    SessionAcceptTimeout(String),

    #[error("Receive timed out")]
    ReceiveTimeout,

    #[error("Message not found: sequence number {0}")]
    MessageNotFound(i64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Client is closed")]
    Closed,
}

impl BrokerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BrokerError::EntityNotFound(_)
            | BrokerError::Unauthorized(_)
            | BrokerError::Throttled(_)
            | BrokerError::LockLost(_) => ErrorClass::BrokerFault,
            BrokerError::SessionAcceptTimeout(_)
            | BrokerError::ReceiveTimeout
            | BrokerError::MessageNotFound(_) => ErrorClass::NoData,
            BrokerError::Transport(_) | BrokerError::Closed => ErrorClass::Unexpected,
        }
    }

    pub fn is_no_data(&self) -> bool {
        self.class() == ErrorClass::NoData
    }

    /// Faults that will fail every remaining message the same way
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::EntityNotFound(_) | BrokerError::Unauthorized(_) | BrokerError::Closed
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExplorerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No entity selected")]
    NoContext,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExplorerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ExplorerError::Broker(e) => e.class(),
            ExplorerError::Internal(_) => ErrorClass::Unexpected,
            _ => ErrorClass::BrokerFault,
        }
    }

    /// Human-readable status line. Unexpected failures are kept generic; the
    /// details go to the log.
    pub fn status_message(&self) -> String {
        match self.class() {
            ErrorClass::Unexpected => "Operation failed unexpectedly; see log for details".to_string(),
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExplorerError>;
