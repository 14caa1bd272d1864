//! The broker operations facade and the core both auth modes share

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bl_broker::{AdminClient, BrokerClient, OutgoingMessage};
use bl_bulk::BulkEngine;
use bl_common::{
    BrokerError, BulkOperationResult, EntityPath, ExplorerError, MessageConfiguration, MessageRecord,
    PeekRequest, QueueInfo, Result, SessionConfig, SubscriptionInfo, TopicInfo,
};
use bl_pool::ConnectionPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::peek::peek_records;

/// Which credential the facade was built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    SharedSecret,
    Delegated,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::SharedSecret => "shared_secret",
            AuthKind::Delegated => "delegated",
        }
    }
}

/// Everything the pagination controller and the host need from the broker
#[async_trait]
pub trait BrokerOperations: Send + Sync {
    fn auth_kind(&self) -> AuthKind;

    /// Namespace the facade is connected to, for display
    fn namespace(&self) -> &str;

    async fn list_queues(&self) -> Result<Vec<QueueInfo>>;

    async fn list_topics(&self) -> Result<Vec<TopicInfo>>;

    async fn list_subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionInfo>>;

    async fn peek_messages(&self, request: &PeekRequest) -> Result<Vec<MessageRecord>>;

    async fn send_message(&self, entity: &str, body: Vec<u8>, configuration: &MessageConfiguration) -> Result<()>;

    async fn purge_messages(&self, path: &EntityPath, cancel: &CancellationToken) -> Result<BulkOperationResult>;

    async fn delete_messages(
        &self,
        path: &EntityPath,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult>;

    async fn resend_messages(
        &self,
        entity: &str,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult>;

    async fn resubmit_dead_letter_messages(
        &self,
        path: &EntityPath,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult>;

    /// Give the pooled client back. Later calls fail with `Closed`.
    async fn close(&self);
}

/// Pooled client, admin client and bulk engine behind either auth mode
pub(crate) struct OperationsCore {
    client: Arc<dyn BrokerClient>,
    admin: Arc<dyn AdminClient>,
    pool: Arc<ConnectionPool>,
    /// Secret the pooled client was acquired under
    pool_secret: String,
    engine: BulkEngine,
    sessions: SessionConfig,
    closed: AtomicBool,
}

impl OperationsCore {
    pub(crate) fn new(
        client: Arc<dyn BrokerClient>,
        admin: Arc<dyn AdminClient>,
        pool: Arc<ConnectionPool>,
        pool_secret: String,
        engine: BulkEngine,
        sessions: SessionConfig,
    ) -> Self {
        Self {
            client,
            admin,
            pool,
            pool_secret,
            engine,
            sessions,
            closed: AtomicBool::new(false),
        }
    }

    fn client(&self) -> Result<&dyn BrokerClient> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExplorerError::Broker(BrokerError::Closed));
        }
        Ok(self.client.as_ref())
    }

    pub(crate) async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        Ok(self.admin.list_queues().await?)
    }

    pub(crate) async fn list_topics(&self) -> Result<Vec<TopicInfo>> {
        Ok(self.admin.list_topics().await?)
    }

    pub(crate) async fn list_subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionInfo>> {
        Ok(self.admin.list_subscriptions(topic).await?)
    }

    pub(crate) async fn peek_messages(&self, request: &PeekRequest) -> Result<Vec<MessageRecord>> {
        let client = self.client()?;
        let records = peek_records(client, request, &self.sessions).await?;
        debug!(
            entity = %request.path,
            requested = request.count,
            from_sequence = ?request.from_sequence,
            sessions = request.uses_sessions(),
            returned = records.len(),
            "Peeked messages"
        );
        Ok(records)
    }

    pub(crate) async fn send_message(
        &self,
        entity: &str,
        body: Vec<u8>,
        configuration: &MessageConfiguration,
    ) -> Result<()> {
        let client = self.client()?;
        let message = OutgoingMessage::new(body).with_configuration(configuration);
        let mut sender = client.open_sender(entity).await?;
        let sent = sender.send(message).await;
        if let Err(e) = sender.close().await {
            debug!(entity = entity, error = %e, "Failed to close sender");
        }
        sent?;
        info!(entity = entity, "Message sent");
        Ok(())
    }

    pub(crate) async fn purge_messages(&self, path: &EntityPath, cancel: &CancellationToken) -> Result<BulkOperationResult> {
        self.engine.purge(self.client()?, path, cancel).await
    }

    pub(crate) async fn delete_messages(
        &self,
        path: &EntityPath,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        self.engine.delete(self.client()?, path, sequence_numbers, cancel).await
    }

    pub(crate) async fn resend_messages(
        &self,
        entity: &str,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        self.engine.resend(self.client()?, entity, messages, cancel).await
    }

    pub(crate) async fn resubmit_dead_letter_messages(
        &self,
        path: &EntityPath,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        let main = path.clone().main();
        self.engine
            .resubmit_dead_letter(self.client()?, &main, sequence_numbers, cancel)
            .await
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.return_client(&self.pool_secret, &self.client);
    }
}
