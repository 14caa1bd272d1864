//! The two authentication modes and the factory that picks one at connect time

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bl_broker::{BrokerConnector, TokenCredential};
use bl_bulk::BulkEngine;
use bl_common::{
    BulkOperationResult, EntityPath, ExplorerConfig, ExplorerError, MessageConfiguration, MessageRecord,
    PeekRequest, QueueInfo, Result, StatusSink, SubscriptionInfo, TopicInfo,
};
use bl_pool::ConnectionPool;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::operations::{AuthKind, BrokerOperations, OperationsCore};

/// Credentials for a namespace
#[derive(Clone)]
pub enum AuthMode {
    SharedSecret {
        connection_string: String,
    },
    Delegated {
        namespace: String,
        credential: Arc<dyn TokenCredential>,
    },
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::SharedSecret { .. } => f
                .debug_struct("SharedSecret")
                .field("connection_string", &"<redacted>")
                .finish(),
            AuthMode::Delegated { namespace, credential } => f
                .debug_struct("Delegated")
                .field("namespace", namespace)
                .field("identity", &credential.identity())
                .finish(),
        }
    }
}

/// Build the facade for `auth`. The data-plane client comes from the pool;
/// the admin client is built fresh.
pub async fn connect(
    auth: AuthMode,
    connector: Arc<dyn BrokerConnector>,
    pool: Arc<ConnectionPool>,
    config: &ExplorerConfig,
    status: Arc<dyn StatusSink>,
) -> Result<Arc<dyn BrokerOperations>> {
    let engine = BulkEngine::new(config.bulk.clone(), status);
    let operations: Arc<dyn BrokerOperations> = match auth {
        AuthMode::SharedSecret { connection_string } => Arc::new(
            SharedSecretOperations::connect(connection_string, connector.as_ref(), pool, engine, config).await?,
        ),
        AuthMode::Delegated { namespace, credential } => Arc::new(
            DelegatedCredentialOperations::connect(namespace, credential, connector.as_ref(), pool, engine, config)
                .await?,
        ),
    };

    info!(
        auth = operations.auth_kind().as_str(),
        namespace = operations.namespace(),
        "Connected to namespace"
    );
    Ok(operations)
}

/// Namespace host from the `Endpoint=sb://host/` part of a connection string
pub fn namespace_from_connection_string(connection_string: &str) -> Option<String> {
    connection_string
        .split(';')
        .filter_map(|part| part.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("endpoint"))
        .map(|(_, value)| {
            let value = value.trim();
            let host = value.split_once("://").map(|(_, rest)| rest).unwrap_or(value);
            host.trim_end_matches('/').to_string()
        })
        .filter(|host| !host.is_empty())
}

// ============================================================================
// Shared secret
// ============================================================================

/// Facade authenticated with a connection string
pub struct SharedSecretOperations {
    namespace: String,
    core: OperationsCore,
}

impl SharedSecretOperations {
    pub async fn connect(
        connection_string: String,
        connector: &dyn BrokerConnector,
        pool: Arc<ConnectionPool>,
        engine: BulkEngine,
        config: &ExplorerConfig,
    ) -> Result<Self> {
        let namespace = namespace_from_connection_string(&connection_string)
            .ok_or_else(|| ExplorerError::InvalidRequest("connection string has no Endpoint".to_string()))?;

        let client = pool
            .get_client(&connection_string, || connector.connect_shared_secret(&connection_string))
            .await?;
        let admin = match connector.admin_shared_secret(&connection_string).await {
            Ok(admin) => admin,
            Err(e) => {
                pool.return_client(&connection_string, &client);
                return Err(e.into());
            }
        };

        let core = OperationsCore::new(client, admin, pool, connection_string, engine, config.sessions.clone());
        Ok(Self { namespace, core })
    }
}

#[async_trait]
impl BrokerOperations for SharedSecretOperations {
    fn auth_kind(&self) -> AuthKind {
        AuthKind::SharedSecret
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        self.core.list_queues().await
    }

    async fn list_topics(&self) -> Result<Vec<TopicInfo>> {
        self.core.list_topics().await
    }

    async fn list_subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionInfo>> {
        self.core.list_subscriptions(topic).await
    }

    async fn peek_messages(&self, request: &PeekRequest) -> Result<Vec<MessageRecord>> {
        self.core.peek_messages(request).await
    }

    async fn send_message(&self, entity: &str, body: Vec<u8>, configuration: &MessageConfiguration) -> Result<()> {
        self.core.send_message(entity, body, configuration).await
    }

    async fn purge_messages(&self, path: &EntityPath, cancel: &CancellationToken) -> Result<BulkOperationResult> {
        self.core.purge_messages(path, cancel).await
    }

    async fn delete_messages(
        &self,
        path: &EntityPath,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        self.core.delete_messages(path, sequence_numbers, cancel).await
    }

    async fn resend_messages(
        &self,
        entity: &str,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        self.core.resend_messages(entity, messages, cancel).await
    }

    async fn resubmit_dead_letter_messages(
        &self,
        path: &EntityPath,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        self.core.resubmit_dead_letter_messages(path, sequence_numbers, cancel).await
    }

    async fn close(&self) {
        self.core.close();
    }
}

// ============================================================================
// Delegated credential
// ============================================================================

/// Facade authenticated with a token credential against a namespace
pub struct DelegatedCredentialOperations {
    namespace: String,
    identity: String,
    core: OperationsCore,
}

impl DelegatedCredentialOperations {
    pub async fn connect(
        namespace: String,
        credential: Arc<dyn TokenCredential>,
        connector: &dyn BrokerConnector,
        pool: Arc<ConnectionPool>,
        engine: BulkEngine,
        config: &ExplorerConfig,
    ) -> Result<Self> {
        if namespace.trim().is_empty() {
            return Err(ExplorerError::InvalidRequest("namespace is required".to_string()));
        }

        // One pooled client per namespace and signed-in identity
        let identity = credential.identity().to_string();
        let pool_secret = format!("{}|{}", namespace, identity);

        let client = pool
            .get_client(&pool_secret, || connector.connect_delegated(&namespace, credential.clone()))
            .await?;
        let admin = match connector.admin_delegated(&namespace, credential.clone()).await {
            Ok(admin) => admin,
            Err(e) => {
                pool.return_client(&pool_secret, &client);
                return Err(e.into());
            }
        };

        let core = OperationsCore::new(client, admin, pool, pool_secret, engine, config.sessions.clone());
        Ok(Self {
            namespace,
            identity,
            core,
        })
    }

    /// Identity of the credential in use
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[async_trait]
impl BrokerOperations for DelegatedCredentialOperations {
    fn auth_kind(&self) -> AuthKind {
        AuthKind::Delegated
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        self.core.list_queues().await
    }

    async fn list_topics(&self) -> Result<Vec<TopicInfo>> {
        self.core.list_topics().await
    }

    async fn list_subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionInfo>> {
        self.core.list_subscriptions(topic).await
    }

    async fn peek_messages(&self, request: &PeekRequest) -> Result<Vec<MessageRecord>> {
        self.core.peek_messages(request).await
    }

    async fn send_message(&self, entity: &str, body: Vec<u8>, configuration: &MessageConfiguration) -> Result<()> {
        self.core.send_message(entity, body, configuration).await
    }

    async fn purge_messages(&self, path: &EntityPath, cancel: &CancellationToken) -> Result<BulkOperationResult> {
        self.core.purge_messages(path, cancel).await
    }

    async fn delete_messages(
        &self,
        path: &EntityPath,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        self.core.delete_messages(path, sequence_numbers, cancel).await
    }

    async fn resend_messages(
        &self,
        entity: &str,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        self.core.resend_messages(entity, messages, cancel).await
    }

    async fn resubmit_dead_letter_messages(
        &self,
        path: &EntityPath,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        self.core.resubmit_dead_letter_messages(path, sequence_numbers, cancel).await
    }

    async fn close(&self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bl_broker::{InMemoryBroker, NamedCredential, OutgoingMessage};
    use bl_common::{BrokerError, NullStatusSink, PropertyValue};
    use std::collections::BTreeMap;

    const CONNECTION_STRING: &str = "Endpoint=sb://local.servicebus.test/;SharedAccessKeyName=root;SharedAccessKey=abc";

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders", false);
        broker.create_subscription("events", "audit", false);
        for i in 0..5 {
            broker.enqueue("orders", OutgoingMessage::new(format!("order {}", i))).unwrap();
        }
        broker
    }

    async fn shared(broker: &InMemoryBroker, pool: &Arc<ConnectionPool>) -> Result<Arc<dyn BrokerOperations>> {
        connect(
            AuthMode::SharedSecret {
                connection_string: CONNECTION_STRING.to_string(),
            },
            Arc::new(broker.clone()),
            pool.clone(),
            &ExplorerConfig::default(),
            Arc::new(NullStatusSink),
        )
        .await
    }

    async fn delegated(broker: &InMemoryBroker, pool: &Arc<ConnectionPool>, identity: &str) -> Arc<dyn BrokerOperations> {
        connect(
            AuthMode::Delegated {
                namespace: "local.servicebus.test".to_string(),
                credential: Arc::new(NamedCredential::new(identity)),
            },
            Arc::new(broker.clone()),
            pool.clone(),
            &ExplorerConfig::default(),
            Arc::new(NullStatusSink),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_namespace_from_connection_string() {
        assert_eq!(
            namespace_from_connection_string(CONNECTION_STRING).as_deref(),
            Some("local.servicebus.test")
        );
        assert_eq!(
            namespace_from_connection_string("endpoint = sb://ns.example/ ;x=y").as_deref(),
            Some("ns.example")
        );
        assert!(namespace_from_connection_string("SharedAccessKey=abc").is_none());
    }

    #[test]
    fn test_debug_redacts_connection_string() {
        let auth = AuthMode::SharedSecret {
            connection_string: CONNECTION_STRING.to_string(),
        };
        assert!(!format!("{:?}", auth).contains("SharedAccessKey=abc"));
    }

    #[tokio::test]
    async fn test_factory_selects_auth_mode() {
        let broker = broker();
        let pool = Arc::new(ConnectionPool::new());

        let shared = shared(&broker, &pool).await.unwrap();
        assert_eq!(shared.auth_kind(), AuthKind::SharedSecret);
        assert_eq!(shared.namespace(), "local.servicebus.test");

        let delegated = delegated(&broker, &pool, "tenant/app").await;
        assert_eq!(delegated.auth_kind(), AuthKind::Delegated);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_same_credential_shares_pooled_client() {
        let broker = broker();
        let pool = Arc::new(ConnectionPool::new());

        let first = shared(&broker, &pool).await.unwrap();
        let second = shared(&broker, &pool).await.unwrap();
        assert_eq!(broker.stats().clients_connected, 1);
        // Admin clients are built per facade, never pooled
        assert_eq!(broker.stats().admin_clients, 2);
        assert_eq!(pool.ref_count(CONNECTION_STRING), 2);

        first.close().await;
        first.close().await;
        assert_eq!(pool.ref_count(CONNECTION_STRING), 1);

        second.close().await;
        pool.wait_for_teardown().await;
        assert_eq!(broker.stats().clients_closed, 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_failed_teardown_is_tolerated() {
        let broker = broker();
        let pool = Arc::new(ConnectionPool::new());
        let ops = shared(&broker, &pool).await.unwrap();
        broker.fail_client_close(true);

        ops.close().await;
        pool.wait_for_teardown().await;

        assert_eq!(broker.stats().clients_closed, 1);
        assert!(pool.is_empty());
        let peeked = ops.peek_messages(&PeekRequest::new(EntityPath::queue("orders"), 1)).await;
        assert!(matches!(peeked, Err(ExplorerError::Broker(BrokerError::Closed))));
    }

    #[tokio::test]
    async fn test_delegated_identities_get_separate_clients() {
        let broker = broker();
        let pool = Arc::new(ConnectionPool::new());

        delegated(&broker, &pool, "tenant/alice").await;
        delegated(&broker, &pool, "tenant/bob").await;
        delegated(&broker, &pool, "tenant/alice").await;

        assert_eq!(broker.stats().clients_connected, 2);
        assert_eq!(pool.ref_count("local.servicebus.test|tenant/alice"), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_pooled() {
        let broker = broker();
        broker.fail_next_connects(1);
        let pool = Arc::new(ConnectionPool::new());

        let result = shared(&broker, &pool).await;
        assert!(matches!(result, Err(ExplorerError::Broker(BrokerError::Transport(_)))));
        assert!(pool.is_empty());

        assert!(shared(&broker, &pool).await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_string_without_endpoint() {
        let broker = broker();
        let pool = Arc::new(ConnectionPool::new());
        let result = connect(
            AuthMode::SharedSecret {
                connection_string: "SharedAccessKey=abc".to_string(),
            },
            Arc::new(broker.clone()),
            pool.clone(),
            &ExplorerConfig::default(),
            Arc::new(NullStatusSink),
        )
        .await;

        assert!(matches!(result, Err(ExplorerError::InvalidRequest(_))));
        assert_eq!(broker.stats().clients_connected, 0);
    }

    #[tokio::test]
    async fn test_lists_entities() {
        let broker = broker();
        let pool = Arc::new(ConnectionPool::new());
        let ops = shared(&broker, &pool).await.unwrap();

        let queues = ops.list_queues().await.unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].active_message_count, 5);
        assert_eq!(ops.list_topics().await.unwrap()[0].subscription_count, 1);
        assert_eq!(ops.list_subscriptions("events").await.unwrap()[0].name, "audit");
    }

    #[tokio::test]
    async fn test_peek_from_sequence() {
        let broker = broker();
        let pool = Arc::new(ConnectionPool::new());
        let ops = shared(&broker, &pool).await.unwrap();

        let request = PeekRequest::new(EntityPath::queue("orders"), 10).from_sequence(Some(4));
        let records = ops.peek_messages(&request).await.unwrap();
        assert_eq!(records.iter().map(|r| r.sequence_number).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_send_message_applies_configuration() {
        let broker = broker();
        let pool = Arc::new(ConnectionPool::new());
        let ops = shared(&broker, &pool).await.unwrap();

        let configuration = MessageConfiguration {
            subject: Some("invoice.paid".to_string()),
            application_properties: Some(BTreeMap::from([("tenant".to_string(), PropertyValue::from("acme"))])),
            ..Default::default()
        };
        ops.send_message("orders", b"{\"id\":9}".to_vec(), &configuration).await.unwrap();

        let records = ops
            .peek_messages(&PeekRequest::new(EntityPath::queue("orders"), 10).from_sequence(Some(6)))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject.as_deref(), Some("invoice.paid"));
        assert_eq!(records[0].application_properties.get("tenant"), Some(&PropertyValue::from("acme")));
        assert!(records[0].correlation_id.is_none());
    }

    #[tokio::test]
    async fn test_bulk_operations_go_through_engine() {
        let broker = broker();
        broker.dead_letter("orders", 5, "Bad", None);
        let pool = Arc::new(ConnectionPool::new());
        let ops = shared(&broker, &pool).await.unwrap();
        let cancel = CancellationToken::new();
        let path = EntityPath::queue("orders");

        let deleted = ops.delete_messages(&path, &[1, 2], &cancel).await.unwrap();
        assert_eq!(deleted.summary(), "Deleted 2 of 2 messages");

        // Dead-letter path is accepted and resubmitted to the main entity
        let resubmitted = ops
            .resubmit_dead_letter_messages(&path.clone().dead_letter(), &[5], &cancel)
            .await
            .unwrap();
        assert_eq!(resubmitted.completed, 1);

        let peeked = ops.peek_messages(&PeekRequest::new(path.clone(), 10)).await.unwrap();
        let resent = ops.resend_messages("orders", &peeked, &cancel).await.unwrap();
        assert_eq!(resent.completed, 3);

        let purged = ops.purge_messages(&path, &cancel).await.unwrap();
        assert_eq!(purged.completed, 6);
    }

    #[tokio::test]
    async fn test_calls_after_close_fail() {
        let broker = broker();
        let pool = Arc::new(ConnectionPool::new());
        let ops = shared(&broker, &pool).await.unwrap();
        ops.close().await;

        let result = ops.peek_messages(&PeekRequest::new(EntityPath::queue("orders"), 1)).await;
        assert!(matches!(result, Err(ExplorerError::Broker(BrokerError::Closed))));
    }
}
