//! ConnectionPool - shared, reference-counted broker clients
//!
//! Data-plane clients are expensive to build, so every browser and bulk
//! operation against the same credential shares one. Entries are keyed by the
//! SHA-256 of the credential; the secret itself is never stored.
//!
//! - `get_client` creates the client at most once per key, even under
//!   concurrent requests, and bumps the reference count
//! - `return_client` drops a reference; the last one out removes the entry
//!   and closes the client on a background task
//! - `dispose_all` closes everything and waits for pending teardowns

use std::future::Future;
use std::sync::Arc;

use bl_broker::{BrokerClient, BrokerResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Characters of the key hash used to identify a connection in logs
const LOG_KEY_LEN: usize = 12;

/// Pool key for a credential: hex SHA-256 of the secret
pub fn secret_key(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn log_key(key: &str) -> &str {
    &key[..LOG_KEY_LEN.min(key.len())]
}

fn same_client(a: &Arc<dyn BrokerClient>, b: &Arc<dyn BrokerClient>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

struct PooledConnection {
    /// Filled by the first successful connect; concurrent getters wait on it
    cell: Arc<OnceCell<Arc<dyn BrokerClient>>>,
    /// Holders plus getters still waiting on the cell
    ref_count: usize,
}

pub struct ConnectionPool {
    connections: DashMap<String, PooledConnection>,
    teardowns: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            teardowns: Mutex::new(Vec::new()),
        }
    }

    /// Get the pooled client for `secret`, building it with `connect` if the
    /// pool has none. A failed connect leaves no entry behind.
    pub async fn get_client<F, Fut>(&self, secret: &str, connect: F) -> BrokerResult<Arc<dyn BrokerClient>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BrokerResult<Arc<dyn BrokerClient>>>,
    {
        let key = secret_key(secret);
        let cell = {
            let mut entry = self.connections.entry(key.clone()).or_insert_with(|| PooledConnection {
                cell: Arc::new(OnceCell::new()),
                ref_count: 0,
            });
            entry.ref_count += 1;
            entry.cell.clone()
        };

        match cell.get_or_try_init(connect).await {
            Ok(client) => {
                debug!(connection = %log_key(&key), ref_count = self.ref_count_for_key(&key), "Acquired pooled connection");
                Ok(client.clone())
            }
            Err(e) => {
                if let Some(mut entry) = self.connections.get_mut(&key) {
                    if Arc::ptr_eq(&entry.cell, &cell) {
                        entry.ref_count = entry.ref_count.saturating_sub(1);
                    }
                }
                self.connections
                    .remove_if(&key, |_, entry| entry.ref_count == 0 && Arc::ptr_eq(&entry.cell, &cell));
                warn!(connection = %log_key(&key), error = %e, "Failed to create pooled connection");
                Err(e)
            }
        }
    }

    /// Release one reference. The last release removes the entry and closes
    /// the client asynchronously. Unknown or mismatched handles are ignored.
    pub fn return_client(&self, secret: &str, client: &Arc<dyn BrokerClient>) {
        let key = secret_key(secret);

        let remaining = match self.connections.get_mut(&key) {
            Some(mut entry) => {
                let matches = entry.cell.get().is_some_and(|pooled| same_client(pooled, client));
                if !matches || entry.ref_count == 0 {
                    warn!(connection = %log_key(&key), "Returned client does not match the pooled connection, ignoring");
                    return;
                }
                entry.ref_count -= 1;
                entry.ref_count
            }
            None => {
                warn!(connection = %log_key(&key), "Returned client is not pooled, ignoring");
                return;
            }
        };

        if remaining > 0 {
            debug!(connection = %log_key(&key), ref_count = remaining, "Released pooled connection");
            return;
        }

        if let Some((_, pooled)) = self.connections.remove_if(&key, |_, entry| entry.ref_count == 0) {
            if let Some(client) = pooled.cell.get().cloned() {
                self.spawn_teardown(log_key(&key).to_string(), client);
            }
        }
    }

    /// Close every pooled client, tolerating individual failures, and wait
    /// for all pending teardowns
    pub async fn dispose_all(&self) {
        let keys: Vec<String> = self.connections.iter().map(|entry| entry.key().clone()).collect();
        let mut disposed = 0usize;

        for key in keys {
            if let Some((key, pooled)) = self.connections.remove(&key) {
                if let Some(client) = pooled.cell.get().cloned() {
                    self.spawn_teardown(log_key(&key).to_string(), client);
                    disposed += 1;
                }
            }
        }

        self.wait_for_teardown().await;
        info!(disposed = disposed, "Connection pool disposed");
    }

    /// Wait for every teardown scheduled so far
    pub async fn wait_for_teardown(&self) {
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.teardowns.lock());
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "Connection teardown task failed");
            }
        }
    }

    pub fn ref_count(&self, secret: &str) -> usize {
        self.ref_count_for_key(&secret_key(secret))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn ref_count_for_key(&self, key: &str) -> usize {
        self.connections.get(key).map(|entry| entry.ref_count).unwrap_or(0)
    }

    fn spawn_teardown(&self, connection: String, client: Arc<dyn BrokerClient>) {
        let handle = tokio::spawn(async move {
            match client.close().await {
                Ok(()) => debug!(connection = %connection, "Closed pooled connection"),
                Err(e) => warn!(connection = %connection, error = %e, "Failed to close pooled connection"),
            }
        });

        let mut pending = self.teardowns.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }
}
