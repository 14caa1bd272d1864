//! Configuration sections shared by the engines.
//!
//! Loading (TOML file + environment overrides) lives in `bl-config`; these
//! types only carry values and defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    pub paging: PagingConfig,
    pub sessions: SessionConfig,
    pub bulk: BulkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Messages per page
    pub page_size: usize,
    /// Upper bound on messages cached across all pages of one context
    pub max_total_messages: usize,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_total_messages: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Distinct sessions accepted per session peek
    pub max_sessions: usize,
    pub accept_timeout_ms: u64,
}

impl SessionConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            accept_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    pub purge_batch_size: usize,
    pub delete_batch_size: usize,
    pub send_batch_size: usize,
    pub resubmit_batch_size: usize,
    /// Per-batch receive timeout
    pub receive_timeout_ms: u64,
    /// Consecutive empty receive batches before delete gives up
    pub max_empty_batches: u32,
}

impl BulkConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            purge_batch_size: 100,
            delete_batch_size: 100,
            send_batch_size: 50,
            resubmit_batch_size: 50,
            receive_timeout_ms: 5000,
            max_empty_batches: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
