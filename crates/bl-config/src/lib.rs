//! BusLens configuration loading
//!
//! Sources, lowest precedence first:
//! - Built-in defaults
//! - TOML file (optional)
//! - `BUSLENS_*` environment variables

use std::path::Path;
use std::str::FromStr;

use bl_common::ExplorerConfig;
use thiserror::Error;
use tracing::{debug, info};

pub const ENV_PAGE_SIZE: &str = "BUSLENS_PAGE_SIZE";
pub const ENV_MAX_TOTAL_MESSAGES: &str = "BUSLENS_MAX_TOTAL_MESSAGES";
pub const ENV_MAX_SESSIONS: &str = "BUSLENS_MAX_SESSIONS";
pub const ENV_PURGE_BATCH_SIZE: &str = "BUSLENS_PURGE_BATCH_SIZE";
pub const ENV_SEND_BATCH_SIZE: &str = "BUSLENS_SEND_BATCH_SIZE";
pub const ENV_RECEIVE_TIMEOUT_MS: &str = "BUSLENS_RECEIVE_TIMEOUT_MS";
pub const ENV_LOG_LEVEL: &str = "BUSLENS_LOG_LEVEL";
pub const ENV_LOG_JSON: &str = "BUSLENS_LOG_JSON";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Load configuration from an optional TOML file, then apply process
/// environment overrides and validate.
pub fn load_config(path: Option<&Path>) -> Result<ExplorerConfig> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            info!(path = %path.display(), "Loaded configuration file");
            parse_config(&contents)?
        }
        None => ExplorerConfig::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(contents: &str) -> Result<ExplorerConfig> {
    Ok(toml::from_str(contents)?)
}

/// Apply `BUSLENS_*` overrides using `lookup` to read variables
pub fn apply_env_overrides<F>(config: &mut ExplorerConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = parse_env(&lookup, ENV_PAGE_SIZE)? {
        config.paging.page_size = v;
    }
    if let Some(v) = parse_env(&lookup, ENV_MAX_TOTAL_MESSAGES)? {
        config.paging.max_total_messages = v;
    }
    if let Some(v) = parse_env(&lookup, ENV_MAX_SESSIONS)? {
        config.sessions.max_sessions = v;
    }
    if let Some(v) = parse_env(&lookup, ENV_PURGE_BATCH_SIZE)? {
        config.bulk.purge_batch_size = v;
    }
    if let Some(v) = parse_env(&lookup, ENV_SEND_BATCH_SIZE)? {
        config.bulk.send_batch_size = v;
    }
    if let Some(v) = parse_env(&lookup, ENV_RECEIVE_TIMEOUT_MS)? {
        config.bulk.receive_timeout_ms = v;
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }
    if let Some(v) = parse_env(&lookup, ENV_LOG_JSON)? {
        config.logging.json = v;
    }
    Ok(())
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw.clone(),
            })?;
            debug!(key = key, "Applied environment override");
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub fn validate(config: &ExplorerConfig) -> Result<()> {
    let sizes = [
        ("paging.page_size", config.paging.page_size),
        ("paging.max_total_messages", config.paging.max_total_messages),
        ("sessions.max_sessions", config.sessions.max_sessions),
        ("bulk.purge_batch_size", config.bulk.purge_batch_size),
        ("bulk.delete_batch_size", config.bulk.delete_batch_size),
        ("bulk.send_batch_size", config.bulk.send_batch_size),
        ("bulk.resubmit_batch_size", config.bulk.resubmit_batch_size),
    ];
    for (name, value) in sizes {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{} must be greater than 0", name)));
        }
    }

    if config.paging.max_total_messages < config.paging.page_size {
        return Err(ConfigError::Validation(
            "paging.max_total_messages must be at least paging.page_size".to_string(),
        ));
    }
    if config.bulk.receive_timeout_ms == 0 {
        return Err(ConfigError::Validation("bulk.receive_timeout_ms must be greater than 0".to_string()));
    }
    if config.bulk.max_empty_batches == 0 {
        return Err(ConfigError::Validation("bulk.max_empty_batches must be greater than 0".to_string()));
    }
    Ok(())
}
