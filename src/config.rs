//! Session configuration
//!
//! Defaults suit a browser peer. Every field can be overridden from the
//! environment (`CANVAS_SYNC_*`) or loaded from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loop_breaker::LoopBreakerWindows;
use crate::registry::origin;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Origin tag stamped on this peer's own mutations.
    pub origin: String,
    /// Origin this peer rebroadcasts; falls back to `origin`.
    pub authoritative_origin: Option<String>,
    /// Broadcast topic carrying envelopes.
    pub topic: String,
    /// Namespace for inbound envelopes that do not name one.
    pub default_namespace: String,
    pub duplicate_window_ms: u64,
    pub completed_window_ms: u64,
    pub cooldown_ms: u64,
    /// Capacity of the registry's event bus.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            origin: origin::LOCAL.to_string(),
            authoritative_origin: None,
            topic: "canvas-state".to_string(),
            default_namespace: "canvas".to_string(),
            duplicate_window_ms: 2_000,
            completed_window_ms: 30_000,
            cooldown_ms: 5_000,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Config for a peer identified by `origin`.
    pub fn for_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by any `CANVAS_SYNC_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("CANVAS_SYNC_ORIGIN") {
            config.origin = v;
        }
        if let Some(v) = lookup("CANVAS_SYNC_AUTHORITATIVE_ORIGIN") {
            config.authoritative_origin = Some(v);
        }
        if let Some(v) = lookup("CANVAS_SYNC_TOPIC") {
            config.topic = v;
        }
        if let Some(v) = lookup("CANVAS_SYNC_NAMESPACE") {
            config.default_namespace = v;
        }
        if let Some(v) = lookup("CANVAS_SYNC_DUPLICATE_WINDOW_MS") {
            config.duplicate_window_ms = parse_number("CANVAS_SYNC_DUPLICATE_WINDOW_MS", &v)?;
        }
        if let Some(v) = lookup("CANVAS_SYNC_COMPLETED_WINDOW_MS") {
            config.completed_window_ms = parse_number("CANVAS_SYNC_COMPLETED_WINDOW_MS", &v)?;
        }
        if let Some(v) = lookup("CANVAS_SYNC_COOLDOWN_MS") {
            config.cooldown_ms = parse_number("CANVAS_SYNC_COOLDOWN_MS", &v)?;
        }
        if let Some(v) = lookup("CANVAS_SYNC_EVENT_CAPACITY") {
            config.event_capacity = parse_number("CANVAS_SYNC_EVENT_CAPACITY", &v)?;
        }

        Ok(config)
    }

    pub fn authoritative_origin(&self) -> &str {
        self.authoritative_origin.as_deref().unwrap_or(&self.origin)
    }

    pub fn loop_breaker_windows(&self) -> LoopBreakerWindows {
        LoopBreakerWindows {
            duplicate: Duration::from_millis(self.duplicate_window_ms),
            completed: Duration::from_millis(self.completed_window_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

fn parse_number<N: std::str::FromStr>(key: &str, value: &str) -> Result<N, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
