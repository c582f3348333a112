//! Agent intent dispatch
//!
//! The voice agent's tool calls arrive here as intents against canvas
//! widgets. Each becomes a registry update stamped with the agent's
//! origin, so the agent peer's bridge propagates it and every other peer
//! treats it as just another remote change.
//!
//! Agents retry tool calls. A retry of an intent whose content the record
//! already shows is reported as [`DispatchOutcome::Unchanged`] rather than
//! minting a fresh version, and an intent for a widget that was just
//! removed is held off until its cooldown expires.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{origin, EntityRecord, Registry, RegistryError, State, UpdateMeta, UpdateOutcome};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Intent for {0} carries no changes")]
    EmptyIntent(String),

    #[error("No version left after {version} for {id}")]
    VersionExhausted { id: String, version: u64 },
}

/// A requested change to one widget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentIntent {
    pub id: String,
    pub patch: State,
    /// Target version; `None` means the next version after the stored one.
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub allow_repeat: bool,
}

impl AgentIntent {
    pub fn new(id: impl Into<String>, patch: State) -> Self {
        Self {
            id: id.into(),
            patch,
            version: None,
            allow_repeat: false,
        }
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn allow_repeat(mut self) -> Self {
        self.allow_repeat = true;
        self
    }
}

/// Result of a dispatched intent, serialized as a tool-call response.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Applied { record: EntityRecord },
    /// The record already shows the requested content.
    Unchanged { version: u64 },
    Stale { current_version: u64 },
    Blocked { signature: String },
    CoolingDown { remaining_secs: u64 },
}

impl DispatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DispatchOutcome::Applied { .. })
    }
}

pub struct AgentDispatcher {
    registry: Arc<Registry>,
    origin: String,
}

impl AgentDispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            origin: origin::REMOTE_AGENT.to_string(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Turn an intent into a registry update.
    ///
    /// With no explicit version the current version is read first; a
    /// concurrent update landing in between makes this one stale.
    pub fn dispatch(&self, intent: AgentIntent) -> Result<DispatchOutcome, DispatchError> {
        if intent.patch.is_empty() {
            return Err(DispatchError::EmptyIntent(intent.id));
        }

        let breaker = self.registry.loop_breaker();
        if breaker.is_in_cooldown(&intent.id) {
            let remaining_secs = breaker.remaining_cooldown_secs(&intent.id);
            log::info!(
                "Holding intent for {}: cooling down for {}s",
                intent.id, remaining_secs
            );
            return Ok(DispatchOutcome::CoolingDown { remaining_secs });
        }

        let version = match intent.version {
            Some(version) => version,
            None => {
                let current = self.registry.get(&intent.id)?;
                if !intent.allow_repeat && current.reflects(&intent.patch) {
                    log::debug!("Intent for {} already reflected at v{}", intent.id, current.version);
                    return Ok(DispatchOutcome::Unchanged {
                        version: current.version,
                    });
                }
                current
                    .version
                    .checked_add(1)
                    .ok_or_else(|| DispatchError::VersionExhausted {
                        id: intent.id.clone(),
                        version: current.version,
                    })?
            }
        };

        let mut meta = UpdateMeta::new(version, self.origin.clone());
        if intent.allow_repeat {
            meta = meta.allow_repeat();
        }

        let outcome = self.registry.update(&intent.id, &intent.patch, meta)?;
        Ok(match outcome {
            UpdateOutcome::Applied { record } => DispatchOutcome::Applied { record },
            UpdateOutcome::Stale { current_version } => DispatchOutcome::Stale { current_version },
            UpdateOutcome::Blocked { signature } => DispatchOutcome::Blocked { signature },
        })
    }

    /// Re-assert the current state at the current version.
    ///
    /// Used when the agent needs a widget's state to go out again, e.g.
    /// after a peer reconnects. Safe to call repeatedly.
    pub fn confirm(&self, id: &str) -> Result<DispatchOutcome, DispatchError> {
        let current = self.registry.get(id)?;
        let intent = AgentIntent {
            id: id.to_string(),
            patch: current.state,
            version: Some(current.version),
            allow_repeat: true,
        };
        self.dispatch(intent)
    }
}
