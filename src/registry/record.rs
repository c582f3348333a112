//! Entity records and the metadata that travels with each mutation

use serde::{Deserialize, Serialize};

/// Field name -> value document. Patches replace top-level fields; nested
/// objects are not merged.
pub type State = serde_json::Map<String, serde_json::Value>;

/// Well-known origin tags.
pub mod origin {
    /// A browser peer's own edits.
    pub const LOCAL: &str = "local";
    /// The server-side voice agent.
    pub const REMOTE_AGENT: &str = "remote-agent";
    /// Housekeeping performed by the runtime itself.
    pub const SYSTEM: &str = "system";
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// State of one synchronized widget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: String,
    pub kind: String,
    pub namespace: String,
    pub state: State,
    /// Sole ordering key for conflicting edits. Never decreases.
    pub version: u64,
    /// Informational only; never consulted for ordering.
    pub updated_at: i64,
    /// Class of peer that produced the accepted version.
    pub origin: String,
}

impl EntityRecord {
    /// Replace each field named in `patch`.
    pub fn apply_patch(&mut self, patch: &State) {
        for (field, value) in patch {
            self.state.insert(field.clone(), value.clone());
        }
    }

    /// Whether applying `patch` would leave the state unchanged.
    pub fn reflects(&self, patch: &State) -> bool {
        patch
            .iter()
            .all(|(field, value)| self.state.get(field) == Some(value))
    }
}

/// A creation request.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEntity {
    pub id: String,
    pub kind: String,
    pub namespace: String,
    pub state: State,
    pub version: u64,
    pub timestamp: i64,
    pub origin: String,
    /// Set when the creation was ingested from the network.
    pub remote: bool,
}

impl NewEntity {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            state: State::new(),
            version: 0,
            timestamp: now_millis(),
            origin: origin::LOCAL.to_string(),
            remote: false,
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.state = state;
        self
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn at_time(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn from_remote(mut self) -> Self {
        self.remote = true;
        self
    }

    pub(crate) fn into_record(self) -> EntityRecord {
        EntityRecord {
            id: self.id,
            kind: self.kind,
            namespace: self.namespace,
            state: self.state,
            version: self.version,
            updated_at: self.timestamp,
            origin: self.origin,
        }
    }
}

/// Metadata accompanying an update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateMeta {
    /// Producer-assigned version. The registry never invents versions.
    pub version: u64,
    pub timestamp: i64,
    pub origin: String,
    /// Re-apply even if this exact operation was just seen.
    pub allow_repeat: bool,
    /// Set when the update was ingested from the network.
    pub remote: bool,
}

impl UpdateMeta {
    pub fn new(version: u64, origin: impl Into<String>) -> Self {
        Self {
            version,
            timestamp: now_millis(),
            origin: origin.into(),
            allow_repeat: false,
            remote: false,
        }
    }

    pub fn at_time(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn allow_repeat(mut self) -> Self {
        self.allow_repeat = true;
        self
    }

    pub fn from_remote(mut self) -> Self {
        self.remote = true;
        self
    }
}

/// Metadata accompanying a removal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveMeta {
    /// Version the remover had seen. `None` removes whatever is stored.
    pub version: Option<u64>,
    pub timestamp: i64,
    pub origin: String,
    pub remote: bool,
}

impl RemoveMeta {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            version: None,
            timestamp: now_millis(),
            origin: origin.into(),
            remote: false,
        }
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn at_time(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn from_remote(mut self) -> Self {
        self.remote = true;
        self
    }
}

/// Result of an update that reached an existing record.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    /// The patch was applied; carries the record as stored afterwards.
    Applied { record: EntityRecord },
    /// The version did not advance. Harmless no-op, not a failure.
    Stale { current_version: u64 },
    /// Suppressed as a likely feedback loop.
    Blocked { signature: String },
}

impl UpdateOutcome {
    pub fn accepted(&self) -> bool {
        !self.blocked()
    }

    pub fn applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }

    pub fn blocked(&self) -> bool {
        matches!(self, UpdateOutcome::Blocked { .. })
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            UpdateOutcome::Applied { .. } => None,
            UpdateOutcome::Stale { .. } => Some("stale"),
            UpdateOutcome::Blocked { .. } => Some("duplicate"),
        }
    }

    pub fn record(&self) -> Option<&EntityRecord> {
        match self {
            UpdateOutcome::Applied { record } => Some(record),
            _ => None,
        }
    }
}

/// Result of a removal that reached an existing record.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoveOutcome {
    Removed(EntityRecord),
    Stale { current_version: u64 },
}

/// What happened to an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
    /// Dropped by local TTL cleanup. Never propagated.
    Expired,
}

/// Notification fanned out to registry listeners.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub id: String,
    pub kind: String,
    pub change: ChangeKind,
    /// The record after the change. For removals, the last record with the
    /// remover's origin.
    pub record: EntityRecord,
    pub caused_by_remote: bool,
}

impl ChangeEvent {
    pub(crate) fn new(change: ChangeKind, record: EntityRecord, caused_by_remote: bool) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind.clone(),
            change,
            record,
            caused_by_remote,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.change, ChangeKind::Removed | ChangeKind::Expired)
    }
}
