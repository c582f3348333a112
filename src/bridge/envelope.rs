//! Wire envelope exchanged over the broadcast channel
//!
//! JSON shape:
//!
//! ```text
//! { "id": "cmp-1", "kind": "counter", "payload": { "value": 2 },
//!   "version": 2, "timestamp": 1718000000000, "origin": "local" }
//! ```
//!
//! Two optional fields ride along: `op` (`"upsert"` when absent, or
//! `"remove"` for tombstones) and `namespace` (receiver's default when
//! absent). Peers that only know the six-field shape still interoperate.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use super::BridgeError;
use crate::registry::{ChangeEvent, ChangeKind, EntityRecord, State};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeOp {
    #[default]
    Upsert,
    Remove,
}

impl EnvelopeOp {
    fn is_upsert(&self) -> bool {
        *self == EnvelopeOp::Upsert
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub kind: String,
    /// Full state or partial patch; fields replace, no deep merge.
    #[serde(default)]
    pub payload: State,
    pub version: u64,
    /// Milliseconds since the epoch. Informational only; any JSON number is
    /// accepted and rounded.
    #[serde(default, deserialize_with = "millis_from_number")]
    pub timestamp: i64,
    pub origin: String,
    #[serde(default, skip_serializing_if = "EnvelopeOp::is_upsert")]
    pub op: EnvelopeOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

fn millis_from_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let number = serde_json::Number::deserialize(deserializer)?;
    number
        .as_i64()
        .or_else(|| number.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
        .ok_or_else(|| D::Error::custom(format!("timestamp {} is not representable", number)))
}

impl Envelope {
    /// Full-state upsert for a record.
    pub fn from_record(record: &EntityRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind.clone(),
            payload: record.state.clone(),
            version: record.version,
            timestamp: record.updated_at,
            origin: record.origin.clone(),
            op: EnvelopeOp::Upsert,
            namespace: Some(record.namespace.clone()),
        }
    }

    /// Envelope announcing a registry change. Removals become tombstones
    /// with an empty payload.
    pub fn from_event(event: &ChangeEvent) -> Self {
        let mut envelope = Self::from_record(&event.record);
        if matches!(event.change, ChangeKind::Removed | ChangeKind::Expired) {
            envelope.op = EnvelopeOp::Remove;
            envelope.payload = State::new();
        }
        envelope
    }

    pub fn is_tombstone(&self) -> bool {
        self.op == EnvelopeOp::Remove
    }

    /// Parse and validate bytes received from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| BridgeError::Decode(e.to_string()))?;
        if envelope.id.trim().is_empty() {
            return Err(BridgeError::Decode("empty id".into()));
        }
        if envelope.kind.trim().is_empty() {
            return Err(BridgeError::Decode("empty kind".into()));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self).map_err(|e| BridgeError::Encode(e.to_string()))
    }
}
