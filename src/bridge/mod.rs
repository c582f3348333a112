//! Bridge between registry changes and the broadcast channel
//!
//! Outbound: a registry change is published only when this peer caused it
//! locally and its origin is the one this peer is authoritative for. Every
//! peer on the topic already hears every other peer directly, so relaying
//! ingested state would only add traffic and, between two bridges, an
//! endless relay.
//!
//! Inbound: bytes are decoded, validated, echo-filtered, and fed through
//! the same registry acceptance rule as local edits.
//!
//! Publish failures are logged and absorbed. The local mutation already
//! succeeded; the next mutation or a [`SyncBridge::resync`] repairs
//! propagation.

mod envelope;

pub use envelope::{Envelope, EnvelopeOp};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::registry::{
    ChangeEvent, ChangeKind, EntityRecord, NewEntity, Registry, RegistryError, RemoveMeta,
    RemoveOutcome, UpdateMeta, UpdateOutcome,
};
use crate::transport::{BroadcastTransport, InboundPacket};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),
}

/// What the bridge did with an inbound packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundDisposition {
    /// Not valid JSON, or not a valid envelope.
    Malformed,
    /// Our own packet looped back by the transport.
    Echo,
    /// Addressed to another topic.
    WrongTopic,
    Created,
    Applied,
    Removed,
    /// Older than, or not advancing past, what is stored.
    Stale,
    /// Suppressed as a feedback loop.
    Blocked,
    /// Refused by the registry (schema conflict, cooldown, unknown id).
    Rejected(String),
}

/// Counters for observing bridge traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub published: u64,
    pub publish_failures: u64,
    pub ingested: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    ingested: AtomicU64,
    dropped: AtomicU64,
}

pub struct SyncBridge {
    registry: Arc<Registry>,
    transport: Arc<dyn BroadcastTransport>,
    origin: String,
    authoritative_origin: String,
    topic: String,
    default_namespace: String,
    shutdown_tx: broadcast::Sender<()>,
    counters: Counters,
}

impl SyncBridge {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn BroadcastTransport>,
        config: &SyncConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            registry,
            transport,
            origin: config.origin.clone(),
            authoritative_origin: config.authoritative_origin().to_string(),
            topic: config.topic.clone(),
            default_namespace: config.default_namespace.clone(),
            shutdown_tx,
            counters: Counters::default(),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            ingested: self.counters.ingested.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Spawn the bridge task: registry events out, transport packets in.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.registry.events();
        let mut inbound = self.transport.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let bridge = Arc::clone(self);

        tokio::spawn(async move {
            log::info!("Sync bridge for {} started on topic {}", bridge.origin, bridge.topic);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            if let Some(envelope) = bridge.outbound_for(&event) {
                                bridge.publish(&envelope).await;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Sync bridge skipped {} registry events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    packet = inbound.recv() => match packet {
                        Ok(packet) => {
                            bridge.handle_packet(&packet);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Sync bridge skipped {} inbound packets", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            log::info!("Sync bridge for {} stopped", bridge.origin);
        })
    }

    /// Signal the bridge task to exit.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Envelope to broadcast for a registry change, if this peer is
    /// responsible for propagating it.
    pub fn outbound_for(&self, event: &ChangeEvent) -> Option<Envelope> {
        if event.caused_by_remote || event.change == ChangeKind::Expired {
            return None;
        }
        if event.record.origin != self.authoritative_origin {
            log::debug!(
                "Not rebroadcasting {} v{}: origin {} is not ours",
                event.id, event.record.version, event.record.origin
            );
            return None;
        }
        Some(Envelope::from_event(event))
    }

    /// Publish an envelope. Failures are logged and swallowed.
    pub async fn publish(&self, envelope: &Envelope) -> bool {
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode envelope for {}: {}", envelope.id, e);
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        match self.transport.send(&bytes, &self.topic).await {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::warn!(
                    "Failed to publish {} v{} on {}: {}",
                    envelope.id, envelope.version, self.topic, e
                );
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Re-publish every record this peer is authoritative for. Returns the
    /// number of envelopes sent.
    pub async fn resync(&self) -> usize {
        let records = match self.registry.snapshot() {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Resync could not read registry: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for record in records
            .iter()
            .filter(|r| r.origin == self.authoritative_origin)
        {
            if self.publish(&Envelope::from_record(record)).await {
                sent += 1;
            }
        }
        log::info!("Resync published {} of {} records", sent, records.len());
        sent
    }

    /// Handle a packet from the transport.
    pub fn handle_packet(&self, packet: &InboundPacket) -> InboundDisposition {
        if packet.topic != self.topic {
            return InboundDisposition::WrongTopic;
        }
        self.handle_inbound(&packet.bytes, packet.sender_is_local)
    }

    /// Decode an inbound message and feed it to the registry.
    pub fn handle_inbound(&self, bytes: &[u8], sender_is_local: bool) -> InboundDisposition {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping malformed envelope: {}", e);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return InboundDisposition::Malformed;
            }
        };

        if sender_is_local && envelope.origin == self.origin {
            log::debug!("Dropping echo of {} v{}", envelope.id, envelope.version);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return InboundDisposition::Echo;
        }

        let disposition = match envelope.op {
            EnvelopeOp::Remove => self.ingest_removal(&envelope),
            EnvelopeOp::Upsert => self.ingest_upsert(envelope),
        };

        match disposition {
            InboundDisposition::Created
            | InboundDisposition::Applied
            | InboundDisposition::Removed => {
                self.counters.ingested.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        disposition
    }

    fn ingest_removal(&self, envelope: &Envelope) -> InboundDisposition {
        let meta = RemoveMeta::new(envelope.origin.clone())
            .at_version(envelope.version)
            .at_time(envelope.timestamp)
            .from_remote();
        match self.registry.remove_with(&envelope.id, meta) {
            Ok(RemoveOutcome::Removed(_)) => InboundDisposition::Removed,
            Ok(RemoveOutcome::Stale { .. }) => InboundDisposition::Stale,
            Err(RegistryError::NotFound(_)) => {
                log::debug!("Removal of unknown {} (already gone)", envelope.id);
                InboundDisposition::Stale
            }
            Err(e) => InboundDisposition::Rejected(e.to_string()),
        }
    }

    fn ingest_upsert(&self, envelope: Envelope) -> InboundDisposition {
        if let Ok(existing) = self.registry.get(&envelope.id) {
            if existing.kind != envelope.kind {
                log::warn!(
                    "Refusing {} update for {}: stored kind is {}",
                    envelope.kind, envelope.id, existing.kind
                );
                let conflict = RegistryError::SchemaConflict {
                    id: envelope.id,
                    existing_kind: existing.kind,
                    existing_namespace: existing.namespace.clone(),
                    kind: envelope.kind,
                    namespace: envelope.namespace.unwrap_or(existing.namespace),
                };
                return InboundDisposition::Rejected(conflict.to_string());
            }
        }

        match self.apply_update(&envelope) {
            Err(RegistryError::NotFound(_)) => {}
            Ok(outcome) => return Self::disposition_for(&outcome),
            Err(e) => return InboundDisposition::Rejected(e.to_string()),
        }

        let namespace = envelope
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone());
        let entity = NewEntity::new(envelope.id.clone(), envelope.kind.clone(), namespace)
            .with_state(envelope.payload.clone())
            .at_version(envelope.version)
            .at_time(envelope.timestamp)
            .with_origin(envelope.origin.clone())
            .from_remote();

        match self.registry.create(entity) {
            Ok(record) => self.settle_create(&record, &envelope),
            Err(e) => {
                log::debug!("Refused remote create of {}: {}", envelope.id, e);
                InboundDisposition::Rejected(e.to_string())
            }
        }
    }

    /// Classify the record `create` returned. Another producer may have
    /// created the id between our update attempt and the create.
    fn settle_create(&self, record: &EntityRecord, envelope: &Envelope) -> InboundDisposition {
        if record.version < envelope.version {
            return match self.apply_update(envelope) {
                Ok(outcome) => Self::disposition_for(&outcome),
                Err(e) => InboundDisposition::Rejected(e.to_string()),
            };
        }
        if record.version > envelope.version || record.state != envelope.payload {
            log::debug!(
                "Lost creation race for {} at v{}; keeping v{}",
                envelope.id, envelope.version, record.version
            );
            return InboundDisposition::Stale;
        }
        InboundDisposition::Created
    }

    fn apply_update(&self, envelope: &Envelope) -> Result<UpdateOutcome, RegistryError> {
        let meta = UpdateMeta::new(envelope.version, envelope.origin.clone())
            .at_time(envelope.timestamp)
            .from_remote();
        self.registry.update(&envelope.id, &envelope.payload, meta)
    }

    fn disposition_for(outcome: &UpdateOutcome) -> InboundDisposition {
        match outcome {
            UpdateOutcome::Applied { .. } => InboundDisposition::Applied,
            UpdateOutcome::Stale { .. } => InboundDisposition::Stale,
            UpdateOutcome::Blocked { .. } => InboundDisposition::Blocked,
        }
    }
}
