//! In-process broadcast network
//!
//! A shared "room" where every joined link receives every packet sent by
//! any link. Used for integration testing and the demo without a real
//! media server. Knobs reproduce the unpleasant parts of a real data
//! channel: echo back to the sender, duplicated delivery, and a torn-down
//! connection that fails to publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{BroadcastTransport, InboundPacket, TransportError};

struct LinkSlot {
    inbound_tx: broadcast::Sender<InboundPacket>,
    flags: Arc<LinkFlags>,
}

struct LinkFlags {
    open: AtomicBool,
    echo: AtomicBool,
    duplicate: AtomicBool,
}

/// The shared medium all simulated links talk through.
pub struct SimBroadcastNetwork {
    links: Mutex<HashMap<Uuid, LinkSlot>>,
}

impl SimBroadcastNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(HashMap::new()),
        })
    }

    /// Join the network. Echo is on by default, as with most room
    /// data channels.
    pub fn join(self: &Arc<Self>) -> SimPeerLink {
        let id = Uuid::new_v4();
        let (inbound_tx, _) = broadcast::channel(256);
        let flags = Arc::new(LinkFlags {
            open: AtomicBool::new(true),
            echo: AtomicBool::new(true),
            duplicate: AtomicBool::new(false),
        });

        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links.insert(
            id,
            LinkSlot {
                inbound_tx: inbound_tx.clone(),
                flags: Arc::clone(&flags),
            },
        );

        SimPeerLink {
            id,
            network: Arc::clone(self),
            inbound_tx,
            flags,
        }
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn deliver(&self, sender: Uuid, topic: &str, bytes: &[u8]) {
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        for (id, slot) in links.iter() {
            let is_sender = *id == sender;
            if !slot.flags.open.load(Ordering::SeqCst) {
                continue;
            }
            if is_sender && !slot.flags.echo.load(Ordering::SeqCst) {
                continue;
            }
            let packet = InboundPacket {
                topic: topic.to_string(),
                bytes: bytes.to_vec(),
                sender_is_local: is_sender,
            };
            let copies = if slot.flags.duplicate.load(Ordering::SeqCst) { 2 } else { 1 };
            for _ in 0..copies {
                let _ = slot.inbound_tx.send(packet.clone());
            }
        }
    }

    fn leave(&self, id: &Uuid) {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links.remove(id);
    }
}

/// One peer's endpoint on a [`SimBroadcastNetwork`].
pub struct SimPeerLink {
    id: Uuid,
    network: Arc<SimBroadcastNetwork>,
    inbound_tx: broadcast::Sender<InboundPacket>,
    flags: Arc<LinkFlags>,
}

impl SimPeerLink {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether our own packets are delivered back to us.
    pub fn set_echo(&self, echo: bool) {
        self.flags.echo.store(echo, Ordering::SeqCst);
    }

    /// Deliver every packet to this link twice.
    pub fn set_duplicate_delivery(&self, duplicate: bool) {
        self.flags.duplicate.store(duplicate, Ordering::SeqCst);
    }

    /// Tear the connection down: sends fail and nothing is received.
    pub fn close(&self) {
        self.flags.open.store(false, Ordering::SeqCst);
    }

    pub fn reopen(&self) {
        self.flags.open.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.flags.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BroadcastTransport for SimPeerLink {
    async fn send(&self, bytes: &[u8], topic: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if topic.is_empty() {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }
        self.network.deliver(self.id, topic, bytes);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundPacket> {
        self.inbound_tx.subscribe()
    }
}

impl Drop for SimPeerLink {
    fn drop(&mut self) {
        self.network.leave(&self.id);
    }
}
