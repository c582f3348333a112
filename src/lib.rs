// Canvas Sync - Widget State Sync for Shared Voice/Canvas Sessions

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod loop_breaker;
pub mod registry;
pub mod session;
pub mod transport;

pub use bridge::{BridgeError, BridgeStats, Envelope, EnvelopeOp, InboundDisposition, SyncBridge};
pub use config::{ConfigError, SyncConfig};
pub use dispatch::{AgentDispatcher, AgentIntent, DispatchError, DispatchOutcome};
pub use loop_breaker::{
    ContentHashSignature, LoopBreaker, LoopBreakerStats, LoopBreakerWindows, SignatureStrategy,
    VersionSignature,
};
pub use registry::{
    ChangeEvent, ChangeKind, EntityRecord, NewEntity, Registry, RegistryError, RemoveMeta,
    RemoveOutcome, State, SubscriptionId, UpdateMeta, UpdateOutcome,
};
pub use session::SyncSession;
pub use transport::{BroadcastTransport, InboundPacket, TransportError};
