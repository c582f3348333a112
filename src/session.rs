//! One peer's participation in a sync session
//!
//! Owns the registry, the bridge and the agent dispatcher for the
//! lifetime of a session. Nothing is process-global: two sessions in one
//! process are two independent peers.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::bridge::SyncBridge;
use crate::config::SyncConfig;
use crate::dispatch::AgentDispatcher;
use crate::loop_breaker::LoopBreaker;
use crate::registry::Registry;
use crate::transport::BroadcastTransport;

pub struct SyncSession {
    config: SyncConfig,
    registry: Arc<Registry>,
    bridge: Arc<SyncBridge>,
    dispatcher: AgentDispatcher,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    pub fn new(config: SyncConfig, transport: Arc<dyn BroadcastTransport>) -> Self {
        let loop_breaker = Arc::new(LoopBreaker::new(config.loop_breaker_windows()));
        let registry = Arc::new(
            Registry::new(loop_breaker)
                .with_local_origin(config.origin.clone())
                .with_event_capacity(config.event_capacity),
        );
        let bridge = SyncBridge::new(Arc::clone(&registry), transport, &config);
        let dispatcher = AgentDispatcher::new(Arc::clone(&registry))
            .with_origin(config.authoritative_origin().to_string());

        Self {
            config,
            registry,
            bridge,
            dispatcher,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<SyncBridge> {
        &self.bridge
    }

    pub fn dispatcher(&self) -> &AgentDispatcher {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().map_or(false, |t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Start bridging. Calling it on a running session does nothing.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            return;
        }
        *task = Some(self.bridge.start());
    }

    /// Stop bridging and wait for the bridge task to exit.
    pub async fn shutdown(&self) {
        let handle = {
            let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
            task.take()
        };
        if let Some(handle) = handle {
            self.bridge.stop();
            if let Err(e) = handle.await {
                log::warn!("Sync bridge task for {} ended abnormally: {}", self.config.origin, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NewEntity, State, UpdateMeta};
    use crate::transport::simulated::SimBroadcastNetwork;
    use serde_json::json;

    fn state(value: serde_json::Value) -> State {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_session_wires_configured_windows() {
        let network = SimBroadcastNetwork::new();
        let config = SyncConfig {
            cooldown_ms: 750,
            ..SyncConfig::for_origin("browser-a")
        };
        let session = SyncSession::new(config, Arc::new(network.join()));

        assert_eq!(session.registry().local_origin(), "browser-a");
        assert_eq!(
            session.registry().loop_breaker().windows().cooldown.as_millis(),
            750
        );
        assert_eq!(session.dispatcher().origin(), "browser-a");
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let network = SimBroadcastNetwork::new();
        let session = SyncSession::new(SyncConfig::default(), Arc::new(network.join()));

        assert!(!session.is_running());
        session.start();
        session.start();
        assert!(session.is_running());

        session.shutdown().await;
        assert!(!session.is_running());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_sessions_converge() {
        let network = SimBroadcastNetwork::new();
        let a = SyncSession::new(SyncConfig::for_origin("browser-a"), Arc::new(network.join()));
        let b = SyncSession::new(SyncConfig::for_origin("browser-b"), Arc::new(network.join()));
        a.start();
        b.start();

        a.registry()
            .create(NewEntity::new("cmp-1", "counter", "canvas").with_origin("browser-a"))
            .unwrap();
        a.registry()
            .update("cmp-1", &state(json!({"value": 1})), UpdateMeta::new(1, "browser-a"))
            .unwrap();

        for _ in 0..100 {
            if b.registry().get("cmp-1").map(|r| r.version) == Ok(1) {
                break;
            }
            tokio::task::yield_now().await;
        }
        let mirrored = b.registry().get("cmp-1").unwrap();
        assert_eq!(mirrored.state, state(json!({"value": 1})));
        assert_eq!(mirrored.origin, "browser-a");

        a.shutdown().await;
        b.shutdown().await;
    }
}
