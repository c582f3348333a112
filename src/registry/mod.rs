//! Authoritative in-process store of widget state
//!
//! Every mutation, local or ingested from the network, goes through the
//! same version-ordered acceptance rule:
//!
//! ```text
//! incoming <  current   -> Stale    (late delivery, silently ignored)
//! incoming == current   -> Blocked  (recent duplicate, loop suppressed)
//!                       -> Stale    (anything else at that version)
//!                       -> Applied  (allow_repeat escape hatch)
//! incoming >  current   -> Applied  (patch fields, adopt version/origin)
//! ```
//!
//! All mutations serialize behind one mutex so the compare-and-set on
//! `version` is atomic with respect to concurrent network and UI
//! producers. Change events go out on a broadcast bus in acceptance order
//! (sent while the lock is held; `broadcast::Sender::send` never blocks).
//! Callback listeners get the same order: events are queued under the
//! lock and drained by one producer at a time after it is released.

mod error;
mod record;

pub use error::RegistryError;
pub use record::{
    now_millis, origin, ChangeEvent, ChangeKind, EntityRecord, NewEntity, RemoveMeta,
    RemoveOutcome, State, UpdateMeta, UpdateOutcome,
};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::loop_breaker::{ContentHashSignature, LoopBreaker, SignatureStrategy};

/// Identifies a callback registered with [`Registry::subscribe`].
pub type SubscriptionId = Uuid;

type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// The entity store.
pub struct Registry {
    records: Mutex<HashMap<String, EntityRecord>>,
    loop_breaker: Arc<LoopBreaker>,
    signatures: Arc<dyn SignatureStrategy>,
    local_origin: String,
    listeners: Mutex<HashMap<SubscriptionId, Listener>>,
    events_tx: broadcast::Sender<ChangeEvent>,
    /// Accepted changes awaiting callback delivery, in acceptance order.
    pending: Mutex<VecDeque<ChangeEvent>>,
    /// Held by whichever producer is currently draining `pending`.
    delivering: Mutex<()>,
}

impl Registry {
    /// Create an empty registry sharing `loop_breaker`.
    pub fn new(loop_breaker: Arc<LoopBreaker>) -> Self {
        let (events_tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            records: Mutex::new(HashMap::new()),
            loop_breaker,
            signatures: Arc::new(ContentHashSignature),
            local_origin: origin::LOCAL.to_string(),
            listeners: Mutex::new(HashMap::new()),
            events_tx,
            pending: Mutex::new(VecDeque::new()),
            delivering: Mutex::new(()),
        }
    }

    /// Set the signature strategy used for duplicate detection
    pub fn with_signatures(mut self, signatures: impl SignatureStrategy + 'static) -> Self {
        self.signatures = Arc::new(signatures);
        self
    }

    /// Set the origin stamped on local removals
    pub fn with_local_origin(mut self, origin: impl Into<String>) -> Self {
        self.local_origin = origin.into();
        self
    }

    /// Set the capacity of the event bus
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        self.events_tx = events_tx;
        self
    }

    pub fn loop_breaker(&self) -> &Arc<LoopBreaker> {
        &self.loop_breaker
    }

    pub fn local_origin(&self) -> &str {
        &self.local_origin
    }

    fn lock_records(&self) -> Result<MutexGuard<'_, HashMap<String, EntityRecord>>, RegistryError> {
        self.records.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Create an entity.
    ///
    /// Idempotent: if the id already exists with the same kind and
    /// namespace, the stored record is returned untouched. A different
    /// kind or namespace is a [`RegistryError::SchemaConflict`].
    pub fn create(&self, entity: NewEntity) -> Result<EntityRecord, RegistryError> {
        let record = {
            let mut records = self.lock_records()?;

            if let Some(existing) = records.get(&entity.id) {
                if existing.kind != entity.kind || existing.namespace != entity.namespace {
                    return Err(RegistryError::SchemaConflict {
                        id: entity.id,
                        existing_kind: existing.kind.clone(),
                        existing_namespace: existing.namespace.clone(),
                        kind: entity.kind,
                        namespace: entity.namespace,
                    });
                }
                return Ok(existing.clone());
            }

            // A removed widget must not come back from a late or duplicated delivery.
            if entity.remote && self.loop_breaker.is_in_cooldown(&entity.id) {
                return Err(RegistryError::CoolingDown {
                    remaining_secs: self.loop_breaker.remaining_cooldown_secs(&entity.id),
                    id: entity.id,
                });
            }

            let remote = entity.remote;
            let record = entity.into_record();
            let signature =
                self.signatures
                    .signature(&record.id, &record.kind, record.version, &record.state);
            self.loop_breaker.register(&signature);
            self.loop_breaker.mark_completed(&signature);

            records.insert(record.id.clone(), record.clone());
            self.publish(ChangeEvent::new(ChangeKind::Created, record.clone(), remote));
            record
        };

        self.deliver_pending();
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<EntityRecord, RegistryError> {
        self.lock_records()?
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock_records()
            .map(|records| records.contains_key(id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock_records().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, sorted by id.
    pub fn snapshot(&self) -> Result<Vec<EntityRecord>, RegistryError> {
        let mut all: Vec<EntityRecord> = self.lock_records()?.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    /// Records in one namespace, sorted by id.
    pub fn list_namespace(&self, namespace: &str) -> Result<Vec<EntityRecord>, RegistryError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|r| r.namespace == namespace)
            .collect())
    }

    /// Apply a patch under the version-ordered acceptance rule.
    ///
    /// Only a version above the stored one applies. At the stored version
    /// the first accepted content wins: a recent repeat is
    /// [`UpdateOutcome::Blocked`] and any other patch, including one never
    /// seen before, is [`UpdateOutcome::Stale`] and leaves the record
    /// untouched. Set [`UpdateMeta::allow_repeat()`] to re-apply at the
    /// stored version.
    ///
    /// Updating an unknown id is [`RegistryError::NotFound`]; it never
    /// creates the entity.
    pub fn update(
        &self,
        id: &str,
        patch: &State,
        meta: UpdateMeta,
    ) -> Result<UpdateOutcome, RegistryError> {
        let outcome = {
            let mut records = self.lock_records()?;
            let record = records
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            let incoming = meta.version;
            let current = record.version;

            if incoming < current {
                log::debug!(
                    "Ignoring stale update for {} (v{} < v{}, origin {})",
                    id, incoming, current, meta.origin
                );
                return Ok(UpdateOutcome::Stale {
                    current_version: current,
                });
            }

            let signature = self.signatures.signature(id, &record.kind, incoming, patch);

            if incoming == current && !meta.allow_repeat {
                if self.loop_breaker.is_duplicate(&signature) {
                    log::debug!(
                        "Blocked repeat of {} at v{} from {}",
                        id, incoming, meta.origin
                    );
                    return Ok(UpdateOutcome::Blocked { signature });
                }
                log::debug!(
                    "Ignoring non-advancing update for {} at v{} from {}",
                    id, incoming, meta.origin
                );
                return Ok(UpdateOutcome::Stale {
                    current_version: current,
                });
            }

            record.apply_patch(patch);
            record.version = incoming;
            record.updated_at = meta.timestamp;
            record.origin = meta.origin;

            self.loop_breaker.register(&signature);
            self.loop_breaker.mark_completed(&signature);

            let snapshot = record.clone();
            self.publish(ChangeEvent::new(ChangeKind::Updated, snapshot.clone(), meta.remote));
            UpdateOutcome::Applied { record: snapshot }
        };

        self.deliver_pending();
        Ok(outcome)
    }

    /// Remove a record on behalf of the local peer.
    pub fn remove(&self, id: &str) -> Result<EntityRecord, RegistryError> {
        match self.remove_with(id, RemoveMeta::new(self.local_origin.clone()))? {
            RemoveOutcome::Removed(record) => Ok(record),
            // Unversioned removals always apply
            RemoveOutcome::Stale { .. } => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    /// Remove a record, emitting a tombstone event.
    ///
    /// A removal carrying a version older than the stored one lost the race
    /// against a newer update and is reported stale. Removed ids cool down
    /// in the loop breaker so late creates from the network are refused;
    /// a network removal for an id not yet seen starts the same cooldown.
    pub fn remove_with(&self, id: &str, meta: RemoveMeta) -> Result<RemoveOutcome, RegistryError> {
        let removed = {
            let mut records = self.lock_records()?;
            let current = match records.get(id) {
                Some(record) => record.version,
                None => {
                    if meta.remote {
                        self.loop_breaker.register_cooldown(id);
                    }
                    return Err(RegistryError::NotFound(id.to_string()));
                }
            };

            if let Some(version) = meta.version {
                if version < current {
                    log::debug!(
                        "Ignoring stale removal of {} (v{} < v{})",
                        id, version, current
                    );
                    return Ok(RemoveOutcome::Stale {
                        current_version: current,
                    });
                }
            }

            let mut record = match records.remove(id) {
                Some(record) => record,
                None => return Err(RegistryError::NotFound(id.to_string())),
            };
            record.version = meta.version.unwrap_or(current).max(current);
            record.updated_at = meta.timestamp;
            record.origin = meta.origin;

            self.loop_breaker.register_cooldown(id);
            log::info!("Removed {} at v{} (origin {})", id, record.version, record.origin);

            self.publish(ChangeEvent::new(ChangeKind::Removed, record.clone(), meta.remote));
            record
        };

        self.deliver_pending();
        Ok(RemoveOutcome::Removed(removed))
    }

    /// Drop records whose `updated_at` is older than `max_age_ms` before
    /// `now_ms`. Emits [`ChangeKind::Expired`] events, which are never
    /// propagated to other peers.
    pub fn prune_stale(&self, max_age_ms: i64, now_ms: i64) -> Result<Vec<EntityRecord>, RegistryError> {
        let cutoff = now_ms.saturating_sub(max_age_ms);
        let pruned: Vec<EntityRecord> = {
            let mut records = self.lock_records()?;
            let expired: Vec<String> = records
                .values()
                .filter(|r| r.updated_at < cutoff)
                .map(|r| r.id.clone())
                .collect();

            let mut pruned = Vec::with_capacity(expired.len());
            for id in expired {
                if let Some(record) = records.remove(&id) {
                    self.publish(ChangeEvent::new(ChangeKind::Expired, record.clone(), false));
                    pruned.push(record);
                }
            }
            pruned
        };

        if !pruned.is_empty() {
            log::info!("Pruned {} stale records", pruned.len());
        }
        self.deliver_pending();
        Ok(pruned)
    }

    /// Register a callback for every change.
    ///
    /// Callbacks run after the registry lock is released, one at a time and
    /// in acceptance order. With concurrent producers a change may be
    /// delivered on another producer's thread. Callbacks may read the
    /// registry; a listener that wants to mutate in response should use
    /// [`Registry::events`] from its own task instead.
    pub fn subscribe(&self, callback: Box<dyn Fn(&ChangeEvent) + Send + Sync>) -> SubscriptionId {
        let id = Uuid::new_v4();
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.insert(id, Arc::from(callback));
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.remove(&id).is_some()
    }

    /// Typed event bus carrying every change in acceptance order.
    pub fn events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events_tx.subscribe()
    }

    /// Send an accepted change to the bus and queue it for listeners.
    /// Called with the records lock held.
    fn publish(&self, event: ChangeEvent) {
        let _ = self.events_tx.send(event.clone());
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event);
    }

    fn next_pending(&self) -> Option<ChangeEvent> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    /// Drain queued changes to listeners unless another producer already is.
    /// The drainer re-checks the queue after letting go, so nothing queued
    /// while it was finishing is left behind.
    fn deliver_pending(&self) {
        loop {
            let turn = match self.delivering.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
            };
            while let Some(event) = self.next_pending() {
                self.notify_listeners(&event);
            }
            drop(turn);

            let idle = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty();
            if idle {
                return;
            }
        }
    }

    fn notify_listeners(&self, event: &ChangeEvent) {
        let listeners: Vec<Listener> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener(event);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Arc::new(LoopBreaker::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_breaker::VersionSignature;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state(value: serde_json::Value) -> State {
        value.as_object().cloned().unwrap()
    }

    fn counter(registry: &Registry, id: &str, version: u64, value: i64) -> EntityRecord {
        registry
            .create(
                NewEntity::new(id, "counter", "canvas")
                    .with_state(state(json!({ "value": value })))
                    .at_version(version),
            )
            .unwrap()
    }

    fn bump(registry: &Registry, id: &str, version: u64, value: i64) -> UpdateOutcome {
        registry
            .update(id, &state(json!({ "value": value })), UpdateMeta::new(version, "local"))
            .unwrap()
    }

    #[test]
    fn test_counter_scenario() {
        let registry = Registry::default();
        counter(&registry, "cmp-1", 0, 0);

        assert!(bump(&registry, "cmp-1", 1, 1).applied());
        assert_eq!(registry.get("cmp-1").unwrap().state, state(json!({"value": 1})));

        let late = bump(&registry, "cmp-1", 0, 999);
        assert_eq!(late, UpdateOutcome::Stale { current_version: 1 });
        assert!(late.accepted());
        assert_eq!(registry.get("cmp-1").unwrap().state, state(json!({"value": 1})));

        assert!(bump(&registry, "cmp-1", 2, 2).applied());
        let stored = registry.get("cmp-1").unwrap();
        assert_eq!(stored.state, state(json!({"value": 2})));
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn test_monotonic_acceptance_in_every_delivery_order() {
        let orders = [
            [1, 2, 3],
            [1, 3, 2],
            [2, 1, 3],
            [2, 3, 1],
            [3, 1, 2],
            [3, 2, 1],
        ];
        for order in orders {
            let registry = Registry::default();
            counter(&registry, "cmp-1", 0, 0);
            for v in order {
                bump(&registry, "cmp-1", v, v as i64 * 10);
            }
            let stored = registry.get("cmp-1").unwrap();
            assert_eq!(stored.version, 3, "order {:?}", order);
            assert_eq!(stored.state, state(json!({"value": 30})), "order {:?}", order);
        }
    }

    #[test]
    fn test_stale_update_leaves_record_untouched() {
        let registry = Registry::default();
        counter(&registry, "cmp-1", 0, 0);
        registry
            .update(
                "cmp-1",
                &state(json!({"value": 5})),
                UpdateMeta::new(5, "remote-agent").at_time(500),
            )
            .unwrap();
        let before = registry.get("cmp-1").unwrap();

        for version in [3, 5] {
            let outcome = registry
                .update(
                    "cmp-1",
                    &state(json!({"value": -1, "extra": true})),
                    UpdateMeta::new(version, "intruder").at_time(900),
                )
                .unwrap();
            assert!(!outcome.applied());
            assert!(outcome.accepted());
        }

        assert_eq!(registry.get("cmp-1").unwrap(), before);
    }

    #[test]
    fn test_update_unknown_id_is_not_found() {
        let registry = Registry::default();
        let err = registry
            .update("ghost", &State::new(), UpdateMeta::new(1, "local"))
            .unwrap_err();
        assert_eq!(err, RegistryError::NotFound("ghost".into()));
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn test_create_is_idempotent() {
        let registry = Registry::default();
        let first = counter(&registry, "cmp-1", 0, 0);
        let second = registry
            .create(
                NewEntity::new("cmp-1", "counter", "canvas")
                    .with_state(state(json!({"value": 42})))
                    .at_version(9),
            )
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.get("cmp-1").unwrap(), first);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_schema_conflict() {
        let registry = Registry::default();
        counter(&registry, "cmp-1", 0, 0);

        let wrong_kind = registry.create(NewEntity::new("cmp-1", "timer", "canvas"));
        assert!(matches!(wrong_kind, Err(RegistryError::SchemaConflict { .. })));

        let wrong_ns = registry.create(NewEntity::new("cmp-1", "counter", "voice-session"));
        assert!(matches!(wrong_ns, Err(RegistryError::SchemaConflict { .. })));
    }

    #[test]
    fn test_repeat_within_window_is_blocked() {
        let registry = Registry::default();
        counter(&registry, "cmp-1", 0, 0);

        assert!(bump(&registry, "cmp-1", 1, 1).applied());
        let repeat = bump(&registry, "cmp-1", 1, 1);
        assert!(repeat.blocked());
        assert!(!repeat.accepted());
        assert_eq!(registry.get("cmp-1").unwrap().version, 1);
    }

    #[test]
    fn test_allow_repeat_reapplies() {
        let registry = Registry::default();
        counter(&registry, "cmp-1", 0, 0);
        let patch = state(json!({"value": 1}));

        let first = registry
            .update("cmp-1", &patch, UpdateMeta::new(1, "remote-agent").allow_repeat())
            .unwrap();
        let second = registry
            .update("cmp-1", &patch, UpdateMeta::new(1, "remote-agent").allow_repeat())
            .unwrap();
        assert!(first.applied());
        assert!(second.applied());
    }

    #[test]
    fn test_different_patch_at_same_version_is_stale_not_blocked() {
        let registry = Registry::default();
        counter(&registry, "cmp-1", 0, 0);
        bump(&registry, "cmp-1", 1, 1);

        let other = bump(&registry, "cmp-1", 1, 7);
        assert_eq!(other, UpdateOutcome::Stale { current_version: 1 });
        assert_eq!(registry.get("cmp-1").unwrap().state, state(json!({"value": 1})));
    }

    #[test]
    fn test_version_signature_blocks_any_repeat_at_version() {
        let registry = Registry::default().with_signatures(VersionSignature);
        counter(&registry, "cmp-1", 0, 0);
        bump(&registry, "cmp-1", 1, 1);
        assert!(bump(&registry, "cmp-1", 1, 7).blocked());
    }

    #[test]
    fn test_echo_of_creation_is_blocked() {
        let registry = Registry::default();
        counter(&registry, "cmp-1", 0, 0);
        let echo = registry
            .update(
                "cmp-1",
                &state(json!({"value": 0})),
                UpdateMeta::new(0, "local").from_remote(),
            )
            .unwrap();
        assert!(echo.blocked());
    }

    #[test]
    fn test_applied_update_adopts_meta() {
        let registry = Registry::default();
        counter(&registry, "cmp-1", 0, 0);
        registry
            .update(
                "cmp-1",
                &state(json!({"label": "hi"})),
                UpdateMeta::new(4, "remote-agent").at_time(1234),
            )
            .unwrap();

        let stored = registry.get("cmp-1").unwrap();
        assert_eq!(stored.version, 4);
        assert_eq!(stored.updated_at, 1234);
        assert_eq!(stored.origin, "remote-agent");
        assert_eq!(stored.state, state(json!({"value": 0, "label": "hi"})));
    }

    #[test]
    fn test_listeners_receive_changes_and_can_unsubscribe() {
        let registry = Registry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = registry.subscribe(Box::new(move |event: &ChangeEvent| {
            sink.lock().unwrap().push((event.change, event.record.version, event.caused_by_remote));
        }));

        counter(&registry, "cmp-1", 0, 0);
        registry
            .update("cmp-1", &state(json!({"value": 1})), UpdateMeta::new(1, "peer").from_remote())
            .unwrap();
        bump(&registry, "cmp-1", 0, 5); // stale, no event
        registry.remove("cmp-1").unwrap();

        assert!(registry.unsubscribe(sub));
        assert!(!registry.unsubscribe(sub));
        counter(&registry, "cmp-2", 0, 0);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ChangeKind::Created, 0, false),
                (ChangeKind::Updated, 1, true),
                (ChangeKind::Removed, 1, false),
            ]
        );
    }

    #[test]
    fn test_listener_can_read_registry_during_callback() {
        let registry = Arc::new(Registry::default());
        let observed = Arc::new(AtomicUsize::new(0));
        let reader = Arc::clone(&registry);
        let count = Arc::clone(&observed);
        registry.subscribe(Box::new(move |event: &ChangeEvent| {
            if let Ok(record) = reader.get(&event.id) {
                count.store(record.version as usize, Ordering::SeqCst);
            }
        }));

        counter(&registry, "cmp-1", 0, 0);
        bump(&registry, "cmp-1", 7, 1);
        assert_eq!(observed.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_listeners_see_acceptance_order_under_concurrent_producers() {
        for _ in 0..20 {
            let registry = Arc::new(Registry::default());
            counter(&registry, "cmp-1", 0, 0);

            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            registry.subscribe(Box::new(move |event: &ChangeEvent| {
                sink.lock().unwrap().push(event.record.clone());
            }));

            let handles: Vec<_> = (0..4u64)
                .map(|worker| {
                    let registry = Arc::clone(&registry);
                    std::thread::spawn(move || {
                        for step in 0..50u64 {
                            let version = step * 4 + worker + 1;
                            let _ = registry.update(
                                "cmp-1",
                                &state(json!({ "value": version })),
                                UpdateMeta::new(version, "local"),
                            );
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let seen = seen.lock().unwrap();
            let versions: Vec<u64> = seen.iter().map(|r| r.version).collect();
            assert!(
                versions.windows(2).all(|pair| pair[0] < pair[1]),
                "out of order: {:?}",
                versions
            );
            assert_eq!(seen.last(), Some(&registry.get("cmp-1").unwrap()));
        }
    }

    #[test]
    fn test_listener_may_mutate_without_deadlock() {
        let registry = Arc::new(Registry::default());
        counter(&registry, "cmp-1", 0, 0);
        registry.create(NewEntity::new("log", "note", "canvas")).unwrap();

        let writer = Arc::clone(&registry);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.subscribe(Box::new(move |event: &ChangeEvent| {
            sink.lock().unwrap().push((event.id.clone(), event.record.version));
            if event.id == "cmp-1" {
                let _ = writer.update(
                    "log",
                    &state(json!({ "last": event.record.version })),
                    UpdateMeta::new(event.record.version, "local"),
                );
            }
        }));

        bump(&registry, "cmp-1", 1, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("cmp-1".to_string(), 1), ("log".to_string(), 1)]
        );
        assert_eq!(registry.get("log").unwrap().state, state(json!({"last": 1})));
    }

    #[test]
    fn test_event_bus_carries_changes_in_order() {
        let registry = Registry::default();
        let mut rx = registry.events();

        counter(&registry, "cmp-1", 0, 0);
        bump(&registry, "cmp-1", 2, 2);
        bump(&registry, "cmp-1", 1, 1);
        bump(&registry, "cmp-1", 3, 3);

        let versions: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.record.version)
            .collect();
        assert_eq!(versions, vec![0, 2, 3]);
    }

    #[test]
    fn test_remove_emits_tombstone_with_remover_origin() {
        let registry = Registry::default().with_local_origin("browser-a");
        counter(&registry, "cmp-1", 3, 0);
        let mut rx = registry.events();

        let removed = registry.remove("cmp-1").unwrap();
        assert_eq!(removed.version, 3);
        assert_eq!(removed.origin, "browser-a");
        assert!(!registry.contains("cmp-1"));

        let event = rx.try_recv().unwrap();
        assert!(event.is_tombstone());
        assert_eq!(event.change, ChangeKind::Removed);
        assert!(!event.caused_by_remote);

        assert_eq!(registry.remove("cmp-1"), Err(RegistryError::NotFound("cmp-1".into())));
    }

    #[test]
    fn test_stale_remote_removal_is_ignored() {
        let registry = Registry::default();
        counter(&registry, "cmp-1", 0, 0);
        bump(&registry, "cmp-1", 4, 4);

        let outcome = registry
            .remove_with("cmp-1", RemoveMeta::new("peer").at_version(2).from_remote())
            .unwrap();
        assert_eq!(outcome, RemoveOutcome::Stale { current_version: 4 });
        assert!(registry.contains("cmp-1"));
    }

    #[test]
    fn test_removed_entity_is_not_resurrected_by_late_remote_create() {
        let registry = Registry::default();
        counter(&registry, "cmp-1", 0, 0);
        registry.remove("cmp-1").unwrap();

        let late = registry.create(NewEntity::new("cmp-1", "counter", "canvas").from_remote());
        assert!(matches!(late, Err(RegistryError::CoolingDown { .. })));

        // A deliberate local re-create is still allowed
        assert!(registry.create(NewEntity::new("cmp-1", "counter", "canvas")).is_ok());
    }

    #[test]
    fn test_remote_removal_before_create_blocks_the_create() {
        let registry = Registry::default();
        let early = registry.remove_with("cmp-9", RemoveMeta::new("peer").at_version(1).from_remote());
        assert_eq!(early, Err(RegistryError::NotFound("cmp-9".into())));

        let late = registry.create(NewEntity::new("cmp-9", "counter", "canvas").from_remote());
        assert!(matches!(late, Err(RegistryError::CoolingDown { .. })));
    }

    #[test]
    fn test_prune_stale_expires_old_records() {
        let registry = Registry::default();
        registry
            .create(NewEntity::new("old", "note", "canvas").at_time(1_000))
            .unwrap();
        registry
            .create(NewEntity::new("fresh", "note", "canvas").at_time(9_000))
            .unwrap();
        let mut rx = registry.events();

        let pruned = registry.prune_stale(5_000, 10_000).unwrap();
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].id, "old");
        assert!(registry.contains("fresh"));
        assert_eq!(rx.try_recv().unwrap().change, ChangeKind::Expired);
    }

    #[test]
    fn test_snapshot_and_namespace_listing() {
        let registry = Registry::default();
        registry.create(NewEntity::new("b", "note", "canvas")).unwrap();
        registry.create(NewEntity::new("a", "note", "canvas")).unwrap();
        registry.create(NewEntity::new("c", "transcript", "voice-session")).unwrap();

        let ids: Vec<String> = registry.snapshot().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let voice = registry.list_namespace("voice-session").unwrap();
        assert_eq!(voice.len(), 1);
        assert_eq!(voice[0].kind, "transcript");
    }

    #[test]
    fn test_concurrent_producers_converge_on_max_version() {
        let registry = Arc::new(Registry::default());
        counter(&registry, "cmp-1", 0, 0);

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for step in 0..50u64 {
                        let version = step * 4 + worker + 1;
                        let _ = registry.update(
                            "cmp-1",
                            &state(json!({ "value": version })),
                            UpdateMeta::new(version, "local"),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = registry.get("cmp-1").unwrap();
        assert_eq!(stored.version, 200);
        assert_eq!(stored.state, state(json!({"value": 200})));
    }
}
