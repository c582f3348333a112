//! Feedback-loop suppression
//!
//! Peers on a broadcast topic can end up re-announcing the same confirmed
//! value at each other forever. The `LoopBreaker` remembers what happened
//! recently so the registry can tell a genuine edit from a retransmission
//! storm.
//!
//! It tracks three independent windowed sets:
//!
//! - **recent**: signature -> last seen, expires after the duplicate window.
//! - **completed**: signature -> completion time, expires after the
//!   completed window.
//! - **cooldowns**: entity id -> cooldown start, expires after the cooldown
//!   window.
//!
//! Expired entries are purged on every call. There is no background sweep,
//! so memory is bounded by activity rather than by a timer.

mod signature;

pub use signature::{ContentHashSignature, SignatureStrategy, VersionSignature};

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Window lengths for the three tracked sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopBreakerWindows {
    /// How long an operation counts as "just happened".
    pub duplicate: Duration,
    /// How long a finished operation is remembered.
    pub completed: Duration,
    /// How long an entity stays suppressed once flagged.
    pub cooldown: Duration,
}

impl Default for LoopBreakerWindows {
    fn default() -> Self {
        Self {
            duplicate: Duration::from_secs(2),
            completed: Duration::from_secs(30),
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Sizes of the tracked sets after purging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopBreakerStats {
    pub recent: usize,
    pub completed: usize,
    pub cooldowns: usize,
}

#[derive(Default)]
struct Windows {
    recent: HashMap<String, Instant>,
    completed: HashMap<String, Instant>,
    cooldowns: HashMap<String, Instant>,
}

impl Windows {
    fn purge(&mut self, now: Instant, windows: &LoopBreakerWindows) {
        self.recent
            .retain(|_, seen| now.duration_since(*seen) < windows.duplicate);
        self.completed
            .retain(|_, done| now.duration_since(*done) < windows.completed);
        self.cooldowns
            .retain(|_, start| now.duration_since(*start) < windows.cooldown);
    }
}

/// Tracks recent, completed and cooling-down operations.
pub struct LoopBreaker {
    windows: LoopBreakerWindows,
    sets: Mutex<Windows>,
}

impl LoopBreaker {
    pub fn new(windows: LoopBreakerWindows) -> Self {
        Self {
            windows,
            sets: Mutex::new(Windows::default()),
        }
    }

    pub fn windows(&self) -> LoopBreakerWindows {
        self.windows
    }

    /// Lock the sets and drop everything that has expired.
    fn purged(&self) -> (MutexGuard<'_, Windows>, Instant) {
        // The sets only hold timestamps, so a poisoned guard is still usable.
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        sets.purge(now, &self.windows);
        (sets, now)
    }

    /// Whether `signature` happened within the duplicate window or finished
    /// within the completed window. Always records the call as recent.
    pub fn is_duplicate(&self, signature: &str) -> bool {
        let (mut sets, now) = self.purged();
        let seen = sets.recent.contains_key(signature) || sets.completed.contains_key(signature);
        sets.recent.insert(signature.to_string(), now);
        if seen {
            log::debug!("Duplicate operation signature {}", signature);
        }
        seen
    }

    /// Record `signature` as recent without asking whether it repeats.
    pub fn register(&self, signature: &str) {
        let (mut sets, now) = self.purged();
        sets.recent.insert(signature.to_string(), now);
    }

    /// Record that the operation named by `signature` has finished.
    pub fn mark_completed(&self, signature: &str) {
        let (mut sets, now) = self.purged();
        sets.completed.insert(signature.to_string(), now);
    }

    /// Whether `signature` finished within the completed window.
    pub fn is_completed(&self, signature: &str) -> bool {
        let (sets, _) = self.purged();
        sets.completed.contains_key(signature)
    }

    /// Start (or restart) the cooldown for an entity.
    pub fn register_cooldown(&self, id: &str) {
        let (mut sets, now) = self.purged();
        sets.cooldowns.insert(id.to_string(), now);
    }

    pub fn is_in_cooldown(&self, id: &str) -> bool {
        let (sets, _) = self.purged();
        sets.cooldowns.contains_key(id)
    }

    /// Time left on an entity's cooldown, zero when it is not cooling down.
    pub fn remaining_cooldown(&self, id: &str) -> Duration {
        let (sets, now) = self.purged();
        sets.cooldowns
            .get(id)
            .map(|start| self.windows.cooldown.saturating_sub(now.duration_since(*start)))
            .unwrap_or(Duration::ZERO)
    }

    /// Whole seconds left on an entity's cooldown, rounded up.
    pub fn remaining_cooldown_secs(&self, id: &str) -> u64 {
        let remaining = self.remaining_cooldown(id);
        let secs = remaining.as_secs();
        if remaining.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    pub fn clear_cooldown(&self, id: &str) {
        let (mut sets, _) = self.purged();
        sets.cooldowns.remove(id);
    }

    pub fn stats(&self) -> LoopBreakerStats {
        let (sets, _) = self.purged();
        LoopBreakerStats {
            recent: sets.recent.len(),
            completed: sets.completed.len(),
            cooldowns: sets.cooldowns.len(),
        }
    }

    pub fn clear(&self) {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        *sets = Windows::default();
    }
}

impl Default for LoopBreaker {
    fn default() -> Self {
        Self::new(LoopBreakerWindows::default())
    }
}
