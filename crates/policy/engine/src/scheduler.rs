//! Debounced per-user update broadcasts
//!
//! Every data-affecting action marks blocks dirty for the users that can
//! see them. Instead of pushing one notification per block, dirty uuids
//! accumulate per user and fire as a single coalesced set after the
//! debounce window. The fired set is ancestor-reduced: only the topmost
//! dirty blocks survive, since a client re-rendering a container refreshes
//! its subtree anyway.

use crate::components::PolicyComponents;
use policy_types::{BlockId, PolicyId, PolicyUser};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// (policy, composite user id): timers never coalesce across users or
/// policies
type PendingKey = (String, String);

struct PendingEntry {
    user: PolicyUser,
    policy_id: PolicyId,
    blocks: HashSet<BlockId>,
    /// Ties the entry to the timer that armed it. A timer outliving a
    /// flushed entry must not fire the set armed after it.
    generation: u64,
}

/// Per-user debounce timers and their pending dirty sets
pub struct UpdateScheduler {
    window: Duration,
    pending: Mutex<HashMap<PendingKey, PendingEntry>>,
    generation: AtomicU64,
}

impl UpdateScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Mark a block dirty for one user. The first mark within a window
    /// arms the timer; later marks only extend the pending set.
    pub fn schedule(
        &self,
        components: &Arc<PolicyComponents>,
        policy_id: &PolicyId,
        user: &PolicyUser,
        block_id: &BlockId,
    ) {
        let key = (policy_id.to_string(), user.id());
        let armed = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    occupied.get_mut().blocks.insert(block_id.clone());
                    None
                }
                Entry::Vacant(vacant) => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let mut blocks = HashSet::new();
                    blocks.insert(block_id.clone());
                    vacant.insert(PendingEntry {
                        user: user.clone(),
                        policy_id: policy_id.clone(),
                        blocks,
                        generation,
                    });
                    Some(generation)
                }
            }
        };
        if let Some(generation) = armed {
            let components = Arc::clone(components);
            let window = self.window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                components
                    .scheduler()
                    .expire(&components, &key, generation)
                    .await;
            });
        }
    }

    /// Timer path: fires the pending entry only when it is still the one
    /// that armed this timer. An entry armed after a flush keeps its full
    /// window.
    async fn expire(&self, components: &Arc<PolicyComponents>, key: &PendingKey, generation: u64) {
        let entry = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get(key) {
                Some(entry) if entry.generation == generation => pending.remove(key),
                _ => None,
            }
        };
        self.broadcast(components, entry).await;
    }

    /// Fire one pending entry now: remove it, ancestor-reduce the set and
    /// hand it to the sink. A no-op when the entry was already fired or
    /// cancelled.
    pub async fn fire(&self, components: &Arc<PolicyComponents>, key: &PendingKey) {
        let entry = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(key)
        };
        self.broadcast(components, entry).await;
    }

    async fn broadcast(&self, components: &Arc<PolicyComponents>, entry: Option<PendingEntry>) {
        let Some(entry) = entry else { return };

        let reduced = components.reduce_update_set(&entry.policy_id, &entry.blocks);
        if reduced.is_empty() {
            return;
        }
        tracing::debug!(
            policy_id = %entry.policy_id,
            user = %entry.user.id(),
            dirty = entry.blocks.len(),
            reduced = reduced.len(),
            "firing block update"
        );
        components
            .sink()
            .block_update(&entry.policy_id, &entry.user, reduced)
            .await;
    }

    /// Flush one user's pending set immediately, bypassing the window.
    /// The armed timer task finds nothing left and does nothing.
    pub async fn flush_user(
        &self,
        components: &Arc<PolicyComponents>,
        policy_id: &PolicyId,
        user: &PolicyUser,
    ) {
        let key = (policy_id.to_string(), user.id());
        self.fire(components, &key).await;
    }

    /// Flush every pending set immediately
    pub async fn flush_all(&self, components: &Arc<PolicyComponents>) {
        let keys: Vec<PendingKey> = {
            let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.keys().cloned().collect()
        };
        for key in keys {
            self.fire(components, &key).await;
        }
    }

    /// Drop every pending set for a policy. Armed timers become no-ops.
    pub fn cancel_policy(&self, policy_id: &PolicyId) {
        let key = policy_id.to_string();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|(policy, _), _| *policy != key);
    }

    /// Number of users with a pending set (test hook)
    pub fn pending_users(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
