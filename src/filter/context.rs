//! Per-entity decision context and its bounded map
//!
//! Each entity the pipeline has seen carries a small rolling state record
//! used by the frequency and significance rules. The map is sharded to keep
//! lock contention low under load and LRU-bounded so a chatty hub cannot
//! grow it without limit.

use crate::events::Timestamp;
use chrono::Duration;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;

const SHARD_COUNT: usize = 16;

/// Hash of a state value, compared by the significance check
pub fn state_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Rolling decision state for one entity
#[derive(Debug, Clone, Default)]
pub struct EntityContext {
    /// When this entity last produced a kept event
    pub last_kept_at: Option<Timestamp>,
    /// Hash of the state value at the last keep; None until first kept
    pub last_kept_state_hash: Option<u64>,
    /// Arrival timestamps inside the frequency window
    recent: VecDeque<Timestamp>,
}

impl EntityContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arrival, prune entries older than the window, and return
    /// the windowed count including this arrival
    pub fn record_event(&mut self, at: Timestamp, window: Duration) -> usize {
        self.recent.push_back(at);
        let cutoff = at - window;
        while let Some(front) = self.recent.front() {
            if *front < cutoff {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.len()
    }

    /// Update the keep markers after a KEEP decision
    ///
    /// The state hash is only replaced when the kept event carried a state
    /// value, so keeps without one do not erase significance history.
    pub fn mark_kept(&mut self, at: Timestamp, state_hash: Option<u64>) {
        self.last_kept_at = Some(at);
        if state_hash.is_some() {
            self.last_kept_state_hash = state_hash;
        }
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }
}

/// Sharded, LRU-bounded map from entity id to its decision context
///
/// Eviction discards an entity's frequency and significance state; the
/// entity is then treated as first-seen on its next event.
pub struct ContextMap {
    shards: Vec<Mutex<LruCache<String, EntityContext>>>,
}

impl ContextMap {
    /// Create a map bounded to roughly `capacity` entities in total
    pub fn new(capacity: usize) -> Self {
        Self::with_shard_count(capacity, SHARD_COUNT)
    }

    fn with_shard_count(capacity: usize, shard_count: usize) -> Self {
        let per_shard = (capacity / shard_count).max(1);
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(LruCache::new(
                    NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN),
                ))
            })
            .collect();
        Self { shards }
    }

    fn shard_for(&self, entity_id: &str) -> &Mutex<LruCache<String, EntityContext>> {
        let mut hasher = DefaultHasher::new();
        entity_id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    /// Run `f` against the entity's context, creating it on first sight
    ///
    /// Only the entity's shard is locked, and only for the duration of `f`.
    pub fn with_context<T>(&self, entity_id: &str, f: impl FnOnce(&mut EntityContext) -> T) -> T {
        let mut shard = self.shard_for(entity_id).lock().unwrap();
        let context = shard.get_or_insert_mut(entity_id.to_string(), EntityContext::new);
        f(context)
    }

    /// Number of entities currently tracked across all shards
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
