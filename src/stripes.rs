//! Stable key-to-slot hashing.
//!
//! One helper shared by queue partitioning, lock striping and persistence
//! bucketing. FxHasher is deterministic across processes, which keeps bucket
//! file names stable between restarts.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

pub fn key_hash<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Slot index for `key` in a table of `slots` entries.
pub fn slot_for<K: Hash + ?Sized>(key: &K, slots: usize) -> usize {
    debug_assert!(slots > 0);
    (key_hash(key) % slots as u64) as usize
}
