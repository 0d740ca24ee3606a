//! Sharded in-memory key/value store
//!
//! Keys are spread over a fixed number of partitions, each behind its own
//! read/write lock, so operations on different shards never contend.
//! Mutations take a `commit` closure that runs under the shard's write lock
//! after the precondition is checked and before the map changes. The engine
//! uses it to append the log record and update the recency index in the same
//! order the change becomes visible; if `commit` fails nothing is applied.

use crate::error::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

type Shard = HashMap<String, Bytes>;

/// Thread-safe sharded map of `String` keys to binary values
pub struct ShardedStore {
    shards: Vec<RwLock<Shard>>,
}

impl ShardedStore {
    /// Create a store with `shards` partitions (at least one)
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the shard owning `key`. Deterministic within one process.
    pub fn shard_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn shard(&self, key: &str) -> &RwLock<Shard> {
        &self.shards[self.shard_for(key)]
    }

    /// Insert a key that must not exist yet.
    /// Returns `Ok(None)` without calling `commit` if the key is present.
    pub fn insert_with<T, F>(&self, key: &str, value: Bytes, commit: F) -> Result<Option<T>>
    where
        F: FnOnce(&str, &Bytes) -> Result<T>,
    {
        let mut shard = self.shard(key).write();
        if shard.contains_key(key) {
            return Ok(None);
        }
        let committed = commit(key, &value)?;
        shard.insert(key.to_string(), value);
        Ok(Some(committed))
    }

    /// Insert or replace a key. `commit` learns whether the key existed.
    pub fn upsert_with<T, F>(&self, key: &str, value: Bytes, commit: F) -> Result<T>
    where
        F: FnOnce(&str, &Bytes, bool) -> Result<T>,
    {
        let mut shard = self.shard(key).write();
        let existed = shard.contains_key(key);
        let committed = commit(key, &value, existed)?;
        shard.insert(key.to_string(), value);
        Ok(committed)
    }

    /// Remove a key if present and if `commit` agrees.
    /// Returns whether the key was removed.
    pub fn remove_with<F>(&self, key: &str, commit: F) -> Result<bool>
    where
        F: FnOnce(&Bytes) -> Result<bool>,
    {
        let mut shard = self.shard(key).write();
        let proceed = match shard.get(key) {
            Some(value) => commit(value)?,
            None => return Ok(false),
        };
        if proceed {
            shard.remove(key);
        }
        Ok(proceed)
    }

    /// Inspect a key under its shard's read lock
    pub fn read_with<R>(&self, key: &str, f: impl FnOnce(Option<&Bytes>) -> R) -> R {
        let shard = self.shard(key).read();
        f(shard.get(key))
    }

    /// All live keys, sorted. Each shard is read independently, so the
    /// result is a union of per-shard snapshots.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| shard.read().keys().cloned().collect::<Vec<_>>())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Run `f` over a consistent view of every entry. All shard read locks
    /// are taken in index order and held until `f` returns.
    pub fn with_entries<R>(
        &self,
        f: impl FnOnce(&mut dyn Iterator<Item = (&String, &Bytes)>) -> R,
    ) -> R {
        let guards: Vec<_> = self.shards.iter().map(|shard| shard.read()).collect();
        let mut entries = guards.iter().flat_map(|guard| guard.iter());
        f(&mut entries)
    }

    /// Apply a logged insert or update without side effects
    pub fn restore(&self, key: String, value: Bytes) {
        let index = self.shard_for(&key);
        self.shards[index].write().insert(key, value);
    }

    /// Apply a logged delete without side effects
    pub fn discard(&self, key: &str) -> bool {
        self.shard(key).write().remove(key).is_some()
    }
}
