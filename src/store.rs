//! The concurrent key/value table.
//!
//! Entries are sharded into [`BUCKET_COUNT`] buckets, each guarded by its own
//! reader/writer lock. A second, global reader/writer lock — the mode gate —
//! keeps point operations (which take it shared) mutually consistent with
//! full-table work (which takes it exclusive): a full listing never has to
//! collect every bucket lock, it excludes point work wholesale instead.
//!
//! Multi-key batches lock the distinct buckets they touch in ascending index
//! order, which makes overlapping batches from different threads deadlock
//! free.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;

use crate::channel::PipeHandle;

/// Number of buckets the key space is sharded into.
pub const BUCKET_COUNT: usize = 26;

/// Set of notification sinks subscribed to one entry.
///
/// Subscriber counts are small in practice, so the set lives inline until it
/// outgrows two handles.
pub type SubscriberSet = SmallVec<[Arc<PipeHandle>; 2]>;

#[derive(Debug)]
struct Entry {
    key: String,
    value: String,
    subscribers: SubscriberSet,
}

/// One shard of the key space. Only reachable through a bucket lock.
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    entries: Vec<Entry>,
}

impl Bucket {
    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == key)
    }

    /// Replaces or inserts the pair. The subscriber set of an existing entry
    /// is untouched.
    pub(crate) fn put(&mut self, key: &str, value: &str) {
        match self.position(key) {
            Some(index) => self.entries[index].value = value.to_string(),
            None => self.entries.push(Entry {
                key: key.to_string(),
                value: value.to_string(),
                subscribers: SubscriberSet::new(),
            }),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.position(key).map(|index| self.entries[index].value.clone())
    }

    /// Current value and subscriber set of `key`, borrowed under the caller's
    /// bucket lock.
    pub(crate) fn value_and_subscribers(&self, key: &str) -> Option<(&str, &SubscriberSet)> {
        self.position(key)
            .map(|index| (self.entries[index].value.as_str(), &self.entries[index].subscribers))
    }

    /// Removes `key`, handing the subscriber set to the caller so the
    /// `DELETED` fan-out can happen after the bucket lock is released.
    pub(crate) fn remove(&mut self, key: &str) -> Option<SubscriberSet> {
        let index = self.position(key)?;
        Some(self.entries.swap_remove(index).subscribers)
    }

    /// Adds `sink` to the entry's subscriber set. Idempotent. Returns whether
    /// the entry existed.
    pub(crate) fn subscribe(&mut self, key: &str, sink: &Arc<PipeHandle>) -> bool {
        let Some(index) = self.position(key) else {
            return false;
        };
        let subscribers = &mut self.entries[index].subscribers;
        if !subscribers.iter().any(|s| s.id() == sink.id()) {
            subscribers.push(Arc::clone(sink));
        }
        true
    }

    /// Removes `sink_id` from the entry's subscriber set. Returns whether the
    /// entry existed.
    pub(crate) fn unsubscribe(&mut self, key: &str, sink_id: u64) -> bool {
        let Some(index) = self.position(key) else {
            return false;
        };
        self.entries[index].subscribers.retain(|s| s.id() != sink_id);
        true
    }

    fn drop_subscriber(&mut self, sink_id: u64) {
        for entry in &mut self.entries {
            entry.subscribers.retain(|s| s.id() != sink_id);
        }
    }

    fn clear_subscribers(&mut self) {
        for entry in &mut self.entries {
            entry.subscribers.clear();
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|entry| (entry.key.as_str(), entry.value.as_str()))
    }
}

/// The concurrent store: the buckets plus the mode gate.
#[derive(Debug)]
pub struct Store {
    buckets: [RwLock<Bucket>; BUCKET_COUNT],
    gate: RwLock<()>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Store {
        Store {
            buckets: std::array::from_fn(|_| RwLock::new(Bucket::default())),
            gate: RwLock::new(()),
        }
    }

    /// Maps a key onto its bucket. Pure: equal keys always land in the same
    /// bucket. ASCII letters fold to 26 buckets by initial; any other first
    /// byte wraps around.
    pub fn bucket_index(key: &str) -> usize {
        match key.as_bytes().first() {
            Some(b) if b.is_ascii_alphabetic() => (b.to_ascii_lowercase() - b'a') as usize,
            Some(b) => (*b as usize) % BUCKET_COUNT,
            None => 0,
        }
    }

    /// Distinct bucket indices for `keys`, in ascending order — the one total
    /// acquisition order every multi-key batch uses.
    pub(crate) fn lock_plan<'a, I>(keys: I) -> Vec<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut plan: Vec<usize> = keys.into_iter().map(Store::bucket_index).collect();
        plan.sort_unstable();
        plan.dedup();
        plan
    }

    pub(crate) fn gate_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read()
    }

    pub(crate) fn gate_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write()
    }

    /// Write-locks the buckets named by `plan`, in plan order.
    pub(crate) fn write_buckets(&self, plan: &[usize]) -> Vec<RwLockWriteGuard<'_, Bucket>> {
        plan.iter().map(|&index| self.buckets[index].write()).collect()
    }

    /// Read-locks the buckets named by `plan`, in plan order.
    pub(crate) fn read_buckets(&self, plan: &[usize]) -> Vec<RwLockReadGuard<'_, Bucket>> {
        plan.iter().map(|&index| self.buckets[index].read()).collect()
    }

    /// Replaces or inserts a single pair.
    pub fn put(&self, key: &str, value: &str) {
        let _gate = self.gate_shared();
        self.buckets[Store::bucket_index(key)].write().put(key, value);
    }

    /// Copy of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        let _gate = self.gate_shared();
        self.buckets[Store::bucket_index(key)].read().get(key)
    }

    /// Removes `key`. Returns the removed entry's subscriber set — ownership
    /// transfers to the caller so the `DELETED` fan-out can run outside the
    /// bucket lock — or `None` when the key was absent.
    pub fn remove(&self, key: &str) -> Option<SubscriberSet> {
        let _gate = self.gate_shared();
        self.buckets[Store::bucket_index(key)].write().remove(key)
    }

    /// Subscribes `sink` to `key`. Idempotent. Returns whether the key
    /// existed.
    pub fn subscribe(&self, key: &str, sink: &Arc<PipeHandle>) -> bool {
        let _gate = self.gate_shared();
        self.buckets[Store::bucket_index(key)].write().subscribe(key, sink)
    }

    /// Drops `sink_id`'s subscription to `key`. Returns whether the key
    /// existed.
    pub fn unsubscribe(&self, key: &str, sink_id: u64) -> bool {
        let _gate = self.gate_shared();
        self.buckets[Store::bucket_index(key)].write().unsubscribe(key, sink_id)
    }

    /// Runs `f` over every `(key, value)` pair under an exclusive table
    /// snapshot: no point operation overlaps the enumeration. `f` must not
    /// call back into the store.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &str),
    {
        let _gate = self.gate_exclusive();
        for bucket in &self.buckets {
            let bucket = bucket.read();
            for (key, value) in bucket.iter() {
                f(key, value);
            }
        }
    }

    /// Copies every `(key, value)` pair while holding all bucket locks in
    /// read mode. Writers are excluded for the duration, readers are not.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let guards: Vec<_> = self.buckets.iter().map(|bucket| bucket.read()).collect();
        let mut pairs = Vec::new();
        for bucket in &guards {
            for (key, value) in bucket.iter() {
                pairs.push((key.to_string(), value.to_string()));
            }
        }
        pairs
    }

    /// Sweeps `sink_id` out of every subscriber set. Called when a session
    /// ends.
    pub fn drop_subscriber_everywhere(&self, sink_id: u64) {
        let _gate = self.gate_exclusive();
        for bucket in &self.buckets {
            bucket.write().drop_subscriber(sink_id);
        }
    }

    /// Empties every subscriber set. Called on the administrative signal.
    pub fn clear_all_subscribers(&self) {
        let _gate = self.gate_exclusive();
        for bucket in &self.buckets {
            bucket.write().clear_subscribers();
        }
    }
}

/// Drops bucket guards in reverse acquisition order.
pub(crate) fn release_buckets<G>(mut guards: Vec<G>) {
    while guards.pop().is_some() {}
}
