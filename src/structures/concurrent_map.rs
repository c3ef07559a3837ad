//! Chained hash map with one coarse lock
//!
//! - Fixed number of buckets chosen at construction, never grown
//! - Each bucket is a singly linked chain of `(key, value)` nodes
//! - Every public operation, reads included, runs under the same lock
//!
//! Used as the shared aggregation state of the shuffle phase, where it
//! provides its own serialisation independent of the scheduler's gate.

use crate::core::error::{Error, Result};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};

/// Bucket count used by [`ConcurrentMap::new`]
pub const DEFAULT_BUCKET_COUNT: usize = 353;

struct Node<K, V> {
    key: K,
    value: V,
    next: Chain<K, V>,
}

type Chain<K, V> = Option<Box<Node<K, V>>>;

/// Bucket array plus entry count; only ever touched under the map's lock
struct Table<K, V> {
    buckets: Box<[Chain<K, V>]>,
    len: usize,
}

impl<K, V> Table<K, V> {
    fn with_buckets(count: usize) -> Self {
        Self {
            buckets: (0..count).map(|_| None).collect(),
            len: 0,
        }
    }

    fn append(&mut self, index: usize, key: K, value: V) {
        let mut slot = &mut self.buckets[index];
        while let Some(node) = slot {
            slot = &mut node.next;
        }
        *slot = Some(Box::new(Node { key, value, next: None }));
        self.len += 1;
    }

    fn find_mut<Q>(&mut self, index: usize, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut cursor = self.buckets[index].as_deref_mut();
        while let Some(node) = cursor {
            if <K as Borrow<Q>>::borrow(&node.key) == key {
                return Some(&mut node.value);
            }
            cursor = node.next.as_deref_mut();
        }
        None
    }

    fn find<Q>(&self, index: usize, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut cursor = self.buckets[index].as_deref();
        while let Some(node) = cursor {
            if <K as Borrow<Q>>::borrow(&node.key) == key {
                return Some(&node.value);
            }
            cursor = node.next.as_deref();
        }
        None
    }

    /// Visit every entry, bucket by bucket, in chain order
    fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for chain in self.buckets.iter() {
            let mut cursor = chain.as_deref();
            while let Some(node) = cursor {
                f(&node.key, &node.value);
                cursor = node.next.as_deref();
            }
        }
    }

    /// Unlink every node, moving entries out in bucket order
    fn drain(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.len);
        for chain in self.buckets.iter_mut() {
            let mut cursor = chain.take();
            while let Some(node) = cursor {
                let Node { key, value, next } = *node;
                out.push((key, value));
                cursor = next;
            }
        }
        self.len = 0;
        out
    }

    fn clear(&mut self) {
        for chain in self.buckets.iter_mut() {
            let mut cursor = chain.take();
            while let Some(mut node) = cursor {
                cursor = node.next.take();
            }
        }
        self.len = 0;
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // Unlink iteratively; the default recursive drop overflows on long chains
        self.clear();
    }
}

/// Fixed-bucket chained hash map serialised by one lock
pub struct ConcurrentMap<K, V, S = ahash::RandomState> {
    table: Mutex<Table<K, V>>,
    bucket_count: usize,
    hasher: S,
}

impl<K, V> ConcurrentMap<K, V, ahash::RandomState> {
    /// Create a map with [`DEFAULT_BUCKET_COUNT`] buckets
    pub fn new() -> Self {
        Self::from_parts(DEFAULT_BUCKET_COUNT, ahash::RandomState::new())
    }

    /// Create a map with `bucket_count` buckets.
    ///
    /// A zero bucket count is rejected here rather than on the first hash.
    pub fn with_buckets(bucket_count: usize) -> Result<Self> {
        Self::with_buckets_and_hasher(bucket_count, ahash::RandomState::new())
    }
}

impl<K, V> Default for ConcurrentMap<K, V, ahash::RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentMap<K, V, S> {
    /// Create a map with `bucket_count` buckets and a custom hasher
    pub fn with_buckets_and_hasher(bucket_count: usize, hasher: S) -> Result<Self> {
        if bucket_count == 0 {
            return Err(Error::config("ConcurrentMap needs at least one bucket"));
        }
        Ok(Self::from_parts(bucket_count, hasher))
    }

    fn from_parts(bucket_count: usize, hasher: S) -> Self {
        Self {
            table: Mutex::new(Table::with_buckets(bucket_count)),
            bucket_count,
            hasher,
        }
    }

    /// Number of buckets fixed at construction
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Number of entries, duplicates from [`add`](Self::add) included
    pub fn len(&self) -> usize {
        self.table.lock().len
    }

    /// True if the map holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, keeping the bucket count
    pub fn clear(&self) {
        self.table.lock().clear();
    }

    /// Removal is not supported
    pub fn remove<Q>(&self, _key: &Q) -> Result<V>
    where
        Q: ?Sized,
    {
        Err(Error::unsupported("ConcurrentMap::remove"))
    }

    /// Consume the map, returning every entry in bucket order
    pub fn into_entries(self) -> Vec<(K, V)> {
        self.table.into_inner().drain()
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    #[inline]
    fn index_of<Q>(&self, key: &Q) -> usize
    where
        Q: Hash + ?Sized,
    {
        (self.hasher.hash_one(key) % self.bucket_count as u64) as usize
    }

    /// Append an entry without checking for an existing key
    pub fn add(&self, key: K, value: V) {
        let index = self.index_of(&key);
        self.table.lock().append(index, key, value);
    }

    /// Insert `make_if_absent()` if `key` is missing, otherwise apply
    /// `update_if_present` to the stored value; both under one lock hold.
    pub fn add_or_update<M, U>(&self, key: K, make_if_absent: M, update_if_present: U)
    where
        M: FnOnce() -> V,
        U: FnOnce(&mut V),
    {
        let index = self.index_of(&key);
        let mut table = self.table.lock();
        match table.find_mut(index, &key) {
            Some(value) => update_if_present(value),
            None => table.append(index, key, make_if_absent()),
        }
    }

    /// Overwrite the first entry for `key`, or append one
    pub fn set(&self, key: K, value: V) {
        let index = self.index_of(&key);
        let mut table = self.table.lock();
        match table.find_mut(index, &key) {
            Some(slot) => *slot = value,
            None => table.append(index, key, value),
        }
    }

    /// True if an entry for `key` exists
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = self.index_of(key);
        self.table.lock().find(index, key).is_some()
    }

    /// Run `f` against the value for `key` while the lock is held
    pub fn read<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = self.index_of(key);
        self.table.lock().find(index, key).map(f)
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    /// Clone of the value for `key`, if present
    pub fn try_get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.read(key, V::clone)
    }

    /// Clone of the value for `key`; `Error::KeyNotFound` if absent
    pub fn get<Q>(&self, key: &Q) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + fmt::Debug + ?Sized,
    {
        self.try_get(key)
            .ok_or_else(|| Error::key_not_found(format!("{:?}", key)))
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Clone,
    V: Clone,
{
    /// Point-in-time copy of every entry, taken under the lock
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let table = self.table.lock();
        let mut out = Vec::with_capacity(table.len);
        table.for_each(|k, v| out.push((k.clone(), v.clone())));
        out
    }

    /// Point-in-time copy of every key
    pub fn keys(&self) -> Vec<K> {
        let table = self.table.lock();
        let mut out = Vec::with_capacity(table.len);
        table.for_each(|k, _| out.push(k.clone()));
        out
    }

    /// Point-in-time copy of every value
    pub fn values(&self) -> Vec<V> {
        let table = self.table.lock();
        let mut out = Vec::with_capacity(table.len);
        table.for_each(|_, v| out.push(v.clone()));
        out
    }
}

impl<K, V, S> IntoIterator for ConcurrentMap<K, V, S> {
    type Item = (K, V);
    type IntoIter = std::vec::IntoIter<(K, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.into_entries().into_iter()
    }
}

impl<K, V, S> fmt::Debug for ConcurrentMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMap")
            .field("bucket_count", &self.bucket_count)
            .field("len", &self.len())
            .finish()
    }
}
