//! The backing store for `Hash[K, V]` values.
//!
//! Open-chained buckets with a prime-sized bin table. Each entry records its
//! precomputed hash so resizing never rehashes key content. Keys are stored
//! boxed (owned copies, not heap references), which keeps lookup free of
//! heap borrows and lets deletion hand the key back.
//!
//! Integer keys hash to themselves; string keys go through the standard
//! siphash hasher. The key class is enforced at emit time, so a hash only
//! ever sees one key shape at runtime.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use crate::value::Value;

/// Bin counts used as the table grows. The next prime is chosen whenever
/// the load factor (entries per bin) passes [`MAX_LOAD`].
const PRIMES: &[usize] = &[
    53, 97, 193, 389, 769, 1543, 3079, 6151, 12289, 24593, 49157, 98317, 196_613, 393_241,
    786_433, 1_572_869,
];

const MAX_LOAD: usize = 5;

/// An owned hash key. Doubles and other classes are rejected as key types
/// by the emitter, so only these two shapes reach runtime.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HashKey {
    Integer(i64),
    Str(Box<str>),
}

impl HashKey {
    /// Integer keys use identity; strings use siphash. Identity hashing for
    /// integers keeps dense keys collision-free across any prime bin count.
    pub fn hash_value(&self) -> u64 {
        match self {
            Self::Integer(i) => *i as u64,
            Self::Str(s) => {
                let mut hasher = DefaultHasher::new();
                s.hash(&mut hasher);
                hasher.finish()
            }
        }
    }
}

#[derive(Debug)]
struct HashEntry {
    hash: u64,
    key: HashKey,
    value: Value,
    next: Option<Box<HashEntry>>,
}

/// A Lily hash value.
#[derive(Debug, Default)]
pub(crate) struct LilyHash {
    bins: Vec<Option<Box<HashEntry>>>,
    num_entries: usize,
}

impl LilyHash {
    pub fn new() -> Self {
        Self {
            bins: Vec::new(),
            num_entries: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    fn bin_for(&self, hash: u64) -> usize {
        (hash % self.bins.len() as u64) as usize
    }

    pub fn get(&self, key: &HashKey) -> Option<&Value> {
        if self.bins.is_empty() {
            return None;
        }
        let hash = key.hash_value();
        let mut entry = self.bins[self.bin_for(hash)].as_deref();
        while let Some(e) = entry {
            if e.hash == hash && e.key == *key {
                return Some(&e.value);
            }
            entry = e.next.as_deref();
        }
        None
    }

    pub fn get_mut(&mut self, key: &HashKey) -> Option<&mut Value> {
        if self.bins.is_empty() {
            return None;
        }
        let hash = key.hash_value();
        let bin = self.bin_for(hash);
        let mut entry = self.bins[bin].as_deref_mut();
        while let Some(e) = entry {
            if e.hash == hash && e.key == *key {
                return Some(&mut e.value);
            }
            entry = e.next.as_deref_mut();
        }
        None
    }

    /// Inserts or replaces. Returns the previous value for the key, which
    /// the caller must deref if it holds a heap reference.
    #[must_use]
    pub fn insert(&mut self, key: HashKey, value: Value) -> Option<Value> {
        if self.bins.is_empty() {
            self.bins.resize_with(PRIMES[0], || None);
        }
        let hash = key.hash_value();
        let bin = self.bin_for(hash);

        let mut entry = self.bins[bin].as_deref_mut();
        while let Some(e) = entry {
            if e.hash == hash && e.key == key {
                return Some(std::mem::replace(&mut e.value, value));
            }
            entry = e.next.as_deref_mut();
        }

        let next = self.bins[bin].take();
        self.bins[bin] = Some(Box::new(HashEntry {
            hash,
            key,
            value,
            next,
        }));
        self.num_entries += 1;

        if self.num_entries / self.bins.len() > MAX_LOAD {
            self.resize();
        }
        None
    }

    /// Removes a key, returning the boxed key and value if present.
    pub fn remove(&mut self, key: &HashKey) -> Option<(HashKey, Value)> {
        if self.bins.is_empty() {
            return None;
        }
        let hash = key.hash_value();
        let bin = self.bin_for(hash);

        let mut slot = &mut self.bins[bin];
        loop {
            match slot {
                None => return None,
                Some(e) if e.hash == hash && e.key == *key => {
                    let mut removed = slot.take().expect("entry checked above");
                    *slot = removed.next.take();
                    self.num_entries -= 1;
                    return Some((removed.key, removed.value));
                }
                Some(_) => {
                    slot = &mut slot.as_mut().expect("entry checked above").next;
                }
            }
        }
    }

    /// Moves every entry to a larger prime bin table. Precomputed hashes
    /// make this a relink, not a rehash.
    fn resize(&mut self) {
        let new_size = PRIMES
            .iter()
            .copied()
            .find(|&p| p > self.bins.len())
            .unwrap_or(self.bins.len() * 2 + 1);

        let old_bins = std::mem::take(&mut self.bins);
        self.bins.resize_with(new_size, || None);

        for bin in old_bins {
            let mut entry = bin;
            while let Some(mut e) = entry {
                entry = e.next.take();
                let new_bin = self.bin_for(e.hash);
                e.next = self.bins[new_bin].take();
                self.bins[new_bin] = Some(e);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HashKey, &Value)> {
        self.bins.iter().flat_map(|bin| {
            let mut out = Vec::new();
            let mut entry = bin.as_deref();
            while let Some(e) = entry {
                out.push((&e.key, &e.value));
                entry = e.next.as_deref();
            }
            out
        })
    }

    /// Drains every entry, yielding the values so the heap can deref them.
    pub fn drain_values(&mut self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.num_entries);
        for bin in &mut self.bins {
            let mut entry = bin.take();
            while let Some(mut e) = entry {
                entry = e.next.take();
                out.push(e.value);
            }
        }
        self.num_entries = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_across_resize() {
        let mut hash = LilyHash::new();
        // Push well past the first prime's load limit to force resizes.
        for i in 0..2000_i64 {
            let old = hash.insert(HashKey::Integer(i), Value::Integer(i * 10));
            assert!(old.is_none());
        }
        assert_eq!(hash.len(), 2000);
        for i in 0..2000_i64 {
            match hash.get(&HashKey::Integer(i)) {
                Some(Value::Integer(v)) => assert_eq!(*v, i * 10),
                other => panic!("missing key {i}: {other:?}"),
            }
        }
    }

    #[test]
    fn replace_returns_old_value() {
        let mut hash = LilyHash::new();
        assert!(hash.insert(HashKey::Str("a".into()), Value::Integer(1)).is_none());
        let old = hash.insert(HashKey::Str("a".into()), Value::Integer(2));
        assert!(matches!(old, Some(Value::Integer(1))));
        assert_eq!(hash.len(), 1);
    }

    #[test]
    fn remove_returns_boxed_key() {
        let mut hash = LilyHash::new();
        let _ = hash.insert(HashKey::Str("k".into()), Value::Integer(9));
        let (key, value) = hash.remove(&HashKey::Str("k".into())).expect("key present");
        assert_eq!(key, HashKey::Str("k".into()));
        assert!(matches!(value, Value::Integer(9)));
        assert!(hash.is_empty());
    }
}
