//! Sorted array map keyed by `i64` with tombstone deletion and lazy compaction
//!
//! Keys are kept in ascending order and found with a binary search. Removal
//! does not shift the arrays; it marks the slot as a tombstone, and a single
//! compaction pass runs only when the structure must grow or a size-dependent
//! query is made. This keeps deletes O(1) while preserving the sorted-key
//! guarantee for every read that observes indices.

use std::fmt;

/// Outcome of [`SortedArrayMap::put`].
///
/// Callers that care whether a write created a new entry or overwrote an
/// existing one branch on the variant; the carried index is the position of
/// the entry at the time of the write and must not be cached across
/// operations that may compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// A new entry was created at this index.
    Inserted(usize),
    /// An existing live entry at this index had its value replaced.
    Updated(usize),
}

impl PutResult {
    /// Index of the written entry, regardless of variant.
    pub fn index(self) -> usize {
        match self {
            PutResult::Inserted(i) | PutResult::Updated(i) => i,
        }
    }

    /// True if the write created a new entry.
    pub fn is_inserted(self) -> bool {
        matches!(self, PutResult::Inserted(_))
    }
}

/// Round a byte count up to the allocator-friendly `(1 << i) - 12` step.
fn ideal_byte_size(need: usize) -> usize {
    for i in 4..32 {
        if need <= (1usize << i) - 12 {
            return (1usize << i) - 12;
        }
    }
    need
}

/// Ideal slot count for an array of 8-byte elements.
fn ideal_slot_count(need: usize) -> usize {
    ideal_byte_size(need * 8) / 8
}

/// Array-backed map from `i64` keys to values.
///
/// `keys` and `values` always have the same length; a `None` value marks a
/// tombstoned slot whose key is retained so the key array stays sorted.
/// The `dirty` flag records whether any tombstones exist.
pub struct SortedArrayMap<V> {
    keys: Vec<i64>,
    values: Vec<Option<V>>,
    dirty: bool,
}

impl<V> SortedArrayMap<V> {
    /// Creates an empty map with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(10)
    }

    /// Creates an empty map that can hold `capacity` entries without
    /// reallocating. A capacity of 0 allocates nothing.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            0
        } else {
            ideal_slot_count(capacity)
        };
        Self {
            keys: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            dirty: false,
        }
    }

    /// Returns a reference to the value for `key`, or `None` if the key is
    /// absent or tombstoned. Never compacts.
    pub fn get(&self, key: i64) -> Option<&V> {
        match self.keys.binary_search(&key) {
            Ok(i) => self.values[i].as_ref(),
            Err(_) => None,
        }
    }

    /// Mutable counterpart of [`get`](Self::get). Never compacts.
    pub fn get_mut(&mut self, key: i64) -> Option<&mut V> {
        match self.keys.binary_search(&key) {
            Ok(i) => self.values[i].as_mut(),
            Err(_) => None,
        }
    }

    /// Stores `value` under `key`.
    ///
    /// A live entry with the same key is overwritten in place and reported
    /// as [`PutResult::Updated`]. Writing over a tombstone — whether the
    /// exact-key slot or the slot at the insertion point — revives it and
    /// reports [`PutResult::Inserted`], since the prior entry was already
    /// logically removed. A genuinely new key compacts if the arrays are
    /// full and dirty, grows them to the next ideal size if still full,
    /// then shift-inserts.
    pub fn put(&mut self, key: i64, value: V) -> PutResult {
        match self.keys.binary_search(&key) {
            Ok(i) => {
                let revived = self.values[i].is_none();
                self.values[i] = Some(value);
                if revived {
                    PutResult::Inserted(i)
                } else {
                    PutResult::Updated(i)
                }
            }
            Err(mut i) => {
                if i < self.keys.len() && self.values[i].is_none() {
                    // Reuse the tombstoned slot at the insertion point. Its
                    // dead key sits between the neighbors, so overwriting it
                    // keeps the key array sorted.
                    self.keys[i] = key;
                    self.values[i] = Some(value);
                    return PutResult::Inserted(i);
                }

                if self.dirty && self.keys.len() == self.keys.capacity() {
                    self.compact();
                    // Indices may have changed.
                    i = match self.keys.binary_search(&key) {
                        Ok(_) => unreachable!("compaction does not add keys"),
                        Err(i) => i,
                    };
                }

                if self.keys.len() == self.keys.capacity() {
                    self.grow(self.keys.len() + 1);
                }

                self.keys.insert(i, key);
                self.values.insert(i, Some(value));
                PutResult::Inserted(i)
            }
        }
    }

    /// Stores `value` under `key`, optimized for keys greater than every
    /// existing key. Falls back to [`put`](Self::put) otherwise.
    pub fn append(&mut self, key: i64, value: V) -> PutResult {
        if let Some(&last) = self.keys.last() {
            if key <= last {
                return self.put(key, value);
            }
        }

        if self.dirty && self.keys.len() == self.keys.capacity() {
            self.compact();
        }
        if self.keys.len() == self.keys.capacity() {
            self.grow(self.keys.len() + 1);
        }

        self.keys.push(key);
        self.values.push(Some(value));
        PutResult::Inserted(self.keys.len() - 1)
    }

    /// Removes the mapping for `key`, returning the removed value.
    pub fn remove(&mut self, key: i64) -> Option<V> {
        match self.keys.binary_search(&key) {
            Ok(i) => self.remove_at(i),
            Err(_) => None,
        }
    }

    /// Tombstones the slot at `index`, returning the removed value or `None`
    /// if the slot was already tombstoned. Does not shift or compact.
    ///
    /// `index` addresses the raw slot array as of the last compaction;
    /// panics if out of range.
    pub fn remove_at(&mut self, index: usize) -> Option<V> {
        let removed = self.values[index].take();
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Replaces the value for `key` only if it is currently mapped,
    /// returning the previous value.
    pub fn replace(&mut self, key: i64, value: V) -> Option<V> {
        match self.index_of_key(key) {
            Some(i) => self.values[i].replace(value),
            None => None,
        }
    }

    /// Number of live entries. Compacts first if dirty.
    pub fn size(&mut self) -> usize {
        if self.dirty {
            self.compact();
        }
        self.keys.len()
    }

    /// True if [`size`](Self::size) is 0.
    pub fn is_empty(&mut self) -> bool {
        self.size() == 0
    }

    /// Key of the `index`th entry in ascending order. Compacts first;
    /// panics if `index` is out of range.
    pub fn key_at(&mut self, index: usize) -> i64 {
        if self.dirty {
            self.compact();
        }
        self.keys[index]
    }

    /// Value of the `index`th entry in ascending key order. Compacts first;
    /// panics if `index` is out of range.
    pub fn value_at(&mut self, index: usize) -> &V {
        if self.dirty {
            self.compact();
        }
        match self.values[index].as_ref() {
            Some(value) => value,
            None => unreachable!("no tombstones remain after compaction"),
        }
    }

    /// Mutable counterpart of [`value_at`](Self::value_at).
    pub fn value_at_mut(&mut self, index: usize) -> &mut V {
        if self.dirty {
            self.compact();
        }
        match self.values[index].as_mut() {
            Some(value) => value,
            None => unreachable!("no tombstones remain after compaction"),
        }
    }

    /// Replaces the value of the `index`th entry. Compacts first; panics if
    /// `index` is out of range.
    pub fn set_value_at(&mut self, index: usize, value: V) {
        if self.dirty {
            self.compact();
        }
        self.values[index] = Some(value);
    }

    /// Index of `key` in compacted ascending order, or `None` if unmapped.
    pub fn index_of_key(&mut self, key: i64) -> Option<usize> {
        if self.dirty {
            self.compact();
        }
        self.keys.binary_search(&key).ok()
    }

    /// True if `key` is mapped to a live value.
    pub fn contains_key(&mut self, key: i64) -> bool {
        self.index_of_key(key).is_some()
    }

    /// Drops every mapping and resets the dirty flag.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.values.clear();
        self.dirty = false;
    }

    /// Lazy ascending iterator over keys. Compacts first.
    pub fn keys(&mut self) -> impl Iterator<Item = i64> + '_ {
        if self.dirty {
            self.compact();
        }
        self.keys.iter().copied()
    }

    /// Lazy iterator over values in ascending key order. Compacts first.
    pub fn values(&mut self) -> impl Iterator<Item = &V> {
        if self.dirty {
            self.compact();
        }
        self.values.iter().filter_map(|v| v.as_ref())
    }

    /// Lazy iterator over `(key, value)` pairs in ascending key order.
    /// Compacts first.
    pub fn iter(&mut self) -> impl Iterator<Item = (i64, &V)> {
        if self.dirty {
            self.compact();
        }
        self.keys
            .iter()
            .copied()
            .zip(self.values.iter())
            .filter_map(|(k, v)| v.as_ref().map(|v| (k, v)))
    }

    /// Returns a cursor for iteration that supports removing the element
    /// most recently yielded by [`Cursor::next`].
    pub fn cursor(&mut self) -> Cursor<'_, V> {
        Cursor {
            map: self,
            index: 0,
            can_remove: false,
        }
    }

    /// Single left-to-right pass copying live slots down over tombstones.
    /// Tombstone removal never reorders survivors.
    fn compact(&mut self) {
        let mut out = 0;
        for i in 0..self.keys.len() {
            if self.values[i].is_some() {
                if i != out {
                    self.keys[out] = self.keys[i];
                    self.values[out] = self.values[i].take();
                }
                out += 1;
            }
        }
        self.keys.truncate(out);
        self.values.truncate(out);
        self.dirty = false;
    }

    /// Grows the backing arrays to at least the ideal size for `need`
    /// slots. Never shrinks.
    fn grow(&mut self, need: usize) {
        let target = ideal_slot_count(need);
        if target > self.keys.capacity() {
            self.keys.reserve_exact(target - self.keys.len());
            self.values.reserve_exact(target - self.values.len());
        }
    }
}

impl<V: PartialEq> SortedArrayMap<V> {
    /// Index of the first entry holding `value`, by linear scan after
    /// compaction. Which entry wins when duplicates exist is unspecified.
    pub fn index_of_value(&mut self, value: &V) -> Option<usize> {
        if self.dirty {
            self.compact();
        }
        self.values
            .iter()
            .position(|v| v.as_ref() == Some(value))
    }

    /// True if any key maps to `value`.
    pub fn contains_value(&mut self, value: &V) -> bool {
        self.index_of_value(value).is_some()
    }

    /// Replaces the value for `key` only if it is currently mapped to
    /// `expected`. Returns true if the value was replaced.
    pub fn replace_if(&mut self, key: i64, expected: &V, value: V) -> bool {
        match self.index_of_key(key) {
            Some(i) if self.values[i].as_ref() == Some(expected) => {
                self.values[i] = Some(value);
                true
            }
            _ => false,
        }
    }
}

impl<V> Default for SortedArrayMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Clone for SortedArrayMap<V> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            values: self.values.clone(),
            dirty: self.dirty,
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for SortedArrayMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.keys
                    .iter()
                    .zip(self.values.iter())
                    .filter_map(|(k, v)| v.as_ref().map(|v| (k, v))),
            )
            .finish()
    }
}

/// Iteration cursor over a [`SortedArrayMap`] in ascending key order.
///
/// Unlike a plain iterator, the cursor supports removing the entry most
/// recently yielded by [`next`](Self::next). The sequence is finite and not
/// restartable. Each advance may trigger compaction, so positions observed
/// through the cursor are only meaningful for the current step.
pub struct Cursor<'a, V> {
    map: &'a mut SortedArrayMap<V>,
    index: usize,
    can_remove: bool,
}

impl<'a, V> Cursor<'a, V> {
    /// Advances to the next entry, returning its key and a reference to its
    /// value, or `None` when exhausted.
    pub fn next(&mut self) -> Option<(i64, &V)> {
        if self.index >= self.map.size() {
            self.can_remove = false;
            return None;
        }
        let i = self.index;
        self.index += 1;
        self.can_remove = true;
        let key = self.map.keys[i];
        self.map.values[i].as_ref().map(|v| (key, v))
    }

    /// Removes the entry most recently yielded by [`next`](Self::next).
    ///
    /// Panics if called before the first advance or twice for the same
    /// entry (caller contract).
    pub fn remove_current(&mut self) -> Option<V> {
        assert!(
            self.can_remove,
            "next() must be called before remove_current()"
        );
        self.can_remove = false;
        self.index -= 1;
        self.map.remove_at(self.index)
    }
}
