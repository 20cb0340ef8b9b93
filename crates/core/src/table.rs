//! Open-addressed hash table (spec.md §4.1).
//!
//! Linear probing, power-of-two capacity, 0.75 load factor. `nil` is the
//! empty-key sentinel; a tombstone is an empty key paired with a non-nil
//! value, and still counts toward the load factor so growth isn't starved
//! by repeated insert/delete churn. Grounded on
//! `original_source/clox/table.c`; Rust's `Vec<Entry>` replaces the manual
//! `ALLOCATE`/`FREE_ARRAY` calls but the probing algorithm is unchanged.

use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: Value::Nil,
            value: Value::Nil,
        }
    }

    fn is_empty_key(&self) -> bool {
        self.key.is_nil()
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_nil() && !self.value.is_nil()
    }
}

pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe for `key`, returning the slot it occupies (a real entry) or
    /// the slot it should occupy (the first tombstone seen, else the first
    /// true-empty slot). Callers distinguish "found" from "insertion
    /// point" by checking `is_empty_key` on the result.
    fn find_entry(entries: &[Entry], cap: usize, key: Value) -> usize {
        let mut index = (key.hash() as usize) & (cap - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.is_empty_key() {
                if entry.is_tombstone() {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                } else {
                    return first_tombstone.unwrap_or(index);
                }
            } else if entry.key.equals(&key) {
                return index;
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn grow(&mut self, new_cap: usize) {
        let mut new_entries = vec![Entry::empty(); new_cap];
        self.count = 0;
        for entry in &self.entries {
            if entry.is_empty_key() {
                continue;
            }
            let idx = Self::find_entry(&new_entries, new_cap, entry.key);
            new_entries[idx] = *entry;
            self.count += 1;
        }
        self.entries = new_entries;
    }

    /// Insert or overwrite `key` -> `value`. Returns `true` iff `key` was
    /// not already present (a brand new entry, not a tombstone reuse of an
    /// already-counted slot).
    pub fn install(&mut self, key: Value, value: Value) -> bool {
        debug_assert!(!key.is_nil(), "nil is the empty-key sentinel");

        if (self.count + 1) as f64 > self.capacity() as f64 * TABLE_MAX_LOAD {
            let new_cap = (self.capacity() * 2).max(8);
            self.grow(new_cap);
        }

        let idx = Self::find_entry(&self.entries, self.capacity(), key);
        let entry = &mut self.entries[idx];
        let is_new = entry.is_empty_key();
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new
    }

    pub fn lookup(&self, key: Value) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key);
        let entry = &self.entries[idx];
        if entry.is_empty_key() {
            None
        } else {
            Some(entry.value)
        }
    }

    pub fn delete(&mut self, key: Value) -> bool {
        if self.count == 0 {
            return false;
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key);
        let entry = &mut self.entries[idx];
        if entry.is_empty_key() {
            return false;
        }
        // Tombstone: empty key, non-nil value so it keeps probing past it.
        entry.key = Value::Nil;
        entry.value = Value::Bool(true);
        true
    }

    /// Copy every live entry from `self` into `dest`, used for method
    /// inheritance (`INHERIT` copies a superclass's method table into the
    /// subclass) and nowhere else.
    pub fn add_all(&self, dest: &mut Table) {
        for entry in &self.entries {
            if !entry.is_empty_key() {
                dest.install(entry.key, entry.value);
            }
        }
    }

    /// Intern-table lookup: find a string entry matching `bytes`/`hash`
    /// exactly, comparing by hash then by bytes rather than by the general
    /// `Value` equality (which would require the candidate key to already
    /// be an interned `ObjRef`, the very thing we're trying to find).
    pub fn find_string(&self, bytes: &[u8], hash: u32) -> Option<crate::object::ObjRef> {
        if self.count == 0 {
            return None;
        }
        let cap = self.capacity();
        let mut index = (hash as usize) & (cap - 1);
        loop {
            let entry = &self.entries[index];
            if entry.is_empty_key() {
                if !entry.is_tombstone() {
                    return None;
                }
            } else if let Value::Obj(o) = entry.key {
                if let Some(s) = o.as_string() {
                    if s.hash == hash && s.as_bytes() == bytes {
                        return Some(o);
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.is_empty_key())
            .map(|e| (e.key, e.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    #[test]
    fn install_lookup_delete_roundtrip() {
        let mut heap = Heap::new();
        let key = Value::obj(heap.intern_string(b"x"));
        let mut table = Table::new();
        assert!(table.install(key, Value::Number(1.0)));
        assert!(!table.install(key, Value::Number(2.0)));
        assert_eq!(table.lookup(key).unwrap().as_number(), Some(2.0));
        assert!(table.delete(key));
        assert!(table.lookup(key).is_none());
        // deleting again finds nothing, since the tombstone has no key
        assert!(!table.delete(key));
    }

    #[test]
    fn tombstones_still_count_toward_load_for_growth() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..20 {
            let key = Value::obj(heap.intern_string(format!("k{i}").as_bytes()));
            table.install(key, Value::Number(i as f64));
            table.delete(key);
        }
        // No entries remain live, but inserting now must still work
        // correctly (the implementation must not have lost its invariants
        // in the presence of many tombstones).
        let k = Value::obj(heap.intern_string(b"final"));
        table.install(k, Value::Number(99.0));
        assert_eq!(table.lookup(k).unwrap().as_number(), Some(99.0));
    }

    #[test]
    fn find_string_matches_by_hash_then_bytes() {
        let mut heap = Heap::new();
        let s = heap.intern_string(b"hello");
        let mut table = Table::new();
        table.install(Value::obj(s), Value::Bool(true));
        let hash = crate::object::fnv1a_hash(b"hello");
        assert!(table.find_string(b"hello", hash).is_some());
        assert!(table.find_string(b"goodbye", hash).is_none());
    }
}
