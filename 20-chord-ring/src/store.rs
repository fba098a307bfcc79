//! In-memory object store held by each ring member.
//!
//! The store has one slot per ring position. Which slots a node actually
//! fills is decided by ring ownership: objects migrate between nodes as the
//! ring changes shape.

use std::collections::BTreeMap;
use std::fmt;

use crate::message::FieldError;
use crate::ring::{RingKey, RING_SIZE};

/// Longest value the protocol carries, in bytes.
pub const MAX_VALUE_LEN: usize = 16;

/// A short printable string stored under a ring key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value(String);

impl Value {
    pub fn new(raw: &str) -> Result<Self, FieldError> {
        if raw.len() > MAX_VALUE_LEN {
            return Err(FieldError::ValueTooLong(raw.len()));
        }
        if !raw.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
            return Err(FieldError::ValueNotPrintable);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed table of [`RING_SIZE`] optional values.
///
/// Only the dispatcher touches it, so there is no interior locking.
#[derive(Debug, Default)]
pub struct ObjectStore {
    slots: [Option<Value>; RING_SIZE as usize],
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: RingKey) -> Option<&Value> {
        self.slots[usize::from(key.get())].as_ref()
    }

    /// Stores `value` under `key`; `None` deletes the mapping.
    ///
    /// Returns the previous value.
    pub fn set(&mut self, key: RingKey, value: Option<Value>) -> Option<Value> {
        std::mem::replace(&mut self.slots[usize::from(key.get())], value)
    }

    pub fn take(&mut self, key: RingKey) -> Option<Value> {
        self.slots[usize::from(key.get())].take()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every entry matching `predicate`.
    pub fn drain_where<F>(&mut self, mut predicate: F) -> Vec<(RingKey, Value)>
    where
        F: FnMut(RingKey) -> bool,
    {
        RingKey::all()
            .filter(|key| predicate(*key))
            .filter_map(|key| self.take(key).map(|value| (key, value)))
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<u8, String> {
        RingKey::all()
            .filter_map(|key| self.get(key).map(|value| (key.get(), value.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(value: u8) -> RingKey {
        RingKey::new(value).expect("valid key")
    }

    fn value(raw: &str) -> Value {
        Value::new(raw).expect("valid value")
    }

    #[test]
    fn set_then_get_returns_value() {
        let mut store = ObjectStore::new();
        assert!(store.set(key(7), Some(value("seven"))).is_none());
        assert_eq!(store.get(key(7)), Some(&value("seven")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn setting_none_deletes() {
        let mut store = ObjectStore::new();
        store.set(key(3), Some(value("x")));
        let previous = store.set(key(3), None);
        assert_eq!(previous, Some(value("x")));
        assert!(store.get(key(3)).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn drain_moves_matching_entries_out() {
        let mut store = ObjectStore::new();
        for k in [1, 8, 20, 31] {
            store.set(key(k), Some(value(&format!("v{k}"))));
        }
        let moved = store.drain_where(|k| k.get() >= 8 && k.get() < 25);
        assert_eq!(
            moved,
            vec![(key(8), value("v8")), (key(20), value("v20"))]
        );
        assert_eq!(store.snapshot().into_keys().collect::<Vec<_>>(), vec![1, 31]);
    }

    #[test]
    fn value_limits() {
        assert!(Value::new("sixteen-bytes-ok").is_ok());
        assert_eq!(
            Value::new("seventeen-bytes!!"),
            Err(FieldError::ValueTooLong(17))
        );
        assert_eq!(Value::new("tab\there"), Err(FieldError::ValueNotPrintable));
    }
}
