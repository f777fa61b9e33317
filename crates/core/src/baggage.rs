//! Context-scoped metadata baggage.
//!
//! An ordered set of key/value pairs: insertion order is preserved,
//! keys are unique, and re-setting a key moves it to the end. Mutation is
//! serialized by a lock so concurrent readers always observe atomic
//! snapshots. Handles are cheap to clone and share the same bag.

use std::sync::{Arc, Mutex};

/// Ordered, last-writer-wins key/value bag.
#[derive(Debug, Clone, Default)]
pub struct Baggage {
    inner: Arc<Mutex<Vec<(String, String)>>>,
}

impl Baggage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key. An existing entry is removed and re-appended, so the
    /// most recently set keys come last in the snapshot.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let mut entries = self.inner.lock().unwrap();
        entries.retain(|(existing, _)| *existing != key);
        entries.push((key, value.into()));
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.inner.lock().unwrap();
        entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.clone())
    }

    /// Remove a key, returning its value if present.
    pub fn remove(&self, key: &str) -> Option<String> {
        let mut entries = self.inner.lock().unwrap();
        let index = entries.iter().position(|(existing, _)| existing == key)?;
        Some(entries.remove(index).1)
    }

    /// Atomic snapshot in insertion order.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
