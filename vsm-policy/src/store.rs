//! Signal state store
//!
//! Maps full dotted signal names to their current typed value with
//! change-detection. Dots in names are syntactic only; lookup is always by
//! the full string. Signals are created on first observation and retained
//! for the life of the process.

use crate::types::{Millis, Value};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct SignalEntry {
    value: Value,
    last_update_ms: Millis,
}

/// The current state of every observed signal
#[derive(Debug, Default)]
pub struct SignalStore {
    signals: HashMap<String, SignalEntry>,
}

impl SignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update a signal and report whether its value actually changed.
    ///
    /// The timestamp is recorded either way; the return value is what the
    /// driver uses to decide whether condition nodes need re-evaluation.
    pub fn set(&mut self, name: &str, value: Value, now_ms: Millis) -> bool {
        match self.signals.get_mut(name) {
            Some(entry) => {
                let changed = entry.value != value;
                entry.value = value;
                entry.last_update_ms = now_ms;
                changed
            }
            None => {
                self.signals.insert(
                    name.to_string(),
                    SignalEntry {
                        value,
                        last_update_ms: now_ms,
                    },
                );
                true
            }
        }
    }

    /// Current value of a signal, or `None` if it has never been observed
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.signals.get(name).map(|e| &e.value)
    }

    /// Logical time of the last update to a signal
    pub fn last_update(&self, name: &str) -> Option<Millis> {
        self.signals.get(name).map(|e| e.last_update_ms)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// All signals in name order, for state dumps
    pub fn sorted(&self) -> Vec<(&str, &Value)> {
        let mut entries: Vec<(&str, &Value)> = self
            .signals
            .iter()
            .map(|(name, entry)| (name.as_str(), &entry.value))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}
