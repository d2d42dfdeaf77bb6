//! Column Filter Debouncer.
//!
//! Each key (a column index, or the grid's global search box) owns one pending
//! timer. A keystroke replaces that key's pending text and restarts only that
//! key's timer. Time is passed in by the caller, so tests drive it directly.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// What a debounced input edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterKey {
    Column(usize),
    Search,
}

#[derive(Debug, Clone)]
struct Pending {
    text: String,
    deadline: Instant,
}

/// Per-key trailing-edge debouncer.
#[derive(Debug, Clone)]
pub struct FilterDebouncer {
    delay: Duration,
    pending: BTreeMap<FilterKey, Pending>,
}

impl FilterDebouncer {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Record a keystroke, cancelling the key's previous timer.
    pub fn on_input(&mut self, key: FilterKey, text: impl Into<String>, now: Instant) {
        self.pending.insert(
            key,
            Pending {
                text: text.into(),
                deadline: now + self.delay,
            },
        );
    }

    /// Remove and return every input whose timer has fired, in key order.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(FilterKey, String)> {
        let due: Vec<FilterKey> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        due.into_iter()
            .filter_map(|k| self.pending.remove(&k).map(|p| (k, p.text)))
            .collect()
    }

    /// Earliest pending deadline, for the runtime's sleep calculation.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    #[must_use]
    pub fn pending_text(&self, key: FilterKey) -> Option<&str> {
        self.pending.get(&key).map(|p| p.text.as_str())
    }

    pub fn cancel(&mut self, key: FilterKey) -> bool {
        self.pending.remove(&key).is_some()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}
