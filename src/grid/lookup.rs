//! Lookup Cache: `{category -> {id -> label}}`, shared by every grid.
//!
//! The table is replaced wholesale on each successful refresh and never merged.
//! Resolution never fails: an unknown category or id renders as the raw id.
//! A failed refresh leaves the previous table in place.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::errors::{CexError, Result};
use crate::grid::query::QueryTransport;

/// Parsed lookup payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LookupTable(BTreeMap<String, BTreeMap<String, String>>);

impl LookupTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one label. Mostly used by tests and the scripted transport.
    pub fn insert(
        &mut self,
        category: impl Into<String>,
        id: impl Into<String>,
        label: impl Into<String>,
    ) {
        self.0
            .entry(category.into())
            .or_default()
            .insert(id.into(), label.into());
    }

    #[must_use]
    pub fn get(&self, category: &str, id: &str) -> Option<&str> {
        self.0.get(category)?.get(id).map(String::as_str)
    }

    #[must_use]
    pub fn categories(&self) -> usize {
        self.0.len()
    }

    /// Total number of labels across all categories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, String>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parse `{category: {id: label}}`, optionally wrapped in `{"data": ...}`.
    ///
    /// Labels may be strings or numbers. A category whose value is not an
    /// object, or a label that is not a scalar, is a protocol error.
    pub fn parse(endpoint: &str, body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| CexError::protocol(endpoint, format!("body is not JSON: {e}")))?;
        Self::from_value(endpoint, value)
    }

    /// Same as [`Self::parse`] for an already-decoded value.
    pub fn from_value(endpoint: &str, value: Value) -> Result<Self> {
        let Value::Object(mut root) = value else {
            return Err(CexError::protocol(endpoint, "lookup payload is not an object"));
        };
        if root.len() == 1
            && matches!(root.get("data"), Some(Value::Object(_)))
            && let Some(Value::Object(inner)) = root.remove("data")
        {
            root = inner;
        }

        let mut table = Self::new();
        for (category, entries) in root {
            let Value::Object(entries) = entries else {
                return Err(CexError::protocol(
                    endpoint,
                    format!("lookup category {category:?} is not an object"),
                ));
            };
            let labels = table.0.entry(category.clone()).or_default();
            for (id, label) in entries {
                let label = match label {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => {
                        return Err(CexError::protocol(
                            endpoint,
                            format!("label for {category}/{id} is not a scalar"),
                        ));
                    }
                };
                labels.insert(id, label);
            }
        }
        Ok(table)
    }
}

type Listener = Box<dyn FnMut(u64) + Send>;

/// Process-wide label cache with change notification.
#[derive(Default)]
pub struct LookupCache {
    table: LookupTable,
    /// Bumped once per successful refresh; 0 means never populated.
    generation: u64,
    listeners: Vec<Listener>,
    last_error: Option<String>,
}

impl fmt::Debug for LookupCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupCache")
            .field("generation", &self.generation)
            .field("labels", &self.table.len())
            .field("listeners", &self.listeners.len())
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl LookupCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Label for `id` in `category`, or `id` itself when unresolved.
    #[must_use]
    pub fn resolve(&self, category: &str, id: &str) -> String {
        self.table
            .get(category, id)
            .map_or_else(|| id.to_string(), str::to_string)
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn is_populated(&self) -> bool {
        self.generation > 0
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub const fn table(&self) -> &LookupTable {
        &self.table
    }

    /// Register a callback run once per successful refresh with the new generation.
    pub fn on_change<F>(&mut self, callback: F)
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.listeners.push(Box::new(callback));
    }

    /// Replace the table and notify listeners.
    pub fn replace(&mut self, table: LookupTable) -> u64 {
        self.table = table;
        self.generation += 1;
        self.last_error = None;
        debug!(
            generation = self.generation,
            categories = self.table.categories(),
            labels = self.table.len(),
            "lookup cache replaced"
        );
        let generation = self.generation;
        for listener in &mut self.listeners {
            listener(generation);
        }
        generation
    }

    /// Apply the outcome of a lookup fetch. On failure the previous table stays.
    pub fn complete_refresh(&mut self, outcome: Result<LookupTable>) -> Result<u64> {
        match outcome {
            Ok(table) => Ok(self.replace(table)),
            Err(err) => {
                warn!(code = err.code(), error = %err, "lookup refresh failed; keeping previous labels");
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Fetch through `transport` and apply the result.
    pub fn refresh_with(&mut self, transport: &dyn QueryTransport) -> Result<u64> {
        self.complete_refresh(transport.lookups())
    }

    /// Drop listeners and labels. Used on app teardown.
    pub fn clear(&mut self) {
        self.listeners.clear();
        self.table = LookupTable::new();
        self.generation = 0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use serde_json::json;

    use super::*;

    fn table(pairs: &[(&str, &str, &str)]) -> LookupTable {
        let mut t = LookupTable::new();
        for (c, i, l) in pairs {
            t.insert(*c, *i, *l);
        }
        t
    }

    #[test]
    fn unresolved_ids_render_raw() {
        let cache = LookupCache::new();
        assert_eq!(cache.resolve("case_status", "4"), "4");
        assert!(!cache.is_populated());
    }

    #[test]
    fn successful_refresh_replaces_and_notifies() {
        let mut cache = LookupCache::new();
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        cache.on_change(move |generation| sink.store(generation, Ordering::SeqCst));

        let generation = cache
            .complete_refresh(Ok(table(&[("case_status", "4", "Open")])))
            .unwrap();
        assert_eq!(generation, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(cache.resolve("case_status", "4"), "Open");

        // Wholesale replacement: labels absent from the new payload disappear.
        cache
            .complete_refresh(Ok(table(&[("tlp", "1", "TLP:CLEAR")])))
            .unwrap();
        assert_eq!(cache.resolve("case_status", "4"), "4");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_refresh_keeps_previous_labels() {
        let mut cache = LookupCache::new();
        cache
            .complete_refresh(Ok(table(&[("case_status", "4", "Open")])))
            .unwrap();
        let calls = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&calls);
        cache.on_change(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let err = cache
            .complete_refresh(Err(CexError::transport("/api/lookups", Some(502), "bad gateway")))
            .unwrap_err();
        assert_eq!(err.code(), "CEX-2001");
        assert_eq!(cache.resolve("case_status", "4"), "Open");
        assert_eq!(cache.generation(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(cache.last_error().is_some());
    }

    #[test]
    fn parse_accepts_plain_and_wrapped_payloads() {
        let plain = json!({"task_status": {"1": "To do", "2": "Done"}, "tlp": {"3": 3}});
        let t = LookupTable::from_value("/l", plain).unwrap();
        assert_eq!(t.get("task_status", "2"), Some("Done"));
        assert_eq!(t.get("tlp", "3"), Some("3"));
        assert_eq!(t.len(), 3);

        let wrapped = json!({"data": {"ioc_type": {"7": "ip-dst"}}});
        let t = LookupTable::from_value("/l", wrapped).unwrap();
        assert_eq!(t.get("ioc_type", "7"), Some("ip-dst"));
    }

    #[test]
    fn parse_rejects_malformed_payloads() {
        assert!(LookupTable::from_value("/l", json!([1])).is_err());
        assert!(LookupTable::from_value("/l", json!({"tlp": [1]})).is_err());
        assert!(LookupTable::from_value("/l", json!({"tlp": {"1": {"x": 1}}})).is_err());
        assert!(LookupTable::parse("/l", b"not json").is_err());
    }
}
