//! Detail Snapshot Store.
//!
//! Holds the full server record for every row on a grid's current page so
//! detail views and "copy full record" never need a new fetch. A capture
//! builds the whole new map first and swaps it in as one assignment: no row
//! ever mixes fields from two fetches.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::grid::entity::EntityKind;
use crate::grid::identity::{IdentitySource, RowId, identify};

/// One row as last returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowSnapshot {
    pub id: RowId,
    pub source: IdentitySource,
    /// Position on the page at capture time.
    pub position: usize,
    pub record: Map<String, Value>,
}

impl RowSnapshot {
    /// Pretty-printed JSON of the full record.
    #[must_use]
    pub fn pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.record).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Outcome of re-applying expansion intent after a capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpansionRestore {
    /// Ids that are expanded after the refresh.
    pub kept: BTreeSet<RowId>,
    /// Ids that were expanded before but are absent, or only identified by fallback.
    pub dropped: Vec<RowId>,
}

/// Per-grid snapshot map, replaced wholesale on each capture.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    entity: EntityKind,
    rows: Vec<RowSnapshot>,
    index: BTreeMap<RowId, usize>,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            rows: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    /// Replace every snapshot with `records`, in page order.
    ///
    /// Rows that share an id with an earlier row on the same page get a
    /// position-qualified id and lose their stable status.
    pub fn capture(&mut self, records: Vec<Map<String, Value>>) -> &[RowSnapshot] {
        let mut rows = Vec::with_capacity(records.len());
        let mut index = BTreeMap::new();
        let mut fallbacks = 0usize;

        for (position, record) in records.into_iter().enumerate() {
            let identity = identify(self.entity, &record, position);
            let (id, source) = if index.contains_key(&identity.id) {
                warn!(entity = %self.entity, id = %identity.id, position, "duplicate row id on page");
                (
                    RowId::new(format!("{}@{position}", identity.id)),
                    IdentitySource::Positional,
                )
            } else {
                (identity.id, identity.source)
            };
            if !source.is_stable() {
                fallbacks += 1;
            }
            index.insert(id.clone(), position);
            rows.push(RowSnapshot {
                id,
                source,
                position,
                record,
            });
        }

        if fallbacks > 0 {
            warn!(
                entity = %self.entity,
                rows = fallbacks,
                "rows identified by fallback; their expansion will not survive refresh"
            );
        }

        self.rows = rows;
        self.index = index;
        &self.rows
    }

    /// Re-open each previously expanded id that is still present with a stable identity.
    #[must_use]
    pub fn restore_expansion(&self, expanded: &BTreeSet<RowId>) -> ExpansionRestore {
        let mut restore = ExpansionRestore::default();
        for id in expanded {
            match self.get(id) {
                Some(row) if row.source.is_stable() => {
                    restore.kept.insert(id.clone());
                }
                _ => restore.dropped.push(id.clone()),
            }
        }
        restore
    }

    #[must_use]
    pub fn get(&self, id: &RowId) -> Option<&RowSnapshot> {
        self.index.get(id).and_then(|&i| self.rows.get(i))
    }

    #[must_use]
    pub fn contains(&self, id: &RowId) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn rows(&self) -> &[RowSnapshot] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Full record as pretty JSON, if the row is on the current page.
    #[must_use]
    pub fn copy_record(&self, id: &RowId) -> Option<String> {
        self.get(id).map(RowSnapshot::pretty_json)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }
}
