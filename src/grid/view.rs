//! Display projection of snapshots into cell text.
//!
//! Rendering reads only snapshots and the lookup cache. [`relabel`] re-projects
//! label-dependent cells in place, which is how a lookup refresh reaches
//! already rendered rows without a re-fetch.

#![allow(missing_docs)]

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::grid::entity::{CellKind, ColumnSpec, EntityKind};
use crate::grid::identity::RowId;
use crate::grid::lookup::LookupCache;
use crate::grid::snapshot::SnapshotStore;

/// Characters of compact JSON shown in a preview cell.
pub const JSON_PREVIEW_CHARS: usize = 60;

/// One rendered row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedRow {
    pub id: RowId,
    pub cells: Vec<String>,
    pub expanded: bool,
    /// `(field, value)` pairs of the full record, present only when expanded.
    pub detail: Option<Vec<(String, String)>>,
}

/// Render every snapshot in page order.
#[must_use]
pub fn render_page(
    entity: EntityKind,
    snapshots: &SnapshotStore,
    expanded: &BTreeSet<RowId>,
    lookups: &LookupCache,
) -> Vec<RenderedRow> {
    let columns = entity.spec().columns;
    snapshots
        .rows()
        .iter()
        .map(|snap| {
            let is_expanded = expanded.contains(&snap.id);
            RenderedRow {
                id: snap.id.clone(),
                cells: columns
                    .iter()
                    .map(|c| cell_text(c, &snap.record, lookups))
                    .collect(),
                expanded: is_expanded,
                detail: is_expanded.then(|| detail_lines(&snap.record)),
            }
        })
        .collect()
}

/// Re-project label-dependent cells. Returns how many cells changed.
pub fn relabel(
    entity: EntityKind,
    rows: &mut [RenderedRow],
    snapshots: &SnapshotStore,
    lookups: &LookupCache,
) -> usize {
    let spec = entity.spec();
    let mut changed = 0;
    for row in rows {
        let Some(snap) = snapshots.get(&row.id) else {
            continue;
        };
        for (index, _) in spec.lookup_columns() {
            let (Some(column), Some(cell)) = (spec.column(index), row.cells.get_mut(index)) else {
                continue;
            };
            let text = cell_text(column, &snap.record, lookups);
            if *cell != text {
                *cell = text;
                changed += 1;
            }
        }
    }
    changed
}

/// Project one column of a record to display text.
#[must_use]
pub fn cell_text(column: &ColumnSpec, record: &Map<String, Value>, lookups: &LookupCache) -> String {
    let Some(value) = raw_value(column, record) else {
        return String::new();
    };
    match column.kind {
        CellKind::Plain => value_text(value),
        CellKind::Text { max_chars } => truncate(&value_text(value), max_chars),
        CellKind::Lookup { category } => lookups.resolve(category, &value_text(value)),
        CellKind::Json => json_preview(value),
    }
}

/// First present, non-null candidate field of the column.
#[must_use]
pub fn raw_value<'a>(column: &ColumnSpec, record: &'a Map<String, Value>) -> Option<&'a Value> {
    column
        .fields
        .iter()
        .filter_map(|f| record.get(*f))
        .find(|v| !v.is_null())
}

/// Plain text of a value. Arrays of scalars are comma-joined (tag lists).
#[must_use]
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) if items.iter().all(|v| !v.is_array() && !v.is_object()) => items
            .iter()
            .map(value_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Cut to `max_chars` characters and append `...` when anything was cut.
#[must_use]
pub fn truncate(text: &str, max_chars: usize) -> String {
    let mut chars = text.char_indices();
    match chars.nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Compact JSON cut to [`JSON_PREVIEW_CHARS`].
#[must_use]
pub fn json_preview(value: &Value) -> String {
    let compact = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate(&compact, JSON_PREVIEW_CHARS)
}

/// Field/value pairs of the full record for the expanded detail view.
#[must_use]
pub fn detail_lines(record: &Map<String, Value>) -> Vec<(String, String)> {
    record
        .iter()
        .map(|(k, v)| (k.clone(), value_text(v)))
        .collect()
}
