//! Row identity resolution.
//!
//! `identify` is pure: the same `(entity, record)` pair always yields the same
//! [`RowId`]. Identity is what lets expansion state survive a dataset swap, so
//! the resolver also reports *how* it found the key. Only
//! [`IdentitySource::Declared`] keys are stable across fetches.

#![allow(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::grid::entity::EntityKind;

/// Opaque row key, unique within one grid's current page.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RowId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Where a row's identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// One of the entity's declared identity fields.
    Declared { field: &'static str },
    /// The record's first key. Unstable if the server changes field order.
    FirstKey,
    /// Position within the page. Breaks continuity on re-sort or re-page.
    Positional,
}

impl IdentitySource {
    /// Whether expansion state keyed by this identity may be carried across a refresh.
    #[must_use]
    pub const fn is_stable(self) -> bool {
        matches!(self, Self::Declared { .. })
    }
}

/// A resolved identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: RowId,
    pub source: IdentitySource,
}

/// Resolve a row's identity: declared fields in order, then the first key, then position.
#[must_use]
pub fn identify(entity: EntityKind, record: &Map<String, Value>, position: usize) -> Identity {
    for &field in entity.spec().identity {
        if let Some(key) = record.get(field).and_then(key_text) {
            return Identity {
                id: RowId(key),
                source: IdentitySource::Declared { field },
            };
        }
    }

    if let Some(key) = record.values().next().and_then(key_text) {
        return Identity {
            id: RowId(key),
            source: IdentitySource::FirstKey,
        };
    }

    Identity {
        id: RowId(format!("#{position}")),
        source: IdentitySource::Positional,
    }
}

/// Stringify a scalar usable as a key. Null, empty strings, and containers are rejected.
fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
