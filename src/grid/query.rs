//! Remote query adapter: request descriptors and response envelopes.
//!
//! A [`QueryRequest`] captures everything the server needs to produce one page
//! (page window, ordering, per-column filters, global search, extra form
//! parameters, cache-bust marker). [`parse_envelope`] turns a response body
//! into a [`QueryResponse`] or a protocol error. The actual network call lives
//! behind [`QueryTransport`] so the controller logic stays I/O free.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::errors::{CexError, Result};
use crate::grid::entity::{EntityKind, SortDirection};
use crate::grid::lookup::LookupTable;

/// Query-relevant grid state at the moment a fetch is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryState {
    pub entity: EntityKind,
    /// Zero-based page index.
    pub page: usize,
    pub page_size: usize,
    pub sort_column: usize,
    pub sort_direction: SortDirection,
    pub column_filters: BTreeMap<usize, String>,
    pub search: String,
    pub extra: BTreeMap<String, String>,
}

/// A filter bound to its remote field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnFilter {
    pub column: usize,
    pub field: &'static str,
    pub text: String,
}

/// Fully resolved request descriptor for one page fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRequest {
    pub entity: EntityKind,
    /// Monotonic per-grid request counter echoed back by the server.
    pub draw: u64,
    pub start: usize,
    pub length: usize,
    pub order_field: &'static str,
    pub order_dir: SortDirection,
    pub filters: Vec<ColumnFilter>,
    pub search: Option<String>,
    pub extra: BTreeMap<String, String>,
    /// Cache-defeat marker, present only when the caller asked to bust caches.
    pub cache_bust: Option<u64>,
}

impl QueryRequest {
    /// Build a descriptor from grid state.
    ///
    /// # Errors
    /// `InvalidQuery` when the page size is zero or a filter targets a column
    /// that does not exist or is not filterable.
    pub fn build(state: &QueryState, draw: u64, cache_bust: Option<u64>) -> Result<Self> {
        let spec = state.entity.spec();
        if state.page_size == 0 {
            return Err(CexError::InvalidQuery {
                entity: state.entity.key(),
                details: "page size must be > 0".to_string(),
            });
        }

        let mut filters = Vec::new();
        for (&column, text) in &state.column_filters {
            if text.is_empty() {
                continue;
            }
            let col = spec
                .column(column)
                .filter(|c| c.filterable)
                .ok_or_else(|| CexError::InvalidQuery {
                    entity: state.entity.key(),
                    details: format!("column {column} is not filterable"),
                })?;
            filters.push(ColumnFilter {
                column,
                field: col.remote_field(),
                text: text.clone(),
            });
        }

        let search = Some(state.search.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Self {
            entity: state.entity,
            draw,
            start: state.page.saturating_mul(state.page_size),
            length: state.page_size,
            order_field: spec.sort_field(state.sort_column),
            order_dir: state.sort_direction,
            filters,
            search,
            extra: state
                .extra
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cache_bust,
        })
    }

    /// Query-string parameters in a stable order.
    #[must_use]
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("draw".to_string(), self.draw.to_string()),
            ("start".to_string(), self.start.to_string()),
            ("length".to_string(), self.length.to_string()),
            ("order_column".to_string(), self.order_field.to_string()),
            ("order_dir".to_string(), self.order_dir.as_str().to_string()),
        ];
        for filter in &self.filters {
            params.push((
                format!("columns[{}][data]", filter.column),
                filter.field.to_string(),
            ));
            params.push((
                format!("columns[{}][search][value]", filter.column),
                filter.text.clone(),
            ));
        }
        if let Some(search) = &self.search {
            params.push(("search[value]".to_string(), search.clone()));
        }
        for (key, value) in &self.extra {
            params.push((key.clone(), value.clone()));
        }
        if let Some(nonce) = self.cache_bust {
            params.push(("_".to_string(), nonce.to_string()));
        }
        params
    }

    /// Zero-based page this request asks for.
    #[must_use]
    pub fn page(&self) -> usize {
        self.start / self.length.max(1)
    }
}

/// Parsed page of results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResponse {
    pub rows: Vec<Map<String, Value>>,
    /// Unfiltered record count.
    pub total: u64,
    /// Count after filters; equals `total` when the server omits it.
    pub filtered: u64,
    /// Echoed draw counter, if the server sent one.
    pub draw: Option<u64>,
    /// Entity-specific side-channel metadata.
    pub meta: Option<Value>,
}

/// Parse a response envelope `{data: [...], recordsTotal: n, ...}`.
///
/// # Errors
/// `Protocol` when the body is not JSON, `data` is missing or not an array of
/// objects, or `recordsTotal` is missing or not a non-negative integer.
pub fn parse_envelope(endpoint: &str, body: &[u8]) -> Result<QueryResponse> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| CexError::protocol(endpoint, format!("body is not JSON: {e}")))?;
    envelope_from_value(endpoint, value)
}

/// Same as [`parse_envelope`] for an already-decoded value.
pub fn envelope_from_value(endpoint: &str, value: Value) -> Result<QueryResponse> {
    let Value::Object(mut envelope) = value else {
        return Err(CexError::protocol(endpoint, "envelope is not an object"));
    };

    let rows = match envelope.remove("data") {
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(map),
                other => Err(CexError::protocol(
                    endpoint,
                    format!("data[{i}] is not an object: {}", type_name(&other)),
                )),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(CexError::protocol(
                endpoint,
                format!("`data` is {}, expected array", type_name(&other)),
            ));
        }
        None => return Err(CexError::protocol(endpoint, "missing `data`")),
    };

    let total = match envelope.get("recordsTotal") {
        Some(v) => v
            .as_u64()
            .ok_or_else(|| CexError::protocol(endpoint, "`recordsTotal` is not an integer"))?,
        None => return Err(CexError::protocol(endpoint, "missing `recordsTotal`")),
    };
    let filtered = envelope
        .get("recordsFiltered")
        .and_then(Value::as_u64)
        .unwrap_or(total);
    let draw = envelope.get("draw").and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    });
    let meta = envelope.remove("meta").filter(|m| !m.is_null());

    Ok(QueryResponse {
        rows,
        total,
        filtered,
        draw,
        meta,
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Network seam shared by the runtime's fetch workers.
///
/// Each method issues exactly one request and never retries.
pub trait QueryTransport: Send + Sync {
    /// Fetch one page for a grid.
    fn query(&self, request: &QueryRequest) -> Result<QueryResponse>;

    /// Fetch the full `{category: {id: label}}` lookup payload.
    fn lookups(&self) -> Result<LookupTable>;

    /// Fetch per-entity total counts for badges.
    fn counts(&self) -> Result<BTreeMap<EntityKind, u64>>;
}

/// Parse a counts payload `{entity_key: n}`. Unknown keys are ignored.
pub fn parse_counts(endpoint: &str, body: &[u8]) -> Result<BTreeMap<EntityKind, u64>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| CexError::protocol(endpoint, format!("body is not JSON: {e}")))?;
    let object = match value {
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Object(inner)) => inner,
            Some(other) => {
                map.insert("data".to_string(), other);
                map
            }
            None => map,
        },
        other => {
            return Err(CexError::protocol(
                endpoint,
                format!("counts payload is {}, expected object", type_name(&other)),
            ));
        }
    };

    let mut counts = BTreeMap::new();
    for (key, value) in object {
        let Some(kind) = EntityKind::from_key(&key) else {
            continue;
        };
        let count = value.as_u64().ok_or_else(|| {
            CexError::protocol(endpoint, format!("count for {key} is not an integer"))
        })?;
        counts.insert(kind, count);
    }
    Ok(counts)
}
