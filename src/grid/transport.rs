//! Transports behind [`QueryTransport`].
//!
//! [`HttpTransport`] talks to the case server with a blocking reqwest client.
//! [`ScriptedTransport`] serves pages from an in-memory fixture, with optional
//! queued replies per grid, and records every request it receives. It backs
//! `cexp watch --replay` and the test suite.

#![allow(missing_docs)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::core::config::{Config, EndpointsConfig};
use crate::core::errors::{CexError, Result};
use crate::grid::entity::{EntityKind, SortDirection};
use crate::grid::lookup::LookupTable;
use crate::grid::query::{QueryRequest, QueryResponse, QueryTransport, envelope_from_value};

/// Resolve endpoint templates against a case id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointResolver {
    templates: EndpointsConfig,
    case_id: Option<u64>,
}

impl EndpointResolver {
    #[must_use]
    pub fn new(templates: EndpointsConfig, case_id: Option<u64>) -> Self {
        Self { templates, case_id }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.endpoints.clone(), config.server.case_id)
    }

    /// Path of a grid's query endpoint.
    pub fn grid(&self, entity: EntityKind) -> Result<String> {
        if entity.is_case_scoped() {
            let path = self.templates.grid.replace("{entity}", entity.key());
            self.with_case(&path, "grid")
        } else {
            self.with_case(&self.templates.feed, "feed")
        }
    }

    pub fn lookups(&self) -> Result<String> {
        self.with_case(&self.templates.lookups, "lookups")
    }

    pub fn counts(&self) -> Result<String> {
        self.with_case(&self.templates.counts, "counts")
    }

    fn with_case(&self, template: &str, name: &str) -> Result<String> {
        if !template.contains("{case}") {
            return Ok(template.to_string());
        }
        let case_id = self.case_id.ok_or_else(|| CexError::InvalidConfig {
            details: format!("endpoints.{name} needs server.case_id"),
        })?;
        Ok(template.replace("{case}", &case_id.to_string()))
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use tracing::{debug, info};

    use super::EndpointResolver;
    use crate::core::config::Config;
    use crate::core::errors::{CexError, Result};
    use crate::core::logging::fingerprint;
    use crate::grid::entity::EntityKind;
    use crate::grid::lookup::LookupTable;
    use crate::grid::query::{
        QueryRequest, QueryResponse, QueryTransport, parse_counts, parse_envelope,
    };

    /// Blocking HTTP transport (no async runtime required).
    pub struct HttpTransport {
        http: reqwest::blocking::Client,
        base_url: String,
        api_key: String,
        endpoints: EndpointResolver,
    }

    impl std::fmt::Debug for HttpTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("HttpTransport")
                .field("base_url", &self.base_url)
                .field("api_key", &fingerprint(&self.api_key))
                .finish_non_exhaustive()
        }
    }

    impl HttpTransport {
        /// Build a client from the `[server]` and `[endpoints]` sections.
        pub fn new(config: &Config) -> Result<Self> {
            let http = reqwest::blocking::Client::builder()
                .user_agent(format!("cexp/{}", env!("CARGO_PKG_VERSION")))
                .timeout(Duration::from_secs(config.server.timeout_secs))
                .danger_accept_invalid_certs(!config.server.verify_tls)
                .build()
                .map_err(|e| {
                    CexError::transport(&config.server.base_url, None, format!("client setup: {e}"))
                })?;
            info!(
                base_url = %config.server.base_url,
                verify_tls = config.server.verify_tls,
                api_key = %fingerprint(&config.server.api_key),
                "http transport ready"
            );
            Ok(Self {
                http,
                base_url: config.server.base_url.clone(),
                api_key: config.server.api_key.clone(),
                endpoints: EndpointResolver::from_config(config),
            })
        }

        fn get(&self, path: &str, params: &[(String, String)]) -> Result<Vec<u8>> {
            let url = format!("{}{path}", self.base_url);
            let mut request = self.http.get(&url).query(params);
            if !self.api_key.is_empty() {
                request = request.bearer_auth(&self.api_key);
            }
            let response = request
                .send()
                .map_err(|e| CexError::transport(path, None, e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                let snippet: String = body.chars().take(200).collect();
                return Err(CexError::transport(path, Some(status.as_u16()), snippet));
            }
            let bytes = response
                .bytes()
                .map_err(|e| CexError::transport(path, Some(status.as_u16()), e.to_string()))?;
            debug!(path, bytes = bytes.len(), "response received");
            Ok(bytes.to_vec())
        }
    }

    impl QueryTransport for HttpTransport {
        fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
            let path = self.endpoints.grid(request.entity)?;
            let body = self.get(&path, &request.to_params())?;
            parse_envelope(&path, &body)
        }

        fn lookups(&self) -> Result<LookupTable> {
            let path = self.endpoints.lookups()?;
            let body = self.get(&path, &[])?;
            LookupTable::parse(&path, &body)
        }

        fn counts(&self) -> Result<std::collections::BTreeMap<EntityKind, u64>> {
            let path = self.endpoints.counts()?;
            let body = self.get(&path, &[])?;
            parse_counts(&path, &body)
        }
    }
}

/// Fixture file format for [`ScriptedTransport::from_fixture_file`].
///
/// ```json
/// {
///   "grids": {"assets": [{"asset_id": 1, "asset_name": "web01"}]},
///   "lookups": {"asset_type": {"1": "Server"}},
///   "counts": {"assets": 1},
///   "meta": {"feed": {"ioc_matches": 0}}
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub grids: BTreeMap<String, Vec<Map<String, Value>>>,
    pub lookups: Option<Value>,
    pub counts: BTreeMap<String, u64>,
    pub meta: BTreeMap<String, Value>,
}

/// One queued reply for a grid, consumed before the dataset is consulted.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// Raw envelope returned verbatim (it may be malformed on purpose).
    Envelope(Value),
    /// Non-2xx status.
    Status(u16),
    /// Connection failure.
    Unreachable,
}

#[derive(Debug, Default)]
struct ScriptState {
    datasets: BTreeMap<EntityKind, Vec<Map<String, Value>>>,
    meta: BTreeMap<EntityKind, Value>,
    replies: BTreeMap<EntityKind, VecDeque<ScriptedReply>>,
    lookups: LookupTable,
    lookup_failures: u32,
    counts: BTreeMap<EntityKind, u64>,
    log: Vec<QueryRequest>,
    lookup_calls: u32,
    count_calls: u32,
}

/// In-memory transport that filters, sorts, and slices fixture rows.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON fixture (see [`Fixture`]).
    pub fn from_fixture_file(path: &Path) -> Result<Self> {
        let raw = fs::read(path).map_err(|e| CexError::io(path, e))?;
        let fixture: Fixture = serde_json::from_slice(&raw)?;
        Self::from_fixture(fixture)
    }

    pub fn from_fixture(fixture: Fixture) -> Result<Self> {
        let transport = Self::new();
        for (key, rows) in fixture.grids {
            transport.set_rows(EntityKind::parse(&key)?, rows);
        }
        for (key, meta) in fixture.meta {
            transport.set_meta(EntityKind::parse(&key)?, meta);
        }
        if let Some(lookups) = fixture.lookups {
            transport.set_lookups(LookupTable::from_value("fixture", lookups)?);
        }
        let mut counts = BTreeMap::new();
        for (key, count) in fixture.counts {
            counts.insert(EntityKind::parse(&key)?, count);
        }
        transport.state.lock().counts = counts;
        Ok(transport)
    }

    /// Replace a grid's dataset.
    pub fn set_rows(&self, entity: EntityKind, rows: Vec<Map<String, Value>>) {
        self.state.lock().datasets.insert(entity, rows);
    }

    /// Replace a grid's dataset from JSON objects. Non-objects are skipped.
    pub fn set_rows_json(&self, entity: EntityKind, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self.set_rows(entity, rows);
    }

    pub fn set_meta(&self, entity: EntityKind, meta: Value) {
        self.state.lock().meta.insert(entity, meta);
    }

    pub fn set_lookups(&self, table: LookupTable) {
        self.state.lock().lookups = table;
    }

    /// Make the next `n` lookup fetches fail.
    pub fn fail_lookups(&self, n: u32) {
        self.state.lock().lookup_failures = n;
    }

    pub fn set_counts(&self, counts: BTreeMap<EntityKind, u64>) {
        self.state.lock().counts = counts;
    }

    /// Queue a reply consumed by the next query for `entity`.
    pub fn push_reply(&self, entity: EntityKind, reply: ScriptedReply) {
        self.state
            .lock()
            .replies
            .entry(entity)
            .or_default()
            .push_back(reply);
    }

    /// Every query received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.state.lock().log.clone()
    }

    /// Queries received for one grid.
    #[must_use]
    pub fn requests_for(&self, entity: EntityKind) -> Vec<QueryRequest> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.entity == entity)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn lookup_calls(&self) -> u32 {
        self.state.lock().lookup_calls
    }

    #[must_use]
    pub fn count_calls(&self) -> u32 {
        self.state.lock().count_calls
    }
}

impl QueryTransport for ScriptedTransport {
    fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let endpoint = format!("scripted/{}", request.entity);
        let mut state = self.state.lock();
        state.log.push(request.clone());

        if let Some(reply) = state
            .replies
            .get_mut(&request.entity)
            .and_then(VecDeque::pop_front)
        {
            debug!(entity = %request.entity, ?reply, "scripted reply");
            return match reply {
                ScriptedReply::Envelope(value) => envelope_from_value(&endpoint, value),
                ScriptedReply::Status(status) => Err(CexError::transport(
                    endpoint,
                    Some(status),
                    "scripted status",
                )),
                ScriptedReply::Unreachable => {
                    Err(CexError::transport(endpoint, None, "connection refused"))
                }
            };
        }

        let rows = state
            .datasets
            .get(&request.entity)
            .cloned()
            .unwrap_or_default();
        let total = rows.len() as u64;
        let mut matching: Vec<_> = rows.into_iter().filter(|row| matches(row, request)).collect();
        let filtered = matching.len() as u64;
        matching.sort_by(|a, b| {
            let ord = compare(a.get(request.order_field), b.get(request.order_field));
            match request.order_dir {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        });
        let page: Vec<_> = matching
            .into_iter()
            .skip(request.start)
            .take(request.length)
            .collect();

        let mut envelope = json!({
            "draw": request.draw,
            "recordsTotal": total,
            "recordsFiltered": filtered,
            "data": page,
        });
        if let Some(meta) = state.meta.get(&request.entity)
            && let Value::Object(map) = &mut envelope
        {
            map.insert("meta".to_string(), meta.clone());
        }
        drop(state);
        envelope_from_value(&endpoint, envelope)
    }

    fn lookups(&self) -> Result<LookupTable> {
        let mut state = self.state.lock();
        state.lookup_calls += 1;
        if state.lookup_failures > 0 {
            state.lookup_failures -= 1;
            return Err(CexError::transport("scripted/lookups", Some(503), "scripted failure"));
        }
        Ok(state.lookups.clone())
    }

    fn counts(&self) -> Result<BTreeMap<EntityKind, u64>> {
        let mut state = self.state.lock();
        state.count_calls += 1;
        if state.counts.is_empty() {
            return Ok(state
                .datasets
                .iter()
                .map(|(kind, rows)| (*kind, rows.len() as u64))
                .collect());
        }
        Ok(state.counts.clone())
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn matches(row: &Map<String, Value>, request: &QueryRequest) -> bool {
    for filter in &request.filters {
        let hit = row
            .get(filter.field)
            .and_then(scalar_text)
            .is_some_and(|text| contains_ci(&text, &filter.text));
        if !hit {
            return false;
        }
    }
    if let Some(search) = &request.search {
        let hit = row
            .values()
            .filter_map(scalar_text)
            .any(|text| contains_ci(&text, search));
        if !hit {
            return false;
        }
    }
    for (key, wanted) in &request.extra {
        let keep = match key.as_str() {
            "date_from" => row
                .get("report_date")
                .and_then(scalar_text)
                .is_some_and(|d| d.as_str() >= wanted.as_str()),
            "date_to" => row
                .get("report_date")
                .and_then(scalar_text)
                .is_some_and(|d| d.get(..wanted.len()).unwrap_or(&d) <= wanted.as_str()),
            field => row
                .get(field)
                .and_then(scalar_text)
                .is_none_or(|v| v == *wanted),
        };
        if !keep {
            return false;
        }
    }
    true
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(x), Some(y)) => scalar_text(x).cmp(&scalar_text(y)),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
