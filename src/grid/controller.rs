//! Grid Controller: one state machine per grid.
//!
//! ```text
//! Unmounted --mount--> Mounting --ok--> Mounted --refresh/reload--> Refreshing
//!     ^                   |  err                                      |  ok | err
//!     +-------------------+                      Mounted <------------+-----+
//! ```
//!
//! The controller never performs I/O. Operations that need data return a
//! [`FetchRequest`]; the runtime executes it and hands the outcome back to
//! [`GridController::complete`]. At most one fetch per grid is in flight:
//! `refresh` while a fetch is outstanding collapses into it, and sort, filter,
//! or page changes made meanwhile are folded into one queued reload.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::errors::{CexError, Result};
use crate::grid::debounce::{FilterDebouncer, FilterKey};
use crate::grid::entity::{EntityKind, SortDirection};
use crate::grid::identity::RowId;
use crate::grid::lookup::LookupCache;
use crate::grid::query::{QueryRequest, QueryResponse, QueryState};
use crate::grid::snapshot::SnapshotStore;
use crate::grid::view::{self, RenderedRow};

/// Lifecycle phase of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GridPhase {
    Unmounted,
    /// Initial fetch in flight.
    Mounting,
    Mounted,
    /// A refresh or reload fetch is in flight; previous rows stay visible.
    Refreshing,
}

impl GridPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unmounted => "unmounted",
            Self::Mounting => "mounting",
            Self::Mounted => "mounted",
            Self::Refreshing => "refreshing",
        }
    }

    /// Mounted in the coordinator's sense: has rows on screen.
    #[must_use]
    pub const fn is_mounted(self) -> bool {
        matches!(self, Self::Mounted | Self::Refreshing)
    }
}

/// Why a fetch was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPurpose {
    Mount,
    Refresh,
    /// Sort, filter, page, or extra-parameter change.
    Reload,
    /// Follow-up after an out-of-range page came back empty.
    Clamp,
}

/// Identifies one issued fetch. A completion is applied only if its ticket
/// matches the controller's in-flight ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchTicket {
    pub entity: EntityKind,
    pub draw: u64,
    /// Mount generation; bumped on unmount so late completions are discarded.
    pub epoch: u64,
    pub purpose: FetchPurpose,
    /// Zero-based page requested.
    pub page: usize,
    /// Request carried a cache-defeat marker; a clamp follow-up keeps it.
    pub bust_cache: bool,
}

/// A fetch the runtime must execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub ticket: FetchTicket,
    pub query: QueryRequest,
}

/// User-facing grid state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridState {
    pub entity: EntityKind,
    pub page: usize,
    pub page_size: usize,
    pub sort_column: usize,
    pub sort_direction: SortDirection,
    /// Applied (post-debounce) column filters.
    pub column_filters: BTreeMap<usize, String>,
    /// Applied global search text.
    pub search: String,
    /// Extra form parameters (feed report type and date range).
    pub extra: BTreeMap<String, String>,
    pub expanded_ids: BTreeSet<RowId>,
}

impl GridState {
    #[must_use]
    pub fn with_defaults(entity: EntityKind, page_size: usize) -> Self {
        let spec = entity.spec();
        Self {
            entity,
            page: 0,
            page_size,
            sort_column: spec.default_sort_column,
            sort_direction: spec.default_sort_direction,
            column_filters: BTreeMap::new(),
            search: String::new(),
            extra: BTreeMap::new(),
            expanded_ids: BTreeSet::new(),
        }
    }

    fn query_state(&self) -> QueryState {
        QueryState {
            entity: self.entity,
            page: self.page,
            page_size: self.page_size,
            sort_column: self.sort_column,
            sort_direction: self.sort_direction,
            column_filters: self.column_filters.clone(),
            search: self.search.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// What a completion did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Rows replaced.
    Applied {
        rows: usize,
        /// Expanded ids that did not survive the swap.
        dropped_expansions: usize,
    },
    /// Fetch failed; previous rows (if any) stay visible.
    Degraded { code: &'static str, error: String },
    /// Out-of-range page came back empty; page clamped and re-requested.
    Clamped { page: usize },
    /// Ticket did not match (unmounted meanwhile, or superseded).
    Discarded,
}

/// Result of [`GridController::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub outcome: CompletionOutcome,
    /// Next fetch to run (queued reload or clamp follow-up).
    pub follow_up: Option<FetchRequest>,
}

/// Serializable status snapshot for the CLI and status line.
#[derive(Debug, Clone, Serialize)]
pub struct GridSummary {
    pub entity: EntityKind,
    pub phase: GridPhase,
    pub page: usize,
    pub page_count: u64,
    pub rows: usize,
    pub total: u64,
    pub filtered: u64,
    pub expanded: usize,
    pub last_error: Option<String>,
    pub last_loaded_at: Option<DateTime<Utc>>,
    pub collapsed_refreshes: u64,
}

/// State machine for one grid.
#[derive(Debug)]
pub struct GridController {
    state: GridState,
    phase: GridPhase,
    snapshots: SnapshotStore,
    rows: Vec<RenderedRow>,
    total: u64,
    filtered: u64,
    meta: Option<Value>,
    debouncer: FilterDebouncer,
    next_draw: u64,
    epoch: u64,
    in_flight: Option<FetchTicket>,
    /// Expansion intent captured when the in-flight fetch was issued.
    captured_expansion: Option<BTreeSet<RowId>>,
    pending_reload: bool,
    last_error: Option<String>,
    last_loaded_at: Option<DateTime<Utc>>,
    collapsed_refreshes: u64,
}

impl GridController {
    #[must_use]
    pub fn new(entity: EntityKind, page_size: usize, debouncer: FilterDebouncer) -> Self {
        Self {
            state: GridState::with_defaults(entity, page_size),
            phase: GridPhase::Unmounted,
            snapshots: SnapshotStore::new(entity),
            rows: Vec::new(),
            total: 0,
            filtered: 0,
            meta: None,
            debouncer,
            next_draw: 0,
            epoch: 0,
            in_flight: None,
            captured_expansion: None,
            pending_reload: false,
            last_error: None,
            last_loaded_at: None,
            collapsed_refreshes: 0,
        }
    }

    #[must_use]
    pub const fn entity(&self) -> EntityKind {
        self.state.entity
    }

    #[must_use]
    pub const fn phase(&self) -> GridPhase {
        self.phase
    }

    #[must_use]
    pub const fn state(&self) -> &GridState {
        &self.state
    }

    #[must_use]
    pub fn rows(&self) -> &[RenderedRow] {
        &self.rows
    }

    #[must_use]
    pub const fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub const fn filtered(&self) -> u64 {
        self.filtered
    }

    #[must_use]
    pub const fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub const fn in_flight(&self) -> Option<FetchTicket> {
        self.in_flight
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    #[must_use]
    pub const fn collapsed_refreshes(&self) -> u64 {
        self.collapsed_refreshes
    }

    #[must_use]
    pub const fn has_queued_reload(&self) -> bool {
        self.pending_reload
    }

    #[must_use]
    pub const fn debouncer(&self) -> &FilterDebouncer {
        &self.debouncer
    }

    /// Number of pages for the last filtered total (at least 1).
    #[must_use]
    pub fn page_count(&self) -> u64 {
        let size = self.state.page_size.max(1) as u64;
        self.filtered.div_ceil(size).max(1)
    }

    #[must_use]
    pub fn summary(&self) -> GridSummary {
        GridSummary {
            entity: self.entity(),
            phase: self.phase,
            page: self.state.page,
            page_count: self.page_count(),
            rows: self.rows.len(),
            total: self.total,
            filtered: self.filtered,
            expanded: self.state.expanded_ids.len(),
            last_error: self.last_error.clone(),
            last_loaded_at: self.last_loaded_at,
            collapsed_refreshes: self.collapsed_refreshes,
        }
    }

    /// Start the initial fetch with default sort and page.
    ///
    /// # Errors
    /// `State` unless the grid is unmounted.
    pub fn mount(&mut self) -> Result<FetchRequest> {
        self.require(self.phase == GridPhase::Unmounted, "mount")?;
        let page_size = self.state.page_size;
        self.state = GridState::with_defaults(self.entity(), page_size);
        let request = self.issue(FetchPurpose::Mount, false)?;
        self.phase = GridPhase::Mounting;
        Ok(request)
    }

    /// Re-fetch the current page, preserving expansion.
    ///
    /// Returns `Ok(None)` when a fetch is already in flight: the call collapses
    /// into it.
    ///
    /// # Errors
    /// `State` when the grid is unmounted or still mounting.
    pub fn refresh(&mut self, bust_cache: bool) -> Result<Option<FetchRequest>> {
        match self.phase {
            GridPhase::Mounted => {
                let request = self.issue(FetchPurpose::Refresh, bust_cache)?;
                self.phase = GridPhase::Refreshing;
                Ok(Some(request))
            }
            GridPhase::Refreshing => {
                self.collapsed_refreshes += 1;
                debug!(entity = %self.entity(), "refresh collapsed into in-flight fetch");
                Ok(None)
            }
            GridPhase::Unmounted | GridPhase::Mounting => Err(self.state_error("refresh")),
        }
    }

    /// Change ordering. Fetches immediately, or queues when a fetch is in flight.
    ///
    /// The page is kept unless it is out of range for the last filtered total.
    pub fn set_sort(
        &mut self,
        column: usize,
        direction: SortDirection,
    ) -> Result<Option<FetchRequest>> {
        self.require(self.phase != GridPhase::Unmounted, "set_sort")?;
        let spec = self.entity().spec();
        if !spec.column(column).is_some_and(|c| c.sortable) {
            return Err(CexError::InvalidQuery {
                entity: self.entity().key(),
                details: format!("column {column} is not sortable"),
            });
        }
        self.state.sort_column = column;
        self.state.sort_direction = direction;
        if !self.page_in_range(self.state.page) {
            self.state.page = 0;
        }
        self.reload()
    }

    /// Record filter input for `column`. Applied later by [`Self::poll_filters`].
    pub fn set_filter(&mut self, column: usize, text: &str, now: Instant) -> Result<()> {
        self.require(self.phase != GridPhase::Unmounted, "set_filter")?;
        if !self
            .entity()
            .spec()
            .column(column)
            .is_some_and(|c| c.filterable)
        {
            return Err(CexError::InvalidQuery {
                entity: self.entity().key(),
                details: format!("column {column} is not filterable"),
            });
        }
        self.debouncer.on_input(FilterKey::Column(column), text, now);
        Ok(())
    }

    /// Record global search input. Debounced like a column filter.
    pub fn set_search(&mut self, text: &str, now: Instant) -> Result<()> {
        self.require(self.phase != GridPhase::Unmounted, "set_search")?;
        self.debouncer.on_input(FilterKey::Search, text, now);
        Ok(())
    }

    /// Apply every expired filter timer. A changed filter resets to the first page.
    pub fn poll_filters(&mut self, now: Instant) -> Result<Option<FetchRequest>> {
        if self.phase == GridPhase::Unmounted {
            self.debouncer.clear();
            return Ok(None);
        }
        let mut changed = false;
        for (key, text) in self.debouncer.take_expired(now) {
            changed |= self.apply_filter(key, text);
        }
        if !changed {
            return Ok(None);
        }
        self.state.page = 0;
        self.reload()
    }

    fn apply_filter(&mut self, key: FilterKey, text: String) -> bool {
        match key {
            FilterKey::Column(column) => {
                let current = self.state.column_filters.get(&column).map_or("", String::as_str);
                if current == text {
                    return false;
                }
                if text.is_empty() {
                    self.state.column_filters.remove(&column);
                } else {
                    self.state.column_filters.insert(column, text);
                }
                true
            }
            FilterKey::Search => {
                if self.state.search == text {
                    return false;
                }
                self.state.search = text;
                true
            }
        }
    }

    /// Jump to a zero-based page.
    pub fn set_page(&mut self, page: usize) -> Result<Option<FetchRequest>> {
        self.require(self.phase != GridPhase::Unmounted, "set_page")?;
        if page == self.state.page {
            return Ok(None);
        }
        self.state.page = page;
        self.reload()
    }

    pub fn next_page(&mut self) -> Result<Option<FetchRequest>> {
        let next = self.state.page + 1;
        if (next as u64) >= self.page_count() {
            return Ok(None);
        }
        self.set_page(next)
    }

    pub fn prev_page(&mut self) -> Result<Option<FetchRequest>> {
        match self.state.page.checked_sub(1) {
            Some(prev) => self.set_page(prev),
            None => Ok(None),
        }
    }

    /// Set an extra form parameter (empty clears it). Applied immediately at page 1.
    pub fn set_extra(&mut self, key: &str, value: &str) -> Result<Option<FetchRequest>> {
        self.require(self.phase != GridPhase::Unmounted, "set_extra")?;
        let current = self.state.extra.get(key).map_or("", String::as_str);
        if current == value {
            return Ok(None);
        }
        if value.is_empty() {
            self.state.extra.remove(key);
        } else {
            self.state.extra.insert(key.to_string(), value.to_string());
        }
        self.state.page = 0;
        self.reload()
    }

    /// Apply a fetch outcome.
    pub fn complete(
        &mut self,
        ticket: FetchTicket,
        outcome: Result<QueryResponse>,
        lookups: &LookupCache,
    ) -> Result<Completion> {
        if self.in_flight != Some(ticket) {
            warn!(
                entity = %self.entity(),
                draw = ticket.draw,
                epoch = ticket.epoch,
                current_epoch = self.epoch,
                "discarding stale completion"
            );
            return Ok(Completion {
                outcome: CompletionOutcome::Discarded,
                follow_up: None,
            });
        }
        self.in_flight = None;

        let outcome = outcome.and_then(|response| match response.draw {
            Some(draw) if draw != ticket.draw => Err(CexError::protocol(
                self.entity().key(),
                format!("draw mismatch: issued {}, got {draw}", ticket.draw),
            )),
            _ => Ok(response),
        });

        let result = match outcome {
            Ok(response) => {
                if let Some(clamped) = self.out_of_range_page(&response, ticket) {
                    let requested = self.state.page;
                    self.state.page = clamped;
                    match self.issue(FetchPurpose::Clamp, ticket.bust_cache) {
                        Ok(follow_up) => {
                            info!(entity = %self.entity(), from = requested, to = clamped, "page out of range; clamping");
                            return Ok(Completion {
                                outcome: CompletionOutcome::Clamped { page: clamped },
                                follow_up: Some(follow_up),
                            });
                        }
                        Err(err) => {
                            warn!(entity = %self.entity(), error = %err, "clamp follow-up not issued");
                            self.state.page = requested;
                        }
                    }
                }
                self.apply(response, ticket, lookups)
            }
            Err(err) => self.degrade(&err, ticket),
        };

        let follow_up = if self.pending_reload && self.phase == GridPhase::Mounted {
            self.pending_reload = false;
            let request = self.issue(FetchPurpose::Reload, false)?;
            self.phase = GridPhase::Refreshing;
            Some(request)
        } else {
            if self.phase == GridPhase::Unmounted {
                self.pending_reload = false;
            }
            None
        };

        Ok(Completion {
            outcome: result,
            follow_up,
        })
    }

    /// Tear down: drop rows, expansion, and pending timers. Late completions are discarded.
    pub fn unmount(&mut self) -> Result<()> {
        self.require(self.phase != GridPhase::Unmounted, "unmount")?;
        self.epoch += 1;
        self.phase = GridPhase::Unmounted;
        self.in_flight = None;
        self.captured_expansion = None;
        self.pending_reload = false;
        self.snapshots.clear();
        self.rows.clear();
        self.state.expanded_ids.clear();
        self.debouncer.clear();
        self.meta = None;
        info!(entity = %self.entity(), "grid unmounted");
        Ok(())
    }

    /// Expand a row on the current page. Returns `false` if the row is absent.
    pub fn expand(&mut self, id: &RowId, lookups: &LookupCache) -> bool {
        if !self.snapshots.contains(id) {
            return false;
        }
        self.state.expanded_ids.insert(id.clone());
        if let Some(captured) = &mut self.captured_expansion {
            captured.insert(id.clone());
        }
        self.rerender(lookups);
        true
    }

    pub fn collapse(&mut self, id: &RowId, lookups: &LookupCache) -> bool {
        let removed = self.state.expanded_ids.remove(id);
        if let Some(captured) = &mut self.captured_expansion {
            captured.remove(id);
        }
        if removed {
            self.rerender(lookups);
        }
        removed
    }

    /// Toggle expansion; returns the new expanded state.
    pub fn toggle(&mut self, id: &RowId, lookups: &LookupCache) -> bool {
        if self.state.expanded_ids.contains(id) {
            self.collapse(id, lookups);
            false
        } else {
            self.expand(id, lookups)
        }
    }

    /// Full record of a row as pretty JSON, from the latest snapshot.
    #[must_use]
    pub fn copy_record(&self, id: &RowId) -> Option<String> {
        self.snapshots.copy_record(id)
    }

    /// Re-project label-dependent cells after a lookup refresh.
    pub fn relabel(&mut self, lookups: &LookupCache) -> usize {
        view::relabel(self.entity(), &mut self.rows, &self.snapshots, lookups)
    }

    fn reload(&mut self) -> Result<Option<FetchRequest>> {
        match self.phase {
            GridPhase::Mounted => {
                let request = self.issue(FetchPurpose::Reload, false)?;
                self.phase = GridPhase::Refreshing;
                Ok(Some(request))
            }
            GridPhase::Mounting | GridPhase::Refreshing => {
                self.pending_reload = true;
                debug!(entity = %self.entity(), "reload queued behind in-flight fetch");
                Ok(None)
            }
            GridPhase::Unmounted => Err(self.state_error("reload")),
        }
    }

    fn issue(&mut self, purpose: FetchPurpose, bust_cache: bool) -> Result<FetchRequest> {
        let nonce = bust_cache.then(|| u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0));
        let draw = self.next_draw + 1;
        let query = QueryRequest::build(&self.state.query_state(), draw, nonce)?;
        self.next_draw = draw;
        let ticket = FetchTicket {
            entity: self.entity(),
            draw,
            epoch: self.epoch,
            purpose,
            page: self.state.page,
            bust_cache,
        };
        if purpose != FetchPurpose::Clamp {
            self.captured_expansion = Some(self.state.expanded_ids.clone());
        }
        self.in_flight = Some(ticket);
        debug!(
            entity = %self.entity(),
            draw,
            ?purpose,
            page = self.state.page,
            order = query.order_field,
            dir = query.order_dir.as_str(),
            filters = query.filters.len(),
            bust = bust_cache,
            "fetch issued"
        );
        Ok(FetchRequest { ticket, query })
    }

    /// Last valid page when the requested page came back empty. A queued
    /// reload already carries newer state, so no clamp is attempted then.
    fn out_of_range_page(&self, response: &QueryResponse, ticket: FetchTicket) -> Option<usize> {
        if ticket.purpose == FetchPurpose::Clamp
            || self.pending_reload
            || !response.rows.is_empty()
            || response.filtered == 0
            || ticket.page == 0
        {
            return None;
        }
        let size = self.state.page_size.max(1) as u64;
        let last = (response.filtered - 1) / size;
        usize::try_from(last).ok().filter(|&p| p < ticket.page)
    }

    fn apply(
        &mut self,
        response: QueryResponse,
        ticket: FetchTicket,
        lookups: &LookupCache,
    ) -> CompletionOutcome {
        let expansion = self.captured_expansion.take().unwrap_or_default();
        self.snapshots.capture(response.rows);
        let restore = self.snapshots.restore_expansion(&expansion);
        if !restore.dropped.is_empty() {
            debug!(entity = %self.entity(), dropped = restore.dropped.len(), "expanded rows not carried over");
        }
        self.state.expanded_ids = restore.kept;
        self.total = response.total;
        self.filtered = response.filtered;
        self.meta = response.meta;
        self.last_error = None;
        self.last_loaded_at = Some(Utc::now());
        self.rerender(lookups);
        self.phase = GridPhase::Mounted;

        if ticket.purpose == FetchPurpose::Mount {
            info!(entity = %self.entity(), rows = self.rows.len(), total = self.total, "grid mounted");
        } else {
            debug!(entity = %self.entity(), rows = self.rows.len(), total = self.total, purpose = ?ticket.purpose, "rows replaced");
        }
        CompletionOutcome::Applied {
            rows: self.rows.len(),
            dropped_expansions: restore.dropped.len(),
        }
    }

    fn degrade(&mut self, err: &CexError, ticket: FetchTicket) -> CompletionOutcome {
        self.captured_expansion = None;
        self.last_error = Some(err.to_string());
        if self.phase == GridPhase::Mounting {
            self.phase = GridPhase::Unmounted;
            self.epoch += 1;
            warn!(entity = %self.entity(), code = err.code(), error = %err, "mount failed");
        } else {
            self.phase = GridPhase::Mounted;
            warn!(
                entity = %self.entity(),
                code = err.code(),
                error = %err,
                purpose = ?ticket.purpose,
                "fetch failed; keeping previous rows"
            );
        }
        CompletionOutcome::Degraded {
            code: err.code(),
            error: err.to_string(),
        }
    }

    fn rerender(&mut self, lookups: &LookupCache) {
        self.rows = view::render_page(
            self.entity(),
            &self.snapshots,
            &self.state.expanded_ids,
            lookups,
        );
    }

    fn page_in_range(&self, page: usize) -> bool {
        page == 0 || (page as u64).saturating_mul(self.state.page_size as u64) < self.filtered
    }

    fn require(&self, ok: bool, operation: &'static str) -> Result<()> {
        if ok { Ok(()) } else { Err(self.state_error(operation)) }
    }

    #[cfg(test)]
    pub(crate) fn state_mut(&mut self) -> &mut GridState {
        &mut self.state
    }

    fn state_error(&self, operation: &'static str) -> CexError {
        CexError::State {
            entity: self.entity().key(),
            operation,
            phase: self.phase.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Map, json};

    use super::*;
    use crate::grid::lookup::LookupTable;

    fn controller(entity: EntityKind) -> GridController {
        GridController::new(entity, 25, FilterDebouncer::new(Duration::from_millis(300)))
    }

    fn rows(values: Vec<Value>) -> Vec<Map<String, Value>> {
        values
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn page(draw: u64, total: u64, values: Vec<Value>) -> QueryResponse {
        QueryResponse {
            rows: rows(values),
            total,
            filtered: total,
            draw: Some(draw),
            meta: None,
        }
    }

    fn three_assets(description: &str) -> Vec<Value> {
        vec![
            json!({"asset_id": "A1", "asset_description": "one"}),
            json!({"asset_id": "A2", "asset_description": description}),
            json!({"asset_id": "A3", "asset_description": "three"}),
        ]
    }

    fn mounted(entity: EntityKind, values: Vec<Value>, lookups: &LookupCache) -> GridController {
        let mut c = controller(entity);
        let req = c.mount().unwrap();
        let total = values.len() as u64;
        c.complete(req.ticket, Ok(page(req.ticket.draw, total, values)), lookups)
            .unwrap();
        assert_eq!(c.phase(), GridPhase::Mounted);
        c
    }

    #[test]
    fn mount_uses_default_sort_and_first_page() {
        let mut c = controller(EntityKind::Feed);
        let req = c.mount().unwrap();
        assert_eq!(c.phase(), GridPhase::Mounting);
        assert_eq!(req.ticket.purpose, FetchPurpose::Mount);
        assert_eq!(req.query.start, 0);
        assert_eq!(req.query.order_field, "report_date");
        assert_eq!(req.query.order_dir, SortDirection::Desc);
        assert!(req.query.cache_bust.is_none());
    }

    #[test]
    fn double_mount_is_a_state_error() {
        let mut c = controller(EntityKind::Assets);
        c.mount().unwrap();
        let err = c.mount().unwrap_err();
        assert_eq!(err.code(), "CEX-3001");
    }

    #[test]
    fn refresh_requires_mounted() {
        let mut c = controller(EntityKind::Assets);
        assert_eq!(c.refresh(false).unwrap_err().code(), "CEX-3001");
        c.mount().unwrap();
        assert_eq!(c.refresh(false).unwrap_err().code(), "CEX-3001");
    }

    #[test]
    fn failed_mount_returns_to_unmounted_with_error() {
        let mut c = controller(EntityKind::Assets);
        let lookups = LookupCache::new();
        let req = c.mount().unwrap();
        let done = c
            .complete(
                req.ticket,
                Err(CexError::transport("/x", Some(500), "boom")),
                &lookups,
            )
            .unwrap();
        assert!(matches!(done.outcome, CompletionOutcome::Degraded { code: "CEX-2001", .. }));
        assert_eq!(c.phase(), GridPhase::Unmounted);
        assert!(c.last_error().is_some());
        // No automatic retry; mounting again is allowed.
        assert!(done.follow_up.is_none());
        assert!(c.mount().is_ok());
    }

    #[test]
    fn refresh_preserves_expansion_with_new_snapshot() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("before"), &lookups);
        assert!(c.expand(&RowId::from("A2"), &lookups));

        let req = c.refresh(true).unwrap().unwrap();
        assert_eq!(c.phase(), GridPhase::Refreshing);
        assert!(req.query.cache_bust.is_some());
        c.complete(req.ticket, Ok(page(req.ticket.draw, 3, three_assets("after"))), &lookups)
            .unwrap();

        assert_eq!(c.phase(), GridPhase::Mounted);
        let a2 = c.rows().iter().find(|r| r.id.as_str() == "A2").unwrap();
        assert!(a2.expanded);
        assert!(a2.cells.contains(&"after".to_string()));
        let detail = a2.detail.as_ref().unwrap();
        assert!(detail.contains(&("asset_description".to_string(), "after".to_string())));
    }

    #[test]
    fn absent_expanded_row_is_silently_dropped() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        c.expand(&RowId::from("A3"), &lookups);
        let req = c.refresh(false).unwrap().unwrap();
        let done = c
            .complete(
                req.ticket,
                Ok(page(req.ticket.draw, 2, three_assets("x")[..2].to_vec())),
                &lookups,
            )
            .unwrap();
        assert_eq!(
            done.outcome,
            CompletionOutcome::Applied {
                rows: 2,
                dropped_expansions: 1
            }
        );
        assert!(c.state().expanded_ids.is_empty());
        assert!(c.rows().iter().all(|r| !r.expanded));
    }

    #[test]
    fn refresh_while_refreshing_collapses() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        let first = c.refresh(false).unwrap();
        assert!(first.is_some());
        assert!(c.refresh(false).unwrap().is_none());
        assert!(c.refresh(true).unwrap().is_none());
        assert_eq!(c.collapsed_refreshes(), 2);
        assert!(c.in_flight().is_some());
    }

    #[test]
    fn failed_refresh_keeps_previous_rows() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        c.expand(&RowId::from("A1"), &lookups);
        let req = c.refresh(false).unwrap().unwrap();
        let done = c
            .complete(req.ticket, Err(CexError::protocol("/x", "missing `data`")), &lookups)
            .unwrap();
        assert!(matches!(done.outcome, CompletionOutcome::Degraded { code: "CEX-2002", .. }));
        assert_eq!(c.phase(), GridPhase::Mounted);
        assert_eq!(c.rows().len(), 3);
        assert!(c.state().expanded_ids.contains(&RowId::from("A1")));
        assert!(c.last_error().unwrap().contains("missing"));
    }

    #[test]
    fn draw_mismatch_degrades() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        let req = c.refresh(false).unwrap().unwrap();
        let done = c
            .complete(req.ticket, Ok(page(req.ticket.draw + 10, 0, vec![])), &lookups)
            .unwrap();
        assert!(matches!(done.outcome, CompletionOutcome::Degraded { code: "CEX-2002", .. }));
        assert_eq!(c.rows().len(), 3);
    }

    #[test]
    fn completion_after_unmount_is_discarded() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        let req = c.refresh(false).unwrap().unwrap();
        c.unmount().unwrap();
        let done = c
            .complete(req.ticket, Ok(page(req.ticket.draw, 3, three_assets("y"))), &lookups)
            .unwrap();
        assert_eq!(done.outcome, CompletionOutcome::Discarded);
        assert_eq!(c.phase(), GridPhase::Unmounted);
        assert!(c.rows().is_empty());
    }

    #[test]
    fn sort_during_flight_is_queued_and_issued_once() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        let req = c.refresh(false).unwrap().unwrap();
        assert!(c.set_sort(1, SortDirection::Asc).unwrap().is_none());
        assert!(c.set_sort(2, SortDirection::Asc).unwrap().is_none());
        assert!(c.has_queued_reload());

        let done = c
            .complete(req.ticket, Ok(page(req.ticket.draw, 3, three_assets("x"))), &lookups)
            .unwrap();
        let follow = done.follow_up.unwrap();
        assert_eq!(follow.ticket.purpose, FetchPurpose::Reload);
        assert_eq!(follow.query.order_field, "asset_ip");
        assert_eq!(c.phase(), GridPhase::Refreshing);
        assert!(!c.has_queued_reload());
    }

    #[test]
    fn sort_keeps_page_when_in_range() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        c.filtered = 100;
        let req = c.set_page(2).unwrap().unwrap();
        c.complete(req.ticket, Ok(page(req.ticket.draw, 100, three_assets("x"))), &lookups)
            .unwrap();
        let req = c.set_sort(1, SortDirection::Asc).unwrap().unwrap();
        assert_eq!(req.query.page(), 2);
    }

    #[test]
    fn sort_resets_page_when_out_of_range() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        let req = c.set_page(4).unwrap().unwrap();
        // Page 4 of a 3-row grid: server returns nothing; recovery clamps to page 0.
        let done = c
            .complete(req.ticket, Ok(page(req.ticket.draw, 3, vec![])), &lookups)
            .unwrap();
        assert_eq!(done.outcome, CompletionOutcome::Clamped { page: 0 });
        let follow = done.follow_up.unwrap();
        assert_eq!(follow.ticket.purpose, FetchPurpose::Clamp);
        c.complete(follow.ticket, Ok(page(follow.ticket.draw, 3, three_assets("x"))), &lookups)
            .unwrap();
        assert_eq!(c.state().page, 0);

        // Force an out-of-range page without a fetch result to check the sort rule.
        c.state.page = 9;
        let req = c.set_sort(2, SortDirection::Desc).unwrap().unwrap();
        assert_eq!(req.query.page(), 0);
    }

    #[test]
    fn clamp_follow_up_only_once() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        c.filtered = 200;
        let req = c.set_page(7).unwrap().unwrap();
        let done = c
            .complete(req.ticket, Ok(page(req.ticket.draw, 60, vec![])), &lookups)
            .unwrap();
        assert_eq!(done.outcome, CompletionOutcome::Clamped { page: 2 });
        let follow = done.follow_up.unwrap();
        let done = c
            .complete(follow.ticket, Ok(page(follow.ticket.draw, 60, vec![])), &lookups)
            .unwrap();
        assert!(matches!(done.outcome, CompletionOutcome::Applied { rows: 0, .. }));
        assert!(done.follow_up.is_none());
    }

    #[test]
    fn clamp_after_cache_busting_refresh_keeps_the_marker() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        c.filtered = 200;
        let req = c.set_page(5).unwrap().unwrap();
        c.complete(req.ticket, Ok(page(req.ticket.draw, 200, three_assets("x"))), &lookups)
            .unwrap();

        let req = c.refresh(true).unwrap().unwrap();
        assert!(req.ticket.bust_cache);
        assert!(req.query.cache_bust.is_some());
        let done = c
            .complete(req.ticket, Ok(page(req.ticket.draw, 30, vec![])), &lookups)
            .unwrap();
        assert_eq!(done.outcome, CompletionOutcome::Clamped { page: 1 });
        let follow = done.follow_up.unwrap();
        assert_eq!(follow.ticket.purpose, FetchPurpose::Clamp);
        assert!(follow.ticket.bust_cache);
        assert!(follow.query.cache_bust.is_some());
    }

    #[test]
    fn clamp_after_plain_refresh_has_no_marker() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        c.filtered = 200;
        let req = c.set_page(5).unwrap().unwrap();
        c.complete(req.ticket, Ok(page(req.ticket.draw, 200, three_assets("x"))), &lookups)
            .unwrap();

        let req = c.refresh(false).unwrap().unwrap();
        let done = c
            .complete(req.ticket, Ok(page(req.ticket.draw, 30, vec![])), &lookups)
            .unwrap();
        let follow = done.follow_up.unwrap();
        assert!(!follow.ticket.bust_cache);
        assert!(follow.query.cache_bust.is_none());
    }

    #[test]
    fn failed_issue_leaves_phase_unchanged() {
        let lookups = LookupCache::new();
        let mut zero = controller(EntityKind::Assets);
        zero.state.page_size = 0;
        assert_eq!(zero.mount().unwrap_err().code(), "CEX-2003");
        assert_eq!(zero.phase(), GridPhase::Unmounted);
        assert!(zero.in_flight().is_none());

        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        c.state.page_size = 0;
        assert_eq!(c.refresh(false).unwrap_err().code(), "CEX-2003");
        assert_eq!(c.phase(), GridPhase::Mounted);
        assert_eq!(c.set_sort(1, SortDirection::Asc).unwrap_err().code(), "CEX-2003");
        assert_eq!(c.phase(), GridPhase::Mounted);
        assert!(c.in_flight().is_none());

        c.state.page_size = 25;
        let req = c.refresh(false).unwrap().unwrap();
        assert_eq!(c.phase(), GridPhase::Refreshing);
        assert_eq!(c.in_flight(), Some(req.ticket));
    }

    #[test]
    fn debounced_filter_fetches_once_at_page_one() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        c.filtered = 500;
        let req = c.set_page(3).unwrap().unwrap();
        c.complete(req.ticket, Ok(page(req.ticket.draw, 500, three_assets("x"))), &lookups)
            .unwrap();

        let t0 = Instant::now();
        c.set_filter(1, "a", t0).unwrap();
        c.set_filter(1, "ab", t0 + Duration::from_millis(100)).unwrap();
        c.set_filter(1, "abc", t0 + Duration::from_millis(200)).unwrap();
        assert!(c.poll_filters(t0 + Duration::from_millis(250)).unwrap().is_none());
        let req = c.poll_filters(t0 + Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(req.query.page(), 0);
        assert_eq!(req.query.filters.len(), 1);
        assert_eq!(req.query.filters[0].text, "abc");
        assert!(c.poll_filters(t0 + Duration::from_secs(5)).unwrap().is_none());
    }

    #[test]
    fn unchanged_filter_does_not_fetch() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        let t0 = Instant::now();
        c.set_filter(2, "", t0).unwrap();
        assert!(c.poll_filters(t0 + Duration::from_secs(1)).unwrap().is_none());
    }

    #[test]
    fn non_filterable_and_non_sortable_columns_rejected() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Feed, vec![json!({"id": 1})], &lookups);
        let now = Instant::now();
        assert_eq!(c.set_filter(9, "x", now).unwrap_err().code(), "CEX-2003");
        assert_eq!(
            c.set_sort(9, SortDirection::Asc).unwrap_err().code(),
            "CEX-2003"
        );
        assert_eq!(c.set_sort(50, SortDirection::Asc).unwrap_err().code(), "CEX-2003");
    }

    #[test]
    fn extra_params_apply_immediately_and_reset_page() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Feed, vec![json!({"id": 1})], &lookups);
        c.state.page = 2;
        let req = c.set_extra("report_type", "scan_http").unwrap().unwrap();
        assert_eq!(req.query.page(), 0);
        assert_eq!(req.query.extra.get("report_type").map(String::as_str), Some("scan_http"));
    }

    #[test]
    fn feed_meta_is_replaced_per_fetch() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Feed, vec![json!({"id": 1})], &lookups);
        assert!(c.meta().is_none());
        let req = c.refresh(false).unwrap().unwrap();
        let mut resp = page(req.ticket.draw, 1, vec![json!({"id": 1})]);
        resp.meta = Some(json!({"ioc_matches": 3}));
        c.complete(req.ticket, Ok(resp), &lookups).unwrap();
        assert_eq!(c.meta(), Some(&json!({"ioc_matches": 3})));
    }

    #[test]
    fn relabel_after_lookup_refresh_without_refetch() {
        let mut lookups = LookupCache::new();
        let mut c = mounted(
            EntityKind::Tasks,
            vec![json!({"task_id": 1, "task_status_id": "4"})],
            &lookups,
        );
        assert_eq!(c.rows()[0].cells[2], "4");
        let mut table = LookupTable::new();
        table.insert("task_status", "4", "Open");
        lookups.replace(table);
        assert_eq!(c.relabel(&lookups), 1);
        assert_eq!(c.rows()[0].cells[2], "Open");
        assert!(c.is_idle());
    }

    #[test]
    fn expansion_toggled_during_flight_is_honoured() {
        let lookups = LookupCache::new();
        let mut c = mounted(EntityKind::Assets, three_assets("x"), &lookups);
        c.expand(&RowId::from("A1"), &lookups);
        let req = c.refresh(false).unwrap().unwrap();
        c.collapse(&RowId::from("A1"), &lookups);
        c.expand(&RowId::from("A3"), &lookups);
        c.complete(req.ticket, Ok(page(req.ticket.draw, 3, three_assets("x"))), &lookups)
            .unwrap();
        let expanded: Vec<_> = c.state().expanded_ids.iter().map(RowId::as_str).collect();
        assert_eq!(expanded, vec!["A3"]);
    }

    #[test]
    fn copy_record_reads_latest_snapshot() {
        let lookups = LookupCache::new();
        let c = mounted(EntityKind::Assets, three_assets("desc"), &lookups);
        let text = c.copy_record(&RowId::from("A2")).unwrap();
        assert!(text.contains("\"asset_description\": \"desc\""));
    }
}
