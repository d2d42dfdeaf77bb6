//! Property-based tests for grid controller invariants.
//!
//! Arbitrary interleavings of user actions, refresh triggers, and fetch
//! completions must never leave two fetches in flight for one grid, must keep
//! expansion limited to rows on the current page, and must never blank a
//! populated grid on failure.

use std::time::{Duration, Instant};

use proptest::prelude::*;
use serde_json::{Value, json};

use super::controller::{CompletionOutcome, FetchRequest, GridController, GridPhase};
use super::debounce::FilterDebouncer;
use super::entity::{EntityKind, SortDirection};
use super::identity::RowId;
use super::lookup::LookupCache;
use super::query::QueryTransport;
use super::transport::ScriptedTransport;
use crate::core::errors::CexError;

// ──────────────────── strategies ────────────────────

#[derive(Debug, Clone)]
enum Op {
    Refresh(bool),
    Sort(usize, bool),
    Page(usize),
    Expand(u8),
    Collapse(u8),
    Filter(usize, String),
    Advance(u64),
    CompleteOk,
    CompleteErr,
    Unmount,
    Mount,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<bool>().prop_map(Op::Refresh),
        (0usize..8, any::<bool>()).prop_map(|(c, asc)| Op::Sort(c, asc)),
        (0usize..4).prop_map(Op::Page),
        (0u8..12).prop_map(Op::Expand),
        (0u8..12).prop_map(Op::Collapse),
        (1usize..4, "[a-c]{0,3}").prop_map(|(c, t)| Op::Filter(c, t)),
        (0u64..700).prop_map(Op::Advance),
        Just(Op::CompleteOk),
        Just(Op::CompleteOk),
        Just(Op::CompleteErr),
        Just(Op::Unmount),
        Just(Op::Mount),
    ]
}

fn dataset() -> Vec<Value> {
    (0..30)
        .map(|i| {
            let name = ["abc", "bca", "cab"][i % 3];
            json!({
                "asset_id": format!("A{i}"),
                "asset_name": name,
                "asset_ip": format!("10.0.0.{i}"),
                "asset_description": format!("row {i}"),
            })
        })
        .collect()
}

struct Harness {
    grid: GridController,
    server: ScriptedTransport,
    lookups: LookupCache,
    outstanding: Option<FetchRequest>,
    now: Instant,
}

impl Harness {
    fn new() -> Self {
        let server = ScriptedTransport::new();
        server.set_rows_json(EntityKind::Assets, dataset());
        Self {
            grid: GridController::new(
                EntityKind::Assets,
                10,
                FilterDebouncer::new(Duration::from_millis(300)),
            ),
            server,
            lookups: LookupCache::new(),
            outstanding: None,
            now: Instant::now(),
        }
    }

    /// Record a newly issued fetch, failing if one is already outstanding.
    fn issued(&mut self, request: Option<FetchRequest>) -> Result<(), TestCaseError> {
        if let Some(request) = request {
            prop_assert!(
                self.outstanding.is_none(),
                "second fetch issued while draw {:?} in flight",
                self.outstanding.as_ref().map(|r| r.ticket.draw)
            );
            self.outstanding = Some(request);
        }
        Ok(())
    }

    fn apply(&mut self, op: Op) -> Result<(), TestCaseError> {
        match op {
            Op::Refresh(bust) => {
                if let Ok(req) = self.grid.refresh(bust) {
                    self.issued(req)?;
                }
            }
            Op::Sort(column, asc) => {
                let dir = if asc { SortDirection::Asc } else { SortDirection::Desc };
                if let Ok(req) = self.grid.set_sort(column, dir) {
                    self.issued(req)?;
                }
            }
            Op::Page(page) => {
                if let Ok(req) = self.grid.set_page(page) {
                    self.issued(req)?;
                }
            }
            Op::Expand(n) => {
                self.grid.expand(&RowId::new(format!("A{n}")), &self.lookups);
            }
            Op::Collapse(n) => {
                self.grid.collapse(&RowId::new(format!("A{n}")), &self.lookups);
            }
            Op::Filter(column, text) => {
                let _ = self.grid.set_filter(column, &text, self.now);
            }
            Op::Advance(ms) => {
                self.now += Duration::from_millis(ms);
                let req = self.grid.poll_filters(self.now).map_err(|e| {
                    TestCaseError::fail(format!("poll_filters failed: {e}"))
                })?;
                self.issued(req)?;
            }
            Op::CompleteOk | Op::CompleteErr => {
                let Some(request) = self.outstanding.take() else {
                    return Ok(());
                };
                let rows_before = self.grid.rows().len();
                let was_mounted = self.grid.phase().is_mounted();
                let outcome = if matches!(op, Op::CompleteOk) {
                    self.server.query(&request.query)
                } else {
                    Err(CexError::transport("/prop", Some(503), "down"))
                };
                let done = self
                    .grid
                    .complete(request.ticket, outcome, &self.lookups)
                    .map_err(|e| TestCaseError::fail(format!("complete failed: {e}")))?;
                if matches!(done.outcome, CompletionOutcome::Degraded { .. }) && was_mounted {
                    prop_assert_eq!(self.grid.rows().len(), rows_before);
                }
                self.issued(done.follow_up)?;
            }
            Op::Unmount => {
                if self.grid.unmount().is_ok() {
                    // Late completion of the abandoned fetch is discarded.
                    if let Some(request) = self.outstanding.take() {
                        let outcome = self.server.query(&request.query);
                        let done = self
                            .grid
                            .complete(request.ticket, outcome, &self.lookups)
                            .map_err(|e| TestCaseError::fail(e.to_string()))?;
                        prop_assert_eq!(done.outcome, CompletionOutcome::Discarded);
                    }
                }
            }
            Op::Mount => {
                if let Ok(req) = self.grid.mount() {
                    self.issued(Some(req))?;
                }
            }
        }
        Ok(())
    }

    fn check_invariants(&self) -> Result<(), TestCaseError> {
        prop_assert_eq!(self.grid.in_flight().is_some(), self.outstanding.is_some());
        prop_assert_eq!(
            self.grid.in_flight().is_some(),
            matches!(self.grid.phase(), GridPhase::Mounting | GridPhase::Refreshing)
        );
        for id in &self.grid.state().expanded_ids {
            prop_assert!(
                self.grid.snapshots().contains(id),
                "expanded id {id} not on current page"
            );
        }
        for row in self.grid.rows() {
            prop_assert_eq!(row.expanded, self.grid.state().expanded_ids.contains(&row.id));
        }
        if self.grid.phase() == GridPhase::Unmounted {
            prop_assert!(self.grid.rows().is_empty() || self.grid.last_error().is_some());
        }
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// No interleaving ever puts two fetches in flight for one grid.
    #[test]
    fn single_flight_and_expansion_invariants(
        ops in prop::collection::vec(arb_op(), 1..80)
    ) {
        let mut h = Harness::new();
        let first = h.grid.mount().map_err(|e| TestCaseError::fail(e.to_string()))?;
        h.issued(Some(first))?;
        for op in ops {
            h.apply(op)?;
            h.check_invariants()?;
        }
    }

    /// A row that stays on the page stays expanded and shows fresh data.
    #[test]
    fn expansion_survives_refresh_with_new_data(
        expanded in prop::collection::btree_set(0u8..10, 0..5),
        edit in "[a-z]{1,8}"
    ) {
        let mut h = Harness::new();
        let req = h.grid.mount().map_err(|e| TestCaseError::fail(e.to_string()))?;
        let outcome = h.server.query(&req.query);
        h.grid.complete(req.ticket, outcome, &h.lookups).map_err(|e| TestCaseError::fail(e.to_string()))?;

        let ids: Vec<RowId> = h.grid.rows().iter().map(|r| r.id.clone()).collect();
        for n in &expanded {
            if let Some(id) = ids.get(usize::from(*n)) {
                h.grid.expand(id, &h.lookups);
            }
        }
        let before = h.grid.state().expanded_ids.clone();

        let mut rows = dataset();
        for row in &mut rows {
            row["asset_description"] = json!(edit.clone());
        }
        h.server.set_rows_json(EntityKind::Assets, rows);
        let req = h.grid.refresh(false).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let req = req.ok_or_else(|| TestCaseError::fail("refresh collapsed unexpectedly"))?;
        let outcome = h.server.query(&req.query);
        h.grid.complete(req.ticket, outcome, &h.lookups).map_err(|e| TestCaseError::fail(e.to_string()))?;

        prop_assert_eq!(&h.grid.state().expanded_ids, &before);
        for row in h.grid.rows().iter().filter(|r| r.expanded) {
            let detail = row.detail.as_ref().ok_or_else(|| TestCaseError::fail("no detail"))?;
            prop_assert!(detail.contains(&("asset_description".to_string(), edit.clone())));
        }
    }

    /// Bursts of keystrokes inside the window yield one fetch with the last text.
    #[test]
    fn debounce_yields_single_fetch_with_last_text(
        texts in prop::collection::vec("[a-z]{1,6}", 1..8),
        gaps in prop::collection::vec(0u64..299, 8)
    ) {
        let mut h = Harness::new();
        let req = h.grid.mount().map_err(|e| TestCaseError::fail(e.to_string()))?;
        let outcome = h.server.query(&req.query);
        h.grid.complete(req.ticket, outcome, &h.lookups).map_err(|e| TestCaseError::fail(e.to_string()))?;

        let mut fetches = Vec::new();
        for (text, gap) in texts.iter().zip(gaps.iter()) {
            h.grid.set_filter(1, text, h.now).map_err(|e| TestCaseError::fail(e.to_string()))?;
            h.now += Duration::from_millis(*gap);
            if let Some(req) = h.grid.poll_filters(h.now).map_err(|e| TestCaseError::fail(e.to_string()))? {
                fetches.push(req);
            }
        }
        h.now += Duration::from_millis(300);
        if let Some(req) = h.grid.poll_filters(h.now).map_err(|e| TestCaseError::fail(e.to_string()))? {
            fetches.push(req);
        }

        prop_assert_eq!(fetches.len(), 1);
        let last = texts.last().cloned().unwrap_or_default();
        prop_assert_eq!(&fetches[0].query.filters[0].text, &last);
        prop_assert_eq!(fetches[0].query.page(), 0);
    }
}
