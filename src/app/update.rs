//! Pure update function for the explorer.
//!
//! `update()` applies one message to [`AppState`] and returns the command the
//! runtime should execute. It performs no I/O; time is passed in.

use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, error, warn};

use super::model::{AppState, ExplorerCmd, ExplorerMsg, NoticeLevel, PageMove};
use crate::core::errors::{CexError, Result};
use crate::grid::controller::{CompletionOutcome, FetchRequest, GridController, GridPhase};
use crate::grid::coordinator::TriggerOutcome;
use crate::grid::entity::{EntityKind, SortDirection};

/// Apply a message and return the next command.
pub fn update(state: &mut AppState, msg: ExplorerMsg, now: Instant) -> ExplorerCmd {
    let cmd = match msg {
        ExplorerMsg::Tick => on_tick(state, now),
        ExplorerMsg::SwitchTab(kind) => switch_tab(state, kind),
        ExplorerMsg::Refresh { bust_cache } => manual_refresh(state, bust_cache, now),
        ExplorerMsg::Sort { column, direction } => with_active(state, |grid| {
            let current = grid.state();
            let direction = direction.unwrap_or(if current.sort_column == column {
                current.sort_direction.flipped()
            } else {
                SortDirection::Asc
            });
            grid.set_sort(column, direction)
        }),
        ExplorerMsg::Filter { column, text } => {
            with_active(state, |grid| grid.set_filter(column, &text, now).map(|()| None))
        }
        ExplorerMsg::Search(text) => {
            with_active(state, |grid| grid.set_search(&text, now).map(|()| None))
        }
        ExplorerMsg::Page(step) => with_active(state, |grid| match step {
            PageMove::Next => grid.next_page(),
            PageMove::Prev => grid.prev_page(),
            PageMove::Goto(page) => grid.set_page(page),
        }),
        ExplorerMsg::Extra { key, value } => {
            with_active(state, |grid| grid.set_extra(&key, &value))
        }
        ExplorerMsg::Expand(id) => {
            let tab = state.active_tab;
            if let Ok(grid) = state.grids.get_mut(tab)
                && !grid.expand(&id, &state.lookups)
            {
                state.push_notice(NoticeLevel::Info, format!("{tab}: row {id} is not on this page"));
            }
            ExplorerCmd::None
        }
        ExplorerMsg::Collapse(id) => {
            let tab = state.active_tab;
            if let Ok(grid) = state.grids.get_mut(tab) {
                grid.collapse(&id, &state.lookups);
            }
            ExplorerCmd::None
        }
        ExplorerMsg::Toggle(id) => {
            let tab = state.active_tab;
            if let Ok(grid) = state.grids.get_mut(tab) {
                grid.toggle(&id, &state.lookups);
            }
            ExplorerCmd::None
        }
        ExplorerMsg::CopyRecord(id) => {
            let record = state
                .active_grid()
                .ok()
                .and_then(|grid| grid.copy_record(&id));
            match record {
                Some(text) => {
                    state.clipboard = Some(text.clone());
                    ExplorerCmd::Emit(text)
                }
                None => {
                    state.push_notice(NoticeLevel::Info, format!("row {id} is not on this page"));
                    ExplorerCmd::None
                }
            }
        }
        ExplorerMsg::RefreshLookups => ExplorerCmd::FetchLookups,
        ExplorerMsg::FetchCompleted { ticket, outcome } => {
            let entity = ticket.entity;
            let result = match state.grids.get_mut(entity) {
                Ok(grid) => grid.complete(ticket, outcome, &state.lookups),
                Err(err) => Err(err),
            };
            let cmd = match result {
                Ok(done) => {
                    if let CompletionOutcome::Degraded { error, .. } = &done.outcome {
                        state.push_notice(NoticeLevel::Warning, format!("{entity}: {error}"));
                    }
                    done.follow_up.map_or(ExplorerCmd::None, ExplorerCmd::Fetch)
                }
                Err(err) => report_error(state, &err),
            };
            if state.grids.get(entity).is_ok_and(GridController::is_idle) {
                state.coordinator.grid_settled(entity, now);
            }
            cmd
        }
        ExplorerMsg::LookupsLoaded(outcome) => {
            if let Err(err) = state.lookups.complete_refresh(outcome) {
                state.push_notice(
                    NoticeLevel::Warning,
                    format!("lookup refresh failed; keeping previous labels ({})", err.code()),
                );
            }
            relabel_if_dirty(state);
            ExplorerCmd::None
        }
        ExplorerMsg::CountsLoaded(outcome) => {
            match outcome {
                Ok(counts) => state.counts = counts,
                Err(err) => warn!(code = err.code(), error = %err, "count badges not updated"),
            }
            ExplorerCmd::None
        }
        ExplorerMsg::Quit => {
            state.quit = true;
            ExplorerCmd::Quit
        }
    };
    state.status = state.coordinator.status_line(now);
    cmd
}

fn on_tick(state: &mut AppState, now: Instant) -> ExplorerCmd {
    let mut cmds = Vec::new();
    let poll = state.grids.poll_filters(now);
    cmds.extend(poll.requests.into_iter().map(ExplorerCmd::Fetch));
    for err in &poll.errors {
        cmds.push(report_error(state, err));
    }
    let mounted = state.grids.mounted();
    if let Some(outcome) = state.coordinator.on_timer(&mounted, now) {
        cmds.push(run_cycle(state, outcome, false, now));
    }
    ExplorerCmd::batch(cmds)
}

fn manual_refresh(state: &mut AppState, bust_cache: bool, now: Instant) -> ExplorerCmd {
    let mut cmds = Vec::new();
    // A manual refresh is the retry path for a tab whose mount failed.
    let tab = state.active_tab;
    let remount = state.grids.get(tab).is_ok_and(|g| {
        g.phase() == GridPhase::Unmounted && g.last_error().is_some() && !state.is_deferred(tab)
    });
    if remount && let Ok(grid) = state.grids.get_mut(tab) {
        match grid.mount() {
            Ok(request) => cmds.push(ExplorerCmd::Fetch(request)),
            Err(err) => cmds.push(report_error(state, &err)),
        }
    }

    let mounted = state.grids.mounted();
    let outcome = state.coordinator.trigger_now(bust_cache, &mounted, now);
    cmds.push(run_cycle(state, outcome, bust_cache, now));
    ExplorerCmd::batch(cmds)
}

/// Refresh every grid in a started cycle and request fresh counts.
fn run_cycle(
    state: &mut AppState,
    outcome: TriggerOutcome,
    bust_cache: bool,
    now: Instant,
) -> ExplorerCmd {
    let grids = match outcome {
        TriggerOutcome::Started { grids, .. } => grids,
        TriggerOutcome::AlreadyRunning => {
            state.push_notice(NoticeLevel::Info, "refresh already running");
            return ExplorerCmd::None;
        }
    };
    let mut cmds = vec![ExplorerCmd::FetchCounts];
    for kind in grids {
        let result = state.grids.get_mut(kind).and_then(|g| g.refresh(bust_cache));
        match result {
            Ok(Some(request)) => cmds.push(ExplorerCmd::Fetch(request)),
            // Collapsed: the in-flight fetch settles this grid.
            Ok(None) => debug!(entity = %kind, "refresh collapsed"),
            Err(err) => {
                state.coordinator.grid_settled(kind, now);
                cmds.push(report_error(state, &err));
            }
        }
    }
    ExplorerCmd::batch(cmds)
}

fn switch_tab(state: &mut AppState, kind: EntityKind) -> ExplorerCmd {
    if !state.grids.contains(kind) {
        state.push_notice(NoticeLevel::Warning, format!("{kind} is not enabled"));
        return ExplorerCmd::None;
    }
    state.active_tab = kind;
    match state.mounts.activate(kind, &mut state.grids) {
        Some(Ok(request)) => ExplorerCmd::Fetch(request),
        Some(Err(err)) => report_error(state, &err),
        None => ExplorerCmd::None,
    }
}

/// Run a grid operation on the active tab, if it has rows.
fn with_active<F>(state: &mut AppState, op: F) -> ExplorerCmd
where
    F: FnOnce(&mut GridController) -> Result<Option<FetchRequest>>,
{
    let tab = state.active_tab;
    if state.grids.get(tab).is_ok_and(|g| g.phase() == GridPhase::Unmounted) {
        state.push_notice(NoticeLevel::Info, format!("{tab} is not loaded"));
        return ExplorerCmd::None;
    }
    let result = state.grids.get_mut(tab).and_then(op);
    match result {
        Ok(Some(request)) => ExplorerCmd::Fetch(request),
        Ok(None) => ExplorerCmd::None,
        Err(err) => report_error(state, &err),
    }
}

fn relabel_if_dirty(state: &mut AppState) {
    let generation = state.labels_dirty.swap(0, Ordering::AcqRel);
    if generation == 0 {
        return;
    }
    let changed = state.grids.relabel_all(&state.lookups);
    debug!(generation, cells = changed, "label cells patched");
}

/// Surface an error. State errors are caller bugs and fail loudly in debug builds.
fn report_error(state: &mut AppState, err: &CexError) -> ExplorerCmd {
    if matches!(err, CexError::State { .. }) {
        error!(code = err.code(), error = %err, "invalid grid operation");
        state.state_errors += 1;
        debug_assert!(false, "{err}");
    } else {
        warn!(code = err.code(), error = %err, "operation rejected");
    }
    state.push_notice(NoticeLevel::Error, err.to_string());
    ExplorerCmd::None
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde_json::{Map, Value, json};

    use super::*;
    use crate::core::config::Config;
    use crate::grid::identity::RowId;
    use crate::grid::lookup::LookupTable;
    use crate::grid::query::QueryResponse;

    fn rows(values: Vec<Value>) -> Vec<Map<String, Value>> {
        values
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn respond(state: &mut AppState, request: &FetchRequest, values: Vec<Value>, now: Instant) -> ExplorerCmd {
        let total = values.len() as u64;
        update(
            state,
            ExplorerMsg::FetchCompleted {
                ticket: request.ticket,
                outcome: Ok(QueryResponse {
                    rows: rows(values),
                    total,
                    filtered: total,
                    draw: Some(request.ticket.draw),
                    meta: None,
                }),
            },
            now,
        )
    }

    fn fetches(cmd: ExplorerCmd) -> Vec<FetchRequest> {
        cmd.flatten()
            .into_iter()
            .filter_map(|c| match c {
                ExplorerCmd::Fetch(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn booted(now: Instant) -> AppState {
        let (mut state, cmd) = AppState::init(&Config::default(), now).unwrap();
        let first = fetches(cmd).remove(0);
        respond(&mut state, &first, vec![json!({"asset_id": "A1"}), json!({"asset_id": "A2"})], now);
        state
    }

    #[test]
    fn switching_tab_mounts_once() {
        let now = Instant::now();
        let mut state = booted(now);
        let first = fetches(update(&mut state, ExplorerMsg::SwitchTab(EntityKind::Iocs), now));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].ticket.entity, EntityKind::Iocs);
        let again = update(&mut state, ExplorerMsg::SwitchTab(EntityKind::Assets), now);
        assert_eq!(again, ExplorerCmd::None);
        let again = update(&mut state, ExplorerMsg::SwitchTab(EntityKind::Iocs), now);
        assert_eq!(again, ExplorerCmd::None);
    }

    #[test]
    fn manual_refresh_skips_unmounted_and_requests_counts() {
        let now = Instant::now();
        let mut state = booted(now);
        let cmds = update(&mut state, ExplorerMsg::Refresh { bust_cache: true }, now).flatten();
        let requests: Vec<_> = cmds
            .iter()
            .filter_map(|c| match c {
                ExplorerCmd::Fetch(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].ticket.entity, EntityKind::Assets);
        assert!(requests[0].query.cache_bust.is_some());
        assert!(cmds.contains(&ExplorerCmd::FetchCounts));
        assert_eq!(state.status, "refreshing (1 of 1 pending)");
    }

    #[test]
    fn manual_refresh_while_cycle_active_is_ignored_with_notice() {
        let now = Instant::now();
        let mut state = booted(now);
        update(&mut state, ExplorerMsg::Refresh { bust_cache: false }, now);
        let second = update(&mut state, ExplorerMsg::Refresh { bust_cache: false }, now);
        assert_eq!(second, ExplorerCmd::None);
        assert_eq!(state.coordinator.ignored_triggers(), 1);
        assert!(state.notices.iter().any(|n| n.message.contains("already running")));
    }

    #[test]
    fn cycle_completes_and_status_reports_age() {
        let now = Instant::now();
        let mut state = booted(now);
        let request = fetches(update(&mut state, ExplorerMsg::Refresh { bust_cache: false }, now)).remove(0);
        respond(&mut state, &request, vec![json!({"asset_id": "A1"})], now);
        assert!(!state.coordinator.is_active());
        update(&mut state, ExplorerMsg::Tick, now + Duration::from_secs(7));
        assert_eq!(state.status, "updated 7s ago");
    }

    #[test]
    fn timer_tick_starts_cycle_without_cache_bust() {
        let now = Instant::now();
        let mut state = booted(now);
        let later = now + Duration::from_secs(30);
        let requests = fetches(update(&mut state, ExplorerMsg::Tick, later));
        assert_eq!(requests.len(), 1);
        assert!(requests[0].query.cache_bust.is_none());
        assert!(state.coordinator.is_active());
    }

    #[test]
    fn failed_lookup_refresh_keeps_labels_and_notifies() {
        let now = Instant::now();
        let mut state = booted(now);
        let mut table = LookupTable::new();
        table.insert("asset_type", "1", "Server");
        update(&mut state, ExplorerMsg::LookupsLoaded(Ok(table)), now);
        update(
            &mut state,
            ExplorerMsg::LookupsLoaded(Err(CexError::transport("/api/lookups", Some(500), "x"))),
            now,
        );
        assert_eq!(state.lookups.resolve("asset_type", "1"), "Server");
        assert!(state.notices.iter().any(|n| n.level == NoticeLevel::Warning));
    }

    #[test]
    fn counts_loaded_replace_badges() {
        let now = Instant::now();
        let mut state = booted(now);
        let counts = BTreeMap::from([(EntityKind::Assets, 2), (EntityKind::Notes, 9)]);
        update(&mut state, ExplorerMsg::CountsLoaded(Ok(counts.clone())), now);
        assert_eq!(state.counts, counts);
        update(
            &mut state,
            ExplorerMsg::CountsLoaded(Err(CexError::transport("/c", None, "down"))),
            now,
        );
        assert_eq!(state.counts, counts);
    }

    #[test]
    fn copy_record_emits_pretty_json() {
        let now = Instant::now();
        let mut state = booted(now);
        let cmd = update(&mut state, ExplorerMsg::CopyRecord(RowId::from("A2")), now);
        let ExplorerCmd::Emit(text) = cmd else {
            panic!("expected Emit, got {cmd:?}");
        };
        assert!(text.contains("\"asset_id\": \"A2\""));
        assert_eq!(state.clipboard.as_deref(), Some(text.as_str()));
    }

    #[test]
    fn operations_on_unloaded_tab_only_notify() {
        let now = Instant::now();
        let (mut state, cmd) = AppState::init(&Config::default(), now).unwrap();
        let first = fetches(cmd).remove(0);
        update(
            &mut state,
            ExplorerMsg::FetchCompleted {
                ticket: first.ticket,
                outcome: Err(CexError::transport("/x", Some(503), "down")),
            },
            now,
        );
        let cmd = update(
            &mut state,
            ExplorerMsg::Sort {
                column: 1,
                direction: None,
            },
            now,
        );
        assert_eq!(cmd, ExplorerCmd::None);
        assert_eq!(state.state_errors, 0);
        assert!(state.notices.iter().any(|n| n.message.contains("not loaded")));

        // Manual refresh retries the failed mount.
        let requests = fetches(update(&mut state, ExplorerMsg::Refresh { bust_cache: false }, now));
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].ticket.purpose, crate::grid::controller::FetchPurpose::Mount);
    }

    #[test]
    fn invalid_column_is_reported_not_fatal() {
        let now = Instant::now();
        let mut state = booted(now);
        let cmd = update(
            &mut state,
            ExplorerMsg::Filter {
                column: 99,
                text: "x".to_string(),
            },
            now,
        );
        assert_eq!(cmd, ExplorerCmd::None);
        assert!(state.notices.iter().any(|n| n.message.contains("CEX-2003")));
    }

    #[test]
    fn sort_without_direction_flips_current_column() {
        let now = Instant::now();
        let mut state = booted(now);
        // Assets default: column 0 descending.
        let requests = fetches(update(
            &mut state,
            ExplorerMsg::Sort {
                column: 0,
                direction: None,
            },
            now,
        ));
        assert_eq!(requests[0].query.order_dir, SortDirection::Asc);
    }

    #[test]
    fn quit_sets_flag() {
        let now = Instant::now();
        let mut state = booted(now);
        assert_eq!(update(&mut state, ExplorerMsg::Quit, now), ExplorerCmd::Quit);
        assert!(state.quit);
    }
}
