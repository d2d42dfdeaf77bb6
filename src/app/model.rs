//! Process-wide explorer state, messages, and commands.
//!
//! [`AppState`] is built by [`AppState::init`] and torn down explicitly with
//! [`AppState::teardown`]. Nothing here is global: every test constructs its
//! own state. Effects are described as [`ExplorerCmd`] values and executed by
//! the runtime.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::grid::controller::{FetchRequest, FetchTicket, GridController, GridPhase};
use crate::grid::coordinator::RefreshCoordinator;
use crate::grid::entity::{EntityKind, SortDirection};
use crate::grid::identity::RowId;
use crate::grid::lookup::{LookupCache, LookupTable};
use crate::grid::mount::DeferredMountScheduler;
use crate::grid::query::QueryResponse;
use crate::grid::registry::GridRegistry;

/// Max notices kept; the oldest is evicted first.
pub const MAX_NOTICES: usize = 3;

// ──────────────────── notices ────────────────────

/// Non-blocking status indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

// ──────────────────── messages ────────────────────

/// Page navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMove {
    Next,
    Prev,
    /// Zero-based page.
    Goto(usize),
}

/// Every input to [`crate::app::update::update`].
#[derive(Debug)]
pub enum ExplorerMsg {
    /// Timer wake-up: due filter timers, the refresh interval, the status line.
    Tick,
    SwitchTab(EntityKind),
    /// Manual refresh of every mounted grid.
    Refresh { bust_cache: bool },
    /// `None` flips the direction on the current sort column, else sorts ascending.
    Sort {
        column: usize,
        direction: Option<SortDirection>,
    },
    Filter { column: usize, text: String },
    Search(String),
    Page(PageMove),
    /// Extra form parameter on the active grid (empty value clears it).
    Extra { key: String, value: String },
    Expand(RowId),
    Collapse(RowId),
    Toggle(RowId),
    CopyRecord(RowId),
    RefreshLookups,
    FetchCompleted {
        ticket: FetchTicket,
        outcome: Result<QueryResponse>,
    },
    LookupsLoaded(Result<LookupTable>),
    CountsLoaded(Result<BTreeMap<EntityKind, u64>>),
    Quit,
}

// ──────────────────── commands ────────────────────

/// Side-effects for the runtime. `update` never performs I/O itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExplorerCmd {
    None,
    Fetch(FetchRequest),
    FetchLookups,
    FetchCounts,
    /// Text for the operator (copied record).
    Emit(String),
    Quit,
    Batch(Vec<Self>),
}

impl ExplorerCmd {
    /// Collapse a list into the smallest equivalent command.
    #[must_use]
    pub fn batch(mut cmds: Vec<Self>) -> Self {
        cmds.retain(|c| *c != Self::None);
        match cmds.len() {
            0 => Self::None,
            1 => cmds.pop().unwrap_or(Self::None),
            _ => Self::Batch(cmds),
        }
    }

    /// Flatten nested batches in execution order.
    #[must_use]
    pub fn flatten(self) -> Vec<Self> {
        match self {
            Self::None => Vec::new(),
            Self::Batch(cmds) => cmds.into_iter().flat_map(Self::flatten).collect(),
            other => vec![other],
        }
    }
}

// ──────────────────── state ────────────────────

pub(crate) type MountOutcome = Result<FetchRequest>;

/// Everything the explorer session owns.
#[derive(Debug)]
pub struct AppState {
    pub active_tab: EntityKind,
    pub grids: GridRegistry,
    pub lookups: LookupCache,
    pub coordinator: RefreshCoordinator,
    pub(crate) mounts: DeferredMountScheduler<GridRegistry, MountOutcome>,
    /// Badge counts per entity, independent of mounts.
    pub counts: BTreeMap<EntityKind, u64>,
    pub notices: Vec<Notice>,
    next_notice_id: u64,
    /// "updated Ns ago" line, recomputed on every tick.
    pub status: String,
    /// Last copied record.
    pub clipboard: Option<String>,
    pub quit: bool,
    /// Caller bugs caught in release builds.
    pub state_errors: u64,
    pub status_tick: Duration,
    /// Set by the lookup cache's change callback; consumed by the update loop.
    pub(crate) labels_dirty: Arc<AtomicU64>,
}

impl AppState {
    /// Build the session: mount the initial tab, defer the rest, arm the
    /// refresh timer, and request lookups and counts.
    pub fn init(config: &Config, now: Instant) -> Result<(Self, ExplorerCmd)> {
        let kinds = config.grids.enabled_kinds();
        let initial = config.grids.initial_kind();
        let mut grids = GridRegistry::new(
            &kinds,
            config.grids.page_size,
            config.grids.filter_debounce(),
        );

        let labels_dirty = Arc::new(AtomicU64::new(0));
        let mut lookups = LookupCache::new();
        let flag = Arc::clone(&labels_dirty);
        lookups.on_change(move |generation| flag.store(generation, Ordering::Release));

        let mut mounts: DeferredMountScheduler<GridRegistry, MountOutcome> =
            DeferredMountScheduler::new();
        mounts.mark_activated(initial);
        for &kind in kinds.iter().filter(|&&k| k != initial) {
            mounts.register_deferred(kind, move |registry: &mut GridRegistry| {
                registry.get_mut(kind)?.mount()
            });
        }
        let first = grids.get_mut(initial)?.mount()?;

        let mut coordinator = RefreshCoordinator::new();
        coordinator.schedule(config.refresh.interval(), now);

        info!(
            initial = %initial,
            deferred = kinds.len().saturating_sub(1),
            interval_secs = config.refresh.interval_secs,
            "explorer session initialised"
        );

        let state = Self {
            active_tab: initial,
            grids,
            lookups,
            coordinator,
            mounts,
            counts: BTreeMap::new(),
            notices: Vec::new(),
            next_notice_id: 0,
            status: "loading".to_string(),
            clipboard: None,
            quit: false,
            state_errors: 0,
            status_tick: config.refresh.status_tick(),
            labels_dirty,
        };
        let cmd = ExplorerCmd::batch(vec![
            ExplorerCmd::Fetch(first),
            ExplorerCmd::FetchLookups,
            ExplorerCmd::FetchCounts,
        ]);
        Ok((state, cmd))
    }

    /// Unmount every grid, stop the timer, and drop cached labels.
    pub fn teardown(&mut self) {
        let kinds: Vec<EntityKind> = self.grids.kinds().collect();
        for kind in kinds {
            if let Ok(grid) = self.grids.get_mut(kind)
                && grid.phase() != GridPhase::Unmounted
            {
                let _ = grid.unmount();
            }
        }
        self.coordinator.stop();
        self.lookups.clear();
        self.mounts.clear();
        self.notices.clear();
        info!("explorer session torn down");
    }

    /// Controller for the visible tab.
    pub fn active_grid(&self) -> Result<&GridController> {
        self.grids.get(self.active_tab)
    }

    /// Push a notice, evicting the oldest past [`MAX_NOTICES`].
    pub fn push_notice(&mut self, level: NoticeLevel, message: impl Into<String>) -> u64 {
        let id = self.next_notice_id;
        self.next_notice_id += 1;
        self.notices.push(Notice {
            id,
            level,
            message: message.into(),
        });
        while self.notices.len() > MAX_NOTICES {
            self.notices.remove(0);
        }
        id
    }

    /// Whether a tab still waits for its first activation.
    #[must_use]
    pub fn is_deferred(&self, kind: EntityKind) -> bool {
        self.mounts.is_pending(kind)
    }

    /// Earliest instant the runtime must wake for.
    #[must_use]
    pub fn next_wake(&self, now: Instant) -> Instant {
        [
            self.coordinator.next_deadline(),
            self.grids.next_filter_deadline(),
            Some(now + self.status_tick),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(now + self.status_tick)
    }
}
