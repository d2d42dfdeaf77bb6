//! Refresh Coordinator.
//!
//! Owns the single refresh timer and at most one [`RefreshCycle`]. A cycle
//! refreshes every mounted grid once and completes when each has settled.
//! Triggers that arrive while a cycle is active are ignored and counted, never
//! queued.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::grid::entity::EntityKind;

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Timer,
}

/// One in-flight refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshCycle {
    pub id: u64,
    pub trigger: Trigger,
    pub requested_at: Instant,
    pub grids: BTreeSet<EntityKind>,
    /// Grids that have not settled yet.
    pub pending: BTreeSet<EntityKind>,
    pub bust_cache: bool,
}

impl RefreshCycle {
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Result of a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A cycle started; refresh each listed grid.
    Started { cycle: u64, grids: Vec<EntityKind> },
    /// A cycle is already running; nothing was started.
    AlreadyRunning,
}

/// Summary emitted when a cycle completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub trigger: Trigger,
    pub grids: Vec<EntityKind>,
    pub elapsed_ms: u128,
    pub completed_at: DateTime<Utc>,
}

/// Process-wide refresh timer and cycle tracker.
#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    interval: Option<Duration>,
    next_due: Option<Instant>,
    active: Option<RefreshCycle>,
    last_refreshed_at: Option<Instant>,
    last_report: Option<CycleReport>,
    next_cycle: u64,
    cycles_completed: u64,
    ignored_triggers: u64,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the repeating timer. `None` disarms it.
    pub fn schedule(&mut self, interval: Option<Duration>, now: Instant) {
        self.interval = interval.filter(|d| !d.is_zero());
        self.next_due = self.interval.map(|d| now + d);
        debug!(interval_ms = ?self.interval.map(|d| d.as_millis()), "refresh timer armed");
    }

    /// Disarm the timer and forget any active cycle.
    pub fn stop(&mut self) {
        self.interval = None;
        self.next_due = None;
        self.active = None;
    }

    #[must_use]
    pub const fn interval(&self) -> Option<Duration> {
        self.interval
    }

    #[must_use]
    pub const fn next_deadline(&self) -> Option<Instant> {
        self.next_due
    }

    #[must_use]
    pub const fn active(&self) -> Option<&RefreshCycle> {
        self.active.as_ref()
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub const fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    #[must_use]
    pub const fn ignored_triggers(&self) -> u64 {
        self.ignored_triggers
    }

    #[must_use]
    pub const fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    #[must_use]
    pub const fn last_refreshed_at(&self) -> Option<Instant> {
        self.last_refreshed_at
    }

    /// Start a manual cycle over `mounted`, unless one is already running.
    pub fn trigger_now(
        &mut self,
        bust_cache: bool,
        mounted: &[EntityKind],
        now: Instant,
    ) -> TriggerOutcome {
        self.start(Trigger::Manual, bust_cache, mounted, now)
    }

    /// Fire the timer if due. The timer re-arms from `now` whether or not a
    /// cycle starts.
    pub fn on_timer(&mut self, mounted: &[EntityKind], now: Instant) -> Option<TriggerOutcome> {
        let due = self.next_due?;
        if now < due {
            return None;
        }
        self.next_due = self.interval.map(|d| now + d);
        Some(self.start(Trigger::Timer, false, mounted, now))
    }

    fn start(
        &mut self,
        trigger: Trigger,
        bust_cache: bool,
        mounted: &[EntityKind],
        now: Instant,
    ) -> TriggerOutcome {
        if let Some(active) = &self.active {
            self.ignored_triggers += 1;
            debug!(cycle = active.id, ?trigger, pending = active.pending_count(), "trigger ignored; cycle in flight");
            return TriggerOutcome::AlreadyRunning;
        }
        self.next_cycle += 1;
        let grids: BTreeSet<EntityKind> = mounted.iter().copied().collect();
        let cycle = RefreshCycle {
            id: self.next_cycle,
            trigger,
            requested_at: now,
            pending: grids.clone(),
            grids: grids.clone(),
            bust_cache,
        };
        debug!(cycle = cycle.id, ?trigger, grids = grids.len(), bust_cache, "refresh cycle started");
        let id = cycle.id;
        self.active = Some(cycle);
        if grids.is_empty() {
            self.finish(now);
        }
        TriggerOutcome::Started {
            cycle: id,
            grids: grids.into_iter().collect(),
        }
    }

    /// Mark one grid as settled (fetch applied, degraded, collapsed, or
    /// unmounted). Returns a report when this completes the cycle.
    pub fn grid_settled(&mut self, entity: EntityKind, now: Instant) -> Option<CycleReport> {
        let active = self.active.as_mut()?;
        if !active.pending.remove(&entity) || !active.pending.is_empty() {
            return None;
        }
        self.finish(now)
    }

    fn finish(&mut self, now: Instant) -> Option<CycleReport> {
        let cycle = self.active.take()?;
        self.cycles_completed += 1;
        // A cycle with no grids refreshed nothing.
        if !cycle.grids.is_empty() {
            self.last_refreshed_at = Some(now);
        }
        let report = CycleReport {
            cycle: cycle.id,
            trigger: cycle.trigger,
            grids: cycle.grids.into_iter().collect(),
            elapsed_ms: now.saturating_duration_since(cycle.requested_at).as_millis(),
            completed_at: Utc::now(),
        };
        info!(
            cycle = report.cycle,
            trigger = ?report.trigger,
            grids = report.grids.len(),
            elapsed_ms = report.elapsed_ms,
            "refresh cycle complete"
        );
        self.last_report = Some(report.clone());
        Some(report)
    }

    /// Human-readable status, recomputed on the fast status tick.
    #[must_use]
    pub fn status_line(&self, now: Instant) -> String {
        if let Some(active) = &self.active {
            return format!(
                "refreshing ({} of {} pending)",
                active.pending_count(),
                active.grids.len()
            );
        }
        match self.last_refreshed_at {
            Some(at) => format!("updated {}s ago", now.saturating_duration_since(at).as_secs()),
            None => "not refreshed yet".to_string(),
        }
    }
}
