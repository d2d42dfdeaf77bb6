//! Mounted-grids registry: one controller per enabled entity.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::errors::{CexError, Result};
use crate::grid::controller::{FetchRequest, GridController};
use crate::grid::debounce::FilterDebouncer;
use crate::grid::entity::EntityKind;
use crate::grid::lookup::LookupCache;

/// Fetches and per-grid failures from one pass over the filter timers.
#[derive(Debug, Default)]
pub struct FilterPoll {
    pub requests: Vec<FetchRequest>,
    pub errors: Vec<CexError>,
}

/// Owns every grid controller for the session.
#[derive(Debug)]
pub struct GridRegistry {
    grids: BTreeMap<EntityKind, GridController>,
}

impl GridRegistry {
    /// Create an unmounted controller for each kind.
    #[must_use]
    pub fn new(kinds: &[EntityKind], page_size: usize, filter_debounce: Duration) -> Self {
        let grids = kinds
            .iter()
            .map(|&kind| {
                (
                    kind,
                    GridController::new(kind, page_size, FilterDebouncer::new(filter_debounce)),
                )
            })
            .collect();
        Self { grids }
    }

    /// # Errors
    /// `UnknownEntity` when the grid is not enabled.
    pub fn get(&self, kind: EntityKind) -> Result<&GridController> {
        self.grids.get(&kind).ok_or_else(|| not_enabled(kind))
    }

    /// # Errors
    /// `UnknownEntity` when the grid is not enabled.
    pub fn get_mut(&mut self, kind: EntityKind) -> Result<&mut GridController> {
        self.grids.get_mut(&kind).ok_or_else(|| not_enabled(kind))
    }

    #[must_use]
    pub fn contains(&self, kind: EntityKind) -> bool {
        self.grids.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.grids.keys().copied()
    }

    /// Grids with rows on screen (mounted or refreshing).
    #[must_use]
    pub fn mounted(&self) -> Vec<EntityKind> {
        self.grids
            .iter()
            .filter(|(_, g)| g.phase().is_mounted())
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityKind, &GridController)> {
        self.grids.iter()
    }

    /// Earliest filter debounce deadline across all grids.
    #[must_use]
    pub fn next_filter_deadline(&self) -> Option<Instant> {
        self.grids
            .values()
            .filter_map(|g| g.debouncer().next_deadline())
            .min()
    }

    /// Apply expired filter timers on every grid. A failing grid does not
    /// hold back the requests of the others.
    pub fn poll_filters(&mut self, now: Instant) -> FilterPoll {
        let mut poll = FilterPoll::default();
        for grid in self.grids.values_mut() {
            match grid.poll_filters(now) {
                Ok(Some(request)) => poll.requests.push(request),
                Ok(None) => {}
                Err(err) => poll.errors.push(err),
            }
        }
        poll
    }

    /// Re-project label cells on every mounted grid. Returns cells changed.
    pub fn relabel_all(&mut self, lookups: &LookupCache) -> usize {
        self.grids
            .values_mut()
            .filter(|g| g.phase().is_mounted())
            .map(|g| g.relabel(lookups))
            .sum()
    }
}

fn not_enabled(kind: EntityKind) -> CexError {
    CexError::UnknownEntity {
        key: format!("{kind} (not enabled)"),
    }
}
