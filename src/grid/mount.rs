//! Deferred Mount Scheduler.
//!
//! Tabs other than the initial one register a mount closure here. The first
//! activation runs it; later activations are no-ops.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::debug;

use crate::grid::entity::EntityKind;

type MountFn<C, R> = Box<dyn FnOnce(&mut C) -> R + Send>;

/// Pending mount closures keyed by entity. `C` is the context the closure
/// mounts into; `R` is whatever the mount produces.
pub struct DeferredMountScheduler<C, R> {
    pending: BTreeMap<EntityKind, MountFn<C, R>>,
    activated: BTreeSet<EntityKind>,
}

impl<C, R> Default for DeferredMountScheduler<C, R> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            activated: BTreeSet::new(),
        }
    }
}

impl<C, R> fmt::Debug for DeferredMountScheduler<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredMountScheduler")
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("activated", &self.activated)
            .finish()
    }
}

impl<C, R> DeferredMountScheduler<C, R> {
    /// Empty scheduler with nothing registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a mount closure. Ignored if `entity` was already registered or activated.
    pub fn register_deferred<F>(&mut self, entity: EntityKind, mount: F) -> bool
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
    {
        if self.activated.contains(&entity) || self.pending.contains_key(&entity) {
            return false;
        }
        self.pending.insert(entity, Box::new(mount));
        true
    }

    /// Run the pending closure for `entity` exactly once.
    pub fn activate(&mut self, entity: EntityKind, ctx: &mut C) -> Option<R> {
        let mount = self.pending.remove(&entity)?;
        self.activated.insert(entity);
        debug!(%entity, "deferred mount activated");
        Some(mount(ctx))
    }

    /// Mark an eagerly mounted entity so a later registration is ignored.
    pub fn mark_activated(&mut self, entity: EntityKind) {
        self.pending.remove(&entity);
        self.activated.insert(entity);
    }

    /// Registered and not yet activated.
    #[must_use]
    pub fn is_pending(&self, entity: EntityKind) -> bool {
        self.pending.contains_key(&entity)
    }

    /// Activated, either eagerly or through [`Self::activate`].
    #[must_use]
    pub fn is_activated(&self, entity: EntityKind) -> bool {
        self.activated.contains(&entity)
    }

    /// Entities still waiting for their first activation.
    pub fn pending(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.pending.keys().copied()
    }

    /// Drop all closures and activation history.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.activated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_runs_once() {
        let mut sched: DeferredMountScheduler<Vec<EntityKind>, usize> = DeferredMountScheduler::new();
        assert!(sched.register_deferred(EntityKind::Iocs, |log| {
            log.push(EntityKind::Iocs);
            log.len()
        }));
        let mut log = Vec::new();
        assert_eq!(sched.activate(EntityKind::Iocs, &mut log), Some(1));
        assert_eq!(sched.activate(EntityKind::Iocs, &mut log), None);
        assert_eq!(log, vec![EntityKind::Iocs]);
        assert!(sched.is_activated(EntityKind::Iocs));
        assert!(!sched.is_pending(EntityKind::Iocs));
    }

    #[test]
    fn unregistered_activation_is_noop() {
        let mut sched: DeferredMountScheduler<u32, ()> = DeferredMountScheduler::new();
        let mut ctx = 0;
        assert!(sched.activate(EntityKind::Notes, &mut ctx).is_none());
    }

    #[test]
    fn eager_mount_blocks_registration() {
        let mut sched: DeferredMountScheduler<u32, ()> = DeferredMountScheduler::new();
        sched.mark_activated(EntityKind::Assets);
        assert!(!sched.register_deferred(EntityKind::Assets, |_| ()));
        assert!(sched.register_deferred(EntityKind::Tasks, |_| ()));
        assert!(!sched.register_deferred(EntityKind::Tasks, |_| ()));
        assert_eq!(sched.pending().collect::<Vec<_>>(), vec![EntityKind::Tasks]);
    }
}
