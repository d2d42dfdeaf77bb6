//! Grid engine: remote queries, row identity, snapshots, lookups, and the
//! controller, coordinator, and mount scheduler that tie them together.

pub mod controller;
pub mod coordinator;
pub mod debounce;
pub mod entity;
pub mod identity;
pub mod lookup;
pub mod mount;
pub mod query;
pub mod registry;
pub mod snapshot;
pub mod transport;
pub mod view;

#[cfg(test)]
mod test_properties;
