#![forbid(unsafe_code)]

//! Case explorer: a state-preserving refresh and reconciliation engine for
//! paginated, sortable, filterable case-record grids backed by a remote query
//! server.
//!
//! Layers:
//! 1. **Grid engine** ([`grid`]): query building, row identity, snapshots,
//!    lookup labels, and a per-grid controller that reconciles refreshes with
//!    expansion, paging, sorting, and filters
//! 2. **Session** ([`app`]): the explorer state, a pure update step, and a
//!    threaded runtime that runs fetches off the main loop
//!
//! # Library usage
//!
//! ```rust,no_run
//! use case_explorer::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use case_explorer::core::config::Config;
//! use case_explorer::grid::controller::GridController;
//! ```

pub mod prelude;

pub mod app;
pub mod core;
pub mod grid;
