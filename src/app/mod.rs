//! Explorer session: state, pure update step, operator input, text rendering,
//! and the threaded runtime that executes fetches.

pub mod input;
pub mod model;
pub mod render;
pub mod runtime;
pub mod update;
