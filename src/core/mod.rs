//! Core types: errors, configuration, logging.

pub mod config;
pub mod errors;
pub mod logging;
