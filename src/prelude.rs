//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use case_explorer::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{CexError, Result};

// Grid engine
pub use crate::grid::controller::{
    Completion, CompletionOutcome, FetchPurpose, FetchRequest, FetchTicket, GridController,
    GridPhase, GridState,
};
pub use crate::grid::coordinator::{RefreshCoordinator, Trigger, TriggerOutcome};
pub use crate::grid::entity::{EntityKind, SortDirection};
pub use crate::grid::identity::{IdentitySource, RowId};
pub use crate::grid::lookup::{LookupCache, LookupTable};
pub use crate::grid::query::{QueryRequest, QueryResponse, QueryTransport};
pub use crate::grid::transport::ScriptedTransport;
#[cfg(feature = "http")]
pub use crate::grid::transport::HttpTransport;

// Session
pub use crate::app::model::{AppState, ExplorerCmd, ExplorerMsg};
pub use crate::app::runtime::{ExplorerRuntime, RuntimeOptions};
pub use crate::app::update::update;
