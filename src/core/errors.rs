//! CEX-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, CexError>;

/// Top-level error type for the case explorer engine.
#[derive(Debug, Error)]
pub enum CexError {
    #[error("[CEX-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CEX-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CEX-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CEX-2001] transport failure for {endpoint}{}: {details}", status_suffix(.status))]
    Transport {
        endpoint: String,
        status: Option<u16>,
        details: String,
    },

    #[error("[CEX-2002] malformed response from {endpoint}: {details}")]
    Protocol { endpoint: String, details: String },

    #[error("[CEX-2003] invalid query for {entity}: {details}")]
    InvalidQuery {
        entity: &'static str,
        details: String,
    },

    #[error("[CEX-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[CEX-3001] {operation} is not valid for grid {entity} while {phase}")]
    State {
        entity: &'static str,
        operation: &'static str,
        phase: &'static str,
    },

    #[error("[CEX-3002] unknown entity kind {key:?}")]
    UnknownEntity { key: String },

    #[error("[CEX-3003] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CEX-3004] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[CEX-3005] runtime failure: {details}")]
    Runtime { details: String },
}

#[allow(clippy::ref_option)]
fn status_suffix(status: &Option<u16>) -> String {
    status.map_or_else(String::new, |code| format!(" (HTTP {code})"))
}

impl CexError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CEX-1001",
            Self::MissingConfig { .. } => "CEX-1002",
            Self::ConfigParse { .. } => "CEX-1003",
            Self::Transport { .. } => "CEX-2001",
            Self::Protocol { .. } => "CEX-2002",
            Self::InvalidQuery { .. } => "CEX-2003",
            Self::Serialization { .. } => "CEX-2101",
            Self::State { .. } => "CEX-3001",
            Self::UnknownEntity { .. } => "CEX-3002",
            Self::Io { .. } => "CEX-3003",
            Self::ChannelClosed { .. } => "CEX-3004",
            Self::Runtime { .. } => "CEX-3005",
        }
    }

    /// Whether a later attempt might succeed (the next scheduled refresh is the retry).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Transport/protocol failures degrade a grid instead of failing the caller.
    #[must_use]
    pub const fn is_degradation(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Protocol { .. })
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for malformed-envelope errors.
    #[must_use]
    pub fn protocol(endpoint: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Protocol {
            endpoint: endpoint.into(),
            details: details.into(),
        }
    }

    /// Convenience constructor for network / HTTP status failures.
    #[must_use]
    pub fn transport(
        endpoint: impl Into<String>,
        status: Option<u16>,
        details: impl Into<String>,
    ) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            status,
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for CexError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for CexError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
