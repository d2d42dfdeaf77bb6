//! Tracing subscriber setup and log-safe helpers.

use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use crate::core::config::LoggingConfig;

/// Env var holding a full `EnvFilter` directive; wins over the configured level.
pub const LOG_ENV: &str = "CEX_LOG";

/// Build the filter from `CEX_LOG`, then `RUST_LOG`, then the configured level.
#[must_use]
pub fn build_filter(config: &LoggingConfig, verbose: bool) -> EnvFilter {
    if let Ok(directive) = std::env::var(LOG_ENV)
        && let Ok(filter) = EnvFilter::try_new(&directive)
    {
        return filter;
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_new(format!("case_explorer={level},cexp={level}"))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global stderr subscriber. A second call is a no-op.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(config, verbose))
        .with_ansi(config.ansi)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Short, non-reversible fingerprint of a secret for log lines.
///
/// Empty secrets render as `anonymous`.
#[must_use]
pub fn fingerprint(secret: &str) -> String {
    if secret.is_empty() {
        return "anonymous".to_string();
    }
    let digest = Sha256::digest(secret.as_bytes());
    let mut hex = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
