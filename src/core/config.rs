//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CexError, Result};
use crate::grid::entity::EntityKind;

/// Full explorer configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub endpoints: EndpointsConfig,
    pub refresh: RefreshConfig,
    pub grids: GridsConfig,
    pub logging: LoggingConfig,
    /// Path the config was loaded from (not serialized).
    #[serde(skip)]
    pub config_file: PathBuf,
}

/// Remote query server connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    /// Bearer token sent with every request. Empty means anonymous.
    pub api_key: String,
    pub verify_tls: bool,
    pub timeout_secs: u64,
    /// Case whose entities the grids show. Required for case-scoped endpoints.
    pub case_id: Option<u64>,
}

/// Endpoint path templates. `{case}` and `{entity}` are substituted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointsConfig {
    pub grid: String,
    pub feed: String,
    pub lookups: String,
    pub counts: String,
}

/// Refresh timer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RefreshConfig {
    /// Seconds between automatic refresh cycles. 0 disables the timer.
    pub interval_secs: u64,
    /// Cadence of the "updated Ns ago" status recomputation.
    pub status_tick_ms: u64,
}

/// Grid defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GridsConfig {
    pub page_size: usize,
    pub filter_debounce_ms: u64,
    /// Tab mounted eagerly at startup; every other enabled tab is deferred.
    pub initial_tab: String,
    pub enabled: Vec<String>,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub ansi: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:4443".to_string(),
            api_key: String::new(),
            verify_tls: false,
            timeout_secs: 30,
            case_id: None,
        }
    }
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            grid: "/api/dt/case/{case}/{entity}".to_string(),
            feed: "/api/dt/shadowserver".to_string(),
            lookups: "/api/lookups".to_string(),
            counts: "/api/case/{case}/counts".to_string(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            status_tick_ms: 1_000,
        }
    }
}

impl Default for GridsConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            filter_debounce_ms: 300,
            initial_tab: EntityKind::Assets.key().to_string(),
            enabled: EntityKind::ALL.iter().map(|k| k.key().to_string()).collect(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl RefreshConfig {
    /// Refresh interval, or `None` when the timer is disabled.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }

    #[must_use]
    pub fn status_tick(&self) -> Duration {
        Duration::from_millis(self.status_tick_ms)
    }
}

impl GridsConfig {
    #[must_use]
    pub fn filter_debounce(&self) -> Duration {
        Duration::from_millis(self.filter_debounce_ms)
    }

    /// Parsed initial tab. Falls back to the first enabled kind on a bad key.
    #[must_use]
    pub fn initial_kind(&self) -> EntityKind {
        EntityKind::from_key(&self.initial_tab)
            .or_else(|| self.enabled_kinds().first().copied())
            .unwrap_or(EntityKind::Assets)
    }

    /// Enabled kinds in tab order, unknown keys ignored.
    #[must_use]
    pub fn enabled_kinds(&self) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|kind| {
                self.enabled
                    .iter()
                    .any(|k| EntityKind::from_key(k) == Some(*kind))
            })
            .collect()
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                tracing::warn!("HOME not set, falling back to /tmp for config path");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        home_dir.join(".config").join("cexp").join("config.toml")
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| CexError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(CexError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON so the value is stable across processes.
    /// The API key is excluded.
    pub fn stable_hash(&self) -> Result<String> {
        let mut redacted = self.clone();
        redacted.server.api_key.clear();
        let canonical = serde_json::to_string(&redacted)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // server
        if let Some(raw) = lookup("CEX_SERVER_BASE_URL") {
            self.server.base_url = raw;
        }
        if let Some(raw) = lookup("CEX_SERVER_API_KEY") {
            self.server.api_key = raw;
        }
        if let Some(raw) = lookup("CEX_SERVER_VERIFY_TLS") {
            self.server.verify_tls = parse_env_bool("CEX_SERVER_VERIFY_TLS", &raw)?;
        }
        if let Some(raw) = lookup("CEX_SERVER_TIMEOUT_SECS") {
            self.server.timeout_secs = parse_env_u64("CEX_SERVER_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("CEX_SERVER_CASE_ID") {
            self.server.case_id = Some(parse_env_u64("CEX_SERVER_CASE_ID", &raw)?);
        }

        // refresh
        if let Some(raw) = lookup("CEX_REFRESH_INTERVAL_SECS") {
            self.refresh.interval_secs = parse_env_u64("CEX_REFRESH_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("CEX_REFRESH_STATUS_TICK_MS") {
            self.refresh.status_tick_ms = parse_env_u64("CEX_REFRESH_STATUS_TICK_MS", &raw)?;
        }

        // grids
        if let Some(raw) = lookup("CEX_GRIDS_PAGE_SIZE") {
            self.grids.page_size = parse_env_usize("CEX_GRIDS_PAGE_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("CEX_GRIDS_FILTER_DEBOUNCE_MS") {
            self.grids.filter_debounce_ms = parse_env_u64("CEX_GRIDS_FILTER_DEBOUNCE_MS", &raw)?;
        }
        if let Some(raw) = lookup("CEX_GRIDS_INITIAL_TAB") {
            self.grids.initial_tab = raw;
        }

        // logging
        if let Some(raw) = lookup("CEX_LOGGING_LEVEL") {
            self.logging.level = raw;
        }

        Ok(())
    }

    /// Normalize values for consistent comparison.
    fn normalize(&mut self) {
        let trimmed = self.server.base_url.trim().trim_end_matches('/');
        self.server.base_url = trimmed.to_string();
        self.grids.initial_tab = self.grids.initial_tab.trim().to_ascii_lowercase();
        for key in &mut self.grids.enabled {
            *key = key.trim().to_ascii_lowercase();
        }
    }

    fn validate(&self) -> Result<()> {
        let base = &self.server.base_url;
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(CexError::InvalidConfig {
                details: format!("server.base_url must be an http(s) URL, got {base:?}"),
            });
        }
        if self.server.timeout_secs == 0 {
            return Err(CexError::InvalidConfig {
                details: "server.timeout_secs must be > 0".to_string(),
            });
        }

        for (name, template) in [
            ("grid", &self.endpoints.grid),
            ("feed", &self.endpoints.feed),
            ("lookups", &self.endpoints.lookups),
            ("counts", &self.endpoints.counts),
        ] {
            if !template.starts_with('/') {
                return Err(CexError::InvalidConfig {
                    details: format!("endpoints.{name} must start with '/', got {template:?}"),
                });
            }
        }
        if !self.endpoints.grid.contains("{entity}") {
            return Err(CexError::InvalidConfig {
                details: "endpoints.grid must contain the {entity} placeholder".to_string(),
            });
        }

        if self.refresh.status_tick_ms == 0 {
            return Err(CexError::InvalidConfig {
                details: "refresh.status_tick_ms must be > 0".to_string(),
            });
        }

        if !(1..=1_000).contains(&self.grids.page_size) {
            return Err(CexError::InvalidConfig {
                details: format!(
                    "grids.page_size must be in [1, 1000], got {}",
                    self.grids.page_size
                ),
            });
        }
        if self.grids.filter_debounce_ms > 10_000 {
            return Err(CexError::InvalidConfig {
                details: format!(
                    "grids.filter_debounce_ms must be <= 10000, got {}",
                    self.grids.filter_debounce_ms
                ),
            });
        }

        for key in &self.grids.enabled {
            EntityKind::from_key(key).ok_or_else(|| CexError::InvalidConfig {
                details: format!("grids.enabled contains unknown entity {key:?}"),
            })?;
        }
        let initial =
            EntityKind::from_key(&self.grids.initial_tab).ok_or_else(|| {
                CexError::InvalidConfig {
                    details: format!(
                        "grids.initial_tab {:?} is not an entity kind",
                        self.grids.initial_tab
                    ),
                }
            })?;
        if !self.grids.enabled_kinds().contains(&initial) {
            return Err(CexError::InvalidConfig {
                details: format!("grids.initial_tab {initial} is not enabled"),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|error| CexError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn parse_env_usize(name: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|error| CexError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CexError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: expected a boolean"),
        }),
    }
}
