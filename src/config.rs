use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Runtime settings for the attendance core.
///
/// Resolution order: built-in defaults, then an optional JSON file (`ROLLCALL_CONFIG`),
/// then individual `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollcallConfig {
    /// How long `SessionStore::initialize` waits for the current identity before giving up.
    pub init_timeout_ms: u64,
    /// Repeat detections of the same code inside this window are dropped.
    pub scan_cooldown_ms: u64,
    /// How long `subscribe` waits for the first channel status.
    pub subscribe_timeout_ms: u64,
    /// Fallback tracing filter when RUST_LOG is unset.
    pub log_filter: String,
    /// Seed file for the in-process backend used by the runner binary.
    pub seed_path: Option<PathBuf>,
}

impl Default for RollcallConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: 3_000,
            scan_cooldown_ms: 2_000,
            subscribe_timeout_ms: 10_000,
            log_filter: "info".to_string(),
            seed_path: None,
        }
    }
}

impl RollcallConfig {
    pub fn init_timeout(&self) -> Duration { Duration::from_millis(self.init_timeout_ms) }
    pub fn scan_cooldown(&self) -> Duration { Duration::from_millis(self.scan_cooldown_ms) }
    pub fn subscribe_timeout(&self) -> Duration { Duration::from_millis(self.subscribe_timeout_ms) }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Resolve using an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match lookup("ROLLCALL_CONFIG") {
            Some(path) => Self::from_json_file(Path::new(&path)).unwrap_or_else(|e| {
                warn!(target: "startup", "Ignoring config file '{}': {}", path, e);
                Self::default()
            }),
            None => Self::default(),
        };
        override_u64(&lookup, "ROLLCALL_INIT_TIMEOUT_MS", &mut cfg.init_timeout_ms);
        override_u64(&lookup, "ROLLCALL_SCAN_COOLDOWN_MS", &mut cfg.scan_cooldown_ms);
        override_u64(&lookup, "ROLLCALL_SUBSCRIBE_TIMEOUT_MS", &mut cfg.subscribe_timeout_ms);
        if let Some(f) = lookup("ROLLCALL_LOG").filter(|s| !s.trim().is_empty()) { cfg.log_filter = f; }
        if let Some(p) = lookup("ROLLCALL_SEED").filter(|s| !s.trim().is_empty()) { cfg.seed_path = Some(PathBuf::from(p)); }
        cfg
    }
}

fn override_u64<F>(lookup: &F, key: &str, slot: &mut u64)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<u64>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(target: "startup", "{}='{}' is not a number; keeping {}", key, raw, slot),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
