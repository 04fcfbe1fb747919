use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Top-level Ocean configuration, parsed from `ocean.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OceanConfig {
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Path to the database file
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Lock TTL granted per acquire; a crashed instance's lock expires
    /// after this and the run becomes stealable
    #[serde(default = "default_lock_ms")]
    pub lock_ms: i64,
    /// Default `max_attempts` for runs created without an explicit retry policy
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Round cap for the `drain` helper
    #[serde(default = "default_drain_max_rounds")]
    pub drain_max_rounds: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ms: default_lock_ms(),
            default_max_attempts: default_max_attempts(),
            drain_max_rounds: default_drain_max_rounds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Events older than this are eligible for the TTL sweep
    #[serde(default = "default_events_ttl_ms")]
    pub ttl_ms: i64,
    /// Minimum interval between opportunistic sweeps
    #[serde(default = "default_gc_min_interval_ms")]
    pub gc_min_interval_ms: i64,
    /// Default page size for scope-filtered event reads
    #[serde(default = "default_read_limit")]
    pub read_limit: u32,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_events_ttl_ms(),
            gc_min_interval_ms: default_gc_min_interval_ms(),
            read_limit: default_read_limit(),
        }
    }
}

// ─── Defaults ────────────────────────────────────────────────────

fn default_database_path() -> String {
    ".ocean/state.db".to_string()
}

fn default_lock_ms() -> i64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_drain_max_rounds() -> u32 {
    25
}

fn default_events_ttl_ms() -> i64 {
    7 * 24 * 60 * 60 * 1_000
}

fn default_gc_min_interval_ms() -> i64 {
    60_000
}

fn default_read_limit() -> u32 {
    100
}

// ─── Loading ─────────────────────────────────────────────────────

impl OceanConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(toml_str: &str) -> Result<Self> {
        let config: OceanConfig =
            toml::from_str(toml_str).with_context(|| "Failed to parse ocean.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate semantic invariants that serde can't enforce.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.persistence.database_path.trim().is_empty(),
            "persistence.database_path must not be empty"
        );
        anyhow::ensure!(
            self.scheduler.lock_ms > 0,
            "scheduler.lock_ms must be greater than 0"
        );
        anyhow::ensure!(
            self.scheduler.default_max_attempts >= 1,
            "scheduler.default_max_attempts must be at least 1"
        );
        anyhow::ensure!(
            self.scheduler.drain_max_rounds >= 1,
            "scheduler.drain_max_rounds must be at least 1"
        );
        anyhow::ensure!(self.events.ttl_ms > 0, "events.ttl_ms must be greater than 0");
        anyhow::ensure!(
            self.events.gc_min_interval_ms >= 0,
            "events.gc_min_interval_ms must not be negative"
        );
        anyhow::ensure!(
            self.events.read_limit >= 1,
            "events.read_limit must be at least 1"
        );
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[persistence]
database_path = "/var/lib/ocean/state.db"

[scheduler]
lock_ms = 15000
default_max_attempts = 5
drain_max_rounds = 10

[events]
ttl_ms = 3600000
gc_min_interval_ms = 30000
read_limit = 50
"#;

        let config = OceanConfig::from_str(toml).unwrap();
        assert_eq!(config.persistence.database_path, "/var/lib/ocean/state.db");
        assert_eq!(config.scheduler.lock_ms, 15_000);
        assert_eq!(config.scheduler.default_max_attempts, 5);
        assert_eq!(config.scheduler.drain_max_rounds, 10);
        assert_eq!(config.events.ttl_ms, 3_600_000);
        assert_eq!(config.events.gc_min_interval_ms, 30_000);
        assert_eq!(config.events.read_limit, 50);
    }

    #[test]
    fn test_parse_empty_config_applies_defaults() {
        let config = OceanConfig::from_str("").unwrap();
        assert_eq!(config.persistence.database_path, ".ocean/state.db");
        assert_eq!(config.scheduler.lock_ms, 30_000);
        assert_eq!(config.scheduler.default_max_attempts, 3);
        assert_eq!(config.events.gc_min_interval_ms, 60_000);
        assert_eq!(config.events.read_limit, 100);
    }

    #[test]
    fn test_validate_zero_lock_ms() {
        let toml = r#"
[scheduler]
lock_ms = 0
"#;
        assert!(OceanConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_validate_zero_max_attempts() {
        let toml = r#"
[scheduler]
default_max_attempts = 0
"#;
        assert!(OceanConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_validate_empty_database_path() {
        let toml = r#"
[persistence]
database_path = ""
"#;
        assert!(OceanConfig::from_str(toml).is_err());
    }
}
