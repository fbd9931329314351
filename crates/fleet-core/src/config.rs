use crate::error::{FleetError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for the dispatcher, lock manager and driver workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker tasks pulling from the ready queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_action_timeout")]
    pub default_action_timeout_secs: u64,
    /// Lock acquisition attempts before an action fails with a lock conflict.
    #[serde(default = "default_lock_retry_limit")]
    pub lock_retry_limit: u32,
    #[serde(default = "default_lock_retry_base")]
    pub lock_retry_base_ms: u64,
    #[serde(default = "default_lock_retry_max")]
    pub lock_retry_max_ms: u64,
    /// Lease granted on acquisition; renewed by the holder while it runs.
    #[serde(default = "default_lock_lease")]
    pub lock_lease_secs: u64,
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,
    #[serde(default = "default_driver_retry_limit")]
    pub driver_retry_limit: u32,
    #[serde(default = "default_driver_retry_base")]
    pub driver_retry_base_ms: u64,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_readiness_poll")]
    pub readiness_poll_ms: u64,
    #[serde(default = "default_max_members")]
    pub max_members_per_cluster: u32,
}

fn default_workers() -> usize {
    4
}

fn default_action_timeout() -> u64 {
    3600
}

fn default_lock_retry_limit() -> u32 {
    3
}

fn default_lock_retry_base() -> u64 {
    200
}

fn default_lock_retry_max() -> u64 {
    10_000
}

fn default_lock_lease() -> u64 {
    60
}

fn default_reclaim_interval() -> u64 {
    30
}

fn default_driver_retry_limit() -> u32 {
    3
}

fn default_driver_retry_base() -> u64 {
    100
}

fn default_readiness_timeout() -> u64 {
    60
}

fn default_readiness_poll() -> u64 {
    500
}

fn default_max_members() -> u32 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            default_action_timeout_secs: default_action_timeout(),
            lock_retry_limit: default_lock_retry_limit(),
            lock_retry_base_ms: default_lock_retry_base(),
            lock_retry_max_ms: default_lock_retry_max(),
            lock_lease_secs: default_lock_lease(),
            reclaim_interval_secs: default_reclaim_interval(),
            driver_retry_limit: default_driver_retry_limit(),
            driver_retry_base_ms: default_driver_retry_base(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_poll_ms: default_readiness_poll(),
            max_members_per_cluster: default_max_members(),
        }
    }
}

impl EngineConfig {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn lock_retry_base(&self) -> Duration {
        Duration::from_millis(self.lock_retry_base_ms)
    }

    pub fn lock_retry_max(&self) -> Duration {
        Duration::from_millis(self.lock_retry_max_ms)
    }

    pub fn driver_retry_base(&self) -> Duration {
        Duration::from_millis(self.driver_retry_base_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    /// Never zero: the sweeper runs on a fixed interval.
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        crate::io::read_yaml(&paths::config_path(root))?.ok_or(FleetError::NotInitialized)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        crate::io::write_yaml(&paths::config_path(root), self)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let engine = &self.engine;

        if engine.workers == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "engine.workers is 0: no action will ever be dispatched".to_string(),
            });
        }

        if engine.default_action_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "engine.default_action_timeout_secs is 0: every action times out"
                    .to_string(),
            });
        }

        // A holder only renews between polls, so a lease shorter than one
        // poll interval expires under a healthy worker.
        if engine.lock_lease_secs * 1000 <= engine.readiness_poll_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "engine.lock_lease_secs={} is not longer than engine.readiness_poll_ms={}",
                    engine.lock_lease_secs, engine.readiness_poll_ms
                ),
            });
        }

        if engine.lock_retry_base_ms > engine.lock_retry_max_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "engine.lock_retry_base_ms={} exceeds engine.lock_retry_max_ms={}",
                    engine.lock_retry_base_ms, engine.lock_retry_max_ms
                ),
            });
        }

        if engine.driver_retry_limit > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "engine.driver_retry_limit={} (>10 is unusual)",
                    engine.driver_retry_limit
                ),
            });
        }

        if engine.max_members_per_cluster == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "engine.max_members_per_cluster is 0: clusters cannot hold nodes"
                    .to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.engine.workers, 4);
        assert_eq!(cfg.engine.default_action_timeout_secs, 3600);
        assert_eq!(cfg.engine.lock_retry_limit, 3);
        assert_eq!(cfg.engine.max_members_per_cluster, 1000);
    }

    #[test]
    fn partial_engine_section_keeps_other_defaults() {
        let cfg: Config = serde_yaml::from_str("engine:\n  workers: 16\n").unwrap();
        assert_eq!(cfg.engine.workers, 16);
        assert_eq!(cfg.engine.lock_lease_secs, 60);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.engine.workers = 2;
        cfg.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.engine.workers, 2);
    }

    #[test]
    fn load_without_init_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(FleetError::NotInitialized)
        ));
    }

    #[test]
    fn default_config_has_no_warnings() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn zero_workers_is_an_error() {
        let mut cfg = Config::default();
        cfg.engine.workers = 0;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("workers")));
    }

    #[test]
    fn short_lease_is_flagged() {
        let mut cfg = Config::default();
        cfg.engine.lock_lease_secs = 1;
        cfg.engine.readiness_poll_ms = 2000;
        assert!(cfg.validate().iter().any(|w| w.message.contains("lock_lease_secs")));
    }
}
