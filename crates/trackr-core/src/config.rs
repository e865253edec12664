use crate::error::Result;
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
// StorageBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Durable redb file under `.trackr/`.
    #[default]
    Redb,
    /// Volatile; everything is lost on shutdown except the recovery file.
    Memory,
}

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// A worker busy on one task for longer than this is replaced.
    #[serde(default = "default_stuck_timeout_ms")]
    pub stuck_timeout_ms: u64,
    /// Dispatcher wait while the queue is empty.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Dispatcher retry interval while no worker is idle.
    #[serde(default = "default_busy_poll_ms")]
    pub busy_poll_ms: u64,
}

fn default_workers() -> usize {
    3
}

fn default_stuck_timeout_ms() -> u64 {
    3000
}

fn default_idle_poll_ms() -> u64 {
    150
}

fn default_busy_poll_ms() -> u64 {
    50
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            stuck_timeout_ms: default_stuck_timeout_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            busy_poll_ms: default_busy_poll_ms(),
        }
    }
}

impl PoolConfig {
    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_millis(self.stuck_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn busy_poll(&self) -> Duration {
        Duration::from_millis(self.busy_poll_ms)
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
    pub storage: StorageBackend,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Upper bound for synchronous reads submitted through the queue.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

fn default_version() -> u32 {
    1
}

fn default_wait_timeout_ms() -> u64 {
    10_000
}

fn default_recent_capacity() -> usize {
    15
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            storage: StorageBackend::default(),
            pool: PoolConfig::default(),
            wait_timeout_ms: default_wait_timeout_ms(),
            recent_capacity: default_recent_capacity(),
        }
    }
}

impl Config {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Load `.trackr/config.yaml`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.pool.workers == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "pool.workers is 0; no task would ever run".to_string(),
            });
        } else if self.pool.workers > 64 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "pool.workers={} (>64 is unusual for a lock-per-object engine)",
                    self.pool.workers
                ),
            });
        }

        if self.pool.stuck_timeout_ms <= self.pool.idle_poll_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "pool.stuck_timeout_ms={} is not above idle_poll_ms={}; \
                     healthy workers may be replaced",
                    self.pool.stuck_timeout_ms, self.pool.idle_poll_ms
                ),
            });
        }

        if self.pool.idle_poll_ms == 0 || self.pool.busy_poll_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "zero poll interval makes the dispatcher spin".to_string(),
            });
        }

        if self.recent_capacity == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "recent_capacity is 0; recent activity is disabled".to_string(),
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
    fn default_config_roundtrip() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.pool.workers, 3);
        assert_eq!(parsed.pool.stuck_timeout_ms, 3000);
        assert_eq!(parsed.storage, StorageBackend::Redb);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str("storage: memory\npool:\n  workers: 5\n").unwrap();
        assert_eq!(cfg.storage, StorageBackend::Memory);
        assert_eq!(cfg.pool.workers, 5);
        assert_eq!(cfg.pool.busy_poll_ms, 50);
        assert_eq!(cfg.recent_capacity, 15);
    }

    #[test]
    fn load_missing_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.pool.idle_poll_ms, 150);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.pool.workers = 7;
        cfg.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.pool.workers, 7);
    }

    #[test]
    fn validate_default_is_clean() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn validate_flags_zero_workers() {
        let mut cfg = Config::default();
        cfg.pool.workers = 0;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.level == WarnLevel::Error));
    }

    #[test]
    fn validate_flags_tight_stuck_timeout() {
        let mut cfg = Config::default();
        cfg.pool.stuck_timeout_ms = 100;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("stuck_timeout_ms")));
    }
}
