use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
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
// Defaults
// ---------------------------------------------------------------------------

/// Fallbacks for step actions that leave timing fields unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_command_timeout() -> u64 {
    600
}

fn default_health_timeout() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            command_timeout_seconds: default_command_timeout(),
            health_timeout_seconds: default_health_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Defaults {
    /// Shell timeout for actions that set none. Zero disables it.
    pub fn command_timeout(&self) -> Option<Duration> {
        match self.command_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// BackupConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_enabled")]
    pub enabled: bool,
    /// Archive directory. Relative paths are resolved against the root.
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,
}

fn default_backup_enabled() -> bool {
    true
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from(paths::BACKUPS_DIR)
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: default_backup_enabled(),
            dir: default_backup_dir(),
        }
    }
}

impl BackupConfig {
    pub fn resolved_dir(&self, root: &Path) -> PathBuf {
        if self.dir.is_absolute() {
            self.dir.clone()
        } else {
            root.join(&self.dir)
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default = "default_cleanup_on_error")]
    pub cleanup_on_error: bool,
}

fn default_version() -> u32 {
    1
}

fn default_cleanup_on_error() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            defaults: Defaults::default(),
            backup: BackupConfig::default(),
            cleanup_on_error: default_cleanup_on_error(),
        }
    }
}

impl Config {
    /// Load `.provision/config.yaml`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Config::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let d = &self.defaults;

        if d.attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "defaults.attempts is 0; commands will still run once".to_string(),
            });
        }

        if d.attempts > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!("defaults.attempts={} (>10 is unusual)", d.attempts),
            });
        }

        if d.poll_interval_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "defaults.poll_interval_ms must be greater than 0".to_string(),
            });
        } else if d.poll_interval_ms >= d.health_timeout_seconds.saturating_mul(1000) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "defaults.poll_interval_ms={} is not shorter than health_timeout_seconds={}; \
                     readiness checks will poll at most once",
                    d.poll_interval_ms, d.health_timeout_seconds
                ),
            });
        }

        if d.max_backoff_ms < d.backoff_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "defaults.max_backoff_ms={} is below backoff_ms={}; every delay is capped",
                    d.max_backoff_ms, d.backoff_ms
                ),
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
    fn missing_config_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg, Config::default());
        assert!(cfg.cleanup_on_error);
        assert_eq!(cfg.defaults.attempts, 3);
    }

    #[test]
    fn config_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.defaults.backoff_ms = 250;
        cfg.cleanup_on_error = false;
        cfg.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.defaults.backoff_ms, 250);
        assert!(!loaded.cleanup_on_error);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "defaults:\n  attempts: 5\nbackup:\n  enabled: false\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.defaults.attempts, 5);
        assert_eq!(cfg.defaults.poll_interval_ms, 2000);
        assert!(!cfg.backup.enabled);
        assert_eq!(cfg.backup.dir, PathBuf::from(".provision/backups"));
        assert!(cfg.cleanup_on_error);
    }

    #[test]
    fn zero_command_timeout_disables_it() {
        let mut defaults = Defaults::default();
        assert_eq!(defaults.command_timeout(), Some(Duration::from_secs(600)));
        defaults.command_timeout_seconds = 0;
        assert_eq!(defaults.command_timeout(), None);
    }

    #[test]
    fn backup_dir_resolution() {
        let root = Path::new("/srv/host");
        let relative = BackupConfig::default();
        assert_eq!(
            relative.resolved_dir(root),
            PathBuf::from("/srv/host/.provision/backups")
        );
        let absolute = BackupConfig {
            enabled: true,
            dir: PathBuf::from("/var/backups/provision"),
        };
        assert_eq!(
            absolute.resolved_dir(root),
            PathBuf::from("/var/backups/provision")
        );
    }

    #[test]
    fn default_config_has_no_warnings() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn zero_poll_interval_is_an_error() {
        let mut cfg = Config::default();
        cfg.defaults.poll_interval_ms = 0;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.level == WarnLevel::Error));
    }

    #[test]
    fn poll_interval_longer_than_timeout_warns() {
        let mut cfg = Config::default();
        cfg.defaults.health_timeout_seconds = 1;
        cfg.defaults.poll_interval_ms = 5000;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
        assert!(warnings[0].message.contains("poll at most once"));
    }
}
