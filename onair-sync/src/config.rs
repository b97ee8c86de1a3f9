//! onair-sync configuration
//!
//! Loaded from `sync.toml` (see [`onair_common::config::resolve_config_path`]).
//! Every field has a default, so an empty or missing file is a valid config.

use crate::error::{Error, Result};
use crate::mirror::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 5790;

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// HTTP listen port
    pub port: u16,
    /// Fallback tracing filter when RUST_LOG is unset
    pub log_level: String,
    /// Attempts per mirror command before the queue stops
    pub max_attempts: u32,
    /// First retry delay
    pub base_backoff_ms: u64,
    /// Retry delay ceiling (before jitter)
    pub max_backoff_ms: u64,
    /// Symmetric jitter as a fraction of the delay
    pub jitter_ratio: f64,
    /// Idle time before the legacy connection is torn down
    pub idle_ms: u64,
    /// Idle time before a live client is evicted
    pub inactivity_ms: u64,
    /// Where fatal queue snapshots are written
    pub fatal_log_dir: PathBuf,
    /// Topics clients may subscribe to
    pub topics: Vec<String>,
    /// Legacy store connection
    pub legacy: LegacyStoreConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
            max_attempts: 5,
            base_backoff_ms: 250,
            max_backoff_ms: 30_000,
            jitter_ratio: 0.2,
            idle_ms: 300_000,
            inactivity_ms: 300_000,
            fatal_log_dir: onair_common::config::default_data_dir("sync").join("fatal"),
            topics: onair_common::events::default_topics(),
            legacy: LegacyStoreConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load from an optional TOML path, falling back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = onair_common::config::load_toml_or_default(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the queue and timers cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("maxAttempts must be at least 1".to_string()));
        }
        if !self.jitter_ratio.is_finite() || self.jitter_ratio < 0.0 {
            return Err(Error::Config(format!(
                "jitterRatio must be a non-negative number, got {}",
                self.jitter_ratio
            )));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(format!(
                "baseBackoffMs ({}) exceeds maxBackoffMs ({})",
                self.base_backoff_ms, self.max_backoff_ms
            )));
        }
        if self.idle_ms == 0 || self.inactivity_ms == 0 {
            return Err(Error::Config(
                "idleMs and inactivityMs must be greater than zero".to_string(),
            ));
        }
        if let Some(tunnel) = &self.legacy.tunnel {
            if tunnel.ssh_host.trim().is_empty() {
                return Err(Error::Config("legacy.tunnel.sshHost is required".to_string()));
            }
        }
        Ok(())
    }

    /// Backoff policy built from the retry settings
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.jitter_ratio,
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_ms)
    }

    /// Create the fatal snapshot directory up front
    ///
    /// A directory that cannot be created at startup would only surface when
    /// the queue dies, which is the worst moment to find out.
    pub fn prepare_dirs(&self) -> Result<()> {
        onair_common::config::ensure_dir(&self.fatal_log_dir)?;
        Ok(())
    }
}

/// Legacy store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LegacyStoreConfig {
    /// MySQL URL; host/port are replaced by the forwarding listener when tunnelled
    pub database_url: String,
    /// Pool size
    pub max_connections: u32,
    /// Pool acquire timeout
    pub connect_timeout_ms: u64,
    /// SSH tunnel; when absent the store is reached directly
    pub tunnel: Option<TunnelConfig>,
}

impl Default for LegacyStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "mysql://onair@127.0.0.1:3306/legacy".to_string(),
            max_connections: 4,
            connect_timeout_ms: 10_000,
            tunnel: None,
        }
    }
}

/// SSH bastion settings for reaching the legacy store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TunnelConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub identity_file: Option<PathBuf>,
    /// Store address as seen from the bastion
    pub remote_host: String,
    pub remote_port: u16,
    /// Directory for the control-master socket
    pub control_dir: PathBuf,
    /// How long to wait for the control master to come up
    pub establish_timeout_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_host: String::new(),
            ssh_port: 22,
            ssh_user: "onair".to_string(),
            identity_file: None,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 3306,
            control_dir: std::env::temp_dir(),
            establish_timeout_ms: 15_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_options() {
        let config = SyncConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_backoff_ms, 250);
        assert_eq!(config.max_backoff_ms, 30_000);
        assert!((config.jitter_ratio - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.idle_ms, 300_000);
        assert_eq!(config.inactivity_ms, 300_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_camel_case_keys_parse() {
        let config: SyncConfig = toml::from_str(
            r#"
            maxAttempts = 3
            baseBackoffMs = 100
            fatalLogDir = "/tmp/onair-fatal"

            [legacy.tunnel]
            sshHost = "bastion.example.org"
            remotePort = 3307
            "#,
        )
        .unwrap();

        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_backoff_ms, 100);
        assert_eq!(config.max_backoff_ms, 30_000);
        assert_eq!(config.fatal_log_dir, PathBuf::from("/tmp/onair-fatal"));
        let tunnel = config.legacy.tunnel.unwrap();
        assert_eq!(tunnel.ssh_host, "bastion.example.org");
        assert_eq!(tunnel.remote_port, 3307);
        assert_eq!(tunnel.ssh_port, 22);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SyncConfig::default();
        config.max_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = SyncConfig::default();
        config.jitter_ratio = -0.1;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.base_backoff_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.legacy.tunnel = Some(TunnelConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prepare_dirs_creates_fatal_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            fatal_log_dir: dir.path().join("state").join("fatal"),
            ..SyncConfig::default()
        };
        config.prepare_dirs().unwrap();
        assert!(config.fatal_log_dir.is_dir());

        let occupied = dir.path().join("occupied");
        std::fs::write(&occupied, "x").unwrap();
        let config = SyncConfig {
            fatal_log_dir: occupied,
            ..SyncConfig::default()
        };
        assert!(matches!(config.prepare_dirs(), Err(Error::Common(_))));
    }
}
