//! Process bootstrap configuration and per-instance tunable presets.
//!
//! `AppConfig` is the `clap`-parsed surface for process-level concerns (bind address, data
//! directory, master key source, log level, TLS). `InstanceTunables` is the per-instance
//! configuration blob described in the data model (poll interval, listener caps, retry
//! policy); it is not parsed from the command line but read from and written to the store,
//! and ships with environment presets the way the house `RouterConfig` does.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain_types::{
    CleanupIntervalSecs, HealthCheckIntervalSecs, ListenerIdleTimeoutSecs, MaxListeners,
    MaxRetry, PollIntervalSecs,
};

/// Errors raised while assembling or validating process configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value was missing or malformed.
    #[error("invalid configuration: {field} - {reason}")]
    Invalid {
        /// The offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The master key file could not be read.
    #[error("failed to read master key file {path}: {source}")]
    MasterKeyFile {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Process-wide bootstrap configuration, assembled from CLI flags with environment overrides.
/// Env overrides file (the instance/platform store) overrides these built-in defaults, per
/// the documented precedence.
#[derive(Debug, Clone, Parser)]
#[command(name = "chatrelay", about = "Federated chat-automation message router")]
pub struct AppConfig {
    /// Address the management HTTP surface binds to.
    #[arg(long, env = "CHATRELAY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// Port the management HTTP surface listens on.
    #[arg(long, env = "CHATRELAY_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory holding the `SQLite` database file and any received attachments.
    #[arg(long, env = "CHATRELAY_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Raw 32-byte master key, base64-encoded. Mutually exclusive with `master_key_file`.
    #[arg(long, env = "CHATRELAY_MASTER_KEY")]
    pub master_key: Option<String>,

    /// Path to a file containing the master key passphrase. Used if `master_key` is unset.
    #[arg(long, env = "CHATRELAY_MASTER_KEY_FILE")]
    pub master_key_file: Option<PathBuf>,

    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or `chatrelay=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Optional TLS certificate path; both this and `tls_key` must be set to enable TLS.
    #[arg(long, env = "CHATRELAY_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Optional TLS private key path.
    #[arg(long, env = "CHATRELAY_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Number of concurrent delivery workers.
    #[arg(long, env = "CHATRELAY_WORKER_COUNT", default_value_t = 4)]
    pub worker_count: u32,
}

impl AppConfig {
    /// Path to the `SQLite` database file under `data_dir`.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("chatrelay.db")
    }

    /// Cross-field validation beyond what `clap` already enforces.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] if TLS is partially configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::Invalid {
                field: "tls_cert/tls_key".to_string(),
                reason: "both or neither of --tls-cert and --tls-key must be set".to_string(),
            });
        }
        Ok(())
    }

    /// Resolves the raw master key passphrase from `master_key` or `master_key_file`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] if neither is set, or
    /// [`ConfigError::MasterKeyFile`] if the key file cannot be read.
    pub fn resolve_master_key_passphrase(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.master_key {
            return Ok(key.clone());
        }
        if let Some(path) = &self.master_key_file {
            return std::fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .map_err(|source| ConfigError::MasterKeyFile {
                    path: path.clone(),
                    source,
                });
        }
        Err(ConfigError::Invalid {
            field: "master_key".to_string(),
            reason: "one of --master-key or --master-key-file is required".to_string(),
        })
    }
}

/// Per-instance tunables, persisted as part of the instance row and refreshed whenever the
/// config registry signals a change. Mirrors the recognized configuration options in the
/// data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTunables {
    /// Interval between L1/L2 poll ticks.
    pub poll_interval_s: PollIntervalSecs,
    /// Cap on concurrently active listeners for this instance.
    pub max_listeners: MaxListeners,
    /// Idle duration after which a non-pinned listener is evicted.
    pub listener_idle_timeout_s: ListenerIdleTimeoutSecs,
    /// Interval between L3 cleanup sweeps.
    pub cleanup_interval_s: CleanupIntervalSecs,
    /// Interval between health probes.
    pub health_check_interval_s: HealthCheckIntervalSecs,
    /// Whether the pool should auto re-initialize after a failed health check.
    pub auto_reconnect: bool,
    /// Maximum re-initialize attempts per health interval.
    pub max_retry: MaxRetry,
}

impl Default for InstanceTunables {
    fn default() -> Self {
        Self {
            poll_interval_s: PollIntervalSecs::default(),
            max_listeners: MaxListeners::default(),
            listener_idle_timeout_s: ListenerIdleTimeoutSecs::default(),
            cleanup_interval_s: CleanupIntervalSecs::default(),
            health_check_interval_s: HealthCheckIntervalSecs::default(),
            auto_reconnect: true,
            max_retry: MaxRetry::default(),
        }
    }
}

impl InstanceTunables {
    /// Tight intervals for integration tests, so real-time waits complete quickly.
    ///
    /// # Panics
    /// Never: the hard-coded values are all within their domain types' valid ranges.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            poll_interval_s: PollIntervalSecs::try_new(1).expect("1 is a valid poll interval"),
            max_listeners: MaxListeners::try_new(5).expect("5 is a valid listener cap"),
            listener_idle_timeout_s: ListenerIdleTimeoutSecs::try_new(60)
                .expect("60 is a valid idle timeout"),
            cleanup_interval_s: CleanupIntervalSecs::try_new(1)
                .expect("1 is a valid cleanup interval"),
            health_check_interval_s: HealthCheckIntervalSecs::try_new(1)
                .expect("1 is a valid health check interval"),
            auto_reconnect: true,
            max_retry: MaxRetry::try_new(3).expect("3 is a valid retry cap"),
        }
    }

    /// Conservative production defaults: longer intervals, larger listener caps.
    #[must_use]
    pub fn production() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_partial_tls_config() {
        let mut config = AppConfig::parse_from(["chatrelay"]);
        config.tls_cert = Some(PathBuf::from("cert.pem"));
        config.tls_key = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_no_tls_config() {
        let config = AppConfig::parse_from(["chatrelay"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn database_path_joins_data_dir() {
        let mut config = AppConfig::parse_from(["chatrelay"]);
        config.data_dir = PathBuf::from("/var/lib/chatrelay");
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/chatrelay/chatrelay.db")
        );
    }

    #[test]
    fn testing_preset_has_short_intervals() {
        let tunables = InstanceTunables::testing();
        assert_eq!(tunables.poll_interval_s.into_inner(), 1);
    }
}
