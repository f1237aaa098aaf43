//! Configuration resolution for FieldHub.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults (the values the coordinator has always shipped with)
//! 2. Global config (~/.config/fieldhub/settings.json)
//! 3. Explicit config file (--config)
//! 4. Environment variables / CLI arguments (handled by clap, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete FieldHub configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Listener addresses and connection policy for the daemon's TCP/UDP servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Trusted line-oriented stream ingress.
    pub stream_addr: String,
    /// Status query server.
    pub status_addr: String,
    /// Trusted datagram ingress.
    pub dgram_trusted_addr: String,
    /// Untrusted datagram ingress (signature-checked).
    pub dgram_untrusted_addr: String,
    /// Idle timeout applied to stream and status connections (seconds).
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_addr: "127.0.0.1:59054".to_string(),
            status_addr: "127.0.0.1:59055".to_string(),
            dgram_trusted_addr: "0.0.0.0:59053".to_string(),
            dgram_untrusted_addr: "0.0.0.0:59052".to_string(),
            idle_timeout_secs: 600,
        }
    }
}

/// Connection-semaphore watching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directory where sshd maintains per-receiver session semaphores.
    pub sem_dir: PathBuf,
    /// Pattern matching semaphore file names; capture group 1 is the serial.
    pub sem_pattern: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            sem_dir: PathBuf::from("/dev/shm"),
            sem_pattern: r"sem\.(SG-[0-9A-Za-z]{12})".to_string(),
        }
    }
}

/// Sync scheduling window.
///
/// Fractional minutes are allowed so tests can shrink the window to
/// sub-second delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minimum time between syncs of a receiver (minutes).
    pub wait_lo_minutes: f64,
    /// Maximum time between syncs of a receiver (minutes).
    pub wait_hi_minutes: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wait_lo_minutes: 30.0,
            wait_hi_minutes: 90.0,
        }
    }
}

/// SSH access to the upstream data service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Account on the upstream host; this is who ssh makes us be.
    pub user: String,
    /// Identity file used for the sync connection.
    pub identity: PathBuf,
    /// Control path multiplexing port mappings to the upstream host.
    pub control_path: PathBuf,
    /// Remote path touched to trigger a sync; `{port}` and `{serno}` are
    /// substituted per receiver.
    pub sync_template: String,
    /// The ssh program to invoke (replaceable with a stub in tests).
    pub ssh_bin: PathBuf,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            user: "sg@sgdata.motus.org".to_string(),
            identity: PathBuf::from("/home/sg_remote/.ssh/id_ed25519_sgorg_sgdata"),
            control_path: PathBuf::from("/home/sg_remote/sgdata.ssh"),
            sync_template: "/sgm_local/sync/method={port},serno={serno}".to_string(),
            ssh_bin: PathBuf::from("ssh"),
        }
    }
}

/// Database location.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Database file path; `None` means the built-in default path.
    pub path: Option<PathBuf>,
}

/// Logging defaults; CLI flags override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// The global settings file is applied first, then `explicit` (when given)
/// on top of it. A missing global file is fine; a missing explicit file is
/// an error, since the operator asked for it.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            config = load_config_file(&global_path)?;
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        config = load_config_file(path)?;
    }

    validate(&config)?;
    Ok(config)
}

/// Path to the global settings file, if a home directory can be determined.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("fieldhub").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let data = std::fs::read_to_string(path)?;
    let config = serde_json::from_str(&data)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.sync.wait_lo_minutes < 0.0 || config.sync.wait_hi_minutes < config.sync.wait_lo_minutes
    {
        return Err(Error::Config(format!(
            "sync window [{}, {}) is not a valid range",
            config.sync.wait_lo_minutes, config.sync.wait_hi_minutes
        )));
    }
    if !config.upstream.sync_template.contains("{port}")
        || !config.upstream.sync_template.contains("{serno}")
    {
        return Err(Error::Config(
            "upstream.sync_template must contain {port} and {serno}".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(validate(&config).is_ok());
        assert_eq!(config.server.status_addr, "127.0.0.1:59055");
        assert_eq!(config.watcher.sem_dir, PathBuf::from("/dev/shm"));
        assert!((config.sync.wait_lo_minutes - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_file_fills_missing_sections_with_defaults() {
        let json = r#"{ "sync": { "wait_lo_minutes": 1.0, "wait_hi_minutes": 2.0 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!((config.sync.wait_lo_minutes - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.server.stream_addr, "127.0.0.1:59054");
    }

    #[test]
    fn inverted_sync_window_rejected() {
        let mut config = Config::default();
        config.sync.wait_lo_minutes = 90.0;
        config.sync.wait_hi_minutes = 30.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn sync_template_requires_placeholders() {
        let mut config = Config::default();
        config.upstream.sync_template = "/no/placeholders".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/fieldhub.json")));
        assert!(err.is_err());
    }
}
