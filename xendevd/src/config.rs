//! Configuration management for xendevd.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use xendevd_common::LogFormat;
use xendevd_hotplug::{OwnershipGate, DEFAULT_LOOP_CONTROL, DEFAULT_ORIGIN_KEY, DEFAULT_XENSTORED_SOCKET};
use xendevd_proto::DEFAULT_SOCKET_PATH;

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/xendevd/xendevd.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration store connection
    pub store: StoreConfig,
    /// Local device-management protocol listener
    pub protocol: ProtocolConfig,
    /// Loop controller
    pub loop_control: LoopControlConfig,
    /// Device enumeration roots
    pub devices: DevicesConfig,
    /// Block device handling
    pub vbd: VbdConfig,
    /// Log output
    pub logging: LoggingConfig,
    /// Process lifecycle
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load the file named on the command line, or the default file if it
    /// exists, then apply the remaining CLI overrides.
    pub fn resolve(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        Ok(config.with_cli_overrides(args))
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if args.daemon {
            self.daemon.daemonize = true;
            self.daemon.write_pid_file = true;
        }

        if let Some(ref pid_file) = args.pid_file {
            self.daemon.pid_file = pid_file.clone();
            self.daemon.write_pid_file = true;
        }

        self
    }
}

/// Configuration store connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// xenstored control socket
    pub socket_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_XENSTORED_SOCKET),
        }
    }
}

/// Protocol listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Listening socket path
    pub socket_path: PathBuf,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

/// Loop controller configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopControlConfig {
    pub path: PathBuf,
}

impl Default for LoopControlConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_LOOP_CONTROL),
        }
    }
}

/// Where devices are enumerated and their nodes live.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub sysfs_root: PathBuf,
    pub devfs_root: PathBuf,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            devfs_root: PathBuf::from("/dev"),
        }
    }
}

/// Block device handling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VbdConfig {
    /// Store key holding the toolstack origin tag
    pub origin_key: String,
    /// Only act on records carrying this tag; unset acts on all records
    pub origin_tag: Option<String>,
}

impl Default for VbdConfig {
    fn default() -> Self {
        Self {
            origin_key: DEFAULT_ORIGIN_KEY.to_string(),
            origin_tag: None,
        }
    }
}

impl VbdConfig {
    pub fn gate(&self) -> OwnershipGate {
        OwnershipGate {
            key: self.origin_key.clone(),
            tag: self.origin_tag.clone(),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormatConfig,
    /// Also write JSON logs to daily files under this path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormatConfig::Pretty,
            file: None,
        }
    }
}

/// Log format as written in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatConfig {
    #[default]
    Pretty,
    Json,
}

impl From<LogFormatConfig> for LogFormat {
    fn from(format: LogFormatConfig) -> Self {
        match format {
            LogFormatConfig::Pretty => LogFormat::Pretty,
            LogFormatConfig::Json => LogFormat::Json,
        }
    }
}

/// Process lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Detach from the terminal
    pub daemonize: bool,
    /// Write the process id to `pid_file`
    pub write_pid_file: bool,
    pub pid_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemonize: false,
            write_pid_file: false,
            pid_file: PathBuf::from("/var/run/xendevd.pid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.socket_path, PathBuf::from("/var/run/xenstored/socket"));
        assert_eq!(config.protocol.socket_path, PathBuf::from("/var/run/chaos_socket"));
        assert_eq!(config.loop_control.path, PathBuf::from("/dev/loop-control"));
        assert_eq!(config.vbd.gate(), OwnershipGate::open());
        assert!(!config.daemon.write_pid_file);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xendevd.yaml");
        std::fs::write(
            &path,
            "vbd:\n  origin_tag: xapi\nlogging:\n  format: json\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.vbd.gate(), OwnershipGate::requiring("toolstack", "xapi"));
        assert_eq!(config.logging.format, LogFormatConfig::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.devices.sysfs_root, PathBuf::from("/sys"));
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from(["xendevd", "--pid-file", "/tmp/x.pid", "-l", "debug"]);
        let config = Config::default().with_cli_overrides(&args);
        assert!(config.daemon.write_pid_file);
        assert!(!config.daemon.daemonize);
        assert_eq!(config.daemon.pid_file, PathBuf::from("/tmp/x.pid"));
        assert_eq!(config.logging.level, "debug");

        let args = Args::parse_from(["xendevd", "-D"]);
        let config = Config::default().with_cli_overrides(&args);
        assert!(config.daemon.daemonize && config.daemon.write_pid_file);
    }

    #[test]
    fn test_named_file_must_exist() {
        let args = Args::parse_from(["xendevd", "-c", "/nonexistent/xendevd.yaml"]);
        assert!(Config::resolve(&args).is_err());
    }
}
