//! Configuration management for Ferry.
//!
//! One TOML file describes the local server, the known peer hosts, and the
//! transfer rules.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/ferry/config.toml` |
//! | macOS | `~/Library/Application Support/Ferry/config.toml` |
//! | Windows | `%APPDATA%\Ferry\config.toml` |
//!
//! ## Example
//!
//! ```toml
//! [server]
//! host_id = "alpha"
//! port = 6566
//!
//! [hosts.beta]
//! address = "192.168.1.20"
//! port = 6566
//! key = "s3cret"
//!
//! [rules.backup]
//! mode = "Send"
//! send_path = "/srv/ferry/out"
//! recv_path = "/srv/ferry/in"
//! work_path = "/srv/ferry/work"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::directory::{HostAuth, RuleConfig, StaticHostLookup, StaticRuleLookup, TaskSpec};
use crate::error::{Error, Result};
use crate::record::TransferMode;

/// Smallest accepted block size; requests declaring less fall back to the
/// configured default.
pub const MIN_BLOCK_SIZE: u32 = 100;

/// Policy applied when a transfer fails on a block integrity error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityRestartPolicy {
    /// The next attempt restarts from rank 0
    FromZero,
    /// The next attempt resumes from the last acknowledged rank (default)
    #[default]
    FromLastGood,
}

/// Main configuration struct for Ferry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local server settings
    pub server: ServerConfig,
    /// Known peer hosts, keyed by host id
    pub hosts: HashMap<String, HostEntry>,
    /// Transfer rules, keyed by rule id
    pub rules: HashMap<String, RuleEntry>,
}

/// Local server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Identity announced in the Authent handshake
    pub host_id: String,
    /// Shared secret proven in the Authent handshake
    pub host_key: String,
    /// Listen address
    pub bind_address: String,
    /// Listen port
    pub port: u16,
    /// Default block size in bytes
    pub block_size: u32,
    /// Upper bound on concurrent transfer runners (floor of 10 applies)
    pub runner_threads: usize,
    /// Delay between commander poll cycles
    #[serde(with = "humantime_serde")]
    pub delay_commander: Duration,
    /// Pause between two submissions within one poll cycle
    #[serde(with = "humantime_serde")]
    pub delay_between_submissions: Duration,
    /// Connection attempts per transfer before it is deferred
    pub retry_limit: u32,
    /// Pause before a rescheduled connection attempt
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Restart behavior after a block integrity failure
    pub integrity_restart: IntegrityRestartPolicy,
    /// Where the record snapshot lives
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_id: hostname::get().map_or_else(
                |_| "ferry".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            host_key: String::new(),
            bind_address: "0.0.0.0".to_string(),
            port: 6566,
            block_size: 65536,
            runner_threads: 10,
            delay_commander: Duration::from_secs(5),
            delay_between_submissions: Duration::from_millis(100),
            retry_limit: 3,
            retry_delay: Duration::from_secs(30),
            integrity_restart: IntegrityRestartPolicy::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl ServerConfig {
    /// Effective worker pool size: configured value with a floor of 10.
    #[must_use]
    pub fn effective_runner_threads(&self) -> usize {
        self.runner_threads.max(10)
    }

    /// Effective block size: configured value with a floor of
    /// [`MIN_BLOCK_SIZE`].
    #[must_use]
    pub fn effective_block_size(&self) -> u32 {
        self.block_size.max(MIN_BLOCK_SIZE)
    }
}

/// One `[hosts.<id>]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostEntry {
    /// Reachable address (name or IP)
    pub address: String,
    /// TCP port
    pub port: u16,
    /// Whether the connection must use the secure transport
    pub ssl: bool,
    /// Shared secret for the Authent handshake
    pub key: String,
}

impl Default for HostEntry {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 6566,
            ssl: false,
            key: String::new(),
        }
    }
}

/// One `[rules.<id>]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleEntry {
    /// Transfer mode the rule mandates
    pub mode: TransferMode,
    /// Where received files land
    pub recv_path: PathBuf,
    /// Where files to send are read from
    pub send_path: PathBuf,
    /// Where finished files are archived
    pub archive_path: Option<PathBuf>,
    /// Where in-flight files are written
    pub work_path: PathBuf,
    /// Tasks before the data phase
    pub pre_tasks: Vec<TaskSpec>,
    /// Tasks after a successful data phase
    pub post_tasks: Vec<TaskSpec>,
    /// Tasks after a failure
    pub error_tasks: Vec<TaskSpec>,
    /// Hosts allowed to use the rule; empty admits everyone
    pub allowed_hosts: Vec<String>,
}

impl Default for RuleEntry {
    fn default() -> Self {
        Self {
            mode: TransferMode::Send,
            recv_path: PathBuf::from("in"),
            send_path: PathBuf::from("out"),
            archive_path: None,
            work_path: PathBuf::from("work"),
            pre_tasks: Vec::new(),
            post_tasks: Vec::new(),
            error_tasks: Vec::new(),
            allowed_hosts: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the platform config directory, falling back to defaults
    /// when no file exists.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to an explicit path, creating parent directories.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Platform default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("org", "ferry", "Ferry").map_or_else(
            || PathBuf::from(".ferry/config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.host_id.is_empty() {
            return Err(Error::Config("server.host_id must not be empty".into()));
        }
        if self.server.host_id.contains(' ') {
            return Err(Error::Config(
                "server.host_id must not contain spaces".into(),
            ));
        }
        for (rule_id, rule) in &self.rules {
            if rule_id.contains(' ') {
                return Err(Error::Config(format!(
                    "rule id '{rule_id}' must not contain spaces"
                )));
            }
            if rule.mode == TransferMode::Unknown {
                return Err(Error::Config(format!(
                    "rule '{rule_id}' must declare a mode"
                )));
            }
        }
        Ok(())
    }

    /// The host directory this configuration describes.
    #[must_use]
    pub fn host_lookup(&self) -> StaticHostLookup {
        StaticHostLookup::new(self.hosts.iter().map(|(id, entry)| HostAuth {
            host_id: id.clone(),
            address: entry.address.clone(),
            port: entry.port,
            ssl: entry.ssl,
            key: entry.key.clone(),
        }))
    }

    /// The rule directory this configuration describes.
    #[must_use]
    pub fn rule_lookup(&self) -> StaticRuleLookup {
        StaticRuleLookup::new(self.rules.iter().map(|(id, entry)| RuleConfig {
            rule_id: id.clone(),
            mode: entry.mode,
            recv_path: entry.recv_path.clone(),
            send_path: entry.send_path.clone(),
            archive_path: entry.archive_path.clone(),
            work_path: entry.work_path.clone(),
            pre_tasks: entry.pre_tasks.clone(),
            post_tasks: entry.post_tasks.clone(),
            error_tasks: entry.error_tasks.clone(),
            allowed_hosts: entry.allowed_hosts.clone(),
        }))
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "ferry", "Ferry").map_or_else(
        || PathBuf::from(".ferry"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}
