#![deny(unsafe_code)]

//! Configuration loading and validation for ipacct.
//!
//! Loads TOML configuration files and validates them before the daemon
//! starts anything. [`AppConfig`] is the central configuration structure;
//! the [`kind`] module parses the per-group counter kinds.

/// Counter kind grammar (`ipv4src`, `ipv6dst/64`, ...).
pub mod kind;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use kind::{AddressFamily, CounterKind, Direction, KindError};

/// Numeric identifier of a traffic group (the netlink log group).
pub type GroupId = u16;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon-wide settings.
    #[serde(default)]
    pub main: MainConfig,

    /// Traffic groups keyed by their numeric id.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,

    /// Per-plugin settings.
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainConfig {
    /// Seconds between two polling rounds.
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Counter executable spawned once per group.
    #[serde(default = "default_exe")]
    pub exe: String,

    /// Extra arguments placed between `exe` and the group/kind arguments.
    #[serde(default)]
    pub exe_args: Vec<String>,

    /// Name of the storage plugin receiving the accounting records.
    #[serde(default = "default_plugin")]
    pub plugin: String,

    /// Queue depth above which the writer logs a warning.
    #[serde(default = "default_queue_size_warn")]
    pub queue_size_warn: usize,

    /// Age in seconds above which a record waiting in the queue is reported.
    #[serde(default = "default_queue_age_warn")]
    pub queue_age_warn: u64,

    /// Upper bound in seconds on a single reactor wait.
    #[serde(default = "default_max_poll_slice")]
    pub max_poll_slice: u64,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            exe: default_exe(),
            exe_args: Vec::new(),
            plugin: default_plugin(),
            queue_size_warn: default_queue_size_warn(),
            queue_age_warn: default_queue_age_warn(),
            max_poll_slice: default_max_poll_slice(),
        }
    }
}

impl MainConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn queue_age_warn(&self) -> Duration {
        Duration::from_secs(self.queue_age_warn)
    }

    pub fn max_poll_slice(&self) -> Duration {
        Duration::from_secs(self.max_poll_slice)
    }
}

fn default_interval() -> u64 {
    300
}

fn default_exe() -> String {
    "/usr/sbin/nflogipac".to_string()
}

fn default_plugin() -> String {
    "debug".to_string()
}

fn default_queue_size_warn() -> usize {
    10_000
}

fn default_queue_age_warn() -> u64 {
    300
}

fn default_max_poll_slice() -> u64 {
    30
}

/// A single traffic group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Counter kind, forwarded verbatim to the counter executable.
    pub kind: String,
}

impl GroupConfig {
    /// Parse the kind string.
    pub fn counter_kind(&self) -> Result<CounterKind, KindError> {
        self.kind.parse()
    }
}

/// A validated group, as handed to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    /// The kind string exactly as configured.
    pub kind: String,
    pub counter_kind: CounterKind,
}

/// Settings for the built-in storage plugins.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Settings for the `spawn` plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn: Option<SpawnPluginConfig>,
}

/// Settings for the `spawn` plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnPluginConfig {
    /// Shell command line run once per round; records arrive on its stdin.
    pub cmdline: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Upper bound for `main.interval` and `main.max_poll_slice`, in seconds.
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        tracing::debug!(
            path = %path.display(),
            groups = config.groups.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.main.interval == 0 {
            return Err(ConfigError::Validation(
                "main.interval must be non-zero".to_string(),
            ));
        }
        if self.main.max_poll_slice == 0 {
            return Err(ConfigError::Validation(
                "main.max_poll_slice must be non-zero".to_string(),
            ));
        }
        if self.main.interval > MAX_INTERVAL_SECS {
            return Err(ConfigError::Validation(format!(
                "main.interval must be at most {MAX_INTERVAL_SECS} seconds, got {}",
                self.main.interval
            )));
        }
        if self.main.max_poll_slice > MAX_INTERVAL_SECS {
            return Err(ConfigError::Validation(format!(
                "main.max_poll_slice must be at most {MAX_INTERVAL_SECS} seconds, got {}",
                self.main.max_poll_slice
            )));
        }
        if self.main.exe.is_empty() {
            return Err(ConfigError::Validation(
                "main.exe must not be empty".to_string(),
            ));
        }
        if self.main.plugin.is_empty() {
            return Err(ConfigError::Validation(
                "main.plugin must not be empty".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                LOG_LEVELS, self.logging.level
            )));
        }
        if let Some(spawn) = &self.plugins.spawn
            && spawn.cmdline.trim().is_empty()
        {
            return Err(ConfigError::Validation(
                "plugins.spawn.cmdline must not be empty".to_string(),
            ));
        }
        self.groups()?;
        Ok(())
    }

    /// All configured groups, ordered by id.
    pub fn groups(&self) -> Result<Vec<Group>, ConfigError> {
        let mut groups = Vec::with_capacity(self.groups.len());
        for (key, group) in &self.groups {
            let id: GroupId = key.parse().map_err(|_| {
                ConfigError::Validation(format!(
                    "groups.{key}: group ids must be integers in 0..=65535"
                ))
            })?;
            let counter_kind = group
                .counter_kind()
                .map_err(|e| ConfigError::Validation(format!("groups.{key}.kind: {e}")))?;
            groups.push(Group {
                id,
                kind: group.kind.clone(),
                counter_kind,
            });
        }
        groups.sort_by_key(|g| g.id);
        if let Some(pair) = groups.windows(2).find(|pair| pair[0].id == pair[1].id) {
            return Err(ConfigError::Validation(format!(
                "group {} is configured more than once",
                pair[0].id
            )));
        }
        Ok(groups)
    }
}
