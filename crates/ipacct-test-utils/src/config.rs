//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries, and [`TestConfigFile`] when
//! the code under test wants a path.

use std::path::PathBuf;

use ipacct_config::{AppConfig, GroupConfig, GroupId, SpawnPluginConfig};
use tempfile::TempDir;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .interval(60)
///     .group(1, "ipv4src")
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn interval(mut self, secs: u64) -> Self {
        self.config.main.interval = secs;
        self
    }

    pub fn exe(mut self, exe: &str) -> Self {
        self.config.main.exe = exe.to_string();
        self
    }

    pub fn exe_args(mut self, args: Vec<String>) -> Self {
        self.config.main.exe_args = args;
        self
    }

    pub fn plugin(mut self, name: &str) -> Self {
        self.config.main.plugin = name.to_string();
        self
    }

    pub fn group(mut self, id: GroupId, kind: &str) -> Self {
        self.config.groups.insert(
            id.to_string(),
            GroupConfig {
                kind: kind.to_string(),
            },
        );
        self
    }

    pub fn queue_size_warn(mut self, depth: usize) -> Self {
        self.config.main.queue_size_warn = depth;
        self
    }

    pub fn max_poll_slice(mut self, secs: u64) -> Self {
        self.config.main.max_poll_slice = secs;
        self
    }

    pub fn spawn_cmdline(mut self, cmdline: &str) -> Self {
        self.config.plugins.spawn = Some(SpawnPluginConfig {
            cmdline: cmdline.to_string(),
        });
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A config file in a temp directory, deleted on drop (even on panic).
pub struct TestConfigFile {
    pub path: PathBuf,
    _temp_dir: TempDir,
}

impl TestConfigFile {
    /// Write `toml_content` to `ipacct.toml` in a fresh temp directory.
    pub async fn with_toml(toml_content: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("ipacct.toml");
        tokio::fs::write(&path, toml_content)
            .await
            .expect("failed to write test config");
        Self {
            path,
            _temp_dir: temp_dir,
        }
    }

    /// Load and validate the file.
    pub async fn load(&self) -> AppConfig {
        AppConfig::load(&self.path)
            .await
            .expect("failed to parse test config")
    }
}
