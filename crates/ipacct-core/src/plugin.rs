//! Storage plugin contract and registry.
//!
//! A plugin receives the event stream of every round in order:
//! `start_write`, any number of `account`/`loss` calls, then `end_write`.
//! Plugins are looked up by name in a [`PluginRegistry`]; the built-in ones
//! live in [`crate::plugins`].

use std::collections::HashMap;

use ipacct_config::AppConfig;

use crate::event::{AccountRecord, Event, LossRecord};
use crate::format::FormatError;

/// Errors raised by storage plugins.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("unknown plugin {name:?} (available: {available})")]
    Unknown { name: String, available: String },

    #[error("plugin configuration error: {0}")]
    Config(String),

    #[error("address formatting failed: {0}")]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// A storage backend.
///
/// Runs on the writer thread only, so implementations need `Send` but never
/// `Sync`. Retrying transient backend failures is the plugin's business; an
/// error returned here is fatal to the daemon.
pub trait Plugin: Send {
    fn name(&self) -> &str;

    fn start_write(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn account(&mut self, record: &AccountRecord) -> Result<(), PluginError>;

    fn loss(&mut self, _record: &LossRecord) -> Result<(), PluginError> {
        Ok(())
    }

    fn end_write(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Last call before the writer exits.
    fn terminate(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Invoke the plugin method matching `event`.
pub fn dispatch(plugin: &mut dyn Plugin, event: &Event) -> Result<(), PluginError> {
    match event {
        Event::StartWrite => plugin.start_write(),
        Event::Account(record) => plugin.account(record),
        Event::Loss(record) => plugin.loss(record),
        Event::EndWrite => plugin.end_write(),
        Event::Terminate => plugin.terminate(),
    }
}

/// Builds a plugin from the daemon configuration.
pub type PluginFactory =
    Box<dyn Fn(&AppConfig) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync>;

/// Metadata about a registered plugin.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Name used in `main.plugin` (e.g. "spawn").
    pub name: String,
    /// Human-readable description.
    pub description: String,
}

struct Registered {
    info: PluginInfo,
    factory: PluginFactory,
}

/// Registry of storage plugins.
pub struct PluginRegistry {
    plugins: HashMap<String, Registered>,
}

impl PluginRegistry {
    /// Create an empty plugin registry.
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// A registry holding the built-in plugins.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            "debug",
            "print accounting records to stdout",
            crate::plugins::debug::DebugPlugin::from_config,
        );
        registry.register(
            "spawn",
            "pipe each round into a shell command (plugins.spawn.cmdline)",
            crate::plugins::spawn::SpawnPlugin::from_config,
        );
        registry
    }

    /// Register a plugin factory, replacing any plugin of the same name.
    pub fn register<F>(&mut self, name: &str, description: &str, factory: F)
    where
        F: Fn(&AppConfig) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        self.plugins.insert(
            name.to_string(),
            Registered {
                info: PluginInfo {
                    name: name.to_string(),
                    description: description.to_string(),
                },
                factory: Box::new(factory),
            },
        );
    }

    /// Look up a plugin by name.
    pub fn get(&self, name: &str) -> Option<&PluginInfo> {
        self.plugins.get(name).map(|r| &r.info)
    }

    /// All registered plugins, sorted by name.
    pub fn plugins(&self) -> Vec<&PluginInfo> {
        let mut infos: Vec<&PluginInfo> = self.plugins.values().map(|r| &r.info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// All registered plugin names, sorted.
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins().into_iter().map(|i| i.name.as_str()).collect()
    }

    /// Number of registered plugins.
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Instantiate the plugin called `name`.
    pub fn create(&self, name: &str, config: &AppConfig) -> Result<Box<dyn Plugin>, PluginError> {
        let registered = self.plugins.get(name).ok_or_else(|| PluginError::Unknown {
            name: name.to_string(),
            available: self.plugin_names().join(", "),
        })?;
        (registered.factory)(config)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::SystemTime;

    struct Counting {
        calls: Vec<&'static str>,
    }

    impl Plugin for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn start_write(&mut self) -> Result<(), PluginError> {
            self.calls.push("start");
            Ok(())
        }

        fn account(&mut self, _record: &AccountRecord) -> Result<(), PluginError> {
            self.calls.push("account");
            Ok(())
        }

        fn end_write(&mut self) -> Result<(), PluginError> {
            self.calls.push("end");
            Ok(())
        }
    }

    #[test]
    fn test_builtin_registry() {
        let registry = PluginRegistry::builtin();
        assert_eq!(registry.plugin_count(), 2);
        assert_eq!(registry.plugin_names(), vec!["debug", "spawn"]);
        assert!(registry.get("debug").is_some());
        assert!(registry.get("mysql").is_none());
    }

    #[test]
    fn test_create_unknown_plugin_lists_available() {
        let registry = PluginRegistry::builtin();
        let err = registry
            .create("postgres", &AppConfig::default())
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            r#"unknown plugin "postgres" (available: debug, spawn)"#
        );
    }

    #[test]
    fn test_register_custom_factory() {
        let mut registry = PluginRegistry::new();
        registry.register("counting", "test plugin", |_| {
            Ok(Box::new(Counting { calls: Vec::new() }))
        });
        let plugin = registry.create("counting", &AppConfig::default()).unwrap();
        assert_eq!(plugin.name(), "counting");
    }

    #[test]
    fn test_dispatch_routes_events() {
        let mut plugin = Counting { calls: Vec::new() };
        let record = AccountRecord {
            timestamp: SystemTime::now(),
            group: 1,
            address: [1u8, 2, 3, 4][..].into(),
            value: 10,
        };
        for event in [
            Event::StartWrite,
            Event::Account(record),
            Event::Loss(LossRecord {
                timestamp: SystemTime::now(),
                group: 1,
                count: 2,
            }),
            Event::EndWrite,
            Event::Terminate,
        ] {
            dispatch(&mut plugin, &event).unwrap();
        }
        assert_eq!(plugin.calls, vec!["start", "account", "end"]);
    }
}
