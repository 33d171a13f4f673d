//! Writer loop: drains the event queue into the storage plugin.
//!
//! The writer owns the plugin and runs on its own thread so that slow or
//! retrying storage never delays polling. A plugin error is fatal: the
//! writer thread logs it and exits the whole process.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ipacct_config::MainConfig;
use tracing::{error, info, warn};

use crate::event::Event;
use crate::plugin::{Plugin, PluginError, dispatch};
use crate::queue::EventReceiver;

/// Process exit status used when the storage plugin fails.
pub const EXIT_PLUGIN_FAILURE: i32 = 3;

/// Backlog warning thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSettings {
    /// Queue depth above which a warning is logged.
    pub queue_size_warn: usize,
    /// Record age above which a warning is logged (once per round).
    pub queue_age_warn: Duration,
}

impl WriterSettings {
    pub fn from_config(main: &MainConfig) -> Self {
        Self {
            queue_size_warn: main.queue_size_warn,
            queue_age_warn: main.queue_age_warn(),
        }
    }
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self::from_config(&MainConfig::default())
    }
}

/// Counters reported when the writer finishes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriterStats {
    pub rounds: u64,
    pub records: u64,
    pub losses: u64,
}

/// Errors that end the writer loop.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("plugin {plugin} failed handling {event}: {source}")]
    Plugin {
        plugin: String,
        event: &'static str,
        #[source]
        source: PluginError,
    },
}

/// Sequential consumer of the event queue.
pub struct Writer {
    plugin: Box<dyn Plugin>,
    queue: EventReceiver,
    settings: WriterSettings,
}

impl Writer {
    pub fn new(plugin: Box<dyn Plugin>, queue: EventReceiver, settings: WriterSettings) -> Self {
        Self {
            plugin,
            queue,
            settings,
        }
    }

    /// Consume events until `Terminate` (or until every sender is gone).
    pub fn run(mut self) -> Result<WriterStats, WriterError> {
        let mut stats = WriterStats::default();
        let mut backlog_reported = false;
        let mut lag_reported = false;
        info!(plugin = self.plugin.name(), "writer started");

        loop {
            let depth = self.queue.len();
            if depth > self.settings.queue_size_warn {
                if !backlog_reported {
                    warn!(
                        depth,
                        threshold = self.settings.queue_size_warn,
                        "event queue is backing up"
                    );
                    backlog_reported = true;
                }
            } else {
                backlog_reported = false;
            }

            let Some(event) = self.queue.recv_blocking() else {
                warn!("event queue closed before terminate");
                return Ok(stats);
            };

            match &event {
                Event::StartWrite => lag_reported = false,
                Event::Account(_) => stats.records += 1,
                Event::Loss(_) => stats.losses += 1,
                Event::EndWrite => stats.rounds += 1,
                Event::Terminate => {}
            }
            if !lag_reported
                && let Some(age) = event.timestamp().and_then(|t| t.elapsed().ok())
                && age > self.settings.queue_age_warn
            {
                warn!(
                    age_secs = age.as_secs(),
                    threshold_secs = self.settings.queue_age_warn.as_secs(),
                    "storage is lagging behind polling"
                );
                lag_reported = true;
            }

            dispatch(self.plugin.as_mut(), &event).map_err(|source| WriterError::Plugin {
                plugin: self.plugin.name().to_string(),
                event: event.kind(),
                source,
            })?;

            if event == Event::Terminate {
                info!(
                    rounds = stats.rounds,
                    records = stats.records,
                    losses = stats.losses,
                    "writer finished"
                );
                return Ok(stats);
            }
        }
    }

    /// Run on a dedicated thread. A plugin failure exits the process with
    /// [`EXIT_PLUGIN_FAILURE`].
    pub fn spawn(self) -> io::Result<JoinHandle<WriterStats>> {
        thread::Builder::new()
            .name("ipacct-writer".to_string())
            .spawn(move || match self.run() {
                Ok(stats) => stats,
                Err(err) => {
                    error!(error = %err, "storage plugin failed, aborting");
                    std::process::exit(EXIT_PLUGIN_FAILURE);
                }
            })
    }
}
