//! Core daemon process: startup, the gather loop, and shutdown.

use tracing::{debug, info, warn};

use ipacct_config::{AppConfig, ConfigError, Group, MainConfig};

use crate::control::GatherControl;
use crate::event::Event;
use crate::gather::GatherEngine;
use crate::periodic::PeriodicError;
use crate::plugin::{PluginError, PluginRegistry};
use crate::queue::{EventSender, event_queue};
use crate::reactor::Reactor;
use crate::spawn::{self, SpawnError, SpawnedCounter, spawn_counter};
use crate::writer::{Writer, WriterSettings, WriterStats};

/// The ipacct daemon.
pub struct Daemon {
    config: AppConfig,
    registry: PluginRegistry,
}

impl Daemon {
    /// Create a daemon using the built-in storage plugins.
    pub fn new(config: AppConfig) -> Self {
        Self::with_registry(config, PluginRegistry::builtin())
    }

    /// Create a daemon that looks its storage plugin up in `registry`.
    pub fn with_registry(config: AppConfig, registry: PluginRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Create the storage plugin and start one counter per group.
    ///
    /// Nothing is polled until [`PreparedDaemon::run`].
    pub fn prepare(self) -> Result<PreparedDaemon, DaemonError> {
        let main = &self.config.main;
        let groups = self.config.groups()?;
        if groups.is_empty() {
            return Err(DaemonError::NoGroups);
        }
        info!(
            plugin = %main.plugin,
            groups = groups.len(),
            interval_secs = main.interval,
            "ipacct daemon starting"
        );

        let plugin = self.registry.create(&main.plugin, &self.config)?;
        let mut reactor = Reactor::new(main.max_poll_slice())?;
        let (queue, receiver) = event_queue();
        let mut engine = GatherEngine::new(&reactor, main.interval(), queue.clone())?;

        for counter in spawn_all(main, &groups)? {
            engine.add_counter(counter)?;
        }
        engine.start(reactor.scheduler())?;

        Ok(PreparedDaemon {
            writer: Writer::new(plugin, receiver, WriterSettings::from_config(main)),
            engine,
            reactor,
            queue,
        })
    }

    /// Run the daemon until it is told to terminate.
    pub fn run(self) -> Result<WriterStats, DaemonError> {
        self.prepare()?.run()
    }
}

/// Start every counter, or none: on failure the ones already running are
/// closed and reaped.
fn spawn_all(main: &MainConfig, groups: &[Group]) -> Result<Vec<SpawnedCounter>, SpawnError> {
    let mut spawned = Vec::with_capacity(groups.len());
    for group in groups {
        match spawn_counter(&main.exe, &main.exe_args, group.id, &group.kind) {
            Ok(counter) => {
                info!(
                    group = group.id,
                    kind = %group.kind,
                    pid = counter.pid.as_raw(),
                    "counter started"
                );
                spawned.push(counter);
            }
            Err(e) => {
                for SpawnedCounter { group, pid, stream } in spawned {
                    drop(stream);
                    let status = spawn::reap(pid, true);
                    debug!(group, pid = pid.as_raw(), %status, "counter stopped after failed startup");
                }
                return Err(e);
            }
        }
    }
    Ok(spawned)
}

/// A daemon whose counters are running but not yet polled.
pub struct PreparedDaemon {
    engine: GatherEngine,
    reactor: Reactor<GatherEngine>,
    writer: Writer,
    queue: EventSender,
}

impl PreparedDaemon {
    /// Handle for requesting an immediate poll or termination.
    pub fn control(&self) -> GatherControl {
        self.engine.control()
    }

    /// Gather on the calling thread and store on a writer thread until
    /// termination has drained every counter and the writer is done.
    pub fn run(mut self) -> Result<WriterStats, DaemonError> {
        let control = self.engine.control();
        let _signals = control.install_signal_handlers()?;
        // Counters that died before the handler existed.
        control.notify_child_exit();

        let writer = self.writer.spawn()?;
        let gathered = self.reactor.run(&mut self.engine);
        self.engine.reap_remaining();

        if let Err(e) = self.queue.send(Event::Terminate) {
            warn!(error = %e, "writer exited early");
        }
        let stats = writer.join().map_err(|_| DaemonError::WriterPanicked)?;
        self.engine.mark_terminated();
        gathered?;

        info!(
            rounds = stats.rounds,
            records = stats.records,
            "ipacct daemon stopped"
        );
        Ok(stats)
    }
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no groups configured")]
    NoGroups,

    #[error("daemon startup failed: {0}")]
    Startup(#[from] SpawnError),

    #[error("storage plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("scheduling error: {0}")]
    Schedule(#[from] PeriodicError),

    #[error("writer thread panicked")]
    WriterPanicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
