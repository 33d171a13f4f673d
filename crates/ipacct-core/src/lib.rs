#![deny(unsafe_code)]

//! ipacct core daemon runtime.
//!
//! Supervises one counter process per traffic group, polls them in rounds,
//! and hands the collected per-address byte counts to a storage plugin
//! running on its own thread. Gathering and storing only meet at the event
//! queue, so a slow backend never delays polling.

/// Per-counter socket channel and its callbacks.
pub mod channel;
/// Flags for steering the gather engine from signals and other threads.
pub mod control;
/// Core daemon process: startup, gather loop, shutdown.
pub mod daemon;
/// Events carried from the gatherer to the writer.
pub mod event;
/// Textual rendering of raw addresses.
pub mod format;
/// Round tracking over all counter channels.
pub mod gather;
/// Self-rescheduling timer tasks.
pub mod periodic;
/// Storage plugin contract and registry.
pub mod plugin;
/// Built-in storage plugins.
pub mod plugins;
/// Counter wire protocol.
pub mod protocol;
/// Unbounded event queue between gatherer and writer.
pub mod queue;
/// Scheduler-reactor event loop.
pub mod reactor;
/// Starting and reaping counter processes.
pub mod spawn;
/// Writer loop feeding the storage plugin.
pub mod writer;

pub use control::GatherControl;
pub use daemon::{Daemon, DaemonError, PreparedDaemon};
pub use event::{AccountRecord, Event, LossRecord, RawAddress};
pub use gather::{GatherEngine, Lifecycle};
pub use plugin::{Plugin, PluginError, PluginRegistry};
pub use queue::{EventReceiver, EventSender, event_queue};
pub use writer::{EXIT_PLUGIN_FAILURE, Writer, WriterSettings, WriterStats};
