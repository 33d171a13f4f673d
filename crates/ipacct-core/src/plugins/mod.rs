//! Built-in storage plugins.

/// Human-readable dump of every round, for debugging counters.
pub mod debug;
/// Feed each round to a shell command.
pub mod spawn;

pub use debug::DebugPlugin;
pub use spawn::SpawnPlugin;
