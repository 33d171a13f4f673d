#![deny(unsafe_code)]

//! Shared test utilities for the ipacct workspace.
//!
//! Provides config builders, scripted fake counters, a recording storage
//! plugin and tracing helpers so that individual crate tests stay concise.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! ipacct-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod counter;
pub mod plugin;
pub mod tracing_setup;
