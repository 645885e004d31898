#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! modemd library — the discovery, probing, assembly, and lifecycle core
//! behind the `modemd` daemon binary.
//!
//! The key building blocks:
//! - `devicebus` — hotplug grouping and debounce
//! - `probe` — port capability classification
//! - `plugin` — the plugin contract and registry
//! - `queue` — serialized per-port command queues with watchdog
//! - `modem` — modem assembly and the lifecycle state machine
//! - `poll` — guarded bounded-retry periodic tasks
//! - `surface` — the message-bus-facing event/command adapter

pub mod config;
pub mod devicebus;
pub mod error;
pub mod hotplug;
pub mod manager;
pub mod modem;
pub mod plugin;
pub mod poll;
pub mod port;
pub mod probe;
pub mod queue;
pub mod stream;
pub mod surface;

#[cfg(test)]
pub mod testutil;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{Error, Result};
pub use manager::DeviceManager;
pub use modem::{Modem, ModemState};
pub use plugin::{Plugin, PluginRegistry};
pub use surface::{SurfaceCommand, SurfaceHandle};
