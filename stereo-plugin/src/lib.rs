//! stereo-plugin
//!
//! Injected into the host process. On attach it loads `stereo-plugin.json`,
//! sets up logging, runs stereo hook discovery over the host executable once
//! and keeps the resulting hooks alive for the lifetime of the process.
//!
//! Panics must never cross into the host; every fallible step returns a
//! result that the entry point logs.

mod config;
mod detours;
mod entry;
mod logger;

pub use config::{LogConfig, PluginConfig};
pub use entry::start;
