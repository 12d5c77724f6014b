//! Application configuration module.
//!
//! Manages the TOML config file: feed source, fetch policy, run options,
//! data paths and the channel catalog.

#[allow(clippy::module_inception)]
mod config;
mod paths;

#[allow(clippy::module_name_repetitions)]
pub use config::{AppConfig, ChannelConfig};
pub use paths::AppPaths;
