//! Configuration file, CLI arguments and their storage.

pub mod app_config;
pub mod args;
pub mod storage;

pub use app_config::{CacheConfig, LogLevel, NetworkConfig, WebImageConfig};
pub use args::{CacheCommand, CliArgs, Command, FetchArgs};
pub use storage::{ConfigError, ConfigStorage};
