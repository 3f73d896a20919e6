//! Image pipeline configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::entities::WebImageOptions;
use crate::domain::ports::Credentials;
use crate::infrastructure::image::disk_cache::{DEFAULT_MAX_CACHE_SIZE, default_cache_path};
use crate::infrastructure::image::manager::{
    DEFAULT_ACCEPT, DEFAULT_MAX_CONCURRENT_OPERATIONS, RequestSettings,
};
use crate::infrastructure::image::memory_cache::{DEFAULT_COST_LIMIT, DEFAULT_COUNT_LIMIT};

pub(crate) const APP_NAME: &str = "lsimage";
pub(crate) const APP_QUALIFIER: &str = "com";
pub(crate) const APP_ORGANIZATION: &str = "linuxmobile";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Converts to tracing level.
    #[must_use]
    pub const fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Top-level configuration, read from `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebImageConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Network settings.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Network settings shared by all requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Whole-transfer timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Basic auth user name.
    #[serde(default)]
    pub username: Option<String>,

    /// Basic auth password.
    #[serde(default)]
    pub password: Option<String>,

    /// Operations allowed to run at once. Zero starts every operation inline.
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,

    /// Options applied to requests that do not set their own.
    #[serde(default)]
    pub default_options: WebImageOptions,

    /// Headers sent with every request.
    #[serde(default = "default_headers")]
    pub headers: BTreeMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            headers: default_headers(),
            username: None,
            password: None,
            max_concurrent_operations: default_max_concurrent_operations(),
            default_options: WebImageOptions::empty(),
        }
    }
}

impl NetworkConfig {
    /// Transport settings for the manager.
    #[must_use]
    pub fn request_settings(&self) -> RequestSettings {
        RequestSettings {
            headers: self.headers.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            credentials: self.username.as_ref().map(|username| Credentials {
                username: username.clone(),
                password: self.password.clone(),
            }),
        }
    }

    /// Queue size for the manager, `None` when operations start inline.
    #[must_use]
    pub const fn queue_limit(&self) -> Option<usize> {
        match self.max_concurrent_operations {
            0 => None,
            n => Some(n),
        }
    }
}

/// Memory and disk cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Disk cache directory. Defaults to the platform cache directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Maximum number of images in memory.
    #[serde(default = "default_memory_count_limit")]
    pub memory_count_limit: usize,

    /// Maximum memory cost in bytes.
    #[serde(default = "default_memory_cost_limit")]
    pub memory_cost_limit: u64,

    /// Maximum disk usage in bytes.
    #[serde(default = "default_disk_size_limit")]
    pub disk_size_limit: u64,

    /// Keep animated data when decoding from disk.
    #[serde(default = "default_true")]
    pub allow_animated_image: bool,

    /// Display scale attached to decoded images.
    #[serde(default = "default_screen_scale")]
    pub screen_scale: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            memory_count_limit: default_memory_count_limit(),
            memory_cost_limit: default_memory_cost_limit(),
            disk_size_limit: default_disk_size_limit(),
            allow_animated_image: true,
            screen_scale: default_screen_scale(),
        }
    }
}

impl CacheConfig {
    /// Returns the effective disk cache directory.
    #[must_use]
    pub fn effective_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_cache_path)
    }
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_headers() -> BTreeMap<String, String> {
    BTreeMap::from([("Accept".to_string(), DEFAULT_ACCEPT.to_string())])
}

fn default_max_concurrent_operations() -> usize {
    DEFAULT_MAX_CONCURRENT_OPERATIONS
}

fn default_memory_count_limit() -> usize {
    DEFAULT_COUNT_LIMIT
}

fn default_memory_cost_limit() -> u64 {
    DEFAULT_COST_LIMIT
}

fn default_disk_size_limit() -> u64 {
    DEFAULT_MAX_CACHE_SIZE
}

fn default_screen_scale() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

use super::args::CliArgs;

impl WebImageConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.cache.directory = Some(cache_dir.clone());
        }
        if let Some(timeout) = args.timeout {
            self.network.timeout_secs = timeout;
        }
        if let Some(max_concurrent) = args.max_concurrent {
            self.network.max_concurrent_operations = max_concurrent;
        }
        if let Some(scale) = args.scale {
            self.cache.screen_scale = scale;
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default log file path.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_dir().join("lsimage.log"))
    }

    /// Returns effective log path.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(Self::default_log_path)
    }
}

impl Default for WebImageConfig {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            log_level: LogLevel::Info,
            network: NetworkConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}
