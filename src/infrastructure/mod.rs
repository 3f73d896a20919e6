//! Infrastructure layer with caches, transport and configuration.

/// Configuration file and CLI arguments.
pub mod config;
/// Image caching and loading.
pub mod image;

pub use config::{CliArgs, ConfigStorage, LogLevel, WebImageConfig};
pub use self::image::{
    CacheStats, DiskImageCache, HttpImageFetcher, ImageCache, ImageRequest, MemoryImageCache,
    WebImageManager, WebImageOperation,
};
