//! Image loading infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction
//! - Disk caching for persistence
//! - A two-tier image cache with an ordered disk I/O worker
//! - Cancellable download operations and the manager coordinating them

pub mod activity;
pub mod codec;
pub mod disk_cache;
pub mod dispatch;
pub mod http_fetcher;
pub mod image_cache;
pub mod manager;
pub mod memory_cache;
pub mod operation;

pub use activity::{BackgroundTaskTracker, NetworkActivityCounter};
pub use codec::DecodeOptions;
pub use disk_cache::DiskImageCache;
pub use dispatch::CallbackQueue;
pub use http_fetcher::HttpImageFetcher;
pub use image_cache::ImageCache;
pub use manager::{
    ImageRequest, ImageRequestHandle, RequestSettings, WebImageManager, WebImageManagerBuilder,
};
pub use memory_cache::{CacheStats, MemoryImageCache};
pub use operation::{ImageTransform, ListenerId, WebImageOperation};
