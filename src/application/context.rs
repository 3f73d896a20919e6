//! Explicit wiring of cache, manager and configuration.

use std::sync::{Arc, OnceLock};

use tracing::info;

use crate::domain::errors::WebImageError;
use crate::domain::ports::ImageFetcherPort;
use crate::infrastructure::config::WebImageConfig;
use crate::infrastructure::image::{
    CallbackQueue, DiskImageCache, ImageCache, MemoryImageCache, WebImageManager,
};

static SHARED: OnceLock<ImageContext> = OnceLock::new();

/// Cache, manager and the configuration they were built from.
#[derive(Debug, Clone)]
pub struct ImageContext {
    cache: ImageCache,
    manager: WebImageManager,
    config: Arc<WebImageConfig>,
}

impl ImageContext {
    /// Builds a context with the HTTP fetcher. Must run inside a tokio runtime.
    ///
    /// # Errors
    /// Returns error if the disk cache cannot be opened, no runtime is
    /// available, or the HTTP client cannot be built.
    pub fn from_config(config: WebImageConfig) -> Result<Self, WebImageError> {
        Self::build(config, None)
    }

    /// Builds a context that downloads through `fetcher`.
    ///
    /// # Errors
    /// Returns error if the disk cache cannot be opened or no runtime is available.
    pub fn with_fetcher(
        config: WebImageConfig,
        fetcher: Arc<dyn ImageFetcherPort>,
    ) -> Result<Self, WebImageError> {
        Self::build(config, Some(fetcher))
    }

    fn build(
        config: WebImageConfig,
        fetcher: Option<Arc<dyn ImageFetcherPort>>,
    ) -> Result<Self, WebImageError> {
        let directory = config.cache.effective_directory();
        let name = directory
            .file_name()
            .map_or_else(|| "images".to_owned(), |n| n.to_string_lossy().into_owned());

        let memory = MemoryImageCache::new(
            name.clone(),
            config.cache.memory_count_limit,
            config.cache.memory_cost_limit,
        );
        let disk = DiskImageCache::new(directory, config.cache.disk_size_limit)?;
        let cache = ImageCache::new(name, memory, disk, CallbackQueue::spawn());
        cache.set_allow_animated_image(config.cache.allow_animated_image);
        cache.set_scale(config.cache.screen_scale);

        let mut builder = WebImageManager::builder()
            .cache(cache.clone())
            .settings(config.network.request_settings())
            .max_concurrent(config.network.queue_limit());
        if let Some(fetcher) = fetcher {
            builder = builder.fetcher(fetcher);
        }
        let manager = builder.build()?;

        info!(
            cache = cache.name(),
            path = %cache.disk_cache().path().display(),
            "Image context ready"
        );

        Ok(Self {
            cache,
            manager,
            config: Arc::new(config),
        })
    }

    /// The image cache.
    #[must_use]
    pub const fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// The request manager.
    #[must_use]
    pub const fn manager(&self) -> &WebImageManager {
        &self.manager
    }

    /// The configuration the context was built from.
    #[must_use]
    pub fn config(&self) -> &WebImageConfig {
        &self.config
    }

    /// Installs this context as the process-wide default.
    ///
    /// # Errors
    /// Hands the context back if a default is already installed.
    pub fn install_shared(self) -> Result<(), Self> {
        SHARED.set(self)
    }

    /// The process-wide default, if installed.
    #[must_use]
    pub fn shared() -> Option<&'static Self> {
        SHARED.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{ImageCacheType, ImageFromType, WebImageOptions};
    use crate::domain::ports::mocks::MockImageFetcher;
    use crate::infrastructure::image::codec::test_support::png_bytes;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> WebImageConfig {
        let mut config = WebImageConfig::default();
        config.cache.directory = Some(dir.path().join("images"));
        config.cache.memory_count_limit = 3;
        config.cache.screen_scale = 2.0;
        config.network.max_concurrent_operations = 0;
        config
    }

    #[tokio::test]
    async fn test_context_follows_config() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MockImageFetcher::new());
        fetcher.respond("https://x/a.png", png_bytes(4, 4));

        let context = ImageContext::with_fetcher(config(&dir), fetcher.clone()).unwrap();

        assert_eq!(context.cache().name(), "images");
        assert_eq!(context.cache().memory_cache().count_limit(), 3);
        assert_eq!(context.manager().timeout().as_secs(), 15);

        let response = context
            .manager()
            .load("https://x/a.png", WebImageOptions::empty())
            .await;
        assert_eq!(response.from, ImageFromType::Remote);
        assert!((response.image.unwrap().scale() - 2.0).abs() < f32::EPSILON);

        context.cache().flush();
        let key = context
            .manager()
            .cache_key_for_url(&url::Url::parse("https://x/a.png").unwrap());
        assert!(context.cache().contains_image(&key, ImageCacheType::DISK));
    }

    #[tokio::test]
    async fn test_shared_context_installs_once() {
        let dir = tempfile::tempdir().unwrap();
        let first =
            ImageContext::with_fetcher(config(&dir), Arc::new(MockImageFetcher::new())).unwrap();
        let second =
            ImageContext::with_fetcher(config(&dir), Arc::new(MockImageFetcher::new())).unwrap();

        assert!(first.install_shared().is_ok());
        let shared = ImageContext::shared().unwrap();
        assert_eq!(shared.config().cache.memory_count_limit, 3);
        assert!(second.install_shared().is_err());
    }
}
