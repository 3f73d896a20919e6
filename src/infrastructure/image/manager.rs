//! Request coordinator: cache fast path, de-duplication, failed-URL blocklist
//! and a bounded operation queue.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, info, trace};
use url::Url;

use super::activity::{BackgroundTaskTracker, NetworkActivityCounter};
use super::dispatch::CallbackQueue;
use super::http_fetcher::HttpImageFetcher;
use super::image_cache::ImageCache;
use super::operation::{
    CompletionCallback, ImageTransform, ListenerId, OperationEnv, ProgressCallback,
    RejectedListener, WebImageOperation,
};
use crate::domain::entities::{
    CacheKey, ImageCacheType, ImageFromType, ImageResponse, WebImage, WebImageOptions,
};
use crate::domain::errors::WebImageError;
use crate::domain::ports::{
    BackgroundTaskPort, Credentials, FetchRequest, ImageFetcherPort, NetworkActivityPort,
};

/// Default number of operations allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 6;

/// Default whole-transfer timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default `Accept` header value.
pub const DEFAULT_ACCEPT: &str = "image/webp,image/*;q=0.8";

/// Maps a URL to a cache key. `None` falls back to the URL string.
pub type CacheKeyFilter = Arc<dyn Fn(&Url) -> Option<CacheKey> + Send + Sync>;

/// Rewrites the shared headers for one request.
pub type HeadersFilter =
    Arc<dyn Fn(&Url, &BTreeMap<String, String>) -> BTreeMap<String, String> + Send + Sync>;

/// Transport settings shared by every request a manager issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSettings {
    /// Headers sent with each request.
    pub headers: BTreeMap<String, String>,
    /// Whole-transfer timeout.
    pub timeout: Duration,
    /// Optional Basic credentials.
    pub credentials: Option<Credentials>,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            headers: BTreeMap::from([("Accept".to_owned(), DEFAULT_ACCEPT.to_owned())]),
            timeout: DEFAULT_TIMEOUT,
            credentials: None,
        }
    }
}

/// One image request as handed to [`WebImageManager::request_image`].
#[derive(Default)]
pub struct ImageRequest {
    url: Option<Url>,
    options: WebImageOptions,
    progress: Option<ProgressCallback>,
    transform: Option<ImageTransform>,
    completion: Option<CompletionCallback>,
}

impl ImageRequest {
    /// Creates a request for `url`. An unparseable URL is kept as missing and
    /// reported as [`WebImageError::InvalidUrl`].
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: Url::parse(url).ok(),
            ..Self::default()
        }
    }

    /// Creates a request for an already parsed URL.
    #[must_use]
    pub fn from_url(url: Url) -> Self {
        Self {
            url: Some(url),
            ..Self::default()
        }
    }

    /// Sets the request options.
    #[must_use]
    pub fn options(mut self, options: WebImageOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the progress listener.
    #[must_use]
    pub fn on_progress(
        mut self,
        progress: impl Fn(u64, Option<u64>) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Sets a transform applied to the downloaded image before it is cached.
    #[must_use]
    pub fn transform(
        mut self,
        transform: impl Fn(Arc<WebImage>, &Url) -> Option<Arc<WebImage>> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Sets the completion, run once on the callback queue.
    #[must_use]
    pub fn on_complete(mut self, completion: impl FnOnce(ImageResponse) + Send + 'static) -> Self {
        self.completion = Some(Box::new(completion));
        self
    }

    /// The parsed URL, if valid.
    #[must_use]
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Removes and returns the completion.
    pub fn take_completion(&mut self) -> Option<CompletionCallback> {
        self.completion.take()
    }
}

impl std::fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRequest")
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("options", &self.options)
            .field("progress", &self.progress.is_some())
            .field("transform", &self.transform.is_some())
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

/// One caller's share of a running operation.
///
/// Requests for the same key may share an operation; cancelling a handle
/// withdraws only this caller.
#[derive(Debug, Clone)]
pub struct ImageRequestHandle {
    operation: WebImageOperation,
    listener: ListenerId,
}

impl ImageRequestHandle {
    /// The operation serving this request, possibly shared with other callers.
    #[must_use]
    pub const fn operation(&self) -> &WebImageOperation {
        &self.operation
    }

    /// This caller's listener id on the operation.
    #[must_use]
    pub const fn listener(&self) -> ListenerId {
        self.listener
    }

    /// Withdraws this caller. Its completion receives `Cancelled`; the
    /// operation stops once no caller is left.
    pub fn cancel(&self) {
        self.operation.detach(self.listener);
    }
}

/// Builder for [`WebImageManager`].
pub struct WebImageManagerBuilder {
    cache: Option<ImageCache>,
    fetcher: Option<Arc<dyn ImageFetcherPort>>,
    callbacks: Option<CallbackQueue>,
    activity: Option<Arc<dyn NetworkActivityPort>>,
    background: Option<Arc<dyn BackgroundTaskPort>>,
    max_concurrent: Option<usize>,
    settings: RequestSettings,
    cache_key_filter: Option<CacheKeyFilter>,
    headers_filter: Option<HeadersFilter>,
    shared_transform: Option<ImageTransform>,
}

impl Default for WebImageManagerBuilder {
    fn default() -> Self {
        Self {
            cache: None,
            fetcher: None,
            callbacks: None,
            activity: None,
            background: None,
            max_concurrent: Some(DEFAULT_MAX_CONCURRENT_OPERATIONS),
            settings: RequestSettings::default(),
            cache_key_filter: None,
            headers_filter: None,
            shared_transform: None,
        }
    }
}

impl WebImageManagerBuilder {
    /// Sets the image cache. Without one every request goes to the network.
    #[must_use]
    pub fn cache(mut self, cache: ImageCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the transport. Defaults to [`HttpImageFetcher`].
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn ImageFetcherPort>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Sets the callback queue. Defaults to the cache's queue, or a new one.
    #[must_use]
    pub fn callbacks(mut self, callbacks: CallbackQueue) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Sets the network activity indicator.
    #[must_use]
    pub fn network_activity(mut self, activity: Arc<dyn NetworkActivityPort>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Sets the background task registry.
    #[must_use]
    pub fn background_tasks(mut self, background: Arc<dyn BackgroundTaskPort>) -> Self {
        self.background = Some(background);
        self
    }

    /// Limits concurrently running operations. `None` starts operations inline.
    #[must_use]
    pub fn max_concurrent(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent = limit;
        self
    }

    /// Sets the shared transport settings.
    #[must_use]
    pub fn settings(mut self, settings: RequestSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the cache key filter.
    #[must_use]
    pub fn cache_key_filter(
        mut self,
        filter: impl Fn(&Url) -> Option<CacheKey> + Send + Sync + 'static,
    ) -> Self {
        self.cache_key_filter = Some(Arc::new(filter));
        self
    }

    /// Sets the per-request headers filter.
    #[must_use]
    pub fn headers_filter(
        mut self,
        filter: impl Fn(&Url, &BTreeMap<String, String>) -> BTreeMap<String, String>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.headers_filter = Some(Arc::new(filter));
        self
    }

    /// Sets the transform used by requests that bring none of their own.
    #[must_use]
    pub fn shared_transform(
        mut self,
        transform: impl Fn(Arc<WebImage>, &Url) -> Option<Arc<WebImage>> + Send + Sync + 'static,
    ) -> Self {
        self.shared_transform = Some(Arc::new(transform));
        self
    }

    /// Builds the manager on the current tokio runtime.
    ///
    /// # Errors
    /// Returns [`WebImageError::NoRuntime`] outside a runtime, or a client
    /// error if the default HTTP fetcher cannot be built.
    pub fn build(self) -> Result<WebImageManager, WebImageError> {
        let runtime = Handle::try_current().map_err(|_| WebImageError::NoRuntime)?;
        let fetcher: Arc<dyn ImageFetcherPort> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpImageFetcher::new()?),
        };
        let callbacks = self
            .callbacks
            .or_else(|| self.cache.as_ref().map(|cache| cache.callbacks().clone()))
            .unwrap_or_else(CallbackQueue::spawn);
        let scale = self.cache.as_ref().map_or(1.0, ImageCache::scale);

        let env = OperationEnv {
            cache: self.cache,
            fetcher,
            callbacks,
            activity: self
                .activity
                .unwrap_or_else(|| Arc::new(NetworkActivityCounter::new())),
            background: self
                .background
                .unwrap_or_else(|| Arc::new(BackgroundTaskTracker::new())),
            runtime,
            scale,
        };

        info!(
            max_concurrent = ?self.max_concurrent,
            cache = env.cache.as_ref().map(ImageCache::name),
            "Web image manager ready"
        );

        Ok(WebImageManager {
            inner: Arc::new(ManagerInner {
                env,
                queue: self.max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
                running: Mutex::new(HashMap::new()),
                failed_urls: Mutex::new(HashSet::new()),
                settings: RwLock::new(self.settings),
                cache_key_filter: self.cache_key_filter,
                headers_filter: self.headers_filter,
                shared_transform: self.shared_transform,
            }),
        })
    }
}

struct ManagerInner {
    env: OperationEnv,
    queue: Option<Arc<Semaphore>>,
    running: Mutex<HashMap<CacheKey, WebImageOperation>>,
    failed_urls: Mutex<HashSet<String>>,
    settings: RwLock<RequestSettings>,
    cache_key_filter: Option<CacheKeyFilter>,
    headers_filter: Option<HeadersFilter>,
    shared_transform: Option<ImageTransform>,
}

impl ManagerInner {
    /// Bookkeeping run first when an operation reports.
    fn operation_finished(
        &self,
        key: &CacheKey,
        id: u64,
        url: &Url,
        options: WebImageOptions,
        response: &ImageResponse,
    ) {
        {
            let mut running = self.running.lock();
            if running.get(key).is_some_and(|op| op.id() == id) {
                running.remove(key);
            }
        }

        if options.contains(WebImageOptions::IGNORE_FAILED_URL)
            && let Some(error) = &response.error
            && !error.is_cancelled()
        {
            debug!(url = %url, error = %error, "Adding URL to failed set");
            self.failed_urls.lock().insert(url.as_str().to_owned());
        }
    }
}

/// Coordinates image requests. Clones share the same state.
#[derive(Clone)]
pub struct WebImageManager {
    inner: Arc<ManagerInner>,
}

impl WebImageManager {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> WebImageManagerBuilder {
        WebImageManagerBuilder::default()
    }

    /// The cache requests read and write, if any.
    #[must_use]
    pub fn cache(&self) -> Option<&ImageCache> {
        self.inner.env.cache.as_ref()
    }

    /// Queue completions are delivered on.
    #[must_use]
    pub fn callbacks(&self) -> &CallbackQueue {
        &self.inner.env.callbacks
    }

    /// Network activity indicator shared by this manager's operations.
    #[must_use]
    pub fn network_activity(&self) -> &Arc<dyn NetworkActivityPort> {
        &self.inner.env.activity
    }

    /// Cache key for `url`, after the key filter.
    #[must_use]
    pub fn cache_key_for_url(&self, url: &Url) -> CacheKey {
        self.inner
            .cache_key_filter
            .as_ref()
            .and_then(|filter| filter(url))
            .unwrap_or_else(|| CacheKey::from_url(url))
    }

    /// Issues a request.
    ///
    /// Returns this caller's handle on the operation serving it, or `None`
    /// when the request was answered without one (invalid or blacklisted URL,
    /// memory fast path). The completion always runs exactly once, on the
    /// callback queue.
    pub fn request_image(&self, request: ImageRequest) -> Option<ImageRequestHandle> {
        let ImageRequest {
            url,
            options,
            progress,
            transform,
            completion,
        } = request;

        let Some(url) = url else {
            debug!("Rejecting request without a valid URL");
            self.complete_now(completion, ImageResponse::failure(None, WebImageError::InvalidUrl));
            return None;
        };

        if options.contains(WebImageOptions::IGNORE_FAILED_URL) && self.is_failed_url(&url) {
            debug!(url = %url, "Rejecting blacklisted URL");
            let error = WebImageError::blacklisted(url.as_str());
            self.complete_now(completion, ImageResponse::failure(Some(url), error));
            return None;
        }

        let key = self.cache_key_for_url(&url);

        if options.reads_cache()
            && let Some(cache) = self.cache()
            && let Some(image) = cache.get_image(&key, ImageCacheType::ALL)
        {
            trace!(key = %key, "Request served from cache fast path");
            self.complete_now(
                completion,
                ImageResponse::success(Some(image), url, ImageFromType::MemoryCacheFast),
            );
            return None;
        }

        let transform = transform.or_else(|| self.inner.shared_transform.clone());
        let (progress, completion) =
            match self.attach(&key, options, transform.as_ref(), progress, completion) {
                Ok(handle) => return Some(handle),
                Err(listeners) => listeners,
            };

        let op = self.create_operation(url, key.clone(), options, transform);
        let listener = match op.add_listener(progress, completion) {
            Ok(listener) => listener,
            Err((_, completion)) => {
                self.complete_now(completion, ImageResponse::cancelled(op.url().clone()));
                return None;
            }
        };

        let replaced = self.inner.running.lock().insert(key.clone(), op.clone());
        if replaced.is_some() {
            trace!(key = %key, "Replaced running operation with an independent one");
        }

        self.submit(&op);
        Some(ImageRequestHandle {
            operation: op,
            listener,
        })
    }

    /// Attaches the listeners to a compatible running operation for `key`,
    /// or hands them back.
    fn attach(
        &self,
        key: &CacheKey,
        options: WebImageOptions,
        transform: Option<&ImageTransform>,
        progress: Option<ProgressCallback>,
        completion: Option<CompletionCallback>,
    ) -> Result<ImageRequestHandle, RejectedListener> {
        let running = self.inner.running.lock();
        let Some(op) = running.get(key) else {
            return Err((progress, completion));
        };

        let same_transform = match (op.transform(), transform) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if op.options() != options || !same_transform || op.is_cancelled() {
            return Err((progress, completion));
        }

        let listener = op.add_listener(progress, completion)?;

        trace!(key = %key, op = op.id(), listener, "Request attached to running operation");
        Ok(ImageRequestHandle {
            operation: op.clone(),
            listener,
        })
    }

    fn create_operation(
        &self,
        url: Url,
        key: CacheKey,
        options: WebImageOptions,
        transform: Option<ImageTransform>,
    ) -> WebImageOperation {
        let settings = self.inner.settings.read().clone();
        let headers = match &self.inner.headers_filter {
            Some(filter) => filter(&url, &settings.headers),
            None => settings.headers,
        };
        let request = FetchRequest {
            url: url.clone(),
            headers,
            timeout: settings.timeout,
            credentials: settings.credentials,
            options,
        };

        let op = WebImageOperation::new(self.inner.env.clone(), request, key.clone(), transform);

        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let id = op.id();
        let _ = op.on_finished(Box::new(move |response| {
            if let Some(manager) = manager.upgrade() {
                manager.operation_finished(&key, id, &url, options, &response);
            }
        }));

        debug!(op = id, url = %op.url(), key = %op.cache_key(), ?options, "Created operation");
        op
    }

    fn submit(&self, op: &WebImageOperation) {
        let Some(queue) = self.inner.queue.clone() else {
            op.start();
            return;
        };

        let op = op.clone();
        self.inner.env.runtime.spawn(async move {
            let Ok(_permit) = queue.acquire_owned().await else {
                op.cancel();
                return;
            };
            op.start();
            op.wait_until_finished().await;
        });
    }

    fn complete_now(&self, completion: Option<CompletionCallback>, response: ImageResponse) {
        if let Some(completion) = completion {
            self.inner.env.callbacks.dispatch(move || completion(response));
        }
    }

    /// Cancels the running operation for `url`, if any.
    pub fn cancel_image_request(&self, url: &Url) {
        let key = self.cache_key_for_url(url);
        let op = self.inner.running.lock().remove(&key);
        if let Some(op) = op {
            op.cancel();
        }
    }

    /// Cancels every running operation.
    pub fn cancel_all_requests(&self) {
        let ops: Vec<_> = self.inner.running.lock().drain().map(|(_, op)| op).collect();
        if !ops.is_empty() {
            debug!(count = ops.len(), "Cancelling all requests");
        }
        for op in ops {
            op.cancel();
        }
    }

    /// Forgets every failed URL.
    pub fn clear_failed_urls(&self) {
        self.inner.failed_urls.lock().clear();
    }

    /// Returns true if `url` is in the failed set.
    #[must_use]
    pub fn is_failed_url(&self, url: &Url) -> bool {
        self.inner.failed_urls.lock().contains(url.as_str())
    }

    /// The operation currently registered for `url`.
    #[must_use]
    pub fn running_operation(&self, url: &Url) -> Option<WebImageOperation> {
        let key = self.cache_key_for_url(url);
        self.inner.running.lock().get(&key).cloned()
    }

    /// Number of registered operations.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.inner.running.lock().len()
    }

    /// Shared request headers.
    #[must_use]
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.inner.settings.read().headers.clone()
    }

    /// Replaces the shared request headers.
    pub fn set_headers(&self, headers: BTreeMap<String, String>) {
        self.inner.settings.write().headers = headers;
    }

    /// Sets or removes one shared header.
    pub fn set_header(&self, name: impl Into<String>, value: Option<String>) {
        let mut settings = self.inner.settings.write();
        let name = name.into();
        match value {
            Some(value) => settings.headers.insert(name, value),
            None => settings.headers.remove(&name),
        };
    }

    /// Request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.settings.read().timeout
    }

    /// Sets the request timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.settings.write().timeout = timeout;
    }

    /// Basic credentials sent with requests.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.settings.read().credentials.clone()
    }

    /// Sets the Basic credentials.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        self.inner.settings.write().credentials = credentials;
    }

    /// Requests `url` and waits for the response.
    pub async fn load(&self, url: &str, options: WebImageOptions) -> ImageResponse {
        let (tx, rx) = oneshot::channel();
        let request = ImageRequest::new(url).options(options).on_complete(move |response| {
            let _ = tx.send(response);
        });
        self.request_image(request);
        rx.await.unwrap_or_else(|_| {
            ImageResponse::failure(Url::parse(url).ok(), WebImageError::Cancelled)
        })
    }
}

impl std::fmt::Debug for WebImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebImageManager")
            .field("cache", &self.inner.env.cache)
            .field("running", &self.running_count())
            .field("settings", &*self.inner.settings.read())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::ImageStage;
    use crate::domain::ports::mocks::MockImageFetcher;
    use crate::infrastructure::image::codec::test_support::png_bytes;
    use crate::infrastructure::image::image_cache::test_support::temp_cache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const URL: &str = "https://x/a.png";

    struct Fixture {
        manager: WebImageManager,
        fetcher: Arc<MockImageFetcher>,
        cache: ImageCache,
        _temp: TempDir,
    }

    fn fixture_with(configure: impl FnOnce(WebImageManagerBuilder) -> WebImageManagerBuilder) -> Fixture {
        let (cache, temp) = temp_cache();
        let fetcher = Arc::new(MockImageFetcher::new());
        let builder = WebImageManager::builder()
            .cache(cache.clone())
            .fetcher(fetcher.clone());
        Fixture {
            manager: configure(builder).build().unwrap(),
            fetcher,
            cache,
            _temp: temp,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|builder| builder)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn request(
        manager: &WebImageManager,
        request: ImageRequest,
    ) -> (Option<ImageRequestHandle>, ImageResponse) {
        let (tx, rx) = oneshot::channel();
        let op = manager.request_image(request.on_complete(move |response| {
            let _ = tx.send((response, CallbackQueue::is_current()));
        }));
        let (response, on_callback_thread) = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(on_callback_thread);
        (op, response)
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = WebImageManager::builder()
            .fetcher(Arc::new(MockImageFetcher::new()))
            .build();
        assert_eq!(result.err(), Some(WebImageError::NoRuntime));
    }

    #[tokio::test]
    async fn test_invalid_url_reports_once_asynchronously() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let calls_in_completion = calls.clone();

        let op = f.manager.request_image(ImageRequest::new("not a url").on_complete(move |response| {
            calls_in_completion.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send((response, CallbackQueue::is_current()));
        }));

        assert!(op.is_none());
        let (response, on_callback_thread) = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(on_callback_thread);
        assert!(response.image.is_none());
        assert!(response.url.is_none());
        assert_eq!(response.from, ImageFromType::None);
        assert_eq!(response.stage, ImageStage::Finished);
        assert_eq!(response.error, Some(WebImageError::InvalidUrl));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prepopulated_memory_uses_fast_path() {
        let f = fixture();
        let image = Arc::new(WebImage::from(::image::DynamicImage::new_rgba8(3, 3)));
        f.cache
            .set_image(Some(image.clone()), None, &CacheKey::new(URL), ImageCacheType::MEMORY);

        let (op, response) = request(&f.manager, ImageRequest::new(URL)).await;

        assert!(op.is_none());
        assert_eq!(response.from, ImageFromType::MemoryCacheFast);
        assert!(Arc::ptr_eq(&response.image.unwrap(), &image));
        assert_eq!(f.fetcher.attempts(), 0);
        assert_eq!(f.manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_download_is_cached_for_next_request() {
        let f = fixture();
        f.fetcher.respond(URL, png_bytes(4, 4));

        let first = f.manager.load(URL, WebImageOptions::empty()).await;
        assert_eq!(first.from, ImageFromType::Remote);
        assert_eq!(f.manager.running_count(), 0);

        let second = f.manager.load(URL, WebImageOptions::empty()).await;
        assert_eq!(second.from, ImageFromType::MemoryCacheFast);
        assert_eq!(f.fetcher.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_url_is_blacklisted_until_cleared() {
        let f = fixture();
        f.fetcher.fail(URL, WebImageError::HttpStatus { status: 500 });
        let options = WebImageOptions::IGNORE_FAILED_URL;

        let first = f.manager.load(URL, options).await;
        assert_eq!(first.error, Some(WebImageError::HttpStatus { status: 500 }));
        assert!(f.manager.is_failed_url(&url(URL)));

        let second = f.manager.load(URL, options).await;
        assert_eq!(second.error, Some(WebImageError::blacklisted(URL)));
        assert_eq!(f.fetcher.attempts(), 1);

        f.manager.clear_failed_urls();
        let third = f.manager.load(URL, options).await;
        assert_eq!(third.error, Some(WebImageError::HttpStatus { status: 500 }));
        assert_eq!(f.fetcher.attempts(), 2);
    }

    #[tokio::test]
    async fn test_failures_without_option_are_not_blacklisted() {
        let f = fixture();
        f.fetcher.fail(URL, WebImageError::transfer("reset"));

        let _ = f.manager.load(URL, WebImageOptions::empty()).await;
        let _ = f.manager.load(URL, WebImageOptions::IGNORE_FAILED_URL).await;

        assert_eq!(f.fetcher.attempts(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_operation() {
        let f = fixture();
        f.fetcher.respond(URL, png_bytes(2, 2));
        f.fetcher.set_delay(Duration::from_millis(200));

        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        let a = f.manager.request_image(ImageRequest::new(URL).on_complete(move |r| {
            let _ = tx_a.send(r);
        }));
        let b = f.manager.request_image(ImageRequest::new(URL).on_complete(move |r| {
            let _ = tx_b.send(r);
        }));

        let (a_handle, b_handle) = (a.unwrap(), b.unwrap());
        assert_eq!(a_handle.operation().id(), b_handle.operation().id());
        assert_ne!(a_handle.listener(), b_handle.listener());
        assert_eq!(a_handle.operation().listener_count(), 2);
        assert_eq!(f.manager.running_count(), 1);

        let a = rx_a.await.unwrap();
        let b = rx_b.await.unwrap();
        assert!(Arc::ptr_eq(a.image.as_ref().unwrap(), b.image.as_ref().unwrap()));
        assert_eq!(f.fetcher.attempts(), 1);
        assert_eq!(f.manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelling_one_shared_request_leaves_the_other_running() {
        let f = fixture();
        f.fetcher.respond(URL, png_bytes(2, 2));
        f.fetcher.set_delay(Duration::from_millis(200));

        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        let a = f
            .manager
            .request_image(ImageRequest::new(URL).on_complete(move |r| {
                let _ = tx_a.send(r);
            }))
            .unwrap();
        let b = f
            .manager
            .request_image(ImageRequest::new(URL).on_complete(move |r| {
                let _ = tx_b.send(r);
            }))
            .unwrap();

        a.cancel();

        let a = tokio::time::timeout(Duration::from_secs(5), rx_a)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.stage, ImageStage::Cancelled);
        assert!(!b.operation().is_cancelled());

        let b_response = tokio::time::timeout(Duration::from_secs(5), rx_b)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b_response.from, ImageFromType::Remote);
        assert!(b_response.image.is_some());
        assert_eq!(f.fetcher.attempts(), 1);
    }

    #[tokio::test]
    async fn test_cancelling_every_shared_request_stops_the_operation() {
        let f = fixture();
        f.fetcher.respond(URL, png_bytes(2, 2));
        f.fetcher.set_delay(Duration::from_secs(30));

        let a = f.manager.request_image(ImageRequest::new(URL)).unwrap();
        let b = f.manager.request_image(ImageRequest::new(URL)).unwrap();
        let op = a.operation().clone();

        a.cancel();
        assert!(!op.is_cancelled());
        b.cancel();

        tokio::time::timeout(Duration::from_secs(5), op.wait_until_finished())
            .await
            .unwrap();
        assert!(op.is_cancelled());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_incompatible_request_gets_independent_operation() {
        let f = fixture();
        f.fetcher.respond(URL, png_bytes(2, 2));
        f.fetcher.set_delay(Duration::from_millis(200));

        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        let a = f
            .manager
            .request_image(ImageRequest::new(URL).on_complete(move |r| {
                let _ = tx_a.send(r);
            }))
            .unwrap();
        let b = f
            .manager
            .request_image(
                ImageRequest::new(URL)
                    .options(WebImageOptions::SHOW_NETWORK_ACTIVITY)
                    .on_complete(move |r| {
                        let _ = tx_b.send(r);
                    }),
            )
            .unwrap();

        assert_ne!(a.operation().id(), b.operation().id());
        assert_eq!(
            f.manager.running_operation(&url(URL)).unwrap().id(),
            b.operation().id()
        );

        assert!(rx_a.await.unwrap().is_success());
        assert!(rx_b.await.unwrap().is_success());
        assert_eq!(f.fetcher.attempts(), 2);
        assert_eq!(f.manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_request_reports_cancelled_without_blacklisting() {
        let f = fixture();
        f.fetcher.respond(URL, png_bytes(2, 2));
        f.fetcher.set_delay(Duration::from_secs(30));

        let (tx, rx) = oneshot::channel();
        let op = f
            .manager
            .request_image(
                ImageRequest::new(URL)
                    .options(WebImageOptions::IGNORE_FAILED_URL)
                    .on_complete(move |r| {
                        let _ = tx.send(r);
                    }),
            )
            .unwrap()
            .operation()
            .clone();

        f.manager.cancel_image_request(&url(URL));
        let response = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.stage, ImageStage::Cancelled);
        assert!(response.image.is_none());
        assert!(op.is_cancelled());
        assert!(!f.manager.is_failed_url(&url(URL)));
        assert_eq!(f.manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_requests() {
        let f = fixture();
        f.fetcher.set_delay(Duration::from_secs(30));
        let urls = ["https://x/1.png", "https://x/2.png", "https://x/3.png"];
        let ops: Vec<_> = urls
            .iter()
            .filter_map(|u| f.manager.request_image(ImageRequest::new(u)))
            .map(|handle| handle.operation().clone())
            .collect();
        assert_eq!(f.manager.running_count(), 3);

        f.manager.cancel_all_requests();

        assert_eq!(f.manager.running_count(), 0);
        for op in ops {
            tokio::time::timeout(Duration::from_secs(5), op.wait_until_finished())
                .await
                .unwrap();
            assert!(op.is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_queue_limits_running_operations() {
        let f = fixture_with(|builder| builder.max_concurrent(Some(1)));
        f.fetcher.respond("https://x/1.png", png_bytes(2, 2));
        f.fetcher.respond("https://x/2.png", png_bytes(2, 2));
        f.fetcher.set_delay(Duration::from_millis(300));

        let first = f
            .manager
            .request_image(ImageRequest::new("https://x/1.png"))
            .unwrap()
            .operation()
            .clone();
        let second = f
            .manager
            .request_image(ImageRequest::new("https://x/2.png"))
            .unwrap()
            .operation()
            .clone();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(first.is_executing());
        assert!(!second.is_executing());
        assert!(!second.is_finished());

        tokio::time::timeout(Duration::from_secs(5), second.wait_until_finished())
            .await
            .unwrap();
        assert!(first.is_finished());
    }

    #[tokio::test]
    async fn test_filters_and_settings_shape_request() {
        let f = fixture_with(|builder| {
            builder
                .cache_key_filter(|url| {
                    let mut stripped = url.clone();
                    stripped.set_query(None);
                    Some(CacheKey::from_url(&stripped))
                })
                .headers_filter(|_, headers| {
                    let mut headers = headers.clone();
                    headers.insert("X-Test".to_owned(), "1".to_owned());
                    headers
                })
        });
        f.manager.set_timeout(Duration::from_secs(3));
        f.fetcher.respond("https://x/a.png?v=1", png_bytes(2, 2));

        let response = f.manager.load("https://x/a.png?v=1", WebImageOptions::empty()).await;
        assert!(response.is_success());

        let sent = &f.fetcher.requests()[0];
        assert_eq!(sent.headers.get("Accept").map(String::as_str), Some(DEFAULT_ACCEPT));
        assert_eq!(sent.headers.get("X-Test").map(String::as_str), Some("1"));
        assert_eq!(sent.timeout, Duration::from_secs(3));

        let cached = f.manager.load("https://x/a.png?v=2", WebImageOptions::empty()).await;
        assert_eq!(cached.from, ImageFromType::MemoryCacheFast);
        assert_eq!(f.fetcher.attempts(), 1);
    }

    #[tokio::test]
    async fn test_shared_transform_applies_to_plain_requests() {
        let f = fixture_with(|builder| {
            builder.shared_transform(|image, _| Some(Arc::new(WebImage::new(image.bitmap().thumbnail(1, 1)))))
        });
        f.fetcher.respond(URL, png_bytes(6, 6));

        let response = f.manager.load(URL, WebImageOptions::empty()).await;

        assert_eq!(response.image.unwrap().width(), 1);
    }

    #[tokio::test]
    async fn test_request_without_cache_always_downloads() {
        let fetcher = Arc::new(MockImageFetcher::new());
        fetcher.respond(URL, png_bytes(2, 2));
        let manager = WebImageManager::builder()
            .fetcher(fetcher.clone())
            .max_concurrent(None)
            .build()
            .unwrap();

        assert_eq!(manager.load(URL, WebImageOptions::empty()).await.from, ImageFromType::Remote);
        assert_eq!(manager.load(URL, WebImageOptions::empty()).await.from, ImageFromType::Remote);
        assert_eq!(fetcher.attempts(), 2);
    }

    #[tokio::test]
    async fn test_settings_accessors() {
        let f = fixture();
        assert_eq!(f.manager.timeout(), DEFAULT_TIMEOUT);

        f.manager.set_header("Accept", None);
        f.manager.set_header("Referer", Some("https://x/".to_owned()));
        f.manager.set_credentials(Some(Credentials {
            username: "u".to_owned(),
            password: None,
        }));

        let headers = f.manager.headers();
        assert!(!headers.contains_key("Accept"));
        assert_eq!(headers.get("Referer").map(String::as_str), Some("https://x/"));
        assert_eq!(f.manager.credentials().unwrap().username, "u");
    }
}
