//! One cancellable fetch → decode → transform → persist → report pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use url::Url;

use super::codec::{self, DecodeOptions};
use super::dispatch::CallbackQueue;
use super::image_cache::ImageCache;
use crate::domain::entities::{
    CacheKey, ImageCacheType, ImageFromType, ImageResponse, OperationState, WebImage,
    WebImageOptions,
};
use crate::domain::errors::WebImageError;
use crate::domain::ports::{
    BackgroundTaskId, BackgroundTaskPort, FetchRequest, ImageFetcherPort, NetworkActivityPort,
    ProgressFn,
};

/// Progress listener: bytes received and expected total.
pub type ProgressCallback = Arc<ProgressFn>;

/// Transform applied to a freshly decoded image. Returning `None` drops the image.
pub type ImageTransform = Arc<dyn Fn(Arc<WebImage>, &Url) -> Option<Arc<WebImage>> + Send + Sync>;

/// Completion listener, run once on the callback queue.
pub type CompletionCallback = Box<dyn FnOnce(ImageResponse) + Send>;

/// Identifies one caller attached to an operation.
pub type ListenerId = u64;

/// Callbacks handed back when an operation has already reported.
pub type RejectedListener = (Option<ProgressCallback>, Option<CompletionCallback>);

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Collaborators shared by every operation a manager creates.
#[derive(Clone)]
pub struct OperationEnv {
    /// Cache read before downloading and written after decoding.
    pub cache: Option<ImageCache>,
    /// Network transport.
    pub fetcher: Arc<dyn ImageFetcherPort>,
    /// Where completions run.
    pub callbacks: CallbackQueue,
    /// Shared network activity indicator.
    pub activity: Arc<dyn NetworkActivityPort>,
    /// Background task registry.
    pub background: Arc<dyn BackgroundTaskPort>,
    /// Runtime the operation's work is spawned on.
    pub runtime: Handle,
    /// Display scale for decoded images.
    pub scale: f32,
}

impl std::fmt::Debug for OperationEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationEnv")
            .field("cache", &self.cache)
            .field("scale", &self.scale)
            .finish_non_exhaustive()
    }
}

struct Listener {
    id: ListenerId,
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
}

#[derive(Default)]
struct Listeners {
    callers: Vec<Listener>,
    finish_hooks: Vec<CompletionCallback>,
    next_id: ListenerId,
    reported: bool,
    activity_shown: bool,
    background_task: Option<BackgroundTaskId>,
}

struct OperationInner {
    id: u64,
    key: CacheKey,
    request: FetchRequest,
    transform: Option<ImageTransform>,
    env: OperationEnv,
    state: watch::Sender<OperationState>,
    cancelled: watch::Sender<bool>,
    listeners: Mutex<Listeners>,
    was_cancelled: AtomicBool,
}

/// Handle to a web image operation. Clones refer to the same operation.
#[derive(Clone)]
pub struct WebImageOperation {
    inner: Arc<OperationInner>,
}

impl WebImageOperation {
    /// Creates a pending operation.
    #[must_use]
    pub fn new(
        env: OperationEnv,
        request: FetchRequest,
        key: CacheKey,
        transform: Option<ImageTransform>,
    ) -> Self {
        let (state, _) = watch::channel(OperationState::Pending);
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(OperationInner {
                id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
                key,
                request,
                transform,
                env,
                state,
                cancelled,
                listeners: Mutex::new(Listeners::default()),
                was_cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique operation id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Requested URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.inner.request.url
    }

    /// Cache key the operation reads and writes.
    #[must_use]
    pub fn cache_key(&self) -> &CacheKey {
        &self.inner.key
    }

    /// Request options.
    #[must_use]
    pub fn options(&self) -> WebImageOptions {
        self.inner.request.options
    }

    /// Transform applied after decoding, if any.
    #[must_use]
    pub fn transform(&self) -> Option<&ImageTransform> {
        self.inner.transform.as_ref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OperationState {
        *self.inner.state.borrow()
    }

    /// Returns true while the pipeline is running.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.state() == OperationState::Executing
    }

    /// Returns true once the operation has reported.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == OperationState::Finished
    }

    /// Returns true if `cancel` was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.was_cancelled.load(Ordering::Acquire)
    }

    /// Attaches a caller. Either callback may be absent; the caller still
    /// counts towards keeping the operation alive until it detaches.
    ///
    /// # Errors
    /// Hands the callbacks back if the operation has already reported.
    pub fn add_listener(
        &self,
        progress: Option<ProgressCallback>,
        completion: Option<CompletionCallback>,
    ) -> Result<ListenerId, RejectedListener> {
        let mut listeners = self.inner.listeners.lock();
        if listeners.reported {
            return Err((progress, completion));
        }
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.callers.push(Listener {
            id,
            progress,
            completion,
        });
        Ok(id)
    }

    /// Number of callers still attached.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().callers.len()
    }

    /// Registers bookkeeping that runs before caller completions. Does not
    /// count as a caller.
    pub(crate) fn on_finished(&self, hook: CompletionCallback) -> Result<(), CompletionCallback> {
        let mut listeners = self.inner.listeners.lock();
        if listeners.reported {
            return Err(hook);
        }
        listeners.finish_hooks.push(hook);
        Ok(())
    }

    /// Detaches one caller.
    ///
    /// The caller's completion receives a `Cancelled` response. The operation
    /// itself is cancelled only when no caller remains.
    pub fn detach(&self, listener: ListenerId) {
        let (detached, last) = {
            let mut listeners = self.inner.listeners.lock();
            if listeners.reported {
                return;
            }
            let Some(index) = listeners.callers.iter().position(|l| l.id == listener) else {
                return;
            };
            let detached = listeners.callers.remove(index);
            (detached, listeners.callers.is_empty())
        };

        trace!(op = self.inner.id, listener, last, "Listener detached");
        if let Some(completion) = detached.completion {
            let response = ImageResponse::cancelled(self.url().clone());
            self.inner
                .env
                .callbacks
                .dispatch(move || completion(response));
        }
        if last {
            self.cancel();
        }
    }

    /// Starts the pipeline on the operation's runtime. No-op unless pending.
    pub fn start(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == OperationState::Pending {
                *state = OperationState::Executing;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        debug!(op = self.inner.id, url = %self.url(), "Operation started");

        if self.is_cancelled() {
            self.inner.report(ImageResponse::cancelled(self.url().clone()));
            return;
        }

        let this = self.clone();
        self.inner.env.runtime.spawn(async move { this.run().await });
    }

    /// Cancels the operation for every attached caller.
    ///
    /// A pending operation finishes immediately; a running one aborts its
    /// transfer and finishes at the next stage boundary. Either way listeners
    /// receive a `Cancelled` response exactly once. Use [`Self::detach`] to
    /// withdraw a single caller.
    pub fn cancel(&self) {
        if self.inner.was_cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancelled.send_replace(true);
        debug!(op = self.inner.id, url = %self.url(), "Operation cancelled");

        if self.state() == OperationState::Pending {
            self.inner.report(ImageResponse::cancelled(self.url().clone()));
        }
    }

    /// Waits until the operation has finished.
    pub async fn wait_until_finished(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == OperationState::Finished).await;
    }

    async fn run(self) {
        let inner = &self.inner;
        let url = inner.request.url.clone();
        let options = inner.request.options;

        if options.reads_cache()
            && let Some(cache) = inner.env.cache.clone()
        {
            let key = inner.key.clone();
            let hit = inner
                .env
                .runtime
                .spawn_blocking(move || cache.lookup(&key, ImageCacheType::ALL))
                .await;
            match hit {
                Ok(Some((image, from))) => {
                    trace!(op = inner.id, %from, "Operation served from cache");
                    inner.report(ImageResponse::success(Some(image), url, from));
                    return;
                }
                Ok(None) => {}
                Err(e) => warn!(op = inner.id, error = %e, "Cache lookup task failed"),
            }
        }

        if self.bail_if_cancelled() {
            return;
        }

        let data = match self.download().await {
            Some(Ok(data)) => data,
            Some(Err(error)) => {
                inner.report(ImageResponse::failure(Some(url), error));
                return;
            }
            None => {
                inner.report(ImageResponse::cancelled(url));
                return;
            }
        };

        if self.bail_if_cancelled() {
            return;
        }

        let image = match self.decode(&data).await {
            Ok(image) => Arc::new(image),
            Err(error) => {
                debug!(op = inner.id, error = %error, "Downloaded image could not be decoded");
                inner.report(ImageResponse::failure(Some(url), error));
                return;
            }
        };

        if self.bail_if_cancelled() {
            return;
        }

        let image = match inner.transform.clone() {
            Some(transform) => {
                let transform_url = url.clone();
                match inner
                    .env
                    .runtime
                    .spawn_blocking(move || transform(image, &transform_url))
                    .await
                {
                    Ok(image) => image,
                    Err(e) => {
                        warn!(op = inner.id, error = %e, "Transform task failed");
                        None
                    }
                }
            }
            None => Some(image),
        };

        if self.bail_if_cancelled() {
            return;
        }

        if options.writes_cache()
            && let Some(cache) = &inner.env.cache
            && let Some(image) = &image
        {
            cache.set_image(Some(image.clone()), Some(data), &inner.key, ImageCacheType::ALL);
        }

        debug!(op = inner.id, has_image = image.is_some(), "Operation downloaded image");
        inner.report(ImageResponse::success(image, url, ImageFromType::Remote));
    }

    /// Runs the transfer. `None` means it was cancelled.
    async fn download(&self) -> Option<Result<Bytes, WebImageError>> {
        let inner = &self.inner;
        if !inner.begin_network_activity() {
            return None;
        }

        let progress_inner = Arc::clone(inner);
        let progress = move |received: u64, expected: Option<u64>| {
            if progress_inner.was_cancelled.load(Ordering::Acquire) {
                return;
            }
            let listeners: Vec<ProgressCallback> = progress_inner
                .listeners
                .lock()
                .callers
                .iter()
                .filter_map(|l| l.progress.clone())
                .collect();
            for listener in listeners {
                listener(received, expected);
            }
        };

        let mut cancelled = inner.cancelled.subscribe();
        let result = tokio::select! {
            biased;
            _ = cancelled.wait_for(|c| *c) => None,
            result = inner.env.fetcher.fetch(inner.request.clone(), &progress) => Some(result),
        };

        match result {
            Some(Ok(data)) if data.is_empty() => Some(Err(WebImageError::EmptyResponse)),
            other => other,
        }
    }

    async fn decode(&self, data: &Bytes) -> Result<WebImage, WebImageError> {
        let options = self.inner.request.options;
        if options.contains(WebImageOptions::IGNORE_IMAGE_DECODING) {
            return Err(WebImageError::decode("image decoding disabled by options"));
        }

        let decode_options = DecodeOptions {
            allow_animated: !options.contains(WebImageOptions::IGNORE_ANIMATED_IMAGE),
            scale: self.inner.env.scale,
        };
        let data = data.clone();
        self.inner
            .env
            .runtime
            .spawn_blocking(move || codec::decode(&data, decode_options))
            .await
            .map_err(|e| WebImageError::decode(format!("decode task failed: {e}")))?
    }

    fn bail_if_cancelled(&self) -> bool {
        if self.is_cancelled() {
            self.inner
                .report(ImageResponse::cancelled(self.inner.request.url.clone()));
            true
        } else {
            false
        }
    }
}

impl OperationInner {
    /// Turns on the activity indicator and background task the options ask for.
    /// Returns false if the operation has already reported.
    fn begin_network_activity(&self) -> bool {
        let options = self.request.options;
        let mut listeners = self.listeners.lock();
        if listeners.reported {
            return false;
        }
        if options.contains(WebImageOptions::SHOW_NETWORK_ACTIVITY) {
            self.env.activity.increment();
            listeners.activity_shown = true;
        }
        if options.contains(WebImageOptions::ALLOW_BACKGROUND_TASK) {
            listeners.background_task = Some(self.env.background.begin(self.request.url.as_str()));
        }
        true
    }

    /// Delivers the terminal response once and marks the operation finished.
    fn report(&self, response: ImageResponse) {
        let (hooks, callers, activity_shown, background_task) = {
            let mut listeners = self.listeners.lock();
            if listeners.reported {
                return;
            }
            listeners.reported = true;
            (
                std::mem::take(&mut listeners.finish_hooks),
                std::mem::take(&mut listeners.callers),
                std::mem::take(&mut listeners.activity_shown),
                listeners.background_task.take(),
            )
        };

        self.state.send_replace(OperationState::Finished);
        debug!(
            op = self.id,
            stage = ?response.stage,
            from = %response.from,
            error = ?response.error,
            "Operation finished"
        );

        let activity = self.env.activity.clone();
        let background = self.env.background.clone();
        self.env.callbacks.dispatch(move || {
            if activity_shown {
                activity.decrement();
            }
            if let Some(id) = background_task {
                background.end(id);
            }
            for hook in hooks {
                hook(response.clone());
            }
            for completion in callers.into_iter().filter_map(|l| l.completion) {
                completion(response.clone());
            }
        });
    }
}

impl std::fmt::Debug for WebImageOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebImageOperation")
            .field("id", &self.inner.id)
            .field("url", &self.inner.request.url.as_str())
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain::ports::mocks::MockImageFetcher;
    use crate::infrastructure::image::activity::{BackgroundTaskTracker, NetworkActivityCounter};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::oneshot;

    pub struct Harness {
        pub fetcher: Arc<MockImageFetcher>,
        pub activity: Arc<NetworkActivityCounter>,
        pub background: Arc<BackgroundTaskTracker>,
        pub env: OperationEnv,
    }

    impl Harness {
        pub fn new(cache: Option<ImageCache>) -> Self {
            let fetcher = Arc::new(MockImageFetcher::new());
            let activity = Arc::new(NetworkActivityCounter::new());
            let background = Arc::new(BackgroundTaskTracker::new());
            let env = OperationEnv {
                cache,
                fetcher: fetcher.clone(),
                callbacks: CallbackQueue::spawn(),
                activity: activity.clone(),
                background: background.clone(),
                runtime: Handle::current(),
                scale: 1.0,
            };
            Self {
                fetcher,
                activity,
                background,
                env,
            }
        }
    }

    pub fn fetch_request(url: &str, options: WebImageOptions) -> FetchRequest {
        FetchRequest {
            url: Url::parse(url).unwrap(),
            headers: BTreeMap::new(),
            timeout: Duration::from_secs(15),
            credentials: None,
            options,
        }
    }

    /// Registers a completion that forwards the response to the returned receiver.
    pub fn capture(op: &WebImageOperation) -> oneshot::Receiver<(ImageResponse, bool)> {
        capture_listener(op).1
    }

    /// Like [`capture`], also returning the listener id.
    pub fn capture_listener(
        op: &WebImageOperation,
    ) -> (ListenerId, oneshot::Receiver<(ImageResponse, bool)>) {
        let (tx, rx) = oneshot::channel();
        let completion: CompletionCallback = Box::new(move |response| {
            let _ = tx.send((response, CallbackQueue::is_current()));
        });
        let id = op
            .add_listener(None, Some(completion))
            .unwrap_or_else(|_| panic!("operation already reported"));
        (id, rx)
    }

    pub async fn receive(rx: oneshot::Receiver<(ImageResponse, bool)>) -> ImageResponse {
        let (response, on_callback_thread) = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("completion timed out")
            .expect("completion dropped");
        assert!(on_callback_thread);
        response
    }
}
