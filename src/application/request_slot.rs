//! Per-view request state.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;
use url::Url;

use crate::infrastructure::image::{ImageRequest, ImageRequestHandle, WebImageManager};

#[derive(Debug, Default)]
struct SlotState {
    sentinel: u64,
    url: Option<Url>,
    handle: Option<ImageRequestHandle>,
}

/// Holds the one live request of a view.
///
/// Issuing a new request cancels the previous one. Cancelling withdraws only
/// this slot's interest; an operation shared with other slots keeps running
/// for them. Every request and cancel bumps a sentinel; a completion whose
/// sentinel is no longer current is dropped instead of delivered.
#[derive(Debug, Clone, Default)]
pub struct RequestSlot {
    state: Arc<Mutex<SlotState>>,
}

impl RequestSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the current request and issues `request` through `manager`.
    ///
    /// Returns the sentinel assigned to the new request.
    pub fn set_request(&self, manager: &WebImageManager, mut request: ImageRequest) -> u64 {
        let sentinel = self.cancel_with_url(request.url().cloned());

        let completion = request.take_completion();
        let state = Arc::clone(&self.state);
        let request = request.on_complete(move |response| {
            {
                let mut state = state.lock();
                if state.sentinel != sentinel {
                    trace!(sentinel, current = state.sentinel, "Dropping stale completion");
                    return;
                }
                state.handle = None;
            }
            if let Some(completion) = completion {
                completion(response);
            }
        });

        let handle = manager.request_image(request);

        let mut state = self.state.lock();
        if state.sentinel == sentinel {
            state.handle = handle.filter(|h| !h.operation().is_finished());
        }
        sentinel
    }

    /// Cancels the current request and forgets its URL.
    ///
    /// Returns the new sentinel.
    pub fn cancel(&self) -> u64 {
        self.cancel_with_url(None)
    }

    fn cancel_with_url(&self, url: Option<Url>) -> u64 {
        let (sentinel, previous) = {
            let mut state = self.state.lock();
            state.sentinel = state.sentinel.wrapping_add(1);
            state.url = url;
            (state.sentinel, state.handle.take())
        };
        if let Some(handle) = previous {
            handle.cancel();
        }
        sentinel
    }

    /// Current sentinel.
    #[must_use]
    pub fn sentinel(&self) -> u64 {
        self.state.lock().sentinel
    }

    /// URL of the current request.
    #[must_use]
    pub fn url(&self) -> Option<Url> {
        self.state.lock().url.clone()
    }

    /// Returns true while the current request has an unfinished operation.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state
            .lock()
            .handle
            .as_ref()
            .is_some_and(|h| !h.operation().is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{ImageFromType, ImageResponse, ImageStage};
    use crate::domain::ports::mocks::MockImageFetcher;
    use crate::infrastructure::image::codec::test_support::png_bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn manager(fetcher: &Arc<MockImageFetcher>) -> WebImageManager {
        WebImageManager::builder()
            .fetcher(fetcher.clone())
            .build()
            .unwrap()
    }

    fn forward(
        tx: &mpsc::UnboundedSender<(&'static str, ImageResponse)>,
        tag: &'static str,
    ) -> impl FnOnce(ImageResponse) + Send + 'static {
        let tx = tx.clone();
        move |response| {
            let _ = tx.send((tag, response));
        }
    }

    #[tokio::test]
    async fn test_new_request_cancels_and_silences_previous() {
        let fetcher = Arc::new(MockImageFetcher::new());
        fetcher.respond("https://x/1.png", png_bytes(1, 1));
        fetcher.respond("https://x/2.png", png_bytes(2, 2));
        fetcher.set_delay(Duration::from_millis(100));
        let manager = manager(&fetcher);
        let slot = RequestSlot::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = slot.set_request(
            &manager,
            ImageRequest::new("https://x/1.png").on_complete(forward(&tx, "first")),
        );
        assert!(slot.is_loading());
        let second = slot.set_request(
            &manager,
            ImageRequest::new("https://x/2.png").on_complete(forward(&tx, "second")),
        );

        assert!(second > first);
        assert_eq!(slot.url().unwrap().as_str(), "https://x/2.png");

        let (tag, response) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tag, "second");
        assert_eq!(response.from, ImageFromType::Remote);
        assert!(!slot.is_loading());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_completion() {
        let fetcher = Arc::new(MockImageFetcher::new());
        fetcher.respond("https://x/1.png", png_bytes(1, 1));
        fetcher.set_delay(Duration::from_secs(30));
        let manager = manager(&fetcher);
        let slot = RequestSlot::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_completion = calls.clone();

        slot.set_request(
            &manager,
            ImageRequest::new("https://x/1.png").on_complete(move |_| {
                calls_in_completion.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let op = manager
            .running_operation(&Url::parse("https://x/1.png").unwrap())
            .unwrap();

        slot.cancel();

        tokio::time::timeout(Duration::from_secs(5), op.wait_until_finished())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(op.is_cancelled());
        assert!(slot.url().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_leaves_shared_image_for_other_slot() {
        let fetcher = Arc::new(MockImageFetcher::new());
        fetcher.respond("https://x/shared.png", png_bytes(3, 3));
        fetcher.set_delay(Duration::from_millis(150));
        let manager = manager(&fetcher);
        let slot_a = RequestSlot::new();
        let slot_b = RequestSlot::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        slot_a.set_request(
            &manager,
            ImageRequest::new("https://x/shared.png").on_complete(forward(&tx, "a")),
        );
        slot_b.set_request(
            &manager,
            ImageRequest::new("https://x/shared.png").on_complete(forward(&tx, "b")),
        );
        let op = manager
            .running_operation(&Url::parse("https://x/shared.png").unwrap())
            .unwrap();
        assert_eq!(op.listener_count(), 2);

        slot_a.cancel();

        let (tag, response) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tag, "b");
        assert_eq!(response.stage, ImageStage::Finished);
        assert_eq!(response.from, ImageFromType::Remote);
        assert!(response.image.is_some());
        assert!(!op.is_cancelled());
        assert!(!slot_a.is_loading());
        assert_eq!(fetcher.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_url_is_still_reported() {
        let fetcher = Arc::new(MockImageFetcher::new());
        let manager = manager(&fetcher);
        let slot = RequestSlot::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        slot.set_request(
            &manager,
            ImageRequest::new("").on_complete(forward(&tx, "invalid")),
        );

        let (_, response) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.stage, ImageStage::Finished);
        assert!(response.error.is_some());
        assert!(!slot.is_loading());
    }
}
