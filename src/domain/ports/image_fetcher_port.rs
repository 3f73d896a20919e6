//! Port definition for downloading image bytes.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::domain::entities::WebImageOptions;
use crate::domain::errors::WebImageError;

/// Progress callback: bytes received so far and the expected total, if known.
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// HTTP Basic credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password, if any.
    pub password: Option<String>,
}

/// Everything a fetcher needs to perform one transfer.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Resource to download.
    pub url: Url,
    /// Extra HTTP headers.
    pub headers: BTreeMap<String, String>,
    /// Whole-transfer timeout.
    pub timeout: Duration,
    /// Optional Basic credentials.
    pub credentials: Option<Credentials>,
    /// Request options; transport-level flags are read from here.
    pub options: WebImageOptions,
}

/// Port for fetching raw image bytes.
/// Implementations must be thread-safe.
#[async_trait]
pub trait ImageFetcherPort: Send + Sync {
    /// Downloads the body of `request.url`.
    ///
    /// Dropping the returned future aborts the transfer.
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: &ProgressFn,
    ) -> Result<Bytes, WebImageError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    /// Mock fetcher answering from a URL table.
    #[derive(Default)]
    pub struct MockImageFetcher {
        responses: Mutex<HashMap<String, Result<Bytes, WebImageError>>>,
        requests: Mutex<Vec<FetchRequest>>,
        attempts: AtomicUsize,
        delay: Mutex<Option<Duration>>,
    }

    impl MockImageFetcher {
        /// Creates a fetcher with no known URLs.
        pub fn new() -> Self {
            Self::default()
        }

        /// Answers `url` with `body`.
        pub fn respond(&self, url: &str, body: impl Into<Bytes>) {
            self.responses.lock().insert(url.to_owned(), Ok(body.into()));
        }

        /// Answers `url` with `error`.
        pub fn fail(&self, url: &str, error: WebImageError) {
            self.responses.lock().insert(url.to_owned(), Err(error));
        }

        /// Delays every answer.
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = Some(delay);
        }

        /// Number of transfers attempted.
        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Requests seen so far.
        pub fn requests(&self) -> Vec<FetchRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl ImageFetcherPort for MockImageFetcher {
        async fn fetch(
            &self,
            request: FetchRequest,
            progress: &ProgressFn,
        ) -> Result<Bytes, WebImageError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let url = request.url.to_string();
            self.requests.lock().push(request);

            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let response = self
                .responses
                .lock()
                .get(&url)
                .cloned()
                .unwrap_or_else(|| Err(WebImageError::HttpStatus { status: 404 }));

            if let Ok(body) = &response {
                let len = body.len() as u64;
                progress(len, Some(len));
            }
            response
        }
    }
}
