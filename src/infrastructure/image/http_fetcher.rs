//! HTTP transport for image downloads.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Client, header};
use tracing::{debug, trace};

use crate::domain::entities::WebImageOptions;
use crate::domain::errors::WebImageError;
use crate::domain::ports::{FetchRequest, ImageFetcherPort, ProgressFn};

const USER_AGENT: &str = concat!("lsimage/", env!("CARGO_PKG_VERSION"));

/// Downloads images with reqwest.
///
/// One client is kept per transport variant so certificate checking and the
/// cookie jar can be chosen per request.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    strict: Client,
    insecure: Client,
    cookies: Client,
    insecure_cookies: Client,
}

impl HttpImageFetcher {
    /// Creates the fetcher.
    ///
    /// # Errors
    /// Returns error if an HTTP client cannot be built.
    pub fn new() -> Result<Self, WebImageError> {
        Ok(Self {
            strict: build_client(false, false)?,
            insecure: build_client(true, false)?,
            cookies: build_client(false, true)?,
            insecure_cookies: build_client(true, true)?,
        })
    }

    fn client_for(&self, options: WebImageOptions) -> &Client {
        let insecure = options.contains(WebImageOptions::ALLOW_INVALID_SSL_CERTIFICATES);
        let cookies = options.contains(WebImageOptions::HANDLE_COOKIES);
        match (insecure, cookies) {
            (false, false) => &self.strict,
            (true, false) => &self.insecure,
            (false, true) => &self.cookies,
            (true, true) => &self.insecure_cookies,
        }
    }
}

fn build_client(insecure: bool, cookies: bool) -> Result<Client, WebImageError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(insecure)
        .cookie_store(cookies)
        .build()
        .map_err(|e| WebImageError::client(e.to_string()))
}

#[async_trait]
impl ImageFetcherPort for HttpImageFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: &ProgressFn,
    ) -> Result<Bytes, WebImageError> {
        let mut builder = self
            .client_for(request.options)
            .get(request.url.clone())
            .timeout(request.timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.options.contains(WebImageOptions::USE_URL_CACHE) {
            builder = builder.header(header::CACHE_CONTROL, "no-cache");
        }
        if let Some(credentials) = &request.credentials {
            builder = builder.basic_auth(&credentials.username, credentials.password.as_deref());
        }

        debug!(url = %request.url, "Fetching image");

        let mut response = builder
            .send()
            .await
            .map_err(|e| WebImageError::transfer(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            debug!(url = %request.url, status = status.as_u16(), "Image request rejected");
            return Err(WebImageError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let expected = response.content_length();
        let mut body = BytesMut::with_capacity(
            expected
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or_default(),
        );

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| WebImageError::transfer(format!("failed to read body: {e}")))?
        {
            body.extend_from_slice(&chunk);
            progress(body.len() as u64, expected);
        }

        trace!(url = %request.url, bytes = body.len(), "Image fetched");
        Ok(body.freeze())
    }
}
