//! Result types delivered to request completions.

use std::sync::Arc;

use url::Url;

use super::image::WebImage;
use crate::domain::errors::WebImageError;

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFromType {
    /// No image was produced.
    #[default]
    None,
    /// Served synchronously by the manager before any operation existed.
    MemoryCacheFast,
    /// Loaded from the in-memory tier.
    MemoryCache,
    /// Loaded from the on-disk tier.
    DiskCache,
    /// Downloaded from the network.
    Remote,
}

impl std::fmt::Display for ImageFromType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::MemoryCacheFast => write!(f, "memory (fast)"),
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Remote => write!(f, "network"),
        }
    }
}

/// Terminal stage a completion reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStage {
    /// The request was cancelled.
    Cancelled,
    /// The request ran to completion, successfully or not.
    Finished,
}

/// Lifecycle state of a web image operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    /// Created but not started.
    #[default]
    Pending,
    /// Running.
    Executing,
    /// Done; no further callbacks fire.
    Finished,
}

/// Outcome of an image request.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    /// The image, absent on error or when a transform dropped it.
    pub image: Option<Arc<WebImage>>,
    /// The requested URL, absent when the URL was invalid.
    pub url: Option<Url>,
    /// Where the image came from.
    pub from: ImageFromType,
    /// Terminal stage.
    pub stage: ImageStage,
    /// Failure, if any.
    pub error: Option<WebImageError>,
}

impl ImageResponse {
    /// Creates a successful response.
    #[must_use]
    pub const fn success(image: Option<Arc<WebImage>>, url: Url, from: ImageFromType) -> Self {
        Self {
            image,
            url: Some(url),
            from,
            stage: ImageStage::Finished,
            error: None,
        }
    }

    /// Creates a failed response.
    #[must_use]
    pub const fn failure(url: Option<Url>, error: WebImageError) -> Self {
        Self {
            image: None,
            url,
            from: ImageFromType::None,
            stage: ImageStage::Finished,
            error: Some(error),
        }
    }

    /// Creates a cancelled response.
    #[must_use]
    pub const fn cancelled(url: Url) -> Self {
        Self {
            image: None,
            url: Some(url),
            from: ImageFromType::None,
            stage: ImageStage::Cancelled,
            error: Some(WebImageError::Cancelled),
        }
    }

    /// Returns true if the request finished without error.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
