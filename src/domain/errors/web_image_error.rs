//! Web image error types.

use thiserror::Error;

/// Errors reported through a request's completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum WebImageError {
    #[error("invalid image URL")]
    InvalidUrl,

    #[error("URL is blacklisted after an earlier failure: {url}")]
    Blacklisted { url: String },

    #[error("transfer failed: {message}")]
    Transfer { message: String },

    #[error("server responded with HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("response contained no data")]
    EmptyResponse,

    #[error("image decode failed: {message}")]
    DecodeFailed { message: String },

    #[error("request was cancelled")]
    Cancelled,

    #[error("cache I/O error: {message}")]
    Io { message: String },

    #[error("no tokio runtime available to run image operations")]
    NoRuntime,

    #[error("failed to build HTTP client: {message}")]
    Client { message: String },
}

impl WebImageError {
    /// Creates blacklisted error.
    #[must_use]
    pub fn blacklisted(url: impl Into<String>) -> Self {
        Self::Blacklisted { url: url.into() }
    }

    /// Creates transfer error.
    #[must_use]
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer {
            message: message.into(),
        }
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::DecodeFailed {
            message: message.into(),
        }
    }

    /// Creates I/O error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates client construction error.
    #[must_use]
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client {
            message: message.into(),
        }
    }

    /// Returns whether the error came from the network layer.
    #[must_use]
    pub const fn is_network_error(&self) -> bool {
        matches!(
            self,
            Self::Transfer { .. } | Self::HttpStatus { .. } | Self::EmptyResponse
        )
    }

    /// Returns whether the request was cancelled rather than failed.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for WebImageError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_classification() {
        assert!(WebImageError::transfer("reset").is_network_error());
        assert!(WebImageError::HttpStatus { status: 404 }.is_network_error());
        assert!(WebImageError::EmptyResponse.is_network_error());
        assert!(!WebImageError::decode("bad").is_network_error());
        assert!(!WebImageError::Cancelled.is_network_error());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            WebImageError::HttpStatus { status: 503 }.to_string(),
            "server responded with HTTP 503"
        );
        assert_eq!(
            WebImageError::blacklisted("https://x/a.png").to_string(),
            "URL is blacklisted after an earlier failure: https://x/a.png"
        );
    }
}
