//! Cache key type shared by the memory cache, disk cache and running table.

use url::Url;

/// Normalized string identifying a cached image.
/// Derived from the source URL unless a key filter overrides it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Creates a new `CacheKey` from any string-like input.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Creates the default key for a URL: its absolute, percent-encoded form.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        Self(url.as_str().to_owned())
    }

    /// Returns the file name used to persist this key on disk.
    #[must_use]
    pub fn file_name(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        let result = hasher.finalize();
        format!("{}.img", hex::encode(&result[..16]))
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the key is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&Url> for CacheKey {
    fn from(url: &Url) -> Self {
        Self::from_url(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_url_is_absolute_string() {
        let url = Url::parse("https://x/a.png").unwrap();
        assert_eq!(CacheKey::from_url(&url).as_str(), "https://x/a.png");
    }

    #[test]
    fn test_key_from_url_is_percent_encoded() {
        let url = Url::parse("https://example.com/my image.png").unwrap();
        assert_eq!(
            CacheKey::from_url(&url).as_str(),
            "https://example.com/my%20image.png"
        );
    }

    #[test]
    fn test_file_name_is_stable() {
        let a = CacheKey::new("https://example.com/image.png");
        let b = CacheKey::new("https://example.com/image.png");
        assert_eq!(a.file_name(), b.file_name());
        assert_eq!(a.file_name().len(), 32 + ".img".len());
    }

    #[test]
    fn test_distinct_keys_have_distinct_file_names() {
        let a = CacheKey::new("https://example.com/a.png");
        let b = CacheKey::new("https://example.com/b.png");
        assert_ne!(a.file_name(), b.file_name());
    }
}
