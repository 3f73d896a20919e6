//! Request option and cache tier flags.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Cache tiers a call may touch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ImageCacheType: u8 {
        /// In-memory tier.
        const MEMORY = 1 << 0;
        /// On-disk tier.
        const DISK = 1 << 1;
        /// Both tiers.
        const ALL = Self::MEMORY.bits() | Self::DISK.bits();
    }
}

impl ImageCacheType {
    /// No tier at all.
    pub const NONE: Self = Self::empty();
}

bitflags::bitflags! {
    /// Options controlling a single web image request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct WebImageOptions: u32 {
        /// Bump the shared network activity counter while downloading.
        const SHOW_NETWORK_ACTIVITY = 1 << 0;
        /// Let HTTP caches answer the request.
        const USE_URL_CACHE = 1 << 1;
        /// Accept servers presenting invalid TLS certificates.
        const ALLOW_INVALID_SSL_CERTIFICATES = 1 << 2;
        /// Hold a background task token while the request runs.
        const ALLOW_BACKGROUND_TASK = 1 << 3;
        /// Send and store cookies.
        const HANDLE_COOKIES = 1 << 4;
        /// Skip the cache lookup and always download.
        const REFRESH_IMAGE_CACHE = 1 << 5;
        /// Neither read nor write the cache.
        const IGNORE_DISK_CACHE = 1 << 6;
        /// Do not decode downloaded bytes.
        const IGNORE_IMAGE_DECODING = 1 << 7;
        /// Decode only the first frame of animated formats.
        const IGNORE_ANIMATED_IMAGE = 1 << 8;
        /// Never retry a URL that failed once, until the blocklist is cleared.
        const IGNORE_FAILED_URL = 1 << 9;
    }
}

impl WebImageOptions {
    /// Returns true if the request may be answered from the cache.
    #[must_use]
    pub const fn reads_cache(self) -> bool {
        !self.intersects(Self::REFRESH_IMAGE_CACHE.union(Self::IGNORE_DISK_CACHE))
    }

    /// Returns true if downloaded images should be written to the cache.
    #[must_use]
    pub const fn writes_cache(self) -> bool {
        !self.contains(Self::IGNORE_DISK_CACHE)
    }
}
