use super::app_config::LogLevel;
use crate::domain::entities::{ImageCacheType, WebImageOptions};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "lsimage",
    version,
    about = "Download web images through a memory and disk image cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Disk cache directory.
    #[arg(long, value_name = "PATH", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Request timeout in seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Operations allowed to run at once (0 disables the queue).
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Display scale attached to decoded images.
    #[arg(long, global = true)]
    pub scale: Option<f32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch one image through the cache.
    Fetch(FetchArgs),
    /// Inspect or maintain the image cache.
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Debug, Args)]
#[allow(clippy::struct_excessive_bools)]
pub struct FetchArgs {
    /// Image URL.
    pub url: String,

    /// Write the original image bytes to this file.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Skip the cache lookup and download again.
    #[arg(long)]
    pub refresh: bool,

    /// Neither read nor write the cache.
    #[arg(long)]
    pub ignore_disk_cache: bool,

    /// Keep only the first frame of animated images.
    #[arg(long = "static")]
    pub ignore_animated: bool,

    /// Let HTTP caches answer the request.
    #[arg(long)]
    pub use_url_cache: bool,

    /// Accept invalid TLS certificates.
    #[arg(long)]
    pub allow_invalid_certs: bool,

    /// Send and store cookies.
    #[arg(long)]
    pub cookies: bool,
}

impl FetchArgs {
    /// Request options: `base` plus every option a flag turns on.
    #[must_use]
    pub fn options(&self, base: WebImageOptions) -> WebImageOptions {
        let flags = [
            (self.refresh, WebImageOptions::REFRESH_IMAGE_CACHE),
            (self.ignore_disk_cache, WebImageOptions::IGNORE_DISK_CACHE),
            (self.ignore_animated, WebImageOptions::IGNORE_ANIMATED_IMAGE),
            (self.use_url_cache, WebImageOptions::USE_URL_CACHE),
            (
                self.allow_invalid_certs,
                WebImageOptions::ALLOW_INVALID_SSL_CERTIFICATES,
            ),
            (self.cookies, WebImageOptions::HANDLE_COOKIES),
        ];
        flags
            .into_iter()
            .filter(|(on, _)| *on)
            .fold(base, |options, (_, flag)| options | flag)
    }
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Show cache location and usage.
    Stats,
    /// Remove cached images.
    Clear {
        /// Only clear the memory tier.
        #[arg(long, conflicts_with = "disk")]
        memory: bool,
        /// Only clear the disk tier.
        #[arg(long)]
        disk: bool,
    },
    /// Check whether a key (usually a URL) is cached.
    Contains {
        /// Cache key.
        key: String,
    },
}

impl CacheCommand {
    /// Tiers a `clear` should touch.
    #[must_use]
    pub const fn clear_tiers(memory: bool, disk: bool) -> ImageCacheType {
        match (memory, disk) {
            (true, false) => ImageCacheType::MEMORY,
            (false, true) => ImageCacheType::DISK,
            _ => ImageCacheType::ALL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_fetch_flags_map_to_options() {
        let args = CliArgs::parse_from([
            "lsimage",
            "fetch",
            "https://x/a.gif",
            "--static",
            "--cookies",
            "-o",
            "out.gif",
        ]);

        let Command::Fetch(fetch) = args.command else {
            panic!("expected fetch");
        };
        assert_eq!(fetch.output, Some(PathBuf::from("out.gif")));
        assert_eq!(
            fetch.options(WebImageOptions::SHOW_NETWORK_ACTIVITY),
            WebImageOptions::SHOW_NETWORK_ACTIVITY
                | WebImageOptions::IGNORE_ANIMATED_IMAGE
                | WebImageOptions::HANDLE_COOKIES
        );
    }

    #[test]
    fn test_configured_options_are_kept() {
        let args = CliArgs::parse_from(["lsimage", "fetch", "https://x/a.png", "--refresh"]);
        let Command::Fetch(fetch) = args.command else {
            panic!("expected fetch");
        };
        assert_eq!(
            fetch.options(WebImageOptions::USE_URL_CACHE),
            WebImageOptions::USE_URL_CACHE | WebImageOptions::REFRESH_IMAGE_CACHE
        );
    }

    #[test_case(false, false, ImageCacheType::ALL; "both")]
    #[test_case(true, false, ImageCacheType::MEMORY; "memory only")]
    #[test_case(false, true, ImageCacheType::DISK; "disk only")]
    fn test_clear_tiers(memory: bool, disk: bool, expected: ImageCacheType) {
        assert_eq!(CacheCommand::clear_tiers(memory, disk), expected);
    }
}
