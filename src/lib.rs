//! lsimage - web image loading with a two-tier image cache.
//!
//! Requests go through [`infrastructure::image::WebImageManager`], which
//! serves them from the memory cache when it can and otherwise runs a
//! cancellable fetch, decode, transform and persist operation that writes
//! through [`infrastructure::image::ImageCache`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer wiring the pipeline for callers.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing caches, transport and configuration.
pub mod infrastructure;

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = "lsimage";
