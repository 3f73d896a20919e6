//! Domain error types.

mod web_image_error;

pub use web_image_error::WebImageError;
