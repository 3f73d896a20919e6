//! Domain entity definitions.

mod cache_key;
mod image;
mod options;
mod response;

pub use cache_key::CacheKey;
pub use self::image::WebImage;
pub use options::{ImageCacheType, WebImageOptions};
pub use response::{ImageFromType, ImageResponse, ImageStage, OperationState};
