//! Domain layer with core entities, errors and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{
    CacheKey, ImageCacheType, ImageFromType, ImageResponse, ImageStage, OperationState, WebImage,
    WebImageOptions,
};
pub use errors::WebImageError;
pub use ports::{BackgroundTaskPort, FetchRequest, ImageFetcherPort, NetworkActivityPort};
