mod image_fetcher_port;
mod system_port;

pub use image_fetcher_port::{Credentials, FetchRequest, ImageFetcherPort, ProgressFn};
pub use system_port::{BackgroundTaskId, BackgroundTaskPort, NetworkActivityPort};
