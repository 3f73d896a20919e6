//! Application layer wiring the image pipeline for callers.

/// Cache and manager context.
pub mod context;
/// Per-view request state.
pub mod request_slot;

pub use context::ImageContext;
pub use request_slot::RequestSlot;
