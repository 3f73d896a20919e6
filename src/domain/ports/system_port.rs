//! Ports for process-wide system facilities touched by downloads.

/// Handle for a registered background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackgroundTaskId(pub u64);

/// Shared network activity indicator.
///
/// Calls are balanced: every `increment` is followed by exactly one `decrement`.
pub trait NetworkActivityPort: Send + Sync {
    /// Marks one more transfer as active.
    fn increment(&self);

    /// Marks one transfer as done.
    fn decrement(&self);

    /// Number of active transfers.
    fn active_count(&self) -> usize;

    /// Returns true if any transfer is active.
    fn is_active(&self) -> bool {
        self.active_count() > 0
    }
}

/// Registry of background tasks that keep the process alive while they run.
pub trait BackgroundTaskPort: Send + Sync {
    /// Registers a task and returns its token.
    fn begin(&self, name: &str) -> BackgroundTaskId;

    /// Releases a token returned by `begin`.
    fn end(&self, id: BackgroundTaskId);

    /// Number of tokens not yet released.
    fn outstanding(&self) -> usize;
}
