//! Serial callback queue standing in for the UI main thread.
//!
//! Every completion the pipeline reports runs on one dedicated thread, in
//! submission order, never on the thread that issued the request.

use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Name of the thread that runs completions.
pub const CALLBACK_THREAD_NAME: &str = "lsimage-callbacks";

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the callback thread. Cloning shares the same thread.
#[derive(Clone)]
pub struct CallbackQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl CallbackQueue {
    /// Spawns the callback thread.
    ///
    /// The thread exits once every handle has been dropped and the queue drained.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let spawned = thread::Builder::new()
            .name(CALLBACK_THREAD_NAME.to_owned())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
                debug!("Callback queue drained, thread exiting");
            });
        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn callback thread");
        }

        Self { tx }
    }

    /// Queues a job to run on the callback thread.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            warn!("Callback queue closed, dropping job");
        }
    }

    /// Returns true if the current thread is the callback thread.
    #[must_use]
    pub fn is_current() -> bool {
        thread::current().name() == Some(CALLBACK_THREAD_NAME)
    }
}

impl std::fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}
