//! Decode and scale pipeline: fit math, the bounded decode pool, and the
//! per-image loadable state machine.

pub mod loadable;
pub mod resize;

pub use loadable::{LoadState, LoadWatcher, LoadableImage, MaybeScaledImage};
pub use resize::{fit_bounds, resize_premultiplied};

pub type Result<T> = crate::Result<T>;

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Process-wide bound on concurrent decodes. Extraction is cheap I/O while
/// decoding is CPU; this keeps the two decoupled.
#[derive(Debug, Clone)]
pub struct LoadPool {
    semaphore: Arc<Semaphore>,
}

impl LoadPool {
    pub fn new(load_threads: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(load_threads.max(1))) }
    }

    pub(crate) fn semaphore(&self) -> Arc<Semaphore> {
        self.semaphore.clone()
    }
}
