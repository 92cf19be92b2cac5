use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{self, JoinError};
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("worker pool is shut down")]
    Closed,
    #[error("disk job failed to complete: {0}")]
    Join(#[from] JoinError),
}

/// Runs blocking disk io off the reactor, at most `size` jobs at a time.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// one worker per available processor
    pub fn sized_to_machine() -> Self {
        let size = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);
        debug!("starting worker pool with {size} workers");
        Self::new(size)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// queue `job`, the returned future resolves once it ran
    pub async fn run<F, T>(&self, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed)?;
        // the permit moves into the job so it is held until the io is
        // done, even if the caller stops waiting
        let res = task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await?;
        Ok(res)
    }

    /// jobs already running complete, new ones are refused
    pub fn close(&self) {
        self.permits.close();
    }
}
