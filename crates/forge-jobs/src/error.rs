use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("failed to start worker thread: {0}")]
    ThreadStartFailed(std::io::Error),

    #[error("job cache exhausted ({capacity} slots in use)")]
    JobCacheExhausted { capacity: usize },

    #[error("no free thread-info slot available to adopt this thread (capacity {capacity})")]
    NoFreeThreadSlot { capacity: usize },
}

pub type Result<T> = std::result::Result<T, JobQueueError>;
