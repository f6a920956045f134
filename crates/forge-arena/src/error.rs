use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("arena reservation of {requested} bytes failed")]
    ReserveFailed { requested: usize },

    #[error("allocation of {requested} bytes would exceed the {capacity} byte arena (offset {offset})")]
    OutOfMemory {
        requested: usize,
        offset: usize,
        capacity: usize,
    },
}

pub type Result<T> = std::result::Result<T, ArenaError>;
