//! Structured error taxonomy, one enum per failure domain.

use thiserror::Error;

/// Failures parsing the CLI arguments.
#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("{0}")]
    Invalid(String),
}

/// Failures binding to the shared-memory region.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("shmget failed for key {key}, size {size}: {source}")]
    Get {
        key: u64,
        size: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("shmat failed for segment id {id}: {source}")]
    Attach {
        id: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("region too small: need at least {needed} bytes, got {got}")]
    TooSmall { needed: u64, got: u64 },
}

/// Failures allocating optimizer buffers.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("buffer '{name}' of {elements} elements would overflow addressable memory")]
    Overflow { name: &'static str, elements: u64 },
}

/// Failures standing up or running the worker pool.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error unifying every failure domain, so `main` has a single
/// `Result` to match on.
#[derive(Debug, Error)]
pub enum ThreadloomError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}
