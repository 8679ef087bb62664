//! Error types for performance primitives

use thiserror::Error;

/// Errors from affinity and thread management
#[derive(Error, Debug)]
pub enum PerfError {
    /// Topology has no core the strategy could pick
    #[error("no eligible CPU core")]
    NoCores,

    /// Selector returned a core id not in the topology
    #[error("core {0} is not in the topology")]
    UnknownCore(usize),

    /// OS refused to start the thread
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Thread exited by panicking
    #[error("thread {0} panicked")]
    ThreadPanicked(String),
}

/// Result type for performance primitives
pub type PerfResult<T> = Result<T, PerfError>;
