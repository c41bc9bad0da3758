// Error kinds shared across the master and worker crates.
// Anything surfaced to a caller that can react goes through one of these;
// wiring-level code wraps them in anyhow at the binary boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the frame codec and the socket layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection in the middle of a frame.
    #[error("connection closed mid-frame")]
    ConnectionClosed,

    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A frame declared a body larger than the hard limit.
    #[error("frame length {0} exceeds the {1} byte limit")]
    LengthExceeded(usize, usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Protocol-level violations detected after a frame decoded cleanly.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected message type '{0}'")]
    UnexpectedType(String),

    #[error("invalid property declaration: {0}")]
    InvalidProperty(String),

    /// A task state change that is not allowed by the transition topology.
    /// The task is left unchanged; the event that carried it is dropped.
    #[error("invalid task state transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

/// Failures while binding a job to a recipe.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("job command '{0}' not found in configuration")]
    CommandNotFound(String),

    #[error("job bind failed: {0}")]
    BindFailed(String),
}

/// Failures inside the dispatcher's wait-area and worker selection.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("wait-area has no queue for task kind '{0}'")]
    UnknownKind(String),

    #[error("wait-area queue for '{0}' is full")]
    AreaFull(String),

    #[error("wait-area is empty")]
    AreaEmpty,

    #[error("no eligible worker for task '{0}'")]
    NoEligibleWorker(String),
}

/// Resource exhaustion and lookup failures on either side.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The unit's input queue is full; the caller must not retry.
    #[error("processing unit '{0}' denies new work")]
    QueueDeny(String),

    /// The unit's input queue crossed its high-watermark. The letter was
    /// accepted anyway; the caller is informed so it can back off.
    #[error("processing unit '{0}' is overloaded")]
    QueueOverload(String),

    #[error("persistent store has no key '{0}'")]
    PdbKeyNotExists(String),

    #[error("result file not found: {0}")]
    ResultFileNotFound(PathBuf),
}

/// Housekeeping failures on a worker.
#[derive(Debug, Error)]
pub enum HousekeepingError {
    #[error("unit '{0}' is in a dirty state")]
    DirtyState(String),

    #[error("cleanup of '{0}' failed")]
    CleanupFailed(String),
}
