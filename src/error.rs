//! Crate-wide error type.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the replication engine.
///
/// Handler and validation failures are funneled onto `error$` by the cycle
/// runner rather than propagated through `?` out of `run()` -- this type
/// exists for the internal plumbing and for the error payload carried on
/// that observable, not as something callers `?` past `run()`.
#[derive(Error, Debug)]
pub enum Error {
    /// The push or pull handler returned an error.
    #[error("{direction} handler failed: {source}")]
    HandlerFailed {
        direction: Direction,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A pulled document failed dev-mode schema validation.
    #[error("pulled document failed validation: {0}")]
    ValidationFailed(String),

    /// The checkpoint store could not persist a checkpoint update.
    #[error("failed to persist checkpoint: {source}")]
    Checkpoint {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The local storage instance rejected a bulk write or lookup.
    #[error("storage instance error: {source}")]
    Storage {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A should-not-happen invariant was violated (e.g. running a pull cycle
    /// with no pull handler configured). Surfaced as a distinct kind so
    /// callers can tell programmer-error bugs apart from runtime failures.
    #[error("should not happen: {0}")]
    ShouldNotHappen(&'static str),

    /// The replication state was already canceled.
    #[error("replication state is canceled")]
    Canceled,
}

/// Which handler produced a [`Error::HandlerFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Push => write!(f, "push"),
            Direction::Pull => write!(f, "pull"),
        }
    }
}
