//! Error types for the actor runtime
//!
//! Errors are local to the call that raised them. A closed actor is not an
//! error: awaiting one yields [`Outcome::Closed`](crate::actor::Outcome).

use thiserror::Error;

/// Errors raised while encoding or decoding a value stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The byte stream does not follow the wire format.
    #[error("malformed stream at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: String },

    /// A native callable cannot be persisted.
    #[error("attempt to persist a native function '{name}'")]
    NonSerializable { name: String },

    /// Nesting exceeded the configured limit.
    #[error("value nesting exceeds depth {limit}")]
    DepthExceeded { limit: usize },

    /// A length or count does not fit the 32-bit varint used on the wire.
    #[error("{what} of {len} does not fit in 32 bits")]
    TooLarge { what: &'static str, len: usize },
}

impl CodecError {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        CodecError::Malformed {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn truncated(offset: usize, wanted: usize) -> Self {
        CodecError::malformed(offset, format!("truncated, wanted {} more byte(s)", wanted))
    }
}

/// Errors raised by the process manager.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Spawn options were rejected before reaching the OS.
    #[error("invalid spawn argument: {0}")]
    InvalidArgument(String),

    /// The OS refused to launch the process.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Signal delivery failed.
    #[error("failed to signal process {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Crate-wide error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An actor tried to await itself.
    #[error("actor {0} cannot await itself")]
    AwaitSelf(crate::actor::ActorId),
}

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
