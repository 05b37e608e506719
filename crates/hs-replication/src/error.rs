//! Replication errors.

use hs_core::crypto::CryptoError;
use hs_core::{DecodeError, ErrorKind, HandleError};
use hs_net::TransportError;
use hs_store::StorageError;
use thiserror::Error;

/// Errors raised while producing or consuming replication streams.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Stream IO failed
    #[error("replication stream IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Talking to the source failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A record did not decode
    #[error("malformed replication record: {0}")]
    Malformed(#[from] DecodeError),

    /// Unknown record type
    #[error("unknown record type {0}")]
    UnknownRecord(u8),

    /// A block signature is missing, bad, or from the wrong signer
    #[error("replication stream compromised: {0}")]
    Compromised(String),

    /// Signing a block failed
    #[error("cannot sign replication block: {0}")]
    Crypto(#[from] CryptoError),

    /// Local storage rejected a change
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The source answered with an error
    #[error("source refused: {0}")]
    Remote(HandleError),

    /// The stream ended before its terminator
    #[error("replication stream ended early")]
    Truncated,

    /// State file could not be read or written
    #[error("replication state: {0}")]
    State(String),
}

impl From<ReplicationError> for HandleError {
    fn from(err: ReplicationError) -> Self {
        match err {
            ReplicationError::Remote(inner) => inner,
            ReplicationError::Compromised(_) => HandleError::security_alert(err.to_string()),
            ReplicationError::Storage(e) => HandleError::from(e),
            ReplicationError::Transport(e) => HandleError::from(e),
            other => HandleError::new(ErrorKind::ReplicationError, other.to_string()),
        }
    }
}

impl From<HandleError> for ReplicationError {
    fn from(err: HandleError) -> Self {
        ReplicationError::Remote(err)
    }
}

/// Result alias for replication.
pub type ReplicationResult<T> = Result<T, ReplicationError>;
