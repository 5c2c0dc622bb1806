//! Engine error taxonomy. Failures on one connection never cross the engine
//! boundary as panics; they surface as values here and as the engine's
//! current-error observable.

use bluwave_core::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The transport endpoint could not be bound at all.
    #[error("radio unavailable: {0}")]
    RadioUnavailable(#[source] std::io::Error),
    /// The radio is soft-disabled in config; user-recoverable.
    #[error("radio disabled")]
    RadioDisabled,
    /// Outbound connect failed; state is left unchanged, no retry.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("already in a session")]
    AlreadyInSession,
    #[error("not in a session")]
    NotInSession,
    #[error("unknown device; scan first")]
    UnknownDevice,
    /// Read/write failure on an established connection.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl EngineError {
    /// Encode/decode failures on our own side, reported as invalid-data I/O.
    pub(crate) fn invalid_data<E: std::fmt::Display>(err: E) -> Self {
        EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        ))
    }
}
