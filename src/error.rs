//! Session-level error taxonomy (spec §7).
//!
//! Every fallible operation in the engine returns `Result<T, SessionError>`.
//! Any `Err` here means the session state machine moves to `Closing`
//! (spec §4.1) — there is no partial recovery path once one of these fires.
//! A clean peer disconnect is not an error and is represented separately
//! (see [`crate::session::CloseReason`]).

use broadcast_protocol::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Malformed frame, header constraint violation, out-of-order part,
    /// unexpected ack, duplicate CONFIGURE, notify before configure, unknown
    /// compressor ID, length mismatch, oversize body, unsupported flags.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The auth verifier returned `unauthorized` or `forbidden`.
    #[error("authorization rejected: {0}")]
    AuthRejected(String),

    /// The auth verifier, fanout hub, or delivery fanout reported
    /// `unavailable`.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A SHA-512 or length check failed.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Spool I/O, compression, or training-provider failure.
    #[error("local fault: {0}")]
    LocalFault(String),

    #[error("framing error: {0}")]
    Codec(#[from] CodecError),

    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn local_fault(msg: impl Into<String>) -> Self {
        Self::LocalFault(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
