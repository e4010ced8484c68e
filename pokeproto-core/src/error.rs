//! Error types, one enum per concern, mirroring the split the teacher used
//! between `net::result::Error` (wire-level) and `net::error::Error`
//! (connection-lifecycle) — just derived with `thiserror` instead of
//! hand-written `From` impls.

use crate::model::PeerAddr;
use thiserror::Error;

/// Failure decoding a single datagram into a field mapping.
#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum CodecError {
    #[error("line {0:?} is not a valid key:value pair")]
    MalformedLine(String),
    #[error("message has no message_type field")]
    MissingMessageType,
    #[error("datagram is not valid UTF-8")]
    InvalidUtf8,
    #[error("field {field:?} is not a valid integer: {value:?}")]
    InvalidInt { field: String, value: String },
}

/// Raised by the reliability layer once a pending datagram has exhausted
/// its retries without an ACK. Fatal to the session.
#[derive(Debug, Error, Clone)]
#[error("message seq {sequence} to {dest} exceeded max retries ({max_retries}); peer appears unresponsive")]
pub struct ReliabilityError {
    pub sequence: u64,
    pub dest: PeerAddr,
    pub max_retries: u32,
}

/// Top-level error surfaced by the [`crate::engine::Engine`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Reliability(#[from] ReliabilityError),

    #[error("damage calculation requires both local and remote creatures to be set")]
    MissingCreature,

    #[error("move {0:?} is not present in the move catalog")]
    UnknownMove(String),

    #[error("operation attempted while session is not in the required phase")]
    WrongPhase,

    #[error("session has no peer address set")]
    NoPeer,
}
