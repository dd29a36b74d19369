//! Status values returned by every codec parse and reassembly step

use crate::wire::WireError;
use serde::Serialize;
use thiserror::Error;

/// Error kinds a codec or the engine can report for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    /// Payload violates the codec's grammar (truncation included).
    MalformedPacket,
    /// An allocation bound was exceeded while building the result.
    OutOfMemory,
    /// Header or type byte not recognised.
    ProtocolError,
    /// A response arrived for a phase the target was not waiting on.
    OrderingError,
}

impl QueryErrorKind {
    /// Whether this error ends the target. Ordering errors are only logged.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, QueryErrorKind::OrderingError)
    }
}

impl std::fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueryErrorKind::MalformedPacket => "malformed packet",
            QueryErrorKind::OutOfMemory => "out of memory",
            QueryErrorKind::ProtocolError => "protocol error",
            QueryErrorKind::OrderingError => "ordering error",
        };
        write!(f, "{}", name)
    }
}

/// Result of feeding one payload to a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// More data expected; no phase transition.
    InProgress,
    /// Phase complete, but further datagrams for it are still accepted.
    DoneAuto,
    /// Phase complete; later datagrams for it are ignored.
    DoneForce,
    Error(QueryErrorKind),
}

impl QueryOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, QueryOutcome::DoneAuto | QueryOutcome::DoneForce)
    }

    /// Terminal for the phase: either done or a fatal error.
    pub fn is_terminal(&self) -> bool {
        match self {
            QueryOutcome::InProgress => false,
            QueryOutcome::DoneAuto | QueryOutcome::DoneForce => true,
            QueryOutcome::Error(kind) => kind.is_fatal(),
        }
    }

    pub fn error_kind(&self) -> Option<QueryErrorKind> {
        match self {
            QueryOutcome::Error(kind) => Some(*kind),
            _ => None,
        }
    }
}

/// Errors raised inside codecs, collapsed into a [`QueryOutcome`] at the
/// codec boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("unknown packet type 0x{0:02X}")]
    UnknownType(u8),
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Malformed(String),
    #[error("response for {0} was not expected")]
    Unexpected(&'static str),
    #[error("result limit exceeded: {0}")]
    Capacity(String),
}

impl CodecError {
    pub fn kind(&self) -> QueryErrorKind {
        match self {
            CodecError::Wire(_) | CodecError::Malformed(_) => QueryErrorKind::MalformedPacket,
            CodecError::UnknownType(_) | CodecError::Protocol(_) => QueryErrorKind::ProtocolError,
            CodecError::Unexpected(_) => QueryErrorKind::OrderingError,
            CodecError::Capacity(_) => QueryErrorKind::OutOfMemory,
        }
    }
}

impl From<&CodecError> for QueryOutcome {
    fn from(err: &CodecError) -> Self {
        QueryOutcome::Error(err.kind())
    }
}
