//! Error types shared across the link engine.

use crate::infrastructure::bluetooth::protocol::Channel;
use crate::infrastructure::bluetooth::session::LinkState;
use thiserror::Error;

/// Failures surfaced by [`LinkSession`](crate::infrastructure::bluetooth::session::LinkSession)
/// commands.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is not ready (state: {0:?})")]
    NotReady(LinkState),

    #[error("a session is already active (state: {0:?})")]
    AlreadyActive(LinkState),

    #[error("channel {0:?} was not discovered on the peripheral")]
    ChannelMissing(Channel),

    #[error("transport rejected {operation} on {channel:?}")]
    Rejected {
        channel: Channel,
        operation: &'static str,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Failures while turning a framed slice into telemetry samples.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("slice is not a JSON object: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported payload format: {0:?}")]
    UnsupportedFormat(String),

    #[error("declared float count missing or invalid: {0}")]
    InvalidFloatCount(i64),

    #[error("bad base64 payload: {0}")]
    Base64(#[from] data_encoding::DecodeError),

    #[error("raw byte length is not a multiple of 4: {0}")]
    ByteLength(usize),

    #[error("float count mismatch: expected={expected} actual={actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("row {0} does not hold four numeric components")]
    InvalidRow(usize),

    #[error("envelope carries no recognised telemetry field")]
    Unrecognized,
}

impl EnvelopeError {
    /// The slice was not JSON at all, as opposed to a JSON envelope whose
    /// payload failed to decode. Both discard the reassembly buffer.
    pub fn is_framing(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Failures reported by the account / pairing backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("HTTP {status} {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

impl ServiceError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Http { status: 401, .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Http { status: 403, .. })
    }
}
