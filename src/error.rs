//! Error types and result definitions for the lantuya crate.

use thiserror::Error;

/// Errors surfaced by the frame codec, session, discovery, and device API.
///
/// Errors are `Clone` so a single failure can be fanned out to every
/// awaiter registered against a torn-down connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid device configuration (missing id and ip, bad key length,
    /// malformed version string, or an operation called without arguments).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// TCP connect or session-key handshake exceeded the connect timeout.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// Underlying socket failure (reset, refused, closed mid-stream).
    #[error("socket error: {0}")]
    Socket(String),

    /// Inbound bytes did not start with a known frame magic.
    #[error("frame prefix mismatch (got 0x{0:08X})")]
    PrefixMismatch(u32),

    /// Frame did not end with the suffix its prefix requires.
    #[error("frame suffix mismatch")]
    SuffixMismatch,

    /// Buffer shorter than the frame's declared length.
    #[error("frame truncated: need {needed} bytes, have {have}")]
    TruncatedPayload { needed: usize, have: usize },

    /// CRC-32 trailer did not match the frame contents.
    #[error("CRC-32 mismatch")]
    CrcMismatch,

    /// HMAC-SHA256 trailer did not match the frame contents (v3.4).
    #[error("HMAC-SHA256 mismatch")]
    HmacMismatch,

    /// The cipher rejected the payload (wrong key, bad padding, truncated
    /// input, or GCM tag mismatch).
    #[error("payload decryption failed")]
    Decrypt,

    /// Outbound command code not in the protocol's command table.
    #[error("unknown command code 0x{0:02X}")]
    InvalidCommand(u32),

    /// No status reply arrived within the set response window.
    #[error("no status reply within the response window")]
    SetTimeout,

    /// No reply arrived for a query within the response window.
    #[error("no query reply within the response window")]
    GetTimeout,

    /// Session-key negotiation failed (HMAC mismatch or malformed reply).
    #[error("session key negotiation failed")]
    HandshakeIntegrity,

    /// No matching broadcast arrived before the discovery timeout.
    #[error("no matching broadcast before the discovery timeout")]
    FindTimeout,

    /// The connection was torn down while the operation was in flight,
    /// or the device handle is no longer backed by a running session.
    #[error("device is disconnected")]
    Disconnected,

    /// The device sent a structurally valid frame with unusable content.
    #[error("unexpected payload: {0}")]
    Payload(String),

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
}

/// A specialized `Result` for lantuya operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Socket(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}
