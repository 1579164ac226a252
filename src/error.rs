//! Error taxonomy for the sync layer.
//!
//! Link-level failures never escape the pool as errors; they surface as
//! connection state and per-relay outcome records. The variants here cover
//! the conditions callers can actually act on.

use thiserror::Error;

/// Errors produced by the client, pool, and signer.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure. Always retried by the owning link, never
    /// fatal on its own.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A send was attempted on a link with no live socket. Recorded per
    /// relay and surfaced as partial failure, not as an abort.
    #[error("not connected to {0}")]
    NotConnected(String),

    /// No relay reached the connected state within the bounded wait.
    #[error("no relay available")]
    NoRelay,

    /// A bech32 identifier failed to decode.
    #[error("invalid identifier encoding: {0}")]
    InvalidEncoding(String),

    /// Signing failed. Fatal to the operation that requested the signature.
    #[error("signer failure: {0}")]
    Signer(String),

    /// An event failed hash or signature verification.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Local key-value store I/O failure.
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
