//! Error types for the veiltun data plane.

use thiserror::Error;

/// Result type alias for veiltun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the veiltun data plane.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (key length, unresolvable endpoints, missing flags)
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport could not be brought up (bind, socket options, SOCKS5 negotiation)
    #[error("transport init error: {0}")]
    TransportInit(String),

    /// Malformed datagram (truncated, unknown type, invalid SOCKS5 envelope)
    #[error("malformed datagram: {0}")]
    Packet(String),

    /// Sequence number already seen inside the replay window
    #[error("replayed sequence {0}")]
    Replay(u32),

    /// Sequence number fell behind the replay window
    #[error("sequence {0} older than replay window")]
    TooOld(u32),

    /// AEAD authentication failed (key mismatch or tampering)
    #[error("authentication failed")]
    Crypto,

    /// LZ4 frame was invalid or decompressed to nothing
    #[error("compression error: {0}")]
    Compression(String),

    /// Network or device I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// ip/iptables invocation failed
    #[error("platform command failed: {0}")]
    Platform(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new transport initialization error
    pub fn transport_init(msg: impl Into<String>) -> Self {
        Error::TransportInit(msg.into())
    }

    /// Create a new malformed-datagram error
    pub fn packet(msg: impl Into<String>) -> Self {
        Error::Packet(msg.into())
    }

    /// Create a new compression error
    pub fn compression(msg: impl Into<String>) -> Self {
        Error::Compression(msg.into())
    }

    /// Create a new platform error
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    /// Whether the owning loop must stop.
    ///
    /// Only I/O failures on the socket or the TUN device qualify; everything
    /// else is a per-datagram condition that is logged, dropped, and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Replay-window rejections, dropped silently outside verbose runs.
    pub fn is_replay(&self) -> bool {
        matches!(self, Error::Replay(_) | Error::TooOld(_))
    }
}
