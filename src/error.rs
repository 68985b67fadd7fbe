//! Error types for the SAT>IP client core.

use thiserror::Error;

/// Errors surfaced by the SAT>IP client core.
///
/// Per-packet decode problems (RTP/RTCP) are counted and dropped by the
/// receivers and only show up here when a caller explicitly asks for them;
/// they are never fatal to a session.
#[derive(Debug, Error)]
pub enum SatipError {
    /// Invalid configuration detected at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// No server with a matching free frontend was found.
    #[error("no SAT>IP server available")]
    NoServerAvailable,

    /// TCP connect to the RTSP port timed out.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The server answered an RTSP request with a non-2xx status.
    #[error("RTSP error response: {0}")]
    RtspProtocol(u32),

    /// The server demanded authentication we do not provide.
    #[error("RTSP authentication required")]
    RtspAuth,

    /// SETUP did not yield a usable transport.
    #[error("transport negotiation failed")]
    TransportNegotiationFailed,

    /// No lock was achieved within the tuning timeout.
    #[error("tuning timed out")]
    TuningTimeout,

    /// The periodic OPTIONS keep-alive failed.
    #[error("keep-alive failed")]
    KeepAliveFailed,

    /// DESCRIBE failed while waiting for lock.
    #[error("DESCRIBE failed")]
    DescribeFailed,

    /// Malformed RTP packet.
    #[error("RTP decode error: {0}")]
    RtpDecode(&'static str),

    /// Malformed RTCP packet.
    #[error("RTCP decode error: {0}")]
    RtcpDecode(&'static str),

    /// The TS ring buffer dropped data.
    #[error("TS buffer overflow, {0} bytes dropped")]
    BufferOverflow(usize),

    /// A device description did not parse.
    #[error("malformed device description from {0}")]
    DiscoveryXmlMalformed(String),

    /// Underlying socket error.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SatipError>;
