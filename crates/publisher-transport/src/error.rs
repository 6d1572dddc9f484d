//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur during muxing or transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid or unsupported endpoint URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// TLS setup or handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server rejected a request.
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// Timed out waiting for the server.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// RTMP protocol error.
    #[error("RTMP protocol error: {0}")]
    Protocol(String),

    /// Send error.
    #[error("Send error: {0}")]
    Send(String),

    /// Stream layout or ordering violation in the muxer.
    #[error("Muxer error: {0}")]
    Muxer(String),

    /// Decode timestamps went backwards within one stream.
    #[error("Non-monotonic DTS on {stream} stream: {dts} ms after {last} ms")]
    NonMonotonicDts {
        stream: &'static str,
        dts: i64,
        last: i64,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
