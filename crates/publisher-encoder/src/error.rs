//! Error types for the encoder module.

use thiserror::Error;

/// Errors that can occur during encoding operations.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// x264 initialization failed.
    #[error("x264 initialization failed: {0}")]
    X264InitFailed(String),

    /// AAC encoder initialization failed.
    #[error("AAC encoder initialization failed: {0}")]
    AacInitFailed(String),

    /// General encoding error.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Invalid input data.
    #[error("Invalid input data: {0}")]
    InvalidInput(String),

    /// The encoder has already been drained.
    #[error("Encoder has been flushed")]
    Flushed,

    /// Codec support was not compiled in.
    #[error("Not supported: {0}")]
    NotSupported(String),
}
