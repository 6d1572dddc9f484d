//! Error types for the conversion module.

use thiserror::Error;

/// Errors that can occur during pixel or sample conversion.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Input buffer does not match the declared geometry.
    #[error("Input size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Zero or unaddressable dimensions.
    #[error("Invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Channel count without a default layout.
    #[error("Unsupported channel layout: {0} channels")]
    UnsupportedLayout(u32),

    /// Zero sample rate or frame size.
    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),

    /// Buffer allocation failed.
    #[error("Allocation of {0} bytes failed")]
    Alloc(usize),
}
