//! Error taxonomy for publisher operations.

use thiserror::Error;

use crate::state::StreamState;

/// Coarse error category, one per status code of the C surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration or mis-sized buffer; rejected before any mutation.
    InvalidParams,

    /// Encoder or muxer construction failed.
    InitFailed,

    /// Network open or header write failed.
    ConnectFailed,

    /// The codec rejected its input.
    EncodeFailed,

    /// A post-encode write failed.
    SendFailed,

    /// The call is not legal in the current state.
    NotConnected,

    /// An allocation failed.
    AllocFailed,
}

impl ErrorKind {
    /// Status code returned across the C boundary.
    pub fn code(self) -> i32 {
        match self {
            Self::InitFailed => -1,
            Self::ConnectFailed => -2,
            Self::EncodeFailed => -3,
            Self::SendFailed => -4,
            Self::NotConnected => -5,
            Self::InvalidParams => -6,
            Self::AllocFailed => -7,
        }
    }

    /// Symbolic name of the status code.
    pub fn name(self) -> &'static str {
        match self {
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InitFailed => "INIT_FAILED",
            Self::ConnectFailed => "CONNECT_FAILED",
            Self::EncodeFailed => "ENCODE_FAILED",
            Self::SendFailed => "SEND_FAILED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::AllocFailed => "ALLOC_FAILED",
        }
    }
}

/// Errors returned by publisher operations.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// A configuration field or argument is out of range.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// The video buffer length does not match the configured geometry.
    #[error("Invalid frame size: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    /// The audio buffer length does not match sample count and channels.
    #[error("Invalid audio buffer: expected {expected} samples, got {actual}")]
    AudioSize { expected: usize, actual: usize },

    /// Encoder or muxer construction failed.
    #[error("Initialization failed: {0}")]
    InitFailed(String),

    /// Network connection or header write failed.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// Encoding failed.
    #[error("Encoding failed: {0}")]
    EncodeFailed(String),

    /// Writing an encoded packet failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Operation called from the wrong state.
    #[error("Cannot {operation} in state {actual}")]
    WrongState {
        operation: &'static str,
        actual: StreamState,
    },

    /// Allocation failed.
    #[error("Allocation failed: {0}")]
    AllocFailed(String),
}

impl PublishError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParams(_) | Self::FrameSize { .. } | Self::AudioSize { .. } => {
                ErrorKind::InvalidParams
            }
            Self::InitFailed(_) => ErrorKind::InitFailed,
            Self::ConnectFailed(_) => ErrorKind::ConnectFailed,
            Self::EncodeFailed(_) => ErrorKind::EncodeFailed,
            Self::SendFailed(_) => ErrorKind::SendFailed,
            Self::WrongState { .. } => ErrorKind::NotConnected,
            Self::AllocFailed(_) => ErrorKind::AllocFailed,
        }
    }

    /// Status code returned across the C boundary.
    pub fn code(&self) -> i32 {
        self.kind().code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_c_header() {
        assert_eq!(ErrorKind::InitFailed.code(), -1);
        assert_eq!(ErrorKind::ConnectFailed.code(), -2);
        assert_eq!(ErrorKind::EncodeFailed.code(), -3);
        assert_eq!(ErrorKind::SendFailed.code(), -4);
        assert_eq!(ErrorKind::NotConnected.code(), -5);
        assert_eq!(ErrorKind::InvalidParams.code(), -6);
        assert_eq!(ErrorKind::AllocFailed.code(), -7);
    }

    #[test]
    fn test_frame_size_is_invalid_params() {
        let err = PublishError::FrameSize {
            expected: 3_686_400,
            actual: 100,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        assert_eq!(
            err.to_string(),
            "Invalid frame size: expected 3686400 bytes, got 100"
        );
    }

    #[test]
    fn test_wrong_state_message_names_state() {
        let err = PublishError::WrongState {
            operation: "send video",
            actual: StreamState::Connected,
        };
        assert_eq!(err.code(), -5);
        assert_eq!(err.to_string(), "Cannot send video in state Connected");
    }
}
