//! Publisher lifecycle states.

use serde::{Deserialize, Serialize};

/// The lifecycle state of a publishing session.
///
/// Legal edges: `init` (any → Initialized), `connect` (Initialized →
/// Connected), `start_streaming` (Connected → Streaming), `stop_streaming`
/// (Streaming → Connected), `disconnect` (Connected/Streaming → Initialized)
/// and `cleanup` (any → Idle).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    /// No session configured.
    #[default]
    Idle,

    /// Configuration accepted, packet buffer allocated.
    Initialized,

    /// Encoders open, container header written.
    Connected,

    /// Accepting media.
    Streaming,

    /// A transition failed and left no usable session.
    Error,
}

impl StreamState {
    /// Numeric code exposed across the C boundary.
    pub fn code(self) -> i32 {
        match self {
            Self::Idle => 0,
            Self::Initialized => 1,
            Self::Connected => 2,
            Self::Streaming => 3,
            Self::Error => -1,
        }
    }

    /// Inverse of [`StreamState::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Idle),
            1 => Some(Self::Initialized),
            2 => Some(Self::Connected),
            3 => Some(Self::Streaming),
            -1 => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns true if encoder and network contexts exist in this state.
    pub fn has_pipeline(self) -> bool {
        matches!(self, Self::Connected | Self::Streaming)
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Initialized => "Initialized",
            Self::Connected => "Connected",
            Self::Streaming => "Streaming",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
