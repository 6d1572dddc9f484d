//! Shared vocabulary for the RTMP publisher.
//!
//! This crate defines the stream configuration, the lifecycle states, the
//! error taxonomy and the statistics snapshot used by every other crate in
//! the workspace and by the C-callable bridge.

mod error;
mod state;
mod time;
mod types;

pub use error::{ErrorKind, PublishError};
pub use state::StreamState;
pub use time::TimeBase;
pub use types::{AudioStatus, StatisticsSnapshot, StreamConfig};

/// Result type for publisher operations.
pub type PublishResult<T> = Result<T, PublishError>;

/// Largest accepted frame edge in pixels.
pub const MAX_DIMENSION: u32 = 16384;

/// Default keyframe interval in seconds.
pub const DEFAULT_KEYFRAME_INTERVAL_S: u32 = 2;

/// Default audio sample rate in Hz.
pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 44100;

/// Default audio channel count.
pub const DEFAULT_AUDIO_CHANNELS: u32 = 2;

/// Default audio bitrate in kbps.
pub const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 128;

/// Bytes per RGBA pixel.
pub const RGBA_BYTES_PER_PIXEL: usize = 4;
