//! Stream configuration, audio status and statistics.

use serde::{Deserialize, Serialize};

use crate::error::PublishError;
use crate::time::TimeBase;
use crate::{
    PublishResult, DEFAULT_AUDIO_BITRATE_KBPS, DEFAULT_AUDIO_CHANNELS, DEFAULT_AUDIO_SAMPLE_RATE,
    DEFAULT_KEYFRAME_INTERVAL_S, MAX_DIMENSION, RGBA_BYTES_PER_PIXEL,
};

/// Configuration of one publishing session.
///
/// Fixed between `connect()` and the next `disconnect()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,

    /// Constant frame rate.
    pub fps: u32,

    /// Target video bitrate in kbps.
    pub bitrate_kbps: u32,

    /// Seconds between forced keyframes.
    pub keyframe_interval_s: u32,

    /// Caller's audio sample rate in Hz.
    pub audio_sample_rate: u32,

    /// Caller's interleaved channel count.
    pub audio_channels: u32,

    /// Target audio bitrate in kbps.
    pub audio_bitrate_kbps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 3500,
            keyframe_interval_s: DEFAULT_KEYFRAME_INTERVAL_S,
            audio_sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            audio_channels: DEFAULT_AUDIO_CHANNELS,
            audio_bitrate_kbps: DEFAULT_AUDIO_BITRATE_KBPS,
        }
    }
}

impl StreamConfig {
    /// Build a configuration from the signed values of the C surface.
    ///
    /// Geometry, frame rate and video bitrate must be positive. The remaining
    /// fields fall back to their defaults when zero or negative.
    #[allow(clippy::too_many_arguments)]
    pub fn from_raw(
        width: i32,
        height: i32,
        fps: i32,
        bitrate_kbps: i32,
        keyframe_interval_s: i32,
        audio_sample_rate: i32,
        audio_channels: i32,
        audio_bitrate_kbps: i32,
    ) -> PublishResult<Self> {
        let required = |name: &str, value: i32| -> PublishResult<u32> {
            if value <= 0 {
                return Err(PublishError::InvalidParams(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
            Ok(value as u32)
        };
        let optional = |value: i32, default: u32| if value > 0 { value as u32 } else { default };

        let config = Self {
            width: required("width", width)?,
            height: required("height", height)?,
            fps: required("fps", fps)?,
            bitrate_kbps: required("bitrate_kbps", bitrate_kbps)?,
            keyframe_interval_s: optional(keyframe_interval_s, DEFAULT_KEYFRAME_INTERVAL_S),
            audio_sample_rate: optional(audio_sample_rate, DEFAULT_AUDIO_SAMPLE_RATE),
            audio_channels: optional(audio_channels, DEFAULT_AUDIO_CHANNELS),
            audio_bitrate_kbps: optional(audio_bitrate_kbps, DEFAULT_AUDIO_BITRATE_KBPS),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that every field is positive and the geometry is addressable.
    pub fn validate(&self) -> PublishResult<()> {
        let fields = [
            ("width", self.width),
            ("height", self.height),
            ("fps", self.fps),
            ("bitrate_kbps", self.bitrate_kbps),
            ("keyframe_interval_s", self.keyframe_interval_s),
            ("audio_sample_rate", self.audio_sample_rate),
            ("audio_channels", self.audio_channels),
            ("audio_bitrate_kbps", self.audio_bitrate_kbps),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| *value == 0) {
            return Err(PublishError::InvalidParams(format!(
                "{} must be positive",
                name
            )));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(PublishError::InvalidParams(format!(
                "{}x{} exceeds the {} pixel limit",
                self.width, self.height, MAX_DIMENSION
            )));
        }
        Ok(())
    }

    /// Exact byte length of one RGBA frame.
    pub fn frame_size_bytes(&self) -> usize {
        self.width as usize * self.height as usize * RGBA_BYTES_PER_PIXEL
    }

    /// Frames between keyframes.
    pub fn gop_size(&self) -> u32 {
        self.fps.saturating_mul(self.keyframe_interval_s)
    }

    /// Encoder time base for video (one tick per frame).
    pub fn video_time_base(&self) -> TimeBase {
        TimeBase::per_frame(self.fps)
    }
}

/// Whether the secondary audio stream is being published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioStatus {
    /// No connection has been attempted since the last `init()`.
    #[default]
    NotConfigured,

    /// An audio encoder is open and its stream is in the container.
    Active,

    /// Audio could not be set up; the session publishes video only.
    Unavailable { reason: String },
}

impl AudioStatus {
    /// Returns true if audio packets are being published.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Compressed bytes written, video and audio.
    pub bytes_sent: u64,

    /// Accepted `send_video_frame` calls.
    pub frames_sent: u64,

    /// Video frames that failed to encode or write.
    pub dropped_frames: u64,

    /// Video packets written.
    pub video_packets: u64,

    /// Audio packets written.
    pub audio_packets: u64,

    /// Seconds since `start_streaming()`, zero when not streaming.
    pub uptime_seconds: u64,

    /// Average output bitrate since `start_streaming()`.
    pub bitrate_kbps: u32,
}
