//! Video (x264) and audio (AAC) encoding.
//!
//! This crate wraps the H.264 and AAC codecs behind the [`VideoEncoder`] and
//! [`AudioEncoder`] traits. The codec adapters are compiled with the `native`
//! feature; without it the factories report [`EncoderError::NotSupported`].

#[cfg(feature = "native")]
mod aac;
mod error;
#[cfg(feature = "native")]
mod x264;

#[cfg(feature = "native")]
pub use aac::AacEncoder;
pub use error::EncoderError;
#[cfg(feature = "native")]
pub use x264::X264Encoder;

use bytes::Bytes;
use publisher_convert::{ChannelLayout, I420Picture, PlanarAudioFrame};
use publisher_types::{StreamConfig, TimeBase};

/// Result type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;

/// Samples per channel in one AAC-LC frame.
pub const AAC_FRAME_SIZE: usize = 1024;

/// Sampling rates an AAC AudioSpecificConfig can signal by index.
pub const AAC_SAMPLE_RATES: [u32; 12] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000,
];

/// Rate the AAC encoder runs at for a caller rate; unsupported rates are
/// resampled to 48 kHz.
pub fn supported_aac_rate(rate: u32) -> u32 {
    if AAC_SAMPLE_RATES.contains(&rate) {
        rate
    } else {
        48000
    }
}

/// Video encoding configuration.
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Constant frame rate; the encoder time base is `1/fps`.
    pub fps: u32,

    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,

    /// Keyframe interval in seconds.
    pub keyframe_interval_secs: u32,

    /// H.264 profile.
    pub profile: H264Profile,
}

impl VideoEncoderConfig {
    /// Frames per GOP.
    pub fn gop_size(&self) -> u32 {
        self.fps.saturating_mul(self.keyframe_interval_secs).max(1)
    }
}

impl From<&StreamConfig> for VideoEncoderConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.fps,
            bitrate_kbps: config.bitrate_kbps,
            keyframe_interval_secs: config.keyframe_interval_s,
            profile: H264Profile::Main,
        }
    }
}

/// H.264 profile levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

/// Audio encoding configuration.
#[derive(Debug, Clone)]
pub struct AudioEncoderConfig {
    /// Encoder sample rate in Hz, one of [`AAC_SAMPLE_RATES`].
    pub sample_rate: u32,

    /// Channel layout.
    pub layout: ChannelLayout,

    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,
}

impl AudioEncoderConfig {
    /// Derive the encoder settings for a stream, or fail when the caller's
    /// channel count has no default layout.
    pub fn for_stream(config: &StreamConfig) -> EncoderResult<Self> {
        let layout = ChannelLayout::from_channel_count(config.audio_channels)
            .map_err(|e| EncoderError::NotSupported(e.to_string()))?;
        Ok(Self {
            sample_rate: supported_aac_rate(config.audio_sample_rate),
            layout,
            bitrate_kbps: config.audio_bitrate_kbps,
        })
    }
}

/// An encoded video packet.
#[derive(Debug, Clone)]
pub struct EncodedVideoPacket {
    /// Annex-B NAL data.
    pub data: Bytes,

    /// Presentation timestamp in encoder ticks.
    pub pts: i64,

    /// Decode timestamp in encoder ticks.
    pub dts: i64,

    /// Whether this is a keyframe.
    pub is_keyframe: bool,
}

/// An encoded audio packet.
#[derive(Debug, Clone)]
pub struct EncodedAudioPacket {
    /// Raw AAC access unit.
    pub data: Bytes,

    /// Presentation timestamp in encoder ticks (samples).
    pub pts: i64,
}

/// Trait for video encoders.
pub trait VideoEncoder: Send {
    /// Encode one picture stamped `pts` in encoder ticks. Returns `None`
    /// while the encoder is buffering.
    fn encode(
        &mut self,
        picture: &I420Picture,
        pts: i64,
    ) -> EncoderResult<Option<EncodedVideoPacket>>;

    /// Drain every buffered frame. The encoder accepts no input afterwards.
    fn flush(&mut self) -> EncoderResult<Vec<EncodedVideoPacket>>;

    /// SPS and PPS in Annex-B form.
    fn headers(&self) -> Bytes;

    /// Time base of packet timestamps.
    fn time_base(&self) -> TimeBase;

    /// Get encoder name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Trait for audio encoders.
pub trait AudioEncoder: Send {
    /// Encode one planar frame of exactly [`AudioEncoder::frame_size`]
    /// samples per channel.
    fn encode(&mut self, frame: &PlanarAudioFrame) -> EncoderResult<Option<EncodedAudioPacket>>;

    /// Drain the encoder's look-ahead.
    fn flush(&mut self) -> EncoderResult<Vec<EncodedAudioPacket>>;

    /// Samples per channel per input frame.
    fn frame_size(&self) -> usize;

    /// Encoder sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Encoder channel layout.
    fn layout(&self) -> ChannelLayout;

    /// Get encoder name for diagnostics.
    fn name(&self) -> &'static str;

    /// Time base of packet timestamps.
    fn time_base(&self) -> TimeBase {
        TimeBase::new(1, self.sample_rate())
    }
}

/// Create the H.264 encoder.
#[cfg(feature = "native")]
pub fn create_video_encoder(config: VideoEncoderConfig) -> EncoderResult<Box<dyn VideoEncoder>> {
    let encoder = X264Encoder::new(config)?;
    tracing::info!("Using x264 software encoder");
    Ok(Box::new(encoder))
}

/// Create the H.264 encoder (stub without native codecs).
#[cfg(not(feature = "native"))]
pub fn create_video_encoder(_config: VideoEncoderConfig) -> EncoderResult<Box<dyn VideoEncoder>> {
    Err(EncoderError::NotSupported(
        "built without the native codec backend".into(),
    ))
}

/// Create the AAC encoder.
#[cfg(feature = "native")]
pub fn create_audio_encoder(config: AudioEncoderConfig) -> EncoderResult<Box<dyn AudioEncoder>> {
    let encoder = AacEncoder::new(config)?;
    Ok(Box::new(encoder))
}

/// Create the AAC encoder (stub without native codecs).
#[cfg(not(feature = "native"))]
pub fn create_audio_encoder(_config: AudioEncoderConfig) -> EncoderResult<Box<dyn AudioEncoder>> {
    Err(EncoderError::NotSupported(
        "built without the native codec backend".into(),
    ))
}

/// Check that the native codecs can actually be opened on this host.
pub fn probe_native() -> EncoderResult<()> {
    let config = VideoEncoderConfig {
        width: 64,
        height: 64,
        fps: 30,
        bitrate_kbps: 100,
        keyframe_interval_secs: 1,
        profile: H264Profile::Main,
    };
    create_video_encoder(config).map(|_| ())
}
