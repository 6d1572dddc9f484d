//! Pixel and sample conversion.
//!
//! This crate reshapes caller media into encoder-native formats: RGBA frames
//! become bilinear-scaled planar YUV 4:2:0 pictures, and interleaved float
//! PCM becomes planar frames of the audio encoder's fixed frame size.

mod audio;
mod error;
mod pixel;

pub use audio::{AudioResampler, ChannelLayout, PlanarAudioFrame};
pub use error::ConvertError;
pub use pixel::{I420Picture, RgbaScaler};

/// Result type for conversion operations.
pub type ConvertResult<T> = Result<T, ConvertError>;
