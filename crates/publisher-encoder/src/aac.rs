//! AAC audio encoder.

use std::collections::VecDeque;

use bytes::Bytes;
use publisher_convert::{ChannelLayout, PlanarAudioFrame};
use tracing::{debug, instrument, trace};

use crate::error::EncoderError;
use crate::{AudioEncoder, AudioEncoderConfig, EncodedAudioPacket, EncoderResult};

/// Upper bound on silent frames fed while draining the look-ahead.
const MAX_FLUSH_FRAMES: usize = 4;

/// AAC-LC audio encoder using fdk-aac with raw (non-ADTS) output.
pub struct AacEncoder {
    encoder: fdk_aac::enc::Encoder,
    config: AudioEncoderConfig,
    frame_size: usize,
    /// Interleaved i16 scratch for one frame.
    pcm: Vec<i16>,
    /// Output buffer for encoded data.
    output_buffer: Vec<u8>,
    /// Timestamps of submitted frames not yet matched to output.
    pending_pts: VecDeque<i64>,
    frame_count: u64,
}

impl AacEncoder {
    /// Create a new AAC encoder.
    #[instrument(name = "aac_new", skip_all)]
    pub fn new(config: AudioEncoderConfig) -> EncoderResult<Self> {
        debug!(
            sample_rate = config.sample_rate,
            channels = config.layout.channels(),
            bitrate_kbps = config.bitrate_kbps,
            "Initializing AAC encoder"
        );

        let channel_mode = match config.layout {
            ChannelLayout::Mono => fdk_aac::enc::ChannelMode::Mono,
            ChannelLayout::Stereo => fdk_aac::enc::ChannelMode::Stereo,
        };

        let params = fdk_aac::enc::EncoderParams {
            bit_rate: fdk_aac::enc::BitRate::Cbr(config.bitrate_kbps * 1000),
            sample_rate: config.sample_rate,
            transport: fdk_aac::enc::Transport::Raw,
            channels: channel_mode,
        };

        let encoder = fdk_aac::enc::Encoder::new(params)
            .map_err(|e| EncoderError::AacInitFailed(format!("{:?}", e)))?;

        let info = encoder
            .info()
            .map_err(|e| EncoderError::AacInitFailed(format!("info failed: {:?}", e)))?;

        debug!(
            max_out_buf_bytes = info.maxOutBufBytes,
            frame_length = info.frameLength,
            "AAC encoder initialized"
        );

        let frame_size = info.frameLength as usize;
        Ok(Self {
            encoder,
            pcm: vec![0; frame_size * config.layout.channels()],
            output_buffer: vec![0u8; info.maxOutBufBytes as usize],
            config,
            frame_size,
            pending_pts: VecDeque::new(),
            frame_count: 0,
        })
    }

    /// Interleave planar float samples into the i16 scratch buffer.
    fn fill_pcm(&mut self, planes: &[Vec<f32>]) {
        let channels = planes.len();
        for (channel, plane) in planes.iter().enumerate() {
            for (i, &sample) in plane.iter().take(self.frame_size).enumerate() {
                self.pcm[i * channels + channel] = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
            }
        }
    }

    /// Run one frame from the scratch buffer through the codec.
    fn encode_pcm(&mut self) -> EncoderResult<Option<EncodedAudioPacket>> {
        let encode_info = self
            .encoder
            .encode(&self.pcm, &mut self.output_buffer)
            .map_err(|e| EncoderError::Encoding(format!("AAC encode failed: {:?}", e)))?;

        if encode_info.output_size == 0 {
            return Ok(None);
        }

        let pts = self.pending_pts.pop_front().unwrap_or_default();
        Ok(Some(EncodedAudioPacket {
            data: Bytes::copy_from_slice(&self.output_buffer[..encode_info.output_size]),
            pts,
        }))
    }
}

impl AudioEncoder for AacEncoder {
    #[instrument(name = "aac_encode", skip_all)]
    fn encode(&mut self, frame: &PlanarAudioFrame) -> EncoderResult<Option<EncodedAudioPacket>> {
        let channels = self.config.layout.channels();
        if frame.planes.len() != channels || frame.samples != self.frame_size {
            return Err(EncoderError::InvalidInput(format!(
                "Expected {} planes of {} samples, got {} of {}",
                channels,
                self.frame_size,
                frame.planes.len(),
                frame.samples
            )));
        }

        trace!(frame = self.frame_count, pts = frame.pts, "Encoding AAC frame");

        self.fill_pcm(&frame.planes);
        self.pending_pts.push_back(frame.pts);
        self.frame_count += 1;
        self.encode_pcm()
    }

    fn flush(&mut self) -> EncoderResult<Vec<EncodedAudioPacket>> {
        debug!(pending = self.pending_pts.len(), "Flushing AAC encoder");

        let mut packets = Vec::new();
        self.pcm.fill(0);
        for _ in 0..MAX_FLUSH_FRAMES {
            if self.pending_pts.is_empty() {
                break;
            }
            if let Some(packet) = self.encode_pcm()? {
                packets.push(packet);
            }
        }
        self.pending_pts.clear();

        Ok(packets)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn layout(&self) -> ChannelLayout {
        self.config.layout
    }

    fn name(&self) -> &'static str {
        "AAC-LC"
    }
}

impl Drop for AacEncoder {
    fn drop(&mut self) {
        debug!("Closing AAC encoder");
    }
}

// SAFETY: the fdk-aac handle has no thread affinity and is only touched
// through `&mut self`.
unsafe impl Send for AacEncoder {}
