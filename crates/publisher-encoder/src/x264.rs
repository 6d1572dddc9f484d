//! x264 software video encoder.

use bytes::Bytes;
use publisher_convert::I420Picture;
use publisher_types::TimeBase;
use tracing::{debug, instrument, trace};

use crate::error::EncoderError;
use crate::{EncodedVideoPacket, EncoderResult, H264Profile, VideoEncoder, VideoEncoderConfig};

/// x264 encoder tuned for latency: veryfast preset, zero-latency mode,
/// no B-frames, fixed GOP without scene-cut keyframes.
pub struct X264Encoder {
    encoder: Option<x264::Encoder>,
    config: VideoEncoderConfig,
    frame_count: u64,
    /// Cached SPS/PPS header data.
    headers: Bytes,
}

impl X264Encoder {
    /// Create a new x264 encoder.
    #[instrument(name = "x264_new", skip_all)]
    pub fn new(config: VideoEncoderConfig) -> EncoderResult<Self> {
        debug!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            bitrate_kbps = config.bitrate_kbps,
            gop = config.gop_size(),
            "Initializing x264 encoder"
        );

        let mut setup = x264::Setup::preset(
            x264::Preset::Veryfast,
            x264::Tune::None,
            false, // fast_decode
            true,  // zero_latency
        )
        .fps(config.fps, 1)
        .bitrate(config.bitrate_kbps as i32)
        .max_keyframe_interval(config.gop_size() as i32)
        .scenecut_threshold(0);

        setup = match config.profile {
            H264Profile::Baseline => setup.baseline(),
            H264Profile::Main => setup.main(),
            H264Profile::High => setup.high(),
        };

        let mut encoder = setup
            .build(
                x264::Colorspace::I420,
                config.width as i32,
                config.height as i32,
            )
            .map_err(|e| EncoderError::X264InitFailed(format!("{:?}", e)))?;

        let headers = encoder
            .headers()
            .map(|h| Bytes::copy_from_slice(h.entirety()))
            .map_err(|e| EncoderError::X264InitFailed(format!("no headers: {:?}", e)))?;

        debug!(header_size = headers.len(), "x264 encoder initialized");

        Ok(Self {
            encoder: Some(encoder),
            config,
            frame_count: 0,
            headers,
        })
    }
}

impl VideoEncoder for X264Encoder {
    #[instrument(name = "x264_encode", skip(self, picture))]
    fn encode(
        &mut self,
        picture: &I420Picture,
        pts: i64,
    ) -> EncoderResult<Option<EncodedVideoPacket>> {
        if picture.width() != self.config.width || picture.height() != self.config.height {
            return Err(EncoderError::InvalidInput(format!(
                "Expected {}x{} picture, got {}x{}",
                self.config.width,
                self.config.height,
                picture.width(),
                picture.height()
            )));
        }

        trace!(frame = self.frame_count, pts, "Encoding frame");

        let luma_stride = self.config.width as i32;
        let chroma_stride = picture.chroma_width() as i32;
        let image = x264::Image::new(
            x264::Colorspace::I420,
            self.config.width as i32,
            self.config.height as i32,
            &[
                x264::Plane {
                    data: picture.y(),
                    stride: luma_stride,
                },
                x264::Plane {
                    data: picture.u(),
                    stride: chroma_stride,
                },
                x264::Plane {
                    data: picture.v(),
                    stride: chroma_stride,
                },
            ],
        );

        let encoder = self.encoder.as_mut().ok_or(EncoderError::Flushed)?;
        let (data, out) = encoder
            .encode(pts, image)
            .map_err(|e| EncoderError::Encoding(format!("x264 encode failed: {:?}", e)))?;
        self.frame_count += 1;

        // No data while the lookahead is filling.
        if data.len() == 0 {
            return Ok(None);
        }

        Ok(Some(EncodedVideoPacket {
            data: Bytes::copy_from_slice(data.entirety()),
            pts: out.pts(),
            dts: out.dts(),
            is_keyframe: out.keyframe(),
        }))
    }

    fn flush(&mut self) -> EncoderResult<Vec<EncodedVideoPacket>> {
        debug!(frames = self.frame_count, "Flushing x264 encoder");

        let mut packets = Vec::new();
        let encoder = match self.encoder.take() {
            Some(e) => e,
            None => return Ok(packets),
        };
        let mut flush = encoder.flush();

        while let Some(result) = flush.next() {
            match result {
                Ok((data, out)) => {
                    if data.len() > 0 {
                        packets.push(EncodedVideoPacket {
                            data: Bytes::copy_from_slice(data.entirety()),
                            pts: out.pts(),
                            dts: out.dts(),
                            is_keyframe: out.keyframe(),
                        });
                    }
                }
                Err(e) => {
                    debug!("Flush iteration ended: {:?}", e);
                    break;
                }
            }
        }

        packets.sort_by_key(|p| p.pts);
        Ok(packets)
    }

    fn headers(&self) -> Bytes {
        self.headers.clone()
    }

    fn time_base(&self) -> TimeBase {
        TimeBase::per_frame(self.config.fps)
    }

    fn name(&self) -> &'static str {
        "x264"
    }
}

impl Drop for X264Encoder {
    fn drop(&mut self) {
        debug!("Closing x264 encoder");
    }
}

// SAFETY: x264::Encoder holds raw pointers but no thread affinity. The
// wrapper is owned by one session and only used under `&mut self`.
unsafe impl Send for X264Encoder {}
