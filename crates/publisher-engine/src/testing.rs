//! Fake encoders and an in-memory sink for exercising the native backend
//! without codecs or a server.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use publisher_convert::{ChannelLayout, I420Picture, PlanarAudioFrame};
use publisher_encoder::{
    AudioEncoder, AudioEncoderConfig, EncodedAudioPacket, EncodedVideoPacket, EncoderError,
    EncoderResult, VideoEncoder, VideoEncoderConfig,
};
use publisher_transport::{
    Endpoint, FlvMetadata, FlvTag, PacketSink, TransportError, TransportOptions, TransportResult,
};
use publisher_types::TimeBase;

use crate::native::{NativeBackend, SinkFactory};

/// Failure injection and buffering for the fakes.
#[derive(Debug, Clone, Copy)]
pub struct FakeOptions {
    pub video_fails: bool,
    pub audio_fails: bool,
    pub sink_fails: bool,
    /// Zero-based encode call that returns an error.
    pub fail_on_frame: Option<u64>,
    /// Frames the video encoder holds back before emitting.
    pub delay_frames: usize,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            video_fails: false,
            audio_fails: false,
            sink_fails: false,
            fail_on_frame: None,
            delay_frames: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub metadata: Vec<FlvMetadata>,
    pub tags: Vec<FlvTag>,
    pub finished: bool,
}

pub type Recording = Arc<Mutex<Recorded>>;

pub struct MemorySink {
    recording: Recording,
    bytes: u64,
}

impl PacketSink for MemorySink {
    fn write_metadata(&mut self, metadata: &FlvMetadata) -> TransportResult<()> {
        self.recording.lock().metadata.push(metadata.clone());
        Ok(())
    }

    fn write_tag(&mut self, tag: &FlvTag) -> TransportResult<()> {
        self.bytes += tag.body.len() as u64;
        self.recording.lock().tags.push(tag.clone());
        Ok(())
    }

    fn finish(&mut self) -> TransportResult<()> {
        self.recording.lock().finished = true;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

const FAKE_HEADERS: &[u8] = &[
    0, 0, 0, 1, 0x67, 0x4D, 0x40, 0x1F, // SPS
    0, 0, 0, 1, 0x68, 0xEE, 0x3C, 0x80, // PPS
];

pub struct FakeVideoEncoder {
    config: VideoEncoderConfig,
    options: FakeOptions,
    calls: u64,
    pending: VecDeque<i64>,
    emitted: u64,
}

impl FakeVideoEncoder {
    fn packet(&mut self, pts: i64) -> EncodedVideoPacket {
        let keyframe = self.emitted % u64::from(self.config.gop_size().max(1)) == 0;
        self.emitted += 1;
        let nal = if keyframe { 0x65 } else { 0x41 };
        EncodedVideoPacket {
            data: Bytes::from(vec![0, 0, 0, 1, nal, 0x88, 0x84]),
            pts,
            dts: pts,
            is_keyframe: keyframe,
        }
    }
}

impl VideoEncoder for FakeVideoEncoder {
    fn encode(
        &mut self,
        picture: &I420Picture,
        pts: i64,
    ) -> EncoderResult<Option<EncodedVideoPacket>> {
        let call = self.calls;
        self.calls += 1;
        if self.options.fail_on_frame == Some(call) {
            return Err(EncoderError::Encoding("injected failure".into()));
        }
        if picture.width() != self.config.width {
            return Err(EncoderError::InvalidInput("wrong picture".into()));
        }

        self.pending.push_back(pts);
        if self.pending.len() > self.options.delay_frames {
            let pts = self.pending.pop_front().unwrap_or_default();
            return Ok(Some(self.packet(pts)));
        }
        Ok(None)
    }

    fn flush(&mut self) -> EncoderResult<Vec<EncodedVideoPacket>> {
        let pending: Vec<i64> = self.pending.drain(..).collect();
        Ok(pending.into_iter().map(|pts| self.packet(pts)).collect())
    }

    fn headers(&self) -> Bytes {
        Bytes::from_static(FAKE_HEADERS)
    }

    fn time_base(&self) -> TimeBase {
        TimeBase::per_frame(self.config.fps)
    }

    fn name(&self) -> &'static str {
        "fake-h264"
    }
}

pub struct FakeAudioEncoder {
    config: AudioEncoderConfig,
}

impl AudioEncoder for FakeAudioEncoder {
    fn encode(&mut self, frame: &PlanarAudioFrame) -> EncoderResult<Option<EncodedAudioPacket>> {
        Ok(Some(EncodedAudioPacket {
            data: Bytes::from_static(&[0x21, 0x10, 0x04]),
            pts: frame.pts,
        }))
    }

    fn flush(&mut self) -> EncoderResult<Vec<EncodedAudioPacket>> {
        Ok(Vec::new())
    }

    fn frame_size(&self) -> usize {
        publisher_encoder::AAC_FRAME_SIZE
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn layout(&self) -> ChannelLayout {
        self.config.layout
    }

    fn name(&self) -> &'static str {
        "fake-aac"
    }
}

/// Sink factory recording into `recording`.
pub fn recording_sink(options: FakeOptions, recording: Recording) -> SinkFactory {
    Box::new(move |_endpoint: &Endpoint, _options: &TransportOptions| {
        if options.sink_fails {
            return Err(TransportError::Connection("connection refused".into()));
        }
        Ok(Box::new(MemorySink {
            recording: Arc::clone(&recording),
            bytes: 0,
        }) as Box<dyn PacketSink>)
    })
}

/// Native backend with fake codecs writing to `sink`.
pub fn fake_codecs(options: FakeOptions, sink: SinkFactory) -> NativeBackend {
    NativeBackend::with_factories(
        Box::new(move |config: VideoEncoderConfig| {
            if options.video_fails {
                return Err(EncoderError::X264InitFailed("injected".into()));
            }
            Ok(Box::new(FakeVideoEncoder {
                config,
                options,
                calls: 0,
                pending: VecDeque::new(),
                emitted: 0,
            }) as Box<dyn VideoEncoder>)
        }),
        Box::new(move |config: AudioEncoderConfig| {
            if options.audio_fails {
                return Err(EncoderError::AacInitFailed("injected".into()));
            }
            Ok(Box::new(FakeAudioEncoder { config }) as Box<dyn AudioEncoder>)
        }),
        sink,
    )
}

/// Native backend wired to the fakes, plus the sink recording.
pub fn fake_backend(options: FakeOptions) -> (NativeBackend, Recording) {
    let recording = Recording::default();
    let sink = recording_sink(options, Arc::clone(&recording));
    (fake_codecs(options, sink), recording)
}
