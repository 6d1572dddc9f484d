//! Real backend: RGBA conversion, x264/fdk-aac encoding, FLV over RTMP(S).

use tracing::{debug, error, info, instrument, warn};

use publisher_convert::{AudioResampler, ConvertError, I420Picture, RgbaScaler};
use publisher_encoder::{
    create_audio_encoder, create_video_encoder, AudioEncoder, AudioEncoderConfig,
    EncodedAudioPacket, EncodedVideoPacket, EncoderResult, VideoEncoder, VideoEncoderConfig,
};
use publisher_transport::{
    open_sink, AudioStreamParams, EncodedPacket, Endpoint, FlvMuxer, MuxerOptions, PacketSink,
    StreamKind, TransportError, TransportOptions, TransportResult, VideoStreamParams,
};
use publisher_types::{AudioStatus, PublishError, PublishResult, StreamConfig, TimeBase};

use crate::backend::{Backend, PacketBuffer};
use crate::metrics::SendOutcome;

/// Opens the H.264 encoder.
pub type VideoEncoderFactory =
    Box<dyn Fn(VideoEncoderConfig) -> EncoderResult<Box<dyn VideoEncoder>> + Send>;

/// Opens the AAC encoder.
pub type AudioEncoderFactory =
    Box<dyn Fn(AudioEncoderConfig) -> EncoderResult<Box<dyn AudioEncoder>> + Send>;

/// Opens the byte destination for an endpoint.
pub type SinkFactory =
    Box<dyn Fn(&Endpoint, &TransportOptions) -> TransportResult<Box<dyn PacketSink>> + Send>;

/// Steps of `connect()`, undone in reverse on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectPhase {
    /// Scaler and conversion picture.
    Convert,
    VideoEncoder,
    /// Best effort; failure only disables audio.
    AudioEncoder,
    OpenSink,
    WriteHeader,
}

impl ConnectPhase {
    fn next(self) -> Option<Self> {
        match self {
            Self::Convert => Some(Self::VideoEncoder),
            Self::VideoEncoder => Some(Self::AudioEncoder),
            Self::AudioEncoder => Some(Self::OpenSink),
            Self::OpenSink => Some(Self::WriteHeader),
            Self::WriteHeader => None,
        }
    }

    fn previous(self) -> Option<Self> {
        match self {
            Self::Convert => None,
            Self::VideoEncoder => Some(Self::Convert),
            Self::AudioEncoder => Some(Self::VideoEncoder),
            Self::OpenSink => Some(Self::AudioEncoder),
            Self::WriteHeader => Some(Self::OpenSink),
        }
    }
}

struct AudioChain {
    encoder: Box<dyn AudioEncoder>,
    resampler: AudioResampler,
}

/// Resources acquired so far during `connect()`.
#[derive(Default)]
struct PartialSession {
    converter: Option<(RgbaScaler, I420Picture)>,
    video: Option<Box<dyn VideoEncoder>>,
    audio: Option<AudioChain>,
    audio_status: AudioStatus,
    muxer: Option<FlvMuxer>,
}

impl PartialSession {
    fn rollback(&mut self, from: ConnectPhase) {
        let mut phase = Some(from);
        while let Some(current) = phase {
            debug!(phase = ?current, "Rolling back connect phase");
            match current {
                ConnectPhase::WriteHeader => {}
                ConnectPhase::OpenSink => self.muxer = None,
                ConnectPhase::AudioEncoder => self.audio = None,
                ConnectPhase::VideoEncoder => self.video = None,
                ConnectPhase::Convert => self.converter = None,
            }
            phase = current.previous();
        }
    }

    fn complete(self) -> PublishResult<(NativeSession, AudioStatus)> {
        let incomplete = || PublishError::InitFailed("connect sequence incomplete".into());
        let (scaler, picture) = self.converter.ok_or_else(incomplete)?;
        let session = NativeSession {
            scaler,
            picture,
            video: self.video.ok_or_else(incomplete)?,
            audio: self.audio,
            muxer: self.muxer.ok_or_else(incomplete)?,
        };
        Ok((session, self.audio_status))
    }
}

/// One connected pipeline.
struct NativeSession {
    scaler: RgbaScaler,
    picture: I420Picture,
    video: Box<dyn VideoEncoder>,
    audio: Option<AudioChain>,
    muxer: FlvMuxer,
}

fn video_packet(packet: EncodedVideoPacket, time_base: TimeBase) -> EncodedPacket {
    EncodedPacket {
        stream: StreamKind::Video,
        data: packet.data,
        pts: packet.pts,
        dts: packet.dts,
        time_base,
        keyframe: packet.is_keyframe,
    }
}

fn audio_packet(packet: EncodedAudioPacket, time_base: TimeBase) -> EncodedPacket {
    EncodedPacket {
        stream: StreamKind::Audio,
        data: packet.data,
        pts: packet.pts,
        dts: packet.pts,
        time_base,
        keyframe: false,
    }
}

impl NativeSession {
    fn send_video(
        &mut self,
        rgba: &[u8],
        pts_ms: i64,
        buffer: &mut PacketBuffer,
    ) -> PublishResult<SendOutcome> {
        self.scaler
            .convert(rgba, &mut self.picture)
            .map_err(|e| match e {
                ConvertError::SizeMismatch { expected, actual } => {
                    PublishError::FrameSize { expected, actual }
                }
                other => PublishError::EncodeFailed(other.to_string()),
            })?;

        let time_base = self.video.time_base();
        let pts = TimeBase::MILLIS.rescale(pts_ms, time_base);
        let encoded = self
            .video
            .encode(&self.picture, pts)
            .map_err(|e| PublishError::EncodeFailed(e.to_string()))?;
        if let Some(packet) = encoded {
            buffer.push(video_packet(packet, time_base));
        }

        self.write_buffered(buffer)
    }

    fn send_audio(
        &mut self,
        samples: &[f32],
        pts_ms: i64,
        buffer: &mut PacketBuffer,
    ) -> PublishResult<SendOutcome> {
        let Some(audio) = self.audio.as_mut() else {
            return Ok(SendOutcome::default());
        };

        let frames = audio
            .resampler
            .push(samples, pts_ms)
            .map_err(|e| PublishError::EncodeFailed(e.to_string()))?;
        let time_base = audio.encoder.time_base();
        for frame in &frames {
            match audio.encoder.encode(frame) {
                Ok(Some(packet)) => buffer.push(audio_packet(packet, time_base)),
                Ok(None) => {}
                Err(e) => {
                    buffer.clear();
                    return Err(PublishError::EncodeFailed(e.to_string()));
                }
            }
        }

        self.write_buffered(buffer)
    }

    /// Hand every buffered packet to the muxer. The buffer is always left
    /// empty; the first write error is returned.
    fn write_buffered(&mut self, buffer: &mut PacketBuffer) -> PublishResult<SendOutcome> {
        let mut outcome = SendOutcome::default();
        let mut failure = None;

        for packet in buffer.drain() {
            if failure.is_some() {
                continue;
            }
            let stream = packet.stream;
            match self.muxer.write_packet(packet) {
                Ok(bytes) => {
                    outcome.bytes += bytes as u64;
                    match stream {
                        StreamKind::Video => outcome.video_packets += 1,
                        StreamKind::Audio => outcome.audio_packets += 1,
                    }
                }
                Err(e) => failure = Some(PublishError::SendFailed(e.to_string())),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Drain encoders into the buffer: video in PTS order, then padded and
    /// drained audio.
    fn flush_encoders(&mut self, buffer: &mut PacketBuffer) {
        let video_tb = self.video.time_base();
        match self.video.flush() {
            Ok(packets) => {
                debug!(packets = packets.len(), "Flushed video encoder");
                for packet in packets {
                    buffer.push(video_packet(packet, video_tb));
                }
            }
            Err(e) => warn!(error = %e, "Video encoder flush failed"),
        }

        if let Some(audio) = self.audio.as_mut() {
            let audio_tb = audio.encoder.time_base();
            if let Some(frame) = audio.resampler.flush() {
                match audio.encoder.encode(&frame) {
                    Ok(Some(packet)) => buffer.push(audio_packet(packet, audio_tb)),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Encoding final audio frame failed"),
                }
            }
            match audio.encoder.flush() {
                Ok(packets) => {
                    for packet in packets {
                        buffer.push(audio_packet(packet, audio_tb));
                    }
                }
                Err(e) => warn!(error = %e, "Audio encoder flush failed"),
            }
        }
    }
}

/// Backend running the real conversion, codecs and transport.
pub struct NativeBackend {
    video_factory: VideoEncoderFactory,
    audio_factory: AudioEncoderFactory,
    sink_factory: SinkFactory,
    transport: TransportOptions,
    muxer: MuxerOptions,
    session: Option<NativeSession>,
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend {
    /// Backend using x264, fdk-aac and the network/file sinks.
    pub fn new() -> Self {
        Self::with_factories(
            Box::new(create_video_encoder),
            Box::new(create_audio_encoder),
            Box::new(open_sink),
        )
    }

    /// Backend with custom encoder and sink constructors.
    pub fn with_factories(
        video_factory: VideoEncoderFactory,
        audio_factory: AudioEncoderFactory,
        sink_factory: SinkFactory,
    ) -> Self {
        Self {
            video_factory,
            audio_factory,
            sink_factory,
            transport: TransportOptions::default(),
            muxer: MuxerOptions::default(),
            session: None,
        }
    }

    /// Override transport and muxer settings.
    pub fn with_options(mut self, transport: TransportOptions, muxer: MuxerOptions) -> Self {
        self.transport = transport;
        self.muxer = muxer;
        self
    }

    fn session(&mut self) -> PublishResult<&mut NativeSession> {
        self.session
            .as_mut()
            .ok_or_else(|| PublishError::SendFailed("backend is not connected".into()))
    }

    fn run_phase(
        &self,
        phase: ConnectPhase,
        config: &StreamConfig,
        endpoint: &Endpoint,
        partial: &mut PartialSession,
    ) -> PublishResult<()> {
        match phase {
            ConnectPhase::Convert => {
                let scaler = RgbaScaler::new(config.width, config.height, config.width, config.height)
                    .map_err(convert_init_error)?;
                let picture =
                    I420Picture::try_new(config.width, config.height).map_err(convert_init_error)?;
                partial.converter = Some((scaler, picture));
            }
            ConnectPhase::VideoEncoder => {
                let encoder = (self.video_factory)(VideoEncoderConfig::from(config))
                    .map_err(|e| PublishError::InitFailed(format!("video encoder: {}", e)))?;
                info!(encoder = encoder.name(), "Video encoder opened");
                partial.video = Some(encoder);
            }
            ConnectPhase::AudioEncoder => match self.open_audio(config) {
                Ok(chain) => {
                    info!(
                        encoder = chain.encoder.name(),
                        sample_rate = chain.encoder.sample_rate(),
                        "Audio encoder opened"
                    );
                    partial.audio = Some(chain);
                    partial.audio_status = AudioStatus::Active;
                }
                Err(reason) => {
                    warn!(reason = %reason, "Audio unavailable, publishing video only");
                    partial.audio_status = AudioStatus::Unavailable { reason };
                }
            },
            ConnectPhase::OpenSink => {
                let sink = (self.sink_factory)(endpoint, &self.transport).map_err(|e| match e {
                    TransportError::InvalidUrl(detail) => PublishError::InvalidParams(detail),
                    other => PublishError::ConnectFailed(other.to_string()),
                })?;
                partial.muxer = Some(FlvMuxer::new(sink, self.muxer.clone()));
            }
            ConnectPhase::WriteHeader => self.write_header(config, partial)?,
        }
        Ok(())
    }

    fn open_audio(&self, config: &StreamConfig) -> Result<AudioChain, String> {
        let encoder_config = AudioEncoderConfig::for_stream(config).map_err(|e| e.to_string())?;
        let encoder = (self.audio_factory)(encoder_config).map_err(|e| e.to_string())?;
        let resampler = AudioResampler::new(
            encoder.layout(),
            config.audio_sample_rate,
            encoder.sample_rate(),
            encoder.frame_size(),
        )
        .map_err(|e| e.to_string())?;
        Ok(AudioChain { encoder, resampler })
    }

    fn write_header(&self, config: &StreamConfig, partial: &mut PartialSession) -> PublishResult<()> {
        let incomplete = || PublishError::InitFailed("connect phases out of order".into());
        let headers = partial.video.as_ref().ok_or_else(incomplete)?.headers();
        let muxer = partial.muxer.as_mut().ok_or_else(incomplete)?;

        muxer
            .add_video_stream(VideoStreamParams {
                width: config.width,
                height: config.height,
                fps: config.fps,
                bitrate_kbps: config.bitrate_kbps,
                headers,
            })
            .map_err(|e| PublishError::InitFailed(e.to_string()))?;

        if let Some(audio) = &partial.audio {
            let params = AudioStreamParams {
                sample_rate: audio.encoder.sample_rate(),
                channels: audio.encoder.layout().channels() as u32,
                bitrate_kbps: config.audio_bitrate_kbps,
            };
            if let Err(e) = muxer.add_audio_stream(params) {
                warn!(error = %e, "Audio stream rejected by muxer, publishing video only");
                partial.audio = None;
                partial.audio_status = AudioStatus::Unavailable {
                    reason: e.to_string(),
                };
            }
        }

        muxer
            .write_header()
            .map_err(|e| PublishError::ConnectFailed(format!("header write failed: {}", e)))
    }
}

fn convert_init_error(e: ConvertError) -> PublishError {
    match e {
        ConvertError::Alloc(bytes) => {
            PublishError::AllocFailed(format!("conversion picture of {} bytes", bytes))
        }
        other => PublishError::InitFailed(other.to_string()),
    }
}

impl Backend for NativeBackend {
    #[instrument(name = "native_connect", skip_all, fields(endpoint = %endpoint))]
    fn connect(
        &mut self,
        config: &StreamConfig,
        endpoint: &Endpoint,
        _buffer: &mut PacketBuffer,
    ) -> PublishResult<AudioStatus> {
        if self.session.is_some() {
            return Err(PublishError::InitFailed("backend already connected".into()));
        }

        let mut partial = PartialSession::default();
        let mut phase = ConnectPhase::Convert;
        loop {
            debug!(phase = ?phase, "Connect phase");
            if let Err(e) = self.run_phase(phase, config, endpoint, &mut partial) {
                error!(phase = ?phase, error = %e, "Connect failed");
                partial.rollback(phase);
                return Err(e);
            }
            match phase.next() {
                Some(next) => phase = next,
                None => break,
            }
        }

        let (session, audio_status) = partial.complete()?;
        self.session = Some(session);
        info!(audio = ?audio_status, "Native backend connected");
        Ok(audio_status)
    }

    fn send_video(
        &mut self,
        rgba: &[u8],
        pts_ms: i64,
        buffer: &mut PacketBuffer,
    ) -> PublishResult<SendOutcome> {
        self.session()?.send_video(rgba, pts_ms, buffer)
    }

    fn send_audio(
        &mut self,
        samples: &[f32],
        pts_ms: i64,
        buffer: &mut PacketBuffer,
    ) -> PublishResult<SendOutcome> {
        self.session()?.send_audio(samples, pts_ms, buffer)
    }

    #[instrument(name = "native_disconnect", skip_all)]
    fn disconnect(&mut self, buffer: &mut PacketBuffer) -> SendOutcome {
        let Some(mut session) = self.session.take() else {
            return SendOutcome::default();
        };

        session.flush_encoders(buffer);
        let outcome = match session.write_buffered(buffer) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Writing flushed packets failed");
                SendOutcome::default()
            }
        };
        if let Err(e) = session.muxer.write_trailer() {
            warn!(error = %e, "Writing trailer failed");
        }

        info!(
            flushed_bytes = outcome.bytes,
            tags = session.muxer.tags_written(),
            "Native backend disconnected"
        );
        outcome
    }

    fn has_audio(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.audio.is_some())
    }

    fn is_stub(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "native"
    }
}
