//! FLV muxer: stream registration, sequence headers, timestamp rescaling
//! and cross-stream interleaving.

use bytes::Bytes;
use publisher_types::TimeBase;
use tracing::{debug, info, instrument, trace};

use crate::error::TransportError;
use crate::flv::{
    audio_specific_config, build_flv_audio_tag, build_flv_video_tag, AudioMetadata, FlvMetadata,
    FlvTag, FlvTagKind,
};
use crate::interleave::Interleaver;
use crate::nal::{annex_b_to_avcc, build_avc_decoder_config, extract_sps_pps};
use crate::sink::PacketSink;
use crate::TransportResult;

/// Elementary stream kinds carried by the muxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    fn name(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

/// H.264 stream parameters.
#[derive(Debug, Clone)]
pub struct VideoStreamParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// Encoder SPS/PPS in Annex B form.
    pub headers: Bytes,
}

/// AAC stream parameters.
#[derive(Debug, Clone)]
pub struct AudioStreamParams {
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate_kbps: u32,
}

/// One encoded packet handed to the muxer.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub stream: StreamKind,
    /// Annex B access unit for video, raw AAC frame for audio.
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    /// Unit of `pts` and `dts`.
    pub time_base: TimeBase,
    pub keyframe: bool,
}

/// Muxer settings.
#[derive(Debug, Clone)]
pub struct MuxerOptions {
    /// Largest DTS span buffered while waiting for a lagging stream.
    pub max_interleave_delta_ms: u32,
    /// Written as the `encoder` metadata property.
    pub encoder_name: String,
}

impl Default for MuxerOptions {
    fn default() -> Self {
        Self {
            max_interleave_delta_ms: 1000,
            encoder_name: concat!("rtmp-bridge/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

struct VideoTrack {
    params: VideoStreamParams,
    decoder_config: Bytes,
    last_dts: Option<i64>,
}

struct AudioTrack {
    params: AudioStreamParams,
    specific_config: [u8; 2],
    last_dts: Option<i64>,
}

/// Writes one FLV stream to a [`PacketSink`].
///
/// Streams are added first, then the header is written, then packets in
/// per-stream DTS order, then the trailer.
pub struct FlvMuxer {
    sink: Box<dyn PacketSink>,
    options: MuxerOptions,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    interleaver: Option<Interleaver>,
    finished: bool,
    tags_written: u64,
}

impl FlvMuxer {
    /// Create a muxer writing to `sink`.
    pub fn new(sink: Box<dyn PacketSink>, options: MuxerOptions) -> Self {
        Self {
            sink,
            options,
            video: None,
            audio: None,
            interleaver: None,
            finished: false,
            tags_written: 0,
        }
    }

    /// Register the H.264 stream. Its SPS and PPS become the video
    /// sequence header.
    pub fn add_video_stream(&mut self, params: VideoStreamParams) -> TransportResult<()> {
        self.ensure_not_started("add a video stream")?;
        if self.video.is_some() {
            return Err(TransportError::Muxer("video stream already added".into()));
        }

        let (sps, pps) = extract_sps_pps(&params.headers).ok_or_else(|| {
            TransportError::Muxer("encoder headers lack SPS or PPS".to_string())
        })?;
        let decoder_config = build_avc_decoder_config(&sps, &pps)?;

        debug!(
            width = params.width,
            height = params.height,
            fps = params.fps,
            "Added video stream"
        );
        self.video = Some(VideoTrack {
            params,
            decoder_config,
            last_dts: None,
        });
        Ok(())
    }

    /// Register the AAC stream.
    pub fn add_audio_stream(&mut self, params: AudioStreamParams) -> TransportResult<()> {
        self.ensure_not_started("add an audio stream")?;
        if self.audio.is_some() {
            return Err(TransportError::Muxer("audio stream already added".into()));
        }

        let channels = u8::try_from(params.channels).unwrap_or(0);
        let specific_config =
            audio_specific_config(params.sample_rate, channels).ok_or_else(|| {
                TransportError::Muxer(format!(
                    "unsupported AAC configuration: {} Hz, {} channels",
                    params.sample_rate, params.channels
                ))
            })?;

        debug!(
            sample_rate = params.sample_rate,
            channels = params.channels,
            "Added audio stream"
        );
        self.audio = Some(AudioTrack {
            params,
            specific_config,
            last_dts: None,
        });
        Ok(())
    }

    /// Whether an audio stream is registered.
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Send `onMetaData` and the codec sequence headers.
    #[instrument(name = "flv_write_header", skip_all)]
    pub fn write_header(&mut self) -> TransportResult<()> {
        self.ensure_not_started("write the header")?;
        let streams = self.video.is_some() as usize + self.audio.is_some() as usize;
        if streams == 0 {
            return Err(TransportError::Muxer("no streams added".into()));
        }

        let metadata = self.metadata();
        self.sink.write_metadata(&metadata)?;

        if let Some(video) = &self.video {
            let tag = FlvTag {
                kind: FlvTagKind::Video,
                timestamp_ms: 0,
                body: build_flv_video_tag(&video.decoder_config, true, true, 0),
                keyframe: true,
            };
            self.sink.write_tag(&tag)?;
            self.tags_written += 1;
        }
        if let Some(audio) = &self.audio {
            let tag = FlvTag {
                kind: FlvTagKind::Audio,
                timestamp_ms: 0,
                body: build_flv_audio_tag(&audio.specific_config, true),
                keyframe: true,
            };
            self.sink.write_tag(&tag)?;
            self.tags_written += 1;
        }

        self.interleaver = Some(Interleaver::new(
            streams,
            self.options.max_interleave_delta_ms,
        ));
        info!(
            sink = self.sink.name(),
            has_audio = self.audio.is_some(),
            "FLV header written"
        );
        Ok(())
    }

    fn metadata(&self) -> FlvMetadata {
        let mut metadata = FlvMetadata {
            encoder: self.options.encoder_name.clone(),
            ..FlvMetadata::default()
        };
        if let Some(video) = &self.video {
            metadata.width = video.params.width;
            metadata.height = video.params.height;
            metadata.frame_rate = f64::from(video.params.fps);
            metadata.video_bitrate_kbps = video.params.bitrate_kbps;
        }
        metadata.audio = self.audio.as_ref().map(|audio| AudioMetadata {
            sample_rate: audio.params.sample_rate,
            channels: audio.params.channels,
            bitrate_kbps: audio.params.bitrate_kbps,
        });
        metadata
    }

    fn ensure_not_started(&self, operation: &str) -> TransportResult<()> {
        if self.interleaver.is_some() || self.finished {
            return Err(TransportError::Muxer(format!(
                "cannot {} after the header was written",
                operation
            )));
        }
        Ok(())
    }

    fn stream_index(&self, kind: StreamKind) -> usize {
        match kind {
            StreamKind::Video => 0,
            StreamKind::Audio => self.video.is_some() as usize,
        }
    }

    /// Queue one packet. Returns the payload size accepted.
    ///
    /// Timestamps are rescaled to milliseconds. A DTS lower than the
    /// previous one on the same stream is rejected; equal DTS is allowed.
    pub fn write_packet(&mut self, packet: EncodedPacket) -> TransportResult<usize> {
        if self.finished || self.interleaver.is_none() {
            return Err(TransportError::Muxer(
                "packet written outside header/trailer".into(),
            ));
        }

        let dts = packet.time_base.rescale(packet.dts, TimeBase::MILLIS);
        let pts = packet.time_base.rescale(packet.pts, TimeBase::MILLIS);
        if dts < 0 || dts > i64::from(u32::MAX) {
            return Err(TransportError::Muxer(format!(
                "{} DTS {} ms out of range",
                packet.stream.name(),
                dts
            )));
        }

        let last_dts = match packet.stream {
            StreamKind::Video => self.video.as_mut().map(|t| &mut t.last_dts),
            StreamKind::Audio => self.audio.as_mut().map(|t| &mut t.last_dts),
        }
        .ok_or_else(|| {
            TransportError::Muxer(format!("no {} stream added", packet.stream.name()))
        })?;
        if let Some(last) = *last_dts {
            if dts < last {
                return Err(TransportError::NonMonotonicDts {
                    stream: packet.stream.name(),
                    dts,
                    last,
                });
            }
        }
        *last_dts = Some(dts);

        let (kind, body) = match packet.stream {
            StreamKind::Video => {
                let avcc = annex_b_to_avcc(&packet.data);
                let composition = i32::try_from(pts - dts).unwrap_or(0);
                (
                    FlvTagKind::Video,
                    build_flv_video_tag(&avcc, packet.keyframe, false, composition),
                )
            }
            StreamKind::Audio => (FlvTagKind::Audio, build_flv_audio_tag(&packet.data, false)),
        };

        trace!(
            stream = packet.stream.name(),
            dts,
            pts,
            size = body.len(),
            "Queued FLV tag"
        );

        let index = self.stream_index(packet.stream);
        let tag = FlvTag {
            kind,
            timestamp_ms: dts as u32,
            body,
            keyframe: packet.keyframe,
        };
        if let Some(interleaver) = self.interleaver.as_mut() {
            interleaver.push(index, tag);
        }
        self.write_ready()?;

        Ok(packet.data.len())
    }

    fn write_ready(&mut self) -> TransportResult<()> {
        while let Some(tag) = self.interleaver.as_mut().and_then(Interleaver::pop_ready) {
            self.sink.write_tag(&tag)?;
            self.tags_written += 1;
        }
        Ok(())
    }

    /// Drain buffered tags and close the sink.
    #[instrument(name = "flv_write_trailer", skip_all)]
    pub fn write_trailer(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if let Some(mut interleaver) = self.interleaver.take() {
            for tag in interleaver.drain() {
                self.sink.write_tag(&tag)?;
                self.tags_written += 1;
            }
        }
        self.sink.finish()?;

        info!(
            tags = self.tags_written,
            bytes = self.sink.bytes_written(),
            "FLV stream finished"
        );
        Ok(())
    }

    /// Tags written to the sink so far.
    pub fn tags_written(&self) -> u64 {
        self.tags_written
    }

    /// Bytes the sink has put on the wire.
    pub fn bytes_written(&self) -> u64 {
        self.sink.bytes_written()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        metadata: Vec<FlvMetadata>,
        tags: Vec<FlvTag>,
        finished: bool,
    }

    struct RecordingSink(Arc<Mutex<Recorded>>);

    impl PacketSink for RecordingSink {
        fn write_metadata(&mut self, metadata: &FlvMetadata) -> TransportResult<()> {
            self.0.lock().unwrap().metadata.push(metadata.clone());
            Ok(())
        }

        fn write_tag(&mut self, tag: &FlvTag) -> TransportResult<()> {
            self.0.lock().unwrap().tags.push(tag.clone());
            Ok(())
        }

        fn finish(&mut self) -> TransportResult<()> {
            self.0.lock().unwrap().finished = true;
            Ok(())
        }

        fn bytes_written(&self) -> u64 {
            self.0.lock().unwrap().tags.iter().map(|t| t.body.len() as u64).sum()
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    const HEADERS: &[u8] = &[
        0, 0, 0, 1, 0x67, 0x4D, 0x40, 0x1F, // SPS
        0, 0, 0, 1, 0x68, 0xEE, 0x3C, 0x80, // PPS
    ];

    fn muxer(with_audio: bool) -> (FlvMuxer, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let mut muxer = FlvMuxer::new(
            Box::new(RecordingSink(Arc::clone(&recorded))),
            MuxerOptions::default(),
        );
        muxer
            .add_video_stream(VideoStreamParams {
                width: 64,
                height: 64,
                fps: 30,
                bitrate_kbps: 500,
                headers: Bytes::from_static(HEADERS),
            })
            .unwrap();
        if with_audio {
            muxer
                .add_audio_stream(AudioStreamParams {
                    sample_rate: 44100,
                    channels: 2,
                    bitrate_kbps: 128,
                })
                .unwrap();
        }
        muxer.write_header().unwrap();
        (muxer, recorded)
    }

    fn video(frame: i64, keyframe: bool) -> EncodedPacket {
        EncodedPacket {
            stream: StreamKind::Video,
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]),
            pts: frame,
            dts: frame,
            time_base: TimeBase::per_frame(30),
            keyframe,
        }
    }

    fn audio(sample: i64) -> EncodedPacket {
        EncodedPacket {
            stream: StreamKind::Audio,
            data: Bytes::from_static(&[0x21, 0x00]),
            pts: sample,
            dts: sample,
            time_base: TimeBase::new(1, 44100),
            keyframe: false,
        }
    }

    #[test]
    fn test_header_writes_sequence_headers() {
        let (_muxer, recorded) = muxer(true);
        let rec = recorded.lock().unwrap();
        assert_eq!(rec.metadata.len(), 1);
        assert!(rec.metadata[0].audio.is_some());
        assert_eq!(rec.tags.len(), 2);
        assert_eq!(&rec.tags[0].body[..2], &[0x17, 0x00]);
        assert_eq!(rec.tags[1].body.as_ref(), &[0xAF, 0x00, 0x12, 0x10]);
    }

    #[test]
    fn test_video_only_passes_through() {
        let (mut muxer, recorded) = muxer(false);
        assert_eq!(muxer.write_packet(video(0, true)).unwrap(), 6);
        muxer.write_packet(video(1, false)).unwrap();

        let rec = recorded.lock().unwrap();
        assert_eq!(rec.tags.len(), 3);
        assert_eq!(rec.tags[1].timestamp_ms, 0);
        assert_eq!(rec.tags[2].timestamp_ms, 33);
        // AVCC payload after the 5-byte video tag header.
        assert_eq!(&rec.tags[1].body[5..], &[0, 0, 0, 2, 0x65, 0x88]);
        assert_eq!(rec.tags[2].body[0], 0x27);
    }

    #[test]
    fn test_interleaves_by_dts() {
        let (mut muxer, recorded) = muxer(true);
        muxer.write_packet(video(0, true)).unwrap();
        muxer.write_packet(video(1, false)).unwrap();
        muxer.write_packet(video(2, false)).unwrap();
        muxer.write_packet(audio(0)).unwrap();
        muxer.write_packet(audio(1024)).unwrap();
        muxer.write_packet(audio(2048)).unwrap();
        muxer.write_packet(audio(3072)).unwrap();
        muxer.write_trailer().unwrap();

        let rec = recorded.lock().unwrap();
        assert!(rec.finished);
        let media: Vec<u32> = rec.tags[2..].iter().map(|t| t.timestamp_ms).collect();
        assert_eq!(media.len(), 7);
        assert!(media.windows(2).all(|w| w[0] <= w[1]), "{:?}", media);
    }

    #[test]
    fn test_decreasing_dts_rejected() {
        let (mut muxer, _) = muxer(false);
        muxer.write_packet(video(5, true)).unwrap();
        muxer.write_packet(video(5, false)).unwrap();
        let err = muxer.write_packet(video(4, false)).unwrap_err();
        assert!(matches!(err, TransportError::NonMonotonicDts { .. }));
    }

    #[test]
    fn test_audio_without_stream_rejected() {
        let (mut muxer, _) = muxer(false);
        assert!(muxer.write_packet(audio(0)).is_err());
    }

    #[test]
    fn test_streams_fixed_after_header() {
        let (mut muxer, _) = muxer(false);
        let err = muxer.add_audio_stream(AudioStreamParams {
            sample_rate: 44100,
            channels: 2,
            bitrate_kbps: 128,
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_packets_before_header_rejected() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let mut muxer = FlvMuxer::new(Box::new(RecordingSink(recorded)), MuxerOptions::default());
        assert!(muxer.write_packet(video(0, true)).is_err());
        assert!(muxer.write_header().is_err());
    }

    #[test]
    fn test_missing_parameter_sets_rejected() {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let mut muxer = FlvMuxer::new(Box::new(RecordingSink(recorded)), MuxerOptions::default());
        let err = muxer.add_video_stream(VideoStreamParams {
            width: 64,
            height: 64,
            fps: 30,
            bitrate_kbps: 500,
            headers: Bytes::from_static(&[0, 0, 1, 0x67, 0x4D, 0x40, 0x1F]),
        });
        assert!(err.is_err());
    }
}
