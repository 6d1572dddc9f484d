//! The publishing session state machine.

use tracing::{debug, info, instrument, warn};

use publisher_transport::Endpoint;
use publisher_types::{
    AudioStatus, PublishError, PublishResult, StatisticsSnapshot, StreamConfig, StreamState,
};

use crate::backend::{selected_backend, Backend, BackendKind, PacketBuffer};
use crate::metrics::StatisticsCollector;

/// Creates the backend for each `init()`.
pub type BackendFactory = Box<dyn Fn() -> Box<dyn Backend> + Send>;

/// State owned between `init()` and `cleanup()`.
struct Session {
    config: StreamConfig,
    buffer: PacketBuffer,
    backend: Box<dyn Backend>,
    audio: AudioStatus,
}

/// One publishing session: configuration, encode pipeline, connection and
/// statistics.
///
/// ```text
/// Idle --init--> Initialized --connect--> Connected --start_streaming--> Streaming
///                     ^                       |  ^                           |
///                     +------disconnect-------+  +-------stop_streaming------+
/// ```
///
/// Every method takes `&mut self`, so calls on one publisher are serialized
/// by ownership. Pre-flight and wrong-state errors leave the publisher
/// untouched.
pub struct Publisher {
    state: StreamState,
    session: Option<Session>,
    stats: StatisticsCollector,
    factory: BackendFactory,
    stub: bool,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    /// Publisher on the process-wide selected backend.
    pub fn new() -> Self {
        Self::with_backend(selected_backend())
    }

    /// Publisher on a specific backend kind.
    pub fn with_backend(kind: BackendKind) -> Self {
        Self::with_backend_factory(kind == BackendKind::Stub, Box::new(move || kind.create()))
    }

    /// Publisher on a custom backend.
    pub fn with_backend_factory(is_stub: bool, factory: BackendFactory) -> Self {
        Self {
            state: StreamState::Idle,
            session: None,
            stats: StatisticsCollector::new(),
            factory,
            stub: is_stub,
        }
    }

    /// Validate `config`, tear down any previous session, reset statistics
    /// and allocate the packet buffer.
    #[instrument(name = "publisher_init", skip_all)]
    pub fn init(&mut self, config: StreamConfig) -> PublishResult<()> {
        config.validate()?;

        if self.state != StreamState::Idle {
            info!(state = %self.state, "Reinitializing, tearing down previous session");
            self.cleanup();
        }
        self.stats.reset();

        let buffer = match PacketBuffer::try_new() {
            Ok(buffer) => buffer,
            Err(e) => {
                self.transition_to(StreamState::Error);
                return Err(e);
            }
        };

        let backend = (self.factory)();
        info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            bitrate_kbps = config.bitrate_kbps,
            keyframe_interval_s = config.keyframe_interval_s,
            backend = backend.name(),
            "Publisher initialized"
        );

        self.stub = backend.is_stub();
        self.session = Some(Session {
            config,
            buffer,
            backend,
            audio: AudioStatus::NotConfigured,
        });
        self.transition_to(StreamState::Initialized);
        Ok(())
    }

    /// Open encoders and the connection to `url`, and write the stream
    /// header. On failure everything is rolled back and the state stays
    /// `Initialized`.
    #[instrument(name = "publisher_connect", skip_all)]
    pub fn connect(&mut self, url: &str) -> PublishResult<()> {
        self.require(StreamState::Initialized, "connect")?;
        let endpoint =
            Endpoint::parse(url).map_err(|e| PublishError::InvalidParams(e.to_string()))?;
        let session = self.session_mut("connect")?;

        info!(endpoint = %endpoint, "Connecting");
        let audio = session
            .backend
            .connect(&session.config, &endpoint, &mut session.buffer)?;
        session.audio = audio;

        self.transition_to(StreamState::Connected);
        Ok(())
    }

    /// Begin accepting media.
    pub fn start_streaming(&mut self) -> PublishResult<()> {
        self.require(StreamState::Connected, "start streaming")?;
        self.stats.start();
        self.transition_to(StreamState::Streaming);
        Ok(())
    }

    /// Convert, encode and send one RGBA frame stamped `pts_ms`.
    ///
    /// A pipeline failure counts as a dropped frame; the session stays
    /// usable.
    pub fn send_video_frame(&mut self, rgba: &[u8], pts_ms: i64) -> PublishResult<()> {
        let state = self.state;
        let session = self.session_mut("send video")?;

        let expected = session.config.frame_size_bytes();
        if rgba.len() != expected {
            return Err(PublishError::FrameSize {
                expected,
                actual: rgba.len(),
            });
        }
        if pts_ms < 0 {
            return Err(PublishError::InvalidParams(format!(
                "negative video timestamp {} ms",
                pts_ms
            )));
        }
        if state != StreamState::Streaming {
            return Err(PublishError::WrongState {
                operation: "send video",
                actual: state,
            });
        }

        match session
            .backend
            .send_video(rgba, pts_ms, &mut session.buffer)
        {
            Ok(outcome) => {
                self.stats.record_output(&outcome);
                self.stats.record_frame();
                Ok(())
            }
            Err(e) => {
                self.stats.record_drop();
                warn!(pts_ms, error = %e, "Video frame dropped");
                Err(e)
            }
        }
    }

    /// Send `sample_count` samples per channel of interleaved PCM. A no-op
    /// when the session has no audio stream.
    pub fn send_audio(
        &mut self,
        samples: &[f32],
        sample_count: usize,
        pts_ms: i64,
    ) -> PublishResult<()> {
        self.require(StreamState::Streaming, "send audio")?;
        let session = self.session_mut("send audio")?;

        let expected = sample_count.saturating_mul(session.config.audio_channels as usize);
        if sample_count == 0 || samples.len() != expected {
            return Err(PublishError::AudioSize {
                expected,
                actual: samples.len(),
            });
        }
        if pts_ms < 0 {
            return Err(PublishError::InvalidParams(format!(
                "negative audio timestamp {} ms",
                pts_ms
            )));
        }

        let outcome = session
            .backend
            .send_audio(samples, pts_ms, &mut session.buffer)?;
        self.stats.record_output(&outcome);
        Ok(())
    }

    /// Pause media; the connection stays open.
    pub fn stop_streaming(&mut self) -> PublishResult<()> {
        self.require(StreamState::Streaming, "stop streaming")?;
        self.stats.stop();
        self.transition_to(StreamState::Connected);
        Ok(())
    }

    /// Flush encoders, finish the stream and close the connection.
    ///
    /// A no-op outside `Connected` and `Streaming`, so repeated calls are
    /// harmless.
    #[instrument(name = "publisher_disconnect", skip_all)]
    pub fn disconnect(&mut self) -> PublishResult<()> {
        if !self.state.has_pipeline() {
            debug!(state = %self.state, "Nothing to disconnect");
            return Ok(());
        }

        if let Some(session) = self.session.as_mut() {
            let flushed = session.backend.disconnect(&mut session.buffer);
            session.audio = AudioStatus::NotConfigured;
            self.stats.record_output(&flushed);
        }
        self.stats.stop();
        self.transition_to(StreamState::Initialized);
        Ok(())
    }

    /// Release everything and return to `Idle`. Safe from any state.
    #[instrument(name = "publisher_cleanup", skip_all)]
    pub fn cleanup(&mut self) {
        if self.state.has_pipeline() {
            // Disconnect never fails from a connected state.
            let _ = self.disconnect();
        }
        if self.session.take().is_some() {
            debug!("Session released");
        }
        if self.state != StreamState::Idle {
            self.transition_to(StreamState::Idle);
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Configuration of the current session.
    pub fn config(&self) -> Option<&StreamConfig> {
        self.session.as_ref().map(|s| &s.config)
    }

    /// Audio outcome of the last `connect()`.
    pub fn audio_status(&self) -> AudioStatus {
        self.session
            .as_ref()
            .map(|s| s.audio.clone())
            .unwrap_or_default()
    }

    /// Whether audio packets are being published.
    pub fn has_audio(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.backend.has_audio())
    }

    /// Whether calls go to the inert backend.
    pub fn is_stub(&self) -> bool {
        self.stub
    }

    /// Snapshot of the statistics counters.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    fn require(&self, expected: StreamState, operation: &'static str) -> PublishResult<()> {
        if self.state != expected {
            return Err(PublishError::WrongState {
                operation,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn session_mut(&mut self, operation: &'static str) -> PublishResult<&mut Session> {
        let state = self.state;
        self.session.as_mut().ok_or(PublishError::WrongState {
            operation,
            actual: state,
        })
    }

    fn transition_to(&mut self, next: StreamState) {
        let previous = std::mem::replace(&mut self.state, next);
        debug!(
            previous = %previous,
            current = %next,
            "State transition"
        );
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Version and backend description.
pub fn build_info(stub: bool) -> String {
    format!(
        "rtmp-bridge {} (backend: {}, codecs: {}, transport: rtmp/rtmps/file)",
        env!("CARGO_PKG_VERSION"),
        if stub { "stub" } else { "native" },
        if cfg!(feature = "native") {
            "x264+fdk-aac"
        } else {
            "none"
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_codecs, recording_sink, FakeOptions, Recording};
    use publisher_types::ErrorKind;
    use std::sync::Arc;

    const WIDTH: u32 = 16;
    const HEIGHT: u32 = 8;
    const URL: &str = "rtmps://ingest.example.com/app/key";

    fn config() -> StreamConfig {
        StreamConfig {
            width: WIDTH,
            height: HEIGHT,
            ..StreamConfig::default()
        }
    }

    fn frame() -> Vec<u8> {
        vec![200; (WIDTH * HEIGHT * 4) as usize]
    }

    fn native(options: FakeOptions) -> (Publisher, Recording) {
        let recording = Recording::default();
        let shared = Arc::clone(&recording);
        let publisher = Publisher::with_backend_factory(
            false,
            Box::new(move || {
                Box::new(fake_codecs(
                    options,
                    recording_sink(options, Arc::clone(&shared)),
                )) as Box<dyn Backend>
            }),
        );
        (publisher, recording)
    }

    fn streaming(publisher: &mut Publisher) {
        publisher.init(config()).unwrap();
        publisher.connect(URL).unwrap();
        publisher.start_streaming().unwrap();
    }

    #[test]
    fn test_init_reports_initialized() {
        let (mut publisher, _) = native(FakeOptions::default());
        assert_eq!(publisher.state(), StreamState::Idle);
        publisher.init(config()).unwrap();
        assert_eq!(publisher.state(), StreamState::Initialized);
        assert_eq!(publisher.config(), Some(&config()));
    }

    #[test]
    fn test_invalid_init_leaves_state_untouched() {
        let (mut publisher, _) = native(FakeOptions::default());
        streaming(&mut publisher);

        let bad = StreamConfig {
            fps: 0,
            ..config()
        };
        let err = publisher.init(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        assert_eq!(publisher.state(), StreamState::Streaming);
    }

    #[test]
    fn test_scenario_one_frame() {
        let (mut publisher, _) = native(FakeOptions::default());
        streaming(&mut publisher);
        publisher.send_video_frame(&frame(), 0).unwrap();

        let stats = publisher.statistics();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.dropped_frames, 0);
        assert!(publisher.has_audio());
        assert_eq!(publisher.audio_status(), AudioStatus::Active);
    }

    #[test]
    fn test_wrong_size_frame_is_invalid_params() {
        let (mut publisher, _) = native(FakeOptions::default());
        streaming(&mut publisher);

        let err = publisher.send_video_frame(&[0u8; 100], 0).unwrap_err();
        assert_eq!(err.code(), -6);
        assert!(matches!(
            err,
            PublishError::FrameSize {
                expected: 512,
                actual: 100
            }
        ));
        let stats = publisher.statistics();
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(stats.dropped_frames, 0);
    }

    #[test]
    fn test_wrong_size_checked_before_state() {
        let (mut publisher, _) = native(FakeOptions::default());
        publisher.init(config()).unwrap();
        let err = publisher.send_video_frame(&[0u8; 3], 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
    }

    #[test]
    fn test_send_outside_streaming_is_not_connected() {
        let (mut publisher, _) = native(FakeOptions::default());
        let err = publisher.send_video_frame(&frame(), 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);

        publisher.init(config()).unwrap();
        let err = publisher.send_video_frame(&frame(), 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);

        publisher.connect(URL).unwrap();
        let err = publisher.send_video_frame(&frame(), 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert_eq!(
            err.to_string(),
            "Cannot send video in state Connected"
        );

        let stats = publisher.statistics();
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(stats.dropped_frames, 0);
    }

    #[test]
    fn test_negative_pts_rejected() {
        let (mut publisher, _) = native(FakeOptions::default());
        streaming(&mut publisher);
        let err = publisher.send_video_frame(&frame(), -1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
    }

    #[test]
    fn test_frames_sent_counts_calls_not_packets() {
        let (mut publisher, _) = native(FakeOptions {
            delay_frames: 3,
            ..FakeOptions::default()
        });
        streaming(&mut publisher);
        for i in 0..10 {
            publisher.send_video_frame(&frame(), i * 33).unwrap();
        }
        let stats = publisher.statistics();
        assert_eq!(stats.frames_sent, 10);
        assert_eq!(stats.video_packets, 7);
    }

    #[test]
    fn test_encode_failure_counts_drop_and_continues() {
        let (mut publisher, _) = native(FakeOptions {
            fail_on_frame: Some(2),
            ..FakeOptions::default()
        });
        streaming(&mut publisher);
        for i in 0..5 {
            let result = publisher.send_video_frame(&frame(), i * 33);
            assert_eq!(result.is_err(), i == 2);
        }
        let stats = publisher.statistics();
        assert_eq!(stats.frames_sent, 4);
        assert_eq!(stats.dropped_frames, 1);
        assert_eq!(publisher.state(), StreamState::Streaming);
    }

    #[test]
    fn test_connect_failure_rolls_back() {
        let (mut publisher, _) = native(FakeOptions {
            sink_fails: true,
            ..FakeOptions::default()
        });
        publisher.init(config()).unwrap();
        let err = publisher.connect(URL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);
        assert_eq!(publisher.state(), StreamState::Initialized);
    }

    #[test]
    fn test_encoder_failure_is_init_failed() {
        let (mut publisher, _) = native(FakeOptions {
            video_fails: true,
            ..FakeOptions::default()
        });
        publisher.init(config()).unwrap();
        let err = publisher.connect(URL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InitFailed);
        assert_eq!(publisher.state(), StreamState::Initialized);
    }

    #[test]
    fn test_bad_url_is_invalid_params() {
        let (mut publisher, _) = native(FakeOptions::default());
        publisher.init(config()).unwrap();
        for url in ["http://host/app/key", "rtmp://host/app", "garbage"] {
            let err = publisher.connect(url).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParams, "{url}");
        }
        assert_eq!(publisher.state(), StreamState::Initialized);
    }

    #[test]
    fn test_wrong_state_transitions() {
        let (mut publisher, _) = native(FakeOptions::default());
        assert_eq!(
            publisher.connect(URL).unwrap_err().kind(),
            ErrorKind::NotConnected
        );
        assert_eq!(
            publisher.start_streaming().unwrap_err().kind(),
            ErrorKind::NotConnected
        );
        assert_eq!(
            publisher.stop_streaming().unwrap_err().kind(),
            ErrorKind::NotConnected
        );
        publisher.init(config()).unwrap();
        assert_eq!(
            publisher.start_streaming().unwrap_err().kind(),
            ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_stop_keeps_connection() {
        let (mut publisher, recording) = native(FakeOptions::default());
        streaming(&mut publisher);
        publisher.stop_streaming().unwrap();
        assert_eq!(publisher.state(), StreamState::Connected);
        assert!(!recording.lock().finished);
        publisher.start_streaming().unwrap();
        assert_eq!(publisher.state(), StreamState::Streaming);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mut publisher, recording) = native(FakeOptions::default());
        streaming(&mut publisher);
        publisher.disconnect().unwrap();
        assert_eq!(publisher.state(), StreamState::Initialized);
        publisher.disconnect().unwrap();
        assert_eq!(publisher.state(), StreamState::Initialized);
        assert!(recording.lock().finished);
        assert_eq!(publisher.audio_status(), AudioStatus::NotConfigured);
    }

    #[test]
    fn test_round_trip_and_reinit_resets_counters() {
        let (mut publisher, recording) = native(FakeOptions::default());
        streaming(&mut publisher);
        for i in 0..10 {
            publisher.send_video_frame(&frame(), i * 33).unwrap();
        }
        publisher
            .send_audio(&vec![0.0; 2 * 1024], 1024, 0)
            .unwrap();
        publisher.stop_streaming().unwrap();
        publisher.disconnect().unwrap();

        let stats = publisher.statistics();
        assert_eq!(stats.frames_sent, 10);
        // Flushed packet included.
        assert_eq!(stats.video_packets, 10);
        assert_eq!(stats.audio_packets, 1);
        assert!(stats.bytes_sent > 0);
        {
            let rec = recording.lock();
            let media = &rec.tags[2..];
            assert!(media.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
        }

        publisher.cleanup();
        assert_eq!(publisher.state(), StreamState::Idle);
        assert_eq!(publisher.statistics().frames_sent, 10);

        publisher.init(config()).unwrap();
        assert_eq!(publisher.statistics(), StatisticsSnapshot::default());
    }

    #[test]
    fn test_reinit_while_streaming_tears_down() {
        let (mut publisher, recording) = native(FakeOptions::default());
        streaming(&mut publisher);
        publisher.init(config()).unwrap();
        assert_eq!(publisher.state(), StreamState::Initialized);
        assert!(recording.lock().finished);
    }

    #[test]
    fn test_audio_validation() {
        let (mut publisher, _) = native(FakeOptions::default());
        publisher.init(config()).unwrap();
        assert_eq!(
            publisher.send_audio(&[0.0; 4], 2, 0).unwrap_err().kind(),
            ErrorKind::NotConnected
        );

        publisher.connect(URL).unwrap();
        publisher.start_streaming().unwrap();
        assert_eq!(
            publisher.send_audio(&[0.0; 3], 2, 0).unwrap_err().kind(),
            ErrorKind::InvalidParams
        );
        assert_eq!(
            publisher.send_audio(&[], 0, 0).unwrap_err().kind(),
            ErrorKind::InvalidParams
        );
        publisher.send_audio(&[0.0; 4], 2, 0).unwrap();
    }

    #[test]
    fn test_audio_without_encoder_is_noop() {
        let (mut publisher, _) = native(FakeOptions {
            audio_fails: true,
            ..FakeOptions::default()
        });
        streaming(&mut publisher);
        assert!(matches!(
            publisher.audio_status(),
            AudioStatus::Unavailable { .. }
        ));
        publisher.send_audio(&vec![0.5; 4096], 2048, 0).unwrap();
        assert_eq!(publisher.statistics().audio_packets, 0);
    }

    #[test]
    fn test_cleanup_from_any_state() {
        let (mut publisher, _) = native(FakeOptions::default());
        publisher.cleanup();
        assert_eq!(publisher.state(), StreamState::Idle);
        streaming(&mut publisher);
        publisher.cleanup();
        assert_eq!(publisher.state(), StreamState::Idle);
        assert_eq!(
            publisher.send_video_frame(&frame(), 0).unwrap_err().kind(),
            ErrorKind::NotConnected
        );
    }

    fn transitions(publisher: &mut Publisher) -> Vec<(bool, StreamState)> {
        let mut seen = Vec::new();
        let mut record = |ok: bool, p: &Publisher| seen.push((ok, p.state()));
        record(publisher.send_video_frame(&frame(), 0).is_ok(), publisher);
        record(publisher.init(config()).is_ok(), publisher);
        record(publisher.start_streaming().is_ok(), publisher);
        record(publisher.connect(URL).is_ok(), publisher);
        record(publisher.start_streaming().is_ok(), publisher);
        for i in 0..3 {
            record(publisher.send_video_frame(&frame(), i * 33).is_ok(), publisher);
        }
        record(publisher.send_video_frame(&[0; 4], 99).is_ok(), publisher);
        record(publisher.send_audio(&[0.0; 2048], 1024, 0).is_ok(), publisher);
        record(publisher.stop_streaming().is_ok(), publisher);
        record(publisher.disconnect().is_ok(), publisher);
        record(publisher.disconnect().is_ok(), publisher);
        publisher.cleanup();
        record(true, publisher);
        seen
    }

    #[test]
    fn test_stub_and_native_transitions_match() {
        let (mut native_publisher, _) = native(FakeOptions::default());
        let mut stub = Publisher::with_backend(BackendKind::Stub);
        assert!(stub.is_stub());
        assert!(!native_publisher.is_stub());

        assert_eq!(transitions(&mut native_publisher), transitions(&mut stub));
        assert_eq!(
            native_publisher.statistics().frames_sent,
            stub.statistics().frames_sent
        );
    }

    #[test]
    fn test_stub_counts_raw_bytes() {
        let mut stub = Publisher::with_backend(BackendKind::Stub);
        streaming(&mut stub);
        stub.send_video_frame(&frame(), 0).unwrap();
        assert_eq!(stub.statistics().bytes_sent, u64::from(WIDTH * HEIGHT * 4));
        assert!(!stub.has_audio());
    }

    #[test]
    fn test_file_endpoint_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.flv");
        let url = format!("file://{}", path.display());

        let mut publisher = Publisher::with_backend_factory(
            false,
            Box::new(|| {
                Box::new(fake_codecs(
                    FakeOptions::default(),
                    Box::new(publisher_transport::open_sink),
                )) as Box<dyn Backend>
            }),
        );
        publisher.init(config()).unwrap();
        publisher.connect(&url).unwrap();
        publisher.start_streaming().unwrap();
        for i in 0..5 {
            publisher.send_video_frame(&frame(), i * 33).unwrap();
        }
        publisher.disconnect().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..3], b"FLV");
        assert_eq!(data[4], 0x05);
    }

    #[test]
    fn test_build_info_mentions_backend() {
        assert!(build_info(true).contains("stub"));
        assert!(build_info(false).contains("native"));
    }
}
