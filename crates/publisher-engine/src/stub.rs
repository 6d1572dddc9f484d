//! Inert backend: same contract, no codecs and no network.

use tracing::{info, warn};

use publisher_transport::Endpoint;
use publisher_types::{AudioStatus, PublishResult, StreamConfig};

use crate::backend::{Backend, PacketBuffer};
use crate::metrics::SendOutcome;

/// Frames between "still a stub" warnings.
const WARN_EVERY_FRAMES: u64 = 300;

/// Accepts every call and advances like the native backend would, counting
/// the raw RGBA bytes of each frame as sent.
#[derive(Debug, Default)]
pub struct StubBackend {
    connected: bool,
    frames: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for StubBackend {
    fn connect(
        &mut self,
        config: &StreamConfig,
        endpoint: &Endpoint,
        _buffer: &mut PacketBuffer,
    ) -> PublishResult<AudioStatus> {
        warn!(
            endpoint = %endpoint,
            width = config.width,
            height = config.height,
            "STUB backend connected: nothing will be encoded or sent"
        );
        self.connected = true;
        self.frames = 0;
        Ok(AudioStatus::Unavailable {
            reason: "stub backend".to_string(),
        })
    }

    fn send_video(
        &mut self,
        rgba: &[u8],
        pts_ms: i64,
        _buffer: &mut PacketBuffer,
    ) -> PublishResult<SendOutcome> {
        self.frames += 1;
        if self.frames % WARN_EVERY_FRAMES == 0 {
            warn!(
                frames = self.frames,
                pts_ms, "STUB backend: frames are being discarded"
            );
        }
        Ok(SendOutcome {
            bytes: rgba.len() as u64,
            ..SendOutcome::default()
        })
    }

    fn send_audio(
        &mut self,
        _samples: &[f32],
        _pts_ms: i64,
        _buffer: &mut PacketBuffer,
    ) -> PublishResult<SendOutcome> {
        Ok(SendOutcome::default())
    }

    fn disconnect(&mut self, _buffer: &mut PacketBuffer) -> SendOutcome {
        if self.connected {
            info!(frames = self.frames, "STUB backend disconnected");
        }
        self.connected = false;
        SendOutcome::default()
    }

    fn has_audio(&self) -> bool {
        false
    }

    fn is_stub(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}
