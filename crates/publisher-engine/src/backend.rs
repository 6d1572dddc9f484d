//! Backend capability interface and one-time backend selection.

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use publisher_encoder::probe_native;
use publisher_transport::{EncodedPacket, Endpoint};
use publisher_types::{AudioStatus, PublishError, PublishResult, StreamConfig};

use crate::metrics::SendOutcome;
use crate::native::NativeBackend;
use crate::stub::StubBackend;

/// Environment variable overriding backend selection.
pub const BACKEND_ENV: &str = "RTMP_BRIDGE_BACKEND";

/// Encoded packets waiting to be written.
///
/// Allocated once per `init()` and reused by every send call, so steady
/// state streaming does not grow it.
pub struct PacketBuffer {
    packets: Vec<EncodedPacket>,
}

impl PacketBuffer {
    /// Packets buffered per call before the vector has to grow.
    pub const CAPACITY: usize = 16;

    /// Reserve the buffer, reporting allocation failure instead of aborting.
    pub fn try_new() -> PublishResult<Self> {
        let mut packets = Vec::new();
        packets.try_reserve_exact(Self::CAPACITY).map_err(|e| {
            PublishError::AllocFailed(format!("packet buffer: {}", e))
        })?;
        Ok(Self { packets })
    }

    pub fn push(&mut self, packet: EncodedPacket) {
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Take the buffered packets in order, leaving the buffer empty.
    pub fn drain(&mut self) -> std::vec::Drain<'_, EncodedPacket> {
        self.packets.drain(..)
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

/// The encode/mux/publish capability behind a [`crate::Publisher`].
///
/// Both variants honour the same contract; the publisher owns state
/// transitions and statistics, the backend only does the work.
pub trait Backend: Send {
    /// Open encoders, the sink and write the container header.
    ///
    /// On error every partial allocation has been released.
    fn connect(
        &mut self,
        config: &StreamConfig,
        endpoint: &Endpoint,
        buffer: &mut PacketBuffer,
    ) -> PublishResult<AudioStatus>;

    /// Convert, encode and write one RGBA frame.
    fn send_video(
        &mut self,
        rgba: &[u8],
        pts_ms: i64,
        buffer: &mut PacketBuffer,
    ) -> PublishResult<SendOutcome>;

    /// Resample, encode and write interleaved PCM. A no-op without audio.
    fn send_audio(
        &mut self,
        samples: &[f32],
        pts_ms: i64,
        buffer: &mut PacketBuffer,
    ) -> PublishResult<SendOutcome>;

    /// Flush encoders, write the trailer and close the sink. Teardown always
    /// completes; flush failures are logged.
    fn disconnect(&mut self, buffer: &mut PacketBuffer) -> SendOutcome;

    /// Whether an audio stream is being published.
    fn has_audio(&self) -> bool;

    /// Whether this backend is the inert stand-in.
    fn is_stub(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Which backend a publisher runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// x264, fdk-aac and the RTMP(S) sink.
    Native,
    /// Accepts every call, encodes and sends nothing.
    Stub,
}

impl BackendKind {
    /// Parse an `RTMP_BRIDGE_BACKEND` value. `auto` and unknown values
    /// yield `None`.
    pub fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "native" | "real" => Some(Self::Native),
            "stub" => Some(Self::Stub),
            _ => None,
        }
    }

    /// Instantiate a backend of this kind.
    pub fn create(self) -> Box<dyn Backend> {
        match self {
            Self::Native => Box::new(NativeBackend::new()),
            Self::Stub => Box::new(StubBackend::new()),
        }
    }
}

static SELECTED: OnceCell<BackendKind> = OnceCell::new();

/// Backend chosen for this process. Detection runs on first call only.
pub fn selected_backend() -> BackendKind {
    *SELECTED.get_or_init(detect_backend)
}

fn detect_backend() -> BackendKind {
    let requested = std::env::var(BACKEND_ENV).ok();
    if let Some(kind) = requested.as_deref().and_then(BackendKind::from_env_value) {
        info!(backend = ?kind, "Backend forced by {}", BACKEND_ENV);
        return kind;
    }

    match probe_native() {
        Ok(()) => {
            info!("Native codec backend available");
            BackendKind::Native
        }
        Err(e) => {
            warn!(
                reason = %e,
                "Native codec backend unavailable, falling back to the STUB backend; \
                 no video will be published"
            );
            BackendKind::Stub
        }
    }
}
