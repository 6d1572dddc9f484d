//! Publishing session engine.
//!
//! [`Publisher`] owns the lifecycle state machine and the statistics, and
//! delegates media work to a [`Backend`]: the native pipeline (RGBA to I420,
//! H.264/AAC, FLV over RTMP(S) or to a file) or the inert stub used when the
//! codecs are not available.

mod backend;
mod metrics;
mod native;
mod publisher;
mod stub;

#[cfg(test)]
mod testing;

pub use backend::{selected_backend, Backend, BackendKind, PacketBuffer, BACKEND_ENV};
pub use metrics::{SendOutcome, StatisticsCollector};
pub use native::{AudioEncoderFactory, NativeBackend, SinkFactory, VideoEncoderFactory};
pub use publisher::{build_info, BackendFactory, Publisher};
pub use stub::StubBackend;
