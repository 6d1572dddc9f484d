//! FLV muxing and RTMP(S) transport.
//!
//! This crate turns encoded H.264 and AAC packets into an interleaved FLV
//! tag stream and delivers it to an RTMP or RTMPS ingest server, or to a
//! local `.flv` file for `file://` endpoints.

mod endpoint;
mod error;
mod file;
mod flv;
mod interleave;
mod muxer;
mod nal;
mod rtmp;
mod sink;

use std::time::Duration;

pub use endpoint::{Endpoint, RtmpEndpoint};
pub use error::TransportError;
pub use file::FlvFileSink;
pub use flv::{
    audio_specific_config, build_flv_audio_tag, build_flv_video_tag, sampling_frequency_index,
    AudioMetadata, FlvMetadata, FlvTag, FlvTagKind, AUDIO_CODEC_ID_AAC, VIDEO_CODEC_ID_AVC,
};
pub use interleave::Interleaver;
pub use muxer::{
    AudioStreamParams, EncodedPacket, FlvMuxer, MuxerOptions, StreamKind, VideoStreamParams,
};
pub use nal::{
    annex_b_to_avcc, build_avc_decoder_config, extract_sps_pps, filter_parameter_sets,
    nals_to_avcc, parse_annex_b, NalUnit, NalUnitType,
};
pub use rtmp::RtmpSink;
pub use sink::PacketSink;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Default port for `rtmp://`.
pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// Default port for `rtmps://`.
pub const DEFAULT_RTMPS_PORT: u16 = 443;

/// Network settings for RTMP sinks.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Bound on TCP connect, TLS, handshake and publish negotiation.
    pub connect_timeout: Duration,

    /// Outbound RTMP chunk size.
    pub chunk_size: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            chunk_size: 4096,
        }
    }
}

/// Open the sink an endpoint names.
pub fn open_sink(
    endpoint: &Endpoint,
    options: &TransportOptions,
) -> TransportResult<Box<dyn PacketSink>> {
    match endpoint {
        Endpoint::Rtmp(rtmp) => Ok(Box::new(RtmpSink::connect(rtmp, options)?)),
        Endpoint::File(path) => Ok(Box::new(FlvFileSink::create(path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = TransportOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.chunk_size, 4096);
    }

    #[test]
    fn test_open_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.flv");
        let endpoint = Endpoint::File(path.clone());
        let mut sink = open_sink(&endpoint, &TransportOptions::default()).unwrap();
        assert_eq!(sink.name(), "flv-file");
        sink.finish().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_open_unreachable_rtmp_fails() {
        // Port 1 on loopback is closed on any sane test host.
        let endpoint = Endpoint::parse("rtmp://127.0.0.1:1/live/key").unwrap();
        let options = TransportOptions {
            connect_timeout: Duration::from_secs(2),
            ..TransportOptions::default()
        };
        assert!(open_sink(&endpoint, &options).is_err());
    }
}
