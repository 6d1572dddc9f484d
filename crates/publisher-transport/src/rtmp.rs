//! RTMP(S) client sink.
//!
//! The sink is synchronous: it owns a private current-thread runtime and
//! blocks the caller on every network write. Inbound server traffic
//! (acknowledgements, pings) is drained opportunistically between writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::rml_amf0::Amf0Value;
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType, StreamMetadata,
};
use rml_rtmp::time::RtmpTimestamp;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, instrument, trace, warn};

use crate::endpoint::RtmpEndpoint;
use crate::error::TransportError;
use crate::flv::{FlvMetadata, FlvTag, FlvTagKind, AUDIO_CODEC_ID_AAC, VIDEO_CODEC_ID_AVC};
use crate::sink::PacketSink;
use crate::{TransportOptions, TransportResult};

/// Tags sent between inbound polls.
const POLL_INTERVAL_TAGS: u32 = 32;

/// Read buffer size for server traffic.
const READ_BUFFER_SIZE: usize = 4096;

/// Byte stream to the server, plain TCP or TLS.
trait NetStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> NetStream for T {}

type BoxedStream = Box<dyn NetStream>;

/// Publishes FLV tags to an RTMP or RTMPS server.
pub struct RtmpSink {
    runtime: Runtime,
    stream: BoxedStream,
    session: ClientSession,
    read_buf: Vec<u8>,
    bytes_written: u64,
    tags_since_poll: u32,
    closed: bool,
}

impl RtmpSink {
    /// Dial, handshake and negotiate publishing on `endpoint`.
    ///
    /// Everything up to the publish acceptance is bounded by
    /// `options.connect_timeout`.
    #[instrument(name = "rtmp_connect", skip_all, fields(endpoint = %endpoint))]
    pub fn connect(endpoint: &RtmpEndpoint, options: &TransportOptions) -> TransportResult<Self> {
        info!(secure = endpoint.secure, "Connecting to RTMP server");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let timeout = options.connect_timeout;
        let (stream, session, bytes_written) = runtime.block_on(async {
            tokio::time::timeout(timeout, establish(endpoint, options))
                .await
                .map_err(|_| {
                    TransportError::Timeout(format!("no publish acceptance within {:?}", timeout))
                })?
        })?;

        info!("RTMP publishing started");

        Ok(Self {
            runtime,
            stream,
            session,
            read_buf: vec![0; READ_BUFFER_SIZE],
            bytes_written,
            tags_since_poll: 0,
            closed: false,
        })
    }

    fn send(&mut self, result: ClientSessionResult) -> TransportResult<()> {
        if let ClientSessionResult::OutboundResponse(packet) = result {
            let Self {
                runtime, stream, ..
            } = self;
            runtime
                .block_on(stream.write_all(&packet.bytes))
                .map_err(|e| TransportError::Send(e.to_string()))?;
            self.bytes_written += packet.bytes.len() as u64;
        }
        Ok(())
    }

    /// Drain whatever the server has sent without waiting for more.
    fn poll_inbound(&mut self) -> TransportResult<()> {
        loop {
            let Self {
                runtime,
                stream,
                read_buf,
                ..
            } = self;
            let read = runtime.block_on(async {
                tokio::time::timeout(Duration::ZERO, stream.read(read_buf)).await
            });
            let n = match read {
                Err(_) => return Ok(()),
                Ok(result) => result?,
            };
            if n == 0 {
                return Err(TransportError::Send(
                    "server closed the connection".to_string(),
                ));
            }

            let results = self
                .session
                .handle_input(&self.read_buf[..n])
                .map_err(|e| TransportError::Protocol(format!("{:?}", e)))?;
            for result in results {
                match result {
                    ClientSessionResult::RaisedEvent(event) => {
                        trace!(event = ?event, "Server event while publishing")
                    }
                    other => self.send(other)?,
                }
            }
        }
    }
}

impl PacketSink for RtmpSink {
    fn write_metadata(&mut self, metadata: &FlvMetadata) -> TransportResult<()> {
        let mut md = StreamMetadata::new();
        md.video_width = Some(metadata.width);
        md.video_height = Some(metadata.height);
        md.video_frame_rate = Some(metadata.frame_rate as f32);
        md.video_bitrate_kbps = Some(metadata.video_bitrate_kbps);
        md.video_codec_id = Some(VIDEO_CODEC_ID_AVC);
        if let Some(audio) = &metadata.audio {
            md.audio_codec_id = Some(AUDIO_CODEC_ID_AAC);
            md.audio_bitrate_kbps = Some(audio.bitrate_kbps);
            md.audio_sample_rate = Some(audio.sample_rate);
            md.audio_channels = Some(audio.channels);
            md.audio_is_stereo = Some(audio.channels > 1);
        }
        md.encoder = Some(metadata.encoder.clone());

        let result = self
            .session
            .publish_metadata(&md)
            .map_err(|e| TransportError::Send(format!("metadata: {:?}", e)))?;
        self.send(result)
    }

    fn write_tag(&mut self, tag: &FlvTag) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Send("connection closed".to_string()));
        }

        let timestamp = RtmpTimestamp::new(tag.timestamp_ms);
        let result = match tag.kind {
            FlvTagKind::Video => {
                self.session
                    .publish_video_data(tag.body.clone(), timestamp, !tag.keyframe)
            }
            FlvTagKind::Audio => self
                .session
                .publish_audio_data(tag.body.clone(), timestamp, false),
            FlvTagKind::Script => {
                debug!("Skipping script tag; metadata goes through write_metadata");
                return Ok(());
            }
        }
        .map_err(|e| TransportError::Send(format!("{:?}", e)))?;
        self.send(result)?;

        self.tags_since_poll += 1;
        if tag.keyframe || self.tags_since_poll >= POLL_INTERVAL_TAGS {
            self.tags_since_poll = 0;
            self.poll_inbound()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let Self {
            runtime, stream, ..
        } = self;
        if let Err(e) = runtime.block_on(async {
            stream.flush().await?;
            stream.shutdown().await
        }) {
            debug!(error = %e, "RTMP shutdown incomplete");
        }
        info!(bytes = self.bytes_written, "RTMP connection closed");
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn name(&self) -> &'static str {
        "rtmp"
    }
}

/// Dial, secure, handshake, connect and publish. Returns the stream, the
/// session and the bytes written during negotiation.
async fn establish(
    endpoint: &RtmpEndpoint,
    options: &TransportOptions,
) -> TransportResult<(BoxedStream, ClientSession, u64)> {
    let tcp = TcpStream::connect(endpoint.socket_addr())
        .await
        .map_err(|e| TransportError::Connection(format!("TCP connect failed: {}", e)))?;
    if let Err(e) = tcp.set_nodelay(true) {
        warn!(error = %e, "Could not disable Nagle");
    }
    debug!("TCP connection established");

    let mut stream: BoxedStream = if endpoint.secure {
        Box::new(tls_connect(tcp, &endpoint.host).await?)
    } else {
        Box::new(tcp)
    };

    let mut written = 0u64;
    let leftover = handshake(&mut stream, &mut written).await?;
    debug!("Handshake complete, creating RTMP session");

    let mut config = ClientSessionConfig::new();
    config.chunk_size = options.chunk_size;
    config.tc_url = Some(endpoint.tc_url());

    let (mut session, initial) = ClientSession::new(config)
        .map_err(|e| TransportError::Protocol(format!("session creation failed: {:?}", e)))?;
    written += write_results(&mut stream, initial).await?.1;

    if !leftover.is_empty() {
        let results = session
            .handle_input(&leftover)
            .map_err(|e| TransportError::Protocol(format!("{:?}", e)))?;
        written += write_results(&mut stream, results).await?.1;
    }

    debug!(app = %endpoint.app, "Requesting RTMP connection");
    let request = session
        .request_connection(endpoint.app.clone())
        .map_err(|e| TransportError::Protocol(format!("connect request failed: {:?}", e)))?;
    written += write_results(&mut stream, vec![request]).await?.1;
    written += await_event(&mut stream, &mut session, |event| match event {
        ClientSessionEvent::ConnectionRequestAccepted => Ok(true),
        ClientSessionEvent::ConnectionRequestRejected { description } => {
            Err(TransportError::Rejected(description.clone()))
        }
        _ => Ok(false),
    })
    .await?;
    debug!("Connection accepted by server");

    let request = session
        .request_publishing(endpoint.stream_key.clone(), PublishRequestType::Live)
        .map_err(|e| TransportError::Protocol(format!("publish request failed: {:?}", e)))?;
    written += write_results(&mut stream, vec![request]).await?.1;
    written += await_event(&mut stream, &mut session, |event| match event {
        ClientSessionEvent::PublishRequestAccepted => Ok(true),
        other => match publish_failure(other) {
            Some(code) => Err(TransportError::Rejected(code)),
            None => Ok(false),
        },
    })
    .await?;
    debug!("Publish request accepted");

    Ok((stream, session, written))
}

/// Status codes a server uses to refuse a publish.
const FAILURE_MARKERS: [&str; 6] = [
    "Failed",
    "BadName",
    "Rejected",
    "Denied",
    "Unauthorized",
    "Error",
];

fn is_error_status(code: &str) -> bool {
    FAILURE_MARKERS.iter().any(|marker| code.contains(marker))
}

/// The failure code carried by `event`, if it refuses the publish.
///
/// Servers answer a refused publish either with an `onStatus` error code
/// or with an `_error` result on transaction 0.
fn publish_failure(event: &ClientSessionEvent) -> Option<String> {
    match event {
        ClientSessionEvent::UnhandleableOnStatusCode { code } if is_error_status(code) => {
            Some(code.clone())
        }
        ClientSessionEvent::UnknownTransactionResultReceived {
            additional_values, ..
        } => {
            let Some(Amf0Value::Object(status)) = additional_values.first() else {
                return None;
            };
            let (level, code) = (status_text(status, "level"), status_text(status, "code"));
            if level.ends_with("error") || is_error_status(code) {
                Some(if code.is_empty() {
                    "publish refused".to_string()
                } else {
                    code.to_string()
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

fn status_text<'a>(status: &'a HashMap<String, Amf0Value>, name: &str) -> &'a str {
    match status.get(name) {
        Some(Amf0Value::Utf8String(value)) => value.as_str(),
        _ => "",
    }
}

async fn tls_connect(
    tcp: TcpStream,
    host: &str,
) -> TransportResult<tokio_rustls::client::TlsStream<TcpStream>> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.into(),
    };
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TransportError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| TransportError::Tls(format!("invalid server name '{}': {}", host, e)))?;

    let tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    debug!("TLS session established");
    Ok(tls)
}

/// Client side of the RTMP handshake. Returns bytes received past its end.
async fn handshake(stream: &mut BoxedStream, written: &mut u64) -> TransportResult<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Client);
    let p0_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| TransportError::Protocol(format!("handshake: {:?}", e)))?;
    stream.write_all(&p0_p1).await?;
    *written += p0_p1.len() as u64;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Connection(
                "connection closed during handshake".to_string(),
            ));
        }

        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                stream.write_all(&response_bytes).await?;
                *written += response_bytes.len() as u64;
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                stream.write_all(&response_bytes).await?;
                *written += response_bytes.len() as u64;
                return Ok(remaining_bytes);
            }
            Err(e) => {
                return Err(TransportError::Protocol(format!("handshake: {:?}", e)));
            }
        }
    }
}

/// Write outbound packets; return raised events and bytes written.
async fn write_results(
    stream: &mut BoxedStream,
    results: Vec<ClientSessionResult>,
) -> TransportResult<(Vec<ClientSessionEvent>, u64)> {
    let mut events = Vec::new();
    let mut written = 0u64;
    for result in results {
        match result {
            ClientSessionResult::OutboundResponse(packet) => {
                stream.write_all(&packet.bytes).await?;
                written += packet.bytes.len() as u64;
            }
            ClientSessionResult::RaisedEvent(event) => events.push(event),
            _ => trace!("Ignoring unhandleable message"),
        }
    }
    Ok((events, written))
}

/// Read server traffic until `matcher` accepts an event or fails.
async fn await_event<F>(
    stream: &mut BoxedStream,
    session: &mut ClientSession,
    matcher: F,
) -> TransportResult<u64>
where
    F: Fn(&ClientSessionEvent) -> TransportResult<bool>,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Connection(
                "connection closed by server".to_string(),
            ));
        }

        let results = session
            .handle_input(&buf[..n])
            .map_err(|e| TransportError::Protocol(format!("{:?}", e)))?;
        let (events, bytes) = write_results(stream, results).await?;
        written += bytes;

        for event in &events {
            if matcher(event)? {
                return Ok(written);
            }
            trace!(event = ?event, "Server event during negotiation");
        }
    }
}
