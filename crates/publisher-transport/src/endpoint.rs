//! Publish endpoint parsing.
//!
//! Accepted forms:
//!
//! - `rtmp://host[:port]/app/stream-key[?query]` (default port 1935)
//! - `rtmps://host[:port]/app/stream-key[?query]` (default port 443, TLS)
//! - `file:///path/to/out.flv` (records the FLV stream locally)
//!
//! The first path segment is the application, everything after it (query
//! included) is the stream key.

use std::fmt;
use std::path::PathBuf;

use url::{Host, Url};

use crate::error::TransportError;
use crate::{TransportResult, DEFAULT_RTMPS_PORT, DEFAULT_RTMP_PORT};

/// Where a publish session delivers its FLV stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// RTMP or RTMPS ingest server.
    Rtmp(RtmpEndpoint),
    /// Local FLV file.
    File(PathBuf),
}

/// A parsed RTMP(S) publish URL.
#[derive(Clone, PartialEq, Eq)]
pub struct RtmpEndpoint {
    /// TLS (`rtmps://`).
    pub secure: bool,
    /// Host name or address, without IPv6 brackets.
    pub host: String,
    /// Port to dial.
    pub port: u16,
    /// Port written in the URL, if any.
    pub explicit_port: Option<u16>,
    /// RTMP application name.
    pub app: String,
    /// Stream key, including any query string.
    pub stream_key: String,
}

impl Endpoint {
    /// Parse a publish URL.
    pub fn parse(url: &str) -> TransportResult<Self> {
        let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        match parsed.scheme() {
            "rtmp" => RtmpEndpoint::from_url(&parsed, false).map(Self::Rtmp),
            "rtmps" => RtmpEndpoint::from_url(&parsed, true).map(Self::Rtmp),
            "file" => parsed
                .to_file_path()
                .map(Self::File)
                .map_err(|()| TransportError::InvalidUrl("Invalid file path".to_string())),
            other => Err(TransportError::InvalidUrl(format!(
                "Unsupported scheme '{}'",
                other
            ))),
        }
    }

    /// Whether delivery goes over the network.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Rtmp(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rtmp(rtmp) => rtmp.fmt(f),
            Self::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}

impl RtmpEndpoint {
    fn from_url(url: &Url, secure: bool) -> TransportResult<Self> {
        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(TransportError::InvalidUrl("Missing host".to_string())),
        };

        let mut segments = url
            .path_segments()
            .ok_or_else(|| TransportError::InvalidUrl("Missing path".to_string()))?;
        let app = segments.next().unwrap_or_default().to_string();
        if app.is_empty() {
            return Err(TransportError::InvalidUrl(
                "Missing application name in URL path".to_string(),
            ));
        }

        let mut stream_key = segments.collect::<Vec<_>>().join("/");
        if stream_key.is_empty() {
            return Err(TransportError::InvalidUrl(
                "Missing stream key in URL path".to_string(),
            ));
        }
        if let Some(query) = url.query() {
            stream_key.push('?');
            stream_key.push_str(query);
        }

        let default_port = if secure {
            DEFAULT_RTMPS_PORT
        } else {
            DEFAULT_RTMP_PORT
        };

        Ok(Self {
            secure,
            host,
            port: url.port().unwrap_or(default_port),
            explicit_port: url.port(),
            app,
            stream_key,
        })
    }

    /// URL scheme.
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "rtmps"
        } else {
            "rtmp"
        }
    }

    fn host_for_url(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `tcUrl` sent in the RTMP connect command: the URL up to and
    /// including the application.
    pub fn tc_url(&self) -> String {
        match self.explicit_port {
            Some(port) => format!(
                "{}://{}:{}/{}",
                self.scheme(),
                self.host_for_url(),
                port,
                self.app
            ),
            None => format!("{}://{}/{}", self.scheme(), self.host_for_url(), self.app),
        }
    }

    /// `host:port` for dialing.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host_for_url(), self.port)
    }
}

/// Stream keys are credentials; only the application is printed.
impl fmt::Display for RtmpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/<redacted>", self.tc_url())
    }
}

impl fmt::Debug for RtmpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtmpEndpoint")
            .field("secure", &self.secure)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("app", &self.app)
            .field("stream_key", &"<redacted>")
            .finish()
    }
}
