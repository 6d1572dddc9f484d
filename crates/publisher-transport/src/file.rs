//! FLV file writer for `file://` endpoints.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info};

use crate::flv::{FlvMetadata, FlvTag, FlvTagKind};
use crate::sink::PacketSink;
use crate::TransportResult;

/// FLV tag header length.
const TAG_HEADER_LEN: usize = 11;

/// Writes a complete FLV file: signature header, then tags each followed by
/// their PreviousTagSize.
pub struct FlvFileSink<W: Write + Send> {
    writer: W,
    header_written: bool,
    bytes_written: u64,
}

impl FlvFileSink<BufWriter<File>> {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: &Path) -> TransportResult<Self> {
        info!(path = %path.display(), "Recording FLV to file");
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> FlvFileSink<W> {
    /// Wrap any writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_written: false,
            bytes_written: 0,
        }
    }

    /// Unwrap the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_file_header(&mut self, has_audio: bool) -> TransportResult<()> {
        let flags = if has_audio { 0x05 } else { 0x01 };
        let header = [
            b'F', b'L', b'V', 0x01, flags, 0x00, 0x00, 0x00, 0x09, // header
            0x00, 0x00, 0x00, 0x00, // PreviousTagSize0
        ];
        self.writer.write_all(&header)?;
        self.bytes_written += header.len() as u64;
        self.header_written = true;
        Ok(())
    }

    fn write_raw_tag(&mut self, kind: FlvTagKind, timestamp_ms: u32, body: &[u8]) -> TransportResult<()> {
        if !self.header_written {
            self.write_file_header(true)?;
        }

        let mut buf = BytesMut::with_capacity(TAG_HEADER_LEN + body.len() + 4);
        buf.put_u8(kind as u8);
        buf.put_uint(body.len() as u64, 3);
        buf.put_uint(u64::from(timestamp_ms & 0x00FF_FFFF), 3);
        buf.put_u8((timestamp_ms >> 24) as u8);
        buf.put_uint(0, 3);
        buf.put_slice(body);
        buf.put_u32((TAG_HEADER_LEN + body.len()) as u32);

        self.writer.write_all(&buf)?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }
}

impl<W: Write + Send> PacketSink for FlvFileSink<W> {
    fn write_metadata(&mut self, metadata: &FlvMetadata) -> TransportResult<()> {
        if !self.header_written {
            self.write_file_header(metadata.audio.is_some())?;
        }
        self.write_raw_tag(FlvTagKind::Script, 0, &metadata.to_script_body())
    }

    fn write_tag(&mut self, tag: &FlvTag) -> TransportResult<()> {
        self.write_raw_tag(tag.kind, tag.timestamp_ms, &tag.body)
    }

    fn finish(&mut self) -> TransportResult<()> {
        self.writer.flush()?;
        debug!(bytes = self.bytes_written, "FLV file closed");
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn name(&self) -> &'static str {
        "flv-file"
    }
}
