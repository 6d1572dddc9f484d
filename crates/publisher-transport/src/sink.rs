//! Destinations for muxed FLV tags.

use crate::flv::{FlvMetadata, FlvTag};
use crate::TransportResult;

/// A byte destination for one FLV stream.
///
/// Calls are synchronous: a slow network write stalls the caller for the
/// duration of the write.
pub trait PacketSink: Send {
    /// Send the `onMetaData` description. Called once, before any tag.
    fn write_metadata(&mut self, metadata: &FlvMetadata) -> TransportResult<()>;

    /// Send one audio or video tag.
    fn write_tag(&mut self, tag: &FlvTag) -> TransportResult<()>;

    /// Flush and close the destination.
    fn finish(&mut self) -> TransportResult<()>;

    /// Bytes put on the wire so far, including framing.
    fn bytes_written(&self) -> u64;

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}
