//! Cross-stream ordering of FLV tags by decode time.

use std::collections::VecDeque;

use tracing::trace;

use crate::flv::FlvTag;

/// Buffers tags per stream and releases them in global DTS order.
///
/// A tag is released once every active stream has a queued tag, or once the
/// queued span exceeds the interleave delta so that a stalled stream cannot
/// hold the others back indefinitely. Ties go to the lower stream index.
pub struct Interleaver {
    queues: Vec<VecDeque<FlvTag>>,
    max_delta_ms: u32,
}

impl Interleaver {
    /// Create an interleaver for `streams` streams.
    pub fn new(streams: usize, max_delta_ms: u32) -> Self {
        Self {
            queues: (0..streams).map(|_| VecDeque::new()).collect(),
            max_delta_ms,
        }
    }

    /// Number of streams.
    pub fn streams(&self) -> usize {
        self.queues.len()
    }

    /// Tags waiting across all streams.
    pub fn pending(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Queue a tag for `stream`.
    pub fn push(&mut self, stream: usize, tag: FlvTag) {
        if let Some(queue) = self.queues.get_mut(stream) {
            queue.push_back(tag);
        }
    }

    /// Release the next tag if ordering allows it.
    pub fn pop_ready(&mut self) -> Option<FlvTag> {
        if self.queues.iter().all(|q| !q.is_empty()) {
            return self.pop_earliest();
        }

        let earliest = self
            .queues
            .iter()
            .filter_map(|q| q.front())
            .map(|t| t.timestamp_ms)
            .min()?;
        let latest = self
            .queues
            .iter()
            .filter_map(|q| q.back())
            .map(|t| t.timestamp_ms)
            .max()?;
        if latest.saturating_sub(earliest) > self.max_delta_ms {
            trace!(
                earliest,
                latest,
                "Interleave delta exceeded, releasing without peer"
            );
            return self.pop_earliest();
        }
        None
    }

    /// Release everything in order.
    pub fn drain(&mut self) -> Vec<FlvTag> {
        let mut out = Vec::with_capacity(self.pending());
        while let Some(tag) = self.pop_earliest() {
            out.push(tag);
        }
        out
    }

    fn pop_earliest(&mut self) -> Option<FlvTag> {
        let (stream, _) = self
            .queues
            .iter()
            .enumerate()
            .filter_map(|(i, q)| q.front().map(|t| (i, t.timestamp_ms)))
            .min_by_key(|&(i, ts)| (ts, i))?;
        self.queues[stream].pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flv::FlvTagKind;
    use bytes::Bytes;

    fn tag(kind: FlvTagKind, ts: u32) -> FlvTag {
        FlvTag {
            kind,
            timestamp_ms: ts,
            body: Bytes::new(),
            keyframe: false,
        }
    }

    fn times(tags: &[FlvTag]) -> Vec<(FlvTagKind, u32)> {
        tags.iter().map(|t| (t.kind, t.timestamp_ms)).collect()
    }

    #[test]
    fn test_waits_for_every_stream() {
        let mut il = Interleaver::new(2, 1000);
        il.push(0, tag(FlvTagKind::Video, 0));
        il.push(0, tag(FlvTagKind::Video, 33));
        assert!(il.pop_ready().is_none());

        il.push(1, tag(FlvTagKind::Audio, 10));
        assert_eq!(il.pop_ready().unwrap().timestamp_ms, 0);
        assert_eq!(il.pop_ready().unwrap().timestamp_ms, 10);
        // Audio queue is empty again.
        assert!(il.pop_ready().is_none());
        assert_eq!(il.pending(), 1);
    }

    #[test]
    fn test_ties_prefer_lower_stream() {
        let mut il = Interleaver::new(2, 1000);
        il.push(1, tag(FlvTagKind::Audio, 40));
        il.push(0, tag(FlvTagKind::Video, 40));
        assert_eq!(il.pop_ready().unwrap().kind, FlvTagKind::Video);
    }

    #[test]
    fn test_delta_releases_stalled_stream() {
        let mut il = Interleaver::new(2, 100);
        il.push(0, tag(FlvTagKind::Video, 0));
        il.push(0, tag(FlvTagKind::Video, 50));
        assert!(il.pop_ready().is_none());
        il.push(0, tag(FlvTagKind::Video, 150));
        assert_eq!(il.pop_ready().unwrap().timestamp_ms, 0);
        assert!(il.pop_ready().is_none());
    }

    #[test]
    fn test_single_stream_passes_through() {
        let mut il = Interleaver::new(1, 1000);
        il.push(0, tag(FlvTagKind::Video, 5));
        assert_eq!(il.pop_ready().unwrap().timestamp_ms, 5);
    }

    #[test]
    fn test_drain_orders_across_streams() {
        let mut il = Interleaver::new(2, 1000);
        il.push(0, tag(FlvTagKind::Video, 0));
        il.push(0, tag(FlvTagKind::Video, 66));
        il.push(1, tag(FlvTagKind::Audio, 23));
        il.push(1, tag(FlvTagKind::Audio, 46));
        il.push(1, tag(FlvTagKind::Audio, 70));

        let order = times(&il.drain());
        assert_eq!(
            order,
            vec![
                (FlvTagKind::Video, 0),
                (FlvTagKind::Audio, 23),
                (FlvTagKind::Audio, 46),
                (FlvTagKind::Video, 66),
                (FlvTagKind::Audio, 70),
            ]
        );
        assert_eq!(il.pending(), 0);
    }
}
