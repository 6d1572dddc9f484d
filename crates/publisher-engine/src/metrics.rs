//! Session statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use publisher_types::StatisticsSnapshot;

/// Monotonic counters for one session, reset only by `init()`.
///
/// Counters are atomics so a snapshot can be taken through a shared
/// reference while the owning session keeps running.
#[derive(Debug, Default)]
pub struct StatisticsCollector {
    bytes_sent: AtomicU64,
    frames_sent: AtomicU64,
    dropped_frames: AtomicU64,
    video_packets: AtomicU64,
    audio_packets: AtomicU64,
    start_time: RwLock<Option<Instant>>,
}

impl StatisticsCollector {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every counter and forget the start time.
    pub fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.dropped_frames.store(0, Ordering::Relaxed);
        self.video_packets.store(0, Ordering::Relaxed);
        self.audio_packets.store(0, Ordering::Relaxed);
        *self.start_time.write() = None;
    }

    /// Mark the start of streaming for uptime and bitrate.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    /// Streaming paused or ended.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    pub fn record_frame(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Record written output.
    pub fn record_output(&self, output: &SendOutcome) {
        self.bytes_sent.fetch_add(output.bytes, Ordering::Relaxed);
        self.video_packets
            .fetch_add(output.video_packets, Ordering::Relaxed);
        self.audio_packets
            .fetch_add(output.audio_packets, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Current values.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let bytes = self.bytes_sent();
        let elapsed = (*self.start_time.read()).map(|start| start.elapsed());

        let bitrate_kbps = match elapsed {
            Some(elapsed) if elapsed.as_secs_f64() > 0.0 => {
                (bytes as f64 * 8.0 / elapsed.as_secs_f64() / 1000.0) as u32
            }
            _ => 0,
        };

        StatisticsSnapshot {
            bytes_sent: bytes,
            frames_sent: self.frames_sent(),
            dropped_frames: self.dropped_frames(),
            video_packets: self.video_packets.load(Ordering::Relaxed),
            audio_packets: self.audio_packets.load(Ordering::Relaxed),
            uptime_seconds: elapsed.map_or(0, |e| e.as_secs()),
            bitrate_kbps,
        }
    }
}

/// Output produced by one backend call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOutcome {
    /// Compressed bytes handed to the muxer.
    pub bytes: u64,
    pub video_packets: u64,
    pub audio_packets: u64,
}

impl SendOutcome {
    /// Accumulate another outcome.
    pub fn merge(&mut self, other: SendOutcome) {
        self.bytes += other.bytes;
        self.video_packets += other.video_packets;
        self.audio_packets += other.audio_packets;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let stats = StatisticsCollector::new();
        stats.record_frame();
        stats.record_frame();
        stats.record_drop();
        stats.record_output(&SendOutcome {
            bytes: 1500,
            video_packets: 1,
            audio_packets: 2,
        });

        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.dropped_frames, 1);
        assert_eq!(snap.bytes_sent, 1500);
        assert_eq!(snap.video_packets, 1);
        assert_eq!(snap.audio_packets, 2);
        assert_eq!(snap.uptime_seconds, 0);
        assert_eq!(snap.bitrate_kbps, 0);

        stats.reset();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }

    #[test]
    fn test_merge() {
        let mut total = SendOutcome::default();
        total.merge(SendOutcome {
            bytes: 10,
            video_packets: 1,
            audio_packets: 0,
        });
        total.merge(SendOutcome {
            bytes: 5,
            video_packets: 0,
            audio_packets: 1,
        });
        assert_eq!(total.bytes, 15);
        assert_eq!(total.video_packets, 1);
        assert_eq!(total.audio_packets, 1);
    }
}
