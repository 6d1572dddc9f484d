//! Interleaved float PCM to planar encoder frames.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::error::ConvertError;
use crate::ConvertResult;

/// Default channel layout for a channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    /// Layout for `channels`; only mono and stereo have a default layout.
    pub fn from_channel_count(channels: u32) -> ConvertResult<Self> {
        match channels {
            1 => Ok(Self::Mono),
            2 => Ok(Self::Stereo),
            n => Err(ConvertError::UnsupportedLayout(n)),
        }
    }

    /// Number of channels in this layout.
    pub fn channels(self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }
}

/// One encoder frame of planar samples.
#[derive(Debug, Clone)]
pub struct PlanarAudioFrame {
    /// One plane per channel, each `samples` long.
    pub planes: Vec<Vec<f32>>,

    /// Presentation timestamp in output sample ticks (1 / output rate).
    pub pts: i64,

    /// Samples per channel.
    pub samples: usize,
}

/// Converts interleaved chunks of arbitrary length into fixed-size planar
/// frames at the encoder's sample rate.
///
/// Rate conversion, when the rates differ, is linear interpolation carried
/// across chunk boundaries.
pub struct AudioResampler {
    layout: ChannelLayout,
    input_rate: u32,
    output_rate: u32,
    frame_size: usize,
    fifo: Vec<VecDeque<f32>>,
    /// Timestamp of the sample at the FIFO head, in output ticks.
    head_pts: Option<i64>,
    /// Last input sample per channel, index -1 of the next chunk.
    history: Vec<f32>,
    /// Read position of the next output sample, in input samples relative
    /// to `history`.
    position: f64,
}

impl AudioResampler {
    /// Create a resampler emitting `frame_size` samples per frame.
    pub fn new(
        layout: ChannelLayout,
        input_rate: u32,
        output_rate: u32,
        frame_size: usize,
    ) -> ConvertResult<Self> {
        if input_rate == 0 || output_rate == 0 || frame_size == 0 {
            return Err(ConvertError::InvalidFormat(format!(
                "input {} Hz, output {} Hz, frame {} samples",
                input_rate, output_rate, frame_size
            )));
        }

        debug!(
            channels = layout.channels(),
            input_rate,
            output_rate,
            frame_size,
            "Creating audio resampler"
        );

        let channels = layout.channels();
        Ok(Self {
            layout,
            input_rate,
            output_rate,
            frame_size,
            fifo: (0..channels)
                .map(|_| VecDeque::with_capacity(frame_size * 2))
                .collect(),
            head_pts: None,
            history: vec![0.0; channels],
            position: 1.0,
        })
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Samples per channel currently buffered.
    pub fn buffered(&self) -> usize {
        self.fifo.first().map_or(0, VecDeque::len)
    }

    /// Push one interleaved chunk stamped `pts_ms` and collect every complete
    /// frame it finishes.
    pub fn push(
        &mut self,
        interleaved: &[f32],
        pts_ms: i64,
    ) -> ConvertResult<Vec<PlanarAudioFrame>> {
        let channels = self.layout.channels();
        if interleaved.len() % channels != 0 {
            return Err(ConvertError::SizeMismatch {
                expected: interleaved.len() - interleaved.len() % channels,
                actual: interleaved.len(),
            });
        }

        if self.buffered() == 0 {
            // Re-anchor on the caller clock whenever nothing is pending.
            self.head_pts = Some(millis_to_ticks(pts_ms, self.output_rate));
        }

        if self.input_rate == self.output_rate {
            for frame in interleaved.chunks_exact(channels) {
                for (plane, &sample) in self.fifo.iter_mut().zip(frame) {
                    plane.push_back(sample);
                }
            }
        } else {
            self.interpolate(interleaved);
        }

        let mut frames = Vec::new();
        while self.buffered() >= self.frame_size {
            frames.push(self.pop_frame(self.frame_size));
        }

        trace!(
            input = interleaved.len() / channels,
            frames = frames.len(),
            buffered = self.buffered(),
            "Resampled audio chunk"
        );

        Ok(frames)
    }

    /// Emit the buffered remainder padded with silence, if any.
    pub fn flush(&mut self) -> Option<PlanarAudioFrame> {
        let pending = self.buffered();
        if pending == 0 {
            return None;
        }
        for plane in &mut self.fifo {
            plane.resize(self.frame_size, 0.0);
        }
        debug!(pending, "Flushing padded audio frame");
        Some(self.pop_frame(self.frame_size))
    }

    fn interpolate(&mut self, interleaved: &[f32]) {
        let channels = self.layout.channels();
        let count = interleaved.len() / channels;
        let step = self.input_rate as f64 / self.output_rate as f64;

        // Index 0 is `history`, index i + 1 is input sample i.
        let sample = |index: usize, channel: usize, history: &[f32]| {
            if index == 0 {
                history[channel]
            } else {
                interleaved[(index - 1) * channels + channel]
            }
        };

        let mut t = self.position;
        while t < count as f64 {
            let index = t.floor() as usize;
            let frac = (t - index as f64) as f32;
            for (channel, plane) in self.fifo.iter_mut().enumerate() {
                let a = sample(index, channel, &self.history);
                let b = sample(index + 1, channel, &self.history);
                plane.push_back(a + (b - a) * frac);
            }
            t += step;
        }
        self.position = t - count as f64;

        if count > 0 {
            self.history
                .copy_from_slice(&interleaved[(count - 1) * channels..count * channels]);
        }
    }

    fn pop_frame(&mut self, samples: usize) -> PlanarAudioFrame {
        let planes = self
            .fifo
            .iter_mut()
            .map(|plane| plane.drain(..samples).collect::<Vec<f32>>())
            .collect();
        let pts = self.head_pts.unwrap_or(0);
        self.head_pts = Some(pts + samples as i64);
        PlanarAudioFrame {
            planes,
            pts,
            samples,
        }
    }
}

fn millis_to_ticks(ms: i64, rate: u32) -> i64 {
    let ticks = ms as i128 * rate as i128;
    ((ticks + 500) / 1000) as i64
}
