//! Per-speaker delay and gain so every speaker appears as far away as the
//! farthest one.

use crate::audio::{FloatBufferLine, SPEED_OF_SOUND_METERS_PER_SEC};

use super::delay_samples;

pub const MAX_DELAY_LENGTH: usize = 1024;

#[derive(Clone, Debug, Default)]
struct ChanData {
    gain: f32,
    delay: Vec<f32>,
}

pub struct DistanceComp {
    channels: Vec<ChanData>,
    truncated: bool,
}

impl DistanceComp {
    /// `distances[i]` is the distance in meters of output channel `i`.
    /// Returns `None` when no speaker has a positive distance.
    ///
    /// Delays are whole samples, so at 48kHz the compensation moves in steps
    /// of roughly 7mm.
    pub fn new(distances: &[f32], frequency: u32) -> Option<Self> {
        let maxdist = distances.iter().copied().fold(0.0f32, f32::max);
        if !(maxdist > 0.0) {
            return None;
        }

        let scale = frequency as f32 / SPEED_OF_SOUND_METERS_PER_SEC;
        let mut truncated = false;
        let channels = distances
            .iter()
            .enumerate()
            .map(|(idx, &distance)| {
                let mut delay = ((maxdist - distance) * scale + 0.5).floor();
                if delay > (MAX_DELAY_LENGTH - 1) as f32 {
                    log::error!(
                        "Delay for channel {} exceeds buffer length ({} > {})",
                        idx,
                        delay,
                        MAX_DELAY_LENGTH - 1
                    );
                    delay = (MAX_DELAY_LENGTH - 1) as f32;
                    truncated = true;
                }
                let length = delay.max(0.0) as usize;
                let gain = distance.max(0.0) / maxdist;
                log::debug!(
                    "Channel {} distance comp: {} samples, {} gain",
                    idx,
                    length,
                    gain
                );
                ChanData {
                    gain,
                    delay: vec![0.0; length],
                }
            })
            .collect();

        Some(Self {
            channels,
            truncated,
        })
    }

    /// Whether any channel's delay had to be cut to the line length.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn delay_of(&self, channel: usize) -> usize {
        self.channels.get(channel).map_or(0, |c| c.delay.len())
    }

    pub fn gain_of(&self, channel: usize) -> f32 {
        self.channels.get(channel).map_or(1.0, |c| c.gain)
    }

    pub fn process(&mut self, buffers: &mut [FloatBufferLine], samples_to_do: usize) {
        for (line, chan) in buffers.iter_mut().zip(self.channels.iter_mut()) {
            let samples = &mut line[..samples_to_do];
            delay_samples(samples, &mut chan.delay);
            if chan.gain != 1.0 {
                samples.iter_mut().for_each(|s| *s *= chan.gain);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::new_lines;

    #[test]
    fn nearer_speaker_is_delayed_and_attenuated() {
        let freq = 48000;
        let mut comp = DistanceComp::new(&[2.0, 1.0], freq).unwrap();
        assert!(!comp.truncated());
        let expected = (1.0 * freq as f32 / SPEED_OF_SOUND_METERS_PER_SEC + 0.5).floor() as usize;
        assert_eq!(comp.delay_of(0), 0);
        assert_eq!(comp.delay_of(1), expected);
        assert!((comp.gain_of(1) - 0.5).abs() < 1e-6);

        let mut lines = new_lines(2);
        lines[0][0] = 1.0;
        lines[1][0] = 1.0;
        comp.process(&mut lines, 512);
        assert_eq!(lines[0][0], 1.0);
        assert_eq!(lines[1][0], 0.0);
        assert!((lines[1][expected] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn long_delays_are_truncated() {
        let comp = DistanceComp::new(&[20.0, 1.0], 48000).unwrap();
        assert!(comp.truncated());
        assert_eq!(comp.delay_of(1), MAX_DELAY_LENGTH - 1);
    }

    #[test]
    fn zero_distances_disable_compensation() {
        assert!(DistanceComp::new(&[0.0, 0.0], 48000).is_none());
    }
}
