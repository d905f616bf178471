//! Ring modulator: the high-passed input multiplied by a fixed-point LFO.

use std::f32::consts::TAU;

use crate::ambisonic::{compute_pan_gains, MAX_AMBI_CHANNELS};
use crate::audio::{Buffer, FloatBufferLine, MAX_OUTPUT_CHANNELS};
use crate::biquad::{Biquad, BiquadType};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;

use super::{
    set_ambi_pan_identity, EffectProcessor, EffectProps, EffectTarget, ModulatorProps,
    ModulatorWaveform, OutTarget, SlotParams,
};

const MAX_UPDATE_SAMPLES: usize = 128;

const WAVEFORM_FRACBITS: u32 = 24;
const WAVEFORM_FRACONE: u32 = 1 << WAVEFORM_FRACBITS;
const WAVEFORM_FRACMASK: u32 = WAVEFORM_FRACONE - 1;

#[inline]
fn sin_wave(index: u32) -> f32 {
    (index as f32 * (TAU / WAVEFORM_FRACONE as f32)).sin()
}

#[inline]
fn saw_wave(index: u32) -> f32 {
    index as f32 * (2.0 / WAVEFORM_FRACONE as f32) - 1.0
}

#[inline]
fn square_wave(index: u32) -> f32 {
    ((index >> (WAVEFORM_FRACBITS - 2)) & 2) as f32 - 1.0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Waveform {
    One,
    Sine,
    Saw,
    Square,
}

#[derive(Clone, Copy)]
struct Channel {
    filter: Biquad,
    current_gains: [f32; MAX_OUTPUT_CHANNELS],
    target_gains: [f32; MAX_OUTPUT_CHANNELS],
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            filter: Biquad::new(),
            current_gains: [0.0; MAX_OUTPUT_CHANNELS],
            target_gains: [0.0; MAX_OUTPUT_CHANNELS],
        }
    }
}

pub struct ModulatorState {
    waveform: Waveform,
    index: u32,
    step: u32,

    chans: [Channel; MAX_AMBI_CHANNELS],
    num_chans: usize,
}

impl ModulatorState {
    pub fn new() -> Self {
        Self {
            waveform: Waveform::One,
            index: 0,
            step: 1,
            chans: [Channel::default(); MAX_AMBI_CHANNELS],
            num_chans: 0,
        }
    }

    fn generate(&self, dst: &mut [f32]) {
        let step = self.step;
        let mut index = self.index;
        let wave: fn(u32) -> f32 = match self.waveform {
            Waveform::One => {
                dst.fill(1.0);
                return;
            }
            Waveform::Sine => sin_wave,
            Waveform::Saw => saw_wave,
            Waveform::Square => square_wave,
        };
        for d in dst.iter_mut() {
            index = index.wrapping_add(step) & WAVEFORM_FRACMASK;
            *d = wave(index);
        }
    }
}

impl Default for ModulatorState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for ModulatorState {
    fn device_update(&mut self, _device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        for chan in self.chans.iter_mut() {
            *chan = Channel::default();
        }
        Ok(())
    }

    fn update(
        &mut self,
        device: &DeviceInfo,
        slot: &SlotParams,
        props: &EffectProps,
        target: EffectTarget<'_>,
    ) -> OutTarget {
        let props = match props {
            EffectProps::RingModulator(p) => *p,
            _ => ModulatorProps::default(),
        };
        let frequency = device.frequency as f32;

        let step = props.frequency / frequency * WAVEFORM_FRACONE as f32;
        self.step = step.clamp(0.0, (WAVEFORM_FRACONE - 1) as f32) as u32;

        self.waveform = if self.step == 0 {
            Waveform::One
        } else {
            match props.waveform {
                ModulatorWaveform::Sinusoid => Waveform::Sine,
                ModulatorWaveform::Sawtooth => Waveform::Saw,
                ModulatorWaveform::Square => Waveform::Square,
            }
        };

        let f0norm = (props.high_pass_cutoff / frequency).clamp(1.0 / 512.0, 0.49);
        // Bandwidth value is constant in octaves.
        self.chans[0]
            .filter
            .set_params_from_bandwidth(BiquadType::HighPass, f0norm, 1.0, 0.75);
        self.num_chans = slot.wet_channels.min(MAX_AMBI_CHANNELS);
        let (first, rest) = self.chans.split_at_mut(1);
        for chan in rest[..self.num_chans.saturating_sub(1)].iter_mut() {
            chan.filter.copy_params_from(&first[0].filter);
        }

        let chans = &mut self.chans;
        set_ambi_pan_identity(self.num_chans, |i, coeffs| {
            compute_pan_gains(&target.main.ambi_map, coeffs, slot.gain, &mut chans[i].target_gains);
        });
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let mut modsamples = [0.0f32; MAX_UPDATE_SAMPLES];
        let mut temps = [0.0f32; MAX_UPDATE_SAMPLES];

        let mut base = 0;
        while base < samples_to_do {
            let todo = MAX_UPDATE_SAMPLES.min(samples_to_do - base);

            self.generate(&mut modsamples[..todo]);
            self.index = self.index.wrapping_add(self.step.wrapping_mul(todo as u32)) & WAVEFORM_FRACMASK;

            for (chan, insamples) in self.chans[..self.num_chans].iter_mut().zip(input.iter()) {
                chan.filter
                    .process(&insamples[base..base + todo], &mut temps[..todo]);
                for (t, &m) in temps[..todo].iter_mut().zip(modsamples[..todo].iter()) {
                    *t *= m;
                }

                mix(
                    &temps[..todo],
                    output,
                    &mut chan.current_gains,
                    &chan.target_gains,
                    samples_to_do - base,
                    base,
                );
            }
            base += todo;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::test_util::device;

    #[test]
    fn waveforms_span_full_range() {
        assert_eq!(saw_wave(0), -1.0);
        assert!((saw_wave(WAVEFORM_FRACONE - 1) - 1.0).abs() < 1e-6);
        assert_eq!(square_wave(0), -1.0);
        assert_eq!(square_wave(WAVEFORM_FRACONE / 2), 1.0);
        assert!((sin_wave(WAVEFORM_FRACONE / 4) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_frequency_passes_filtered_input() {
        let dev = device(48000);
        let mut state = ModulatorState::new();
        state.device_update(&dev, None).unwrap();
        let main = crate::audio::MixParams::acn_identity(4);
        let slot = SlotParams {
            gain: 1.0,
            wet_channels: 4,
        };
        state.update(
            &dev,
            &slot,
            &EffectProps::RingModulator(ModulatorProps {
                frequency: 0.0,
                ..ModulatorProps::default()
            }),
            EffectTarget {
                main: &main,
                real_out: None,
            },
        );
        assert_eq!(state.waveform, Waveform::One);
        let mut buf = [0.0f32; 16];
        state.generate(&mut buf);
        assert!(buf.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn phase_advances_across_blocks() {
        let dev = device(48000);
        let mut state = ModulatorState::new();
        state.device_update(&dev, None).unwrap();
        let main = crate::audio::MixParams::acn_identity(4);
        let slot = SlotParams {
            gain: 1.0,
            wet_channels: 4,
        };
        state.update(
            &dev,
            &slot,
            &EffectProps::RingModulator(ModulatorProps::default()),
            EffectTarget {
                main: &main,
                real_out: None,
            },
        );
        let step = state.step;
        let wet = crate::audio::new_lines(4);
        let mut out = crate::audio::new_lines(4);
        state.process(300, &wet, &mut out);
        assert_eq!(state.index, step.wrapping_mul(300) & WAVEFORM_FRACMASK);
    }
}
