//! Chorus and flanger: two modulated taps on a shared delay line, panned
//! hard left and right, with feedback from the average tap delay.

use std::f32::consts::TAU;

use crate::ambisonic::{calc_direction_coeffs, compute_pan_gains};
use crate::audio::{cubic, Buffer, FloatBufferLine, MAX_OUTPUT_CHANNELS};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;
use crate::resampler::{MAX_RESAMPLER_PADDING, MIXER_FRAC_BITS, MIXER_FRAC_MASK, MIXER_FRAC_ONE};

use super::props::{CHORUS_MAX_DELAY, FLANGER_MAX_DELAY};
use super::{
    ChorusProps, ChorusWaveform, EffectProcessor, EffectProps, EffectTarget, OutTarget, SlotParams,
    MAX_UPDATE_SAMPLES,
};

/// Smallest modulated delay, in fixed point, that keeps the cubic taps
/// inside written history.
const MIN_DELAY: i32 = ((MAX_RESAMPLER_PADDING >> 1) << MIXER_FRAC_BITS) as i32;

#[derive(Clone, Copy)]
struct Gains {
    current: [f32; MAX_OUTPUT_CHANNELS],
    target: [f32; MAX_OUTPUT_CHANNELS],
}

impl Default for Gains {
    fn default() -> Self {
        Self {
            current: [0.0; MAX_OUTPUT_CHANNELS],
            target: [0.0; MAX_OUTPUT_CHANNELS],
        }
    }
}

pub struct ChorusState {
    sample_buffer: Vec<f32>,
    offset: u32,

    lfo_offset: u32,
    lfo_range: u32,
    lfo_scale: f32,
    lfo_disp: u32,

    mod_delays: [[u32; MAX_UPDATE_SAMPLES]; 2],
    temps: [[f32; MAX_UPDATE_SAMPLES]; 2],
    gains: [Gains; 2],

    waveform: ChorusWaveform,
    delay: i32,
    depth: f32,
    feedback: f32,
}

impl ChorusState {
    pub fn new() -> Self {
        Self {
            sample_buffer: Vec::new(),
            offset: 0,
            lfo_offset: 0,
            lfo_range: 1,
            lfo_scale: 0.0,
            lfo_disp: 0,
            mod_delays: [[0; MAX_UPDATE_SAMPLES]; 2],
            temps: [[0.0; MAX_UPDATE_SAMPLES]; 2],
            gains: [Gains::default(); 2],
            waveform: ChorusWaveform::Triangle,
            delay: 0,
            depth: 0.0,
            feedback: 0.0,
        }
    }

    fn fill_delays(&self, delays: &mut [u32], start_offset: u32) {
        let range = self.lfo_range.max(1);
        let scale = self.lfo_scale;
        let depth = self.depth;
        let delay = self.delay;
        let mut offset = start_offset;
        match self.waveform {
            ChorusWaveform::Triangle => {
                for d in delays.iter_mut() {
                    let norm = offset as f32 * scale;
                    *d = (((1.0 - (2.0 - norm).abs()) * depth).round() as i32 + delay) as u32;
                    offset = (offset + 1) % range;
                }
            }
            ChorusWaveform::Sinusoid => {
                for d in delays.iter_mut() {
                    let norm = offset as f32 * scale;
                    *d = ((norm.sin() * depth).round() as i32 + delay) as u32;
                    offset = (offset + 1) % range;
                }
            }
        }
    }
}

impl Default for ChorusState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for ChorusState {
    fn device_update(&mut self, device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        let max_delay = CHORUS_MAX_DELAY.max(FLANGER_MAX_DELAY);
        let frequency = device.frequency as f32;
        let maxlen = ((max_delay * 2.0 * frequency) as usize + 1).next_power_of_two();
        self.sample_buffer = vec![0.0; maxlen];
        self.offset = 0;
        for g in self.gains.iter_mut() {
            *g = Gains::default();
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
            EffectProps::Chorus(p) => *p,
            EffectProps::Flanger(p) => p.as_chorus(),
            _ => ChorusProps::default(),
        };
        let frequency = device.frequency as f32;

        // The depth is relative to the delay and both leave enough room
        // behind the write head for the interpolator.
        self.waveform = props.waveform;
        self.delay = ((props.delay * frequency * MIXER_FRAC_ONE as f32 + 0.5) as i32).max(MIN_DELAY);
        self.depth = (props.depth * self.delay as f32).min((self.delay - MIN_DELAY) as f32);
        self.feedback = props.feedback;

        let lcoeffs = calc_direction_coeffs([-1.0, 0.0, 0.0], 0.0);
        let rcoeffs = calc_direction_coeffs([1.0, 0.0, 0.0], 0.0);
        compute_pan_gains(&target.main.ambi_map, &lcoeffs, slot.gain, &mut self.gains[0].target);
        compute_pan_gains(&target.main.ambi_map, &rcoeffs, slot.gain, &mut self.gains[1].target);

        let rate = props.rate;
        if !(rate > 0.0) {
            self.lfo_offset = 0;
            self.lfo_range = 1;
            self.lfo_scale = 0.0;
            self.lfo_disp = 0;
        } else {
            // Samples per LFO cycle, limited so the phase displacement below
            // cannot overflow.
            let lfo_range = (frequency / rate + 0.5).min((i32::MAX / 360 - 180) as f32) as u32;
            let lfo_range = lfo_range.max(1);
            self.lfo_offset = (u64::from(self.lfo_offset) * u64::from(lfo_range)
                / u64::from(self.lfo_range.max(1))) as u32;
            self.lfo_range = lfo_range;
            self.lfo_scale = match self.waveform {
                ChorusWaveform::Triangle => 4.0 / lfo_range as f32,
                ChorusWaveform::Sinusoid => TAU / lfo_range as f32,
            };

            let phase = if props.phase < 0 {
                360 + props.phase
            } else {
                props.phase
            } as u32;
            self.lfo_disp = (lfo_range * phase + 180) / 360;
        }
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        if self.sample_buffer.is_empty() {
            return;
        }
        let Some(input) = input.first() else {
            return;
        };
        let bufmask = self.sample_buffer.len() as u32 - 1;
        let feedback = self.feedback;
        let avgdelay = (self.delay as u32 + (MIXER_FRAC_ONE >> 1)) >> MIXER_FRAC_BITS;
        let mut offset = self.offset;

        let mut base = 0;
        while base < samples_to_do {
            let todo = MAX_UPDATE_SAMPLES.min(samples_to_do - base);

            let mut delays = self.mod_delays;
            let range = self.lfo_range.max(1);
            self.fill_delays(&mut delays[0][..todo], self.lfo_offset);
            self.fill_delays(&mut delays[1][..todo], (self.lfo_offset + self.lfo_disp) % range);
            self.lfo_offset = (self.lfo_offset + todo as u32) % range;

            let buf = &mut self.sample_buffer;
            for i in 0..todo {
                // Write first so delays below one sample still read the input.
                buf[(offset & bufmask) as usize] = input[base + i];

                for (tap, temps) in self.temps.iter_mut().enumerate() {
                    let md = delays[tap][i];
                    let delay = offset.wrapping_sub(md >> MIXER_FRAC_BITS);
                    let mu = (md & MIXER_FRAC_MASK) as f32 * (1.0 / MIXER_FRAC_ONE as f32);
                    temps[i] = cubic(
                        buf[(delay.wrapping_add(1) & bufmask) as usize],
                        buf[(delay & bufmask) as usize],
                        buf[(delay.wrapping_sub(1) & bufmask) as usize],
                        buf[(delay.wrapping_sub(2) & bufmask) as usize],
                        mu,
                    );
                }

                let fb = buf[(offset.wrapping_sub(avgdelay) & bufmask) as usize] * feedback;
                buf[(offset & bufmask) as usize] += fb;
                offset = offset.wrapping_add(1);
            }
            self.mod_delays = delays;

            for (temps, gains) in self.temps.iter().zip(self.gains.iter_mut()) {
                mix(
                    &temps[..todo],
                    output,
                    &mut gains.current,
                    &gains.target,
                    samples_to_do - base,
                    base,
                );
            }
            base += todo;
        }
        self.offset = offset;
    }
}
