//! Tube-style distortion run at 4x oversampling.

use std::f32::consts::FRAC_PI_2;

use crate::ambisonic::{calc_direction_coeffs, compute_pan_gains};
use crate::audio::{Buffer, FloatBufferLine, BUFFER_LINE_SIZE, GAIN_SILENCE_THRESHOLD, MAX_OUTPUT_CHANNELS};
use crate::biquad::{Biquad, BiquadType};
use crate::device::DeviceInfo;
use crate::error::Result;

use super::{DistortionProps, EffectProcessor, EffectProps, EffectTarget, OutTarget, SlotParams};

const OVERSAMPLE: usize = 4;

pub struct DistortionState {
    gain: [f32; MAX_OUTPUT_CHANNELS],

    lowpass: Biquad,
    bandpass: Biquad,
    edge_coeff: f32,

    buffer: Box<[FloatBufferLine; 2]>,
}

impl DistortionState {
    pub fn new() -> Self {
        Self {
            gain: [0.0; MAX_OUTPUT_CHANNELS],
            lowpass: Biquad::new(),
            bandpass: Biquad::new(),
            edge_coeff: 0.0,
            buffer: Box::new([[0.0; BUFFER_LINE_SIZE]; 2]),
        }
    }
}

impl Default for DistortionState {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn shape(fc: f32, smp: f32) -> f32 {
    (1.0 + fc) * smp / (1.0 + fc * smp.abs())
}

impl EffectProcessor for DistortionState {
    fn device_update(&mut self, _device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        self.lowpass.clear();
        self.bandpass.clear();
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
            EffectProps::Distortion(p) => *p,
            _ => DistortionProps::default(),
        };

        let edge = (FRAC_PI_2 * props.edge).sin().min(0.99);
        self.edge_coeff = 2.0 * edge / (1.0 - edge);

        // Filter frequencies are relative to the oversampled rate.
        let frequency = device.frequency as f32;
        let cutoff = props.lowpass_cutoff;
        let bandwidth = (cutoff / 2.0) / (cutoff * 0.67);
        self.lowpass.set_params_from_bandwidth(
            BiquadType::LowPass,
            cutoff / frequency / OVERSAMPLE as f32,
            1.0,
            bandwidth,
        );

        let center = props.eq_center;
        let bandwidth = props.eq_bandwidth / (center * 0.67);
        self.bandpass.set_params_from_bandwidth(
            BiquadType::BandPass,
            center / frequency / OVERSAMPLE as f32,
            1.0,
            bandwidth,
        );

        let coeffs = calc_direction_coeffs([0.0, 0.0, -1.0], 0.0);
        compute_pan_gains(&target.main.ambi_map, &coeffs, slot.gain * props.gain, &mut self.gain);
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let Some(input) = input.first() else {
            return;
        };
        let fc = self.edge_coeff;
        let [buf0, buf1] = &mut *self.buffer;

        let mut base = 0;
        while base < samples_to_do {
            let todo = BUFFER_LINE_SIZE.min((samples_to_do - base) * OVERSAMPLE);

            // Zero-stuff, scaling up to keep the signal power.
            for (i, s) in buf0[..todo].iter_mut().enumerate() {
                *s = if i % OVERSAMPLE == 0 {
                    input[i / OVERSAMPLE + base] * OVERSAMPLE as f32
                } else {
                    0.0
                };
            }

            // The lowpass both removes the stuffing images and band-limits
            // the signal ahead of the shaper.
            self.lowpass.process(&buf0[..todo], &mut buf1[..todo]);

            for (dst, &src) in buf0[..todo].iter_mut().zip(buf1[..todo].iter()) {
                let smp = shape(fc, src);
                let smp = -shape(fc, smp);
                *dst = shape(fc, smp);
            }

            self.bandpass.process(&buf0[..todo], &mut buf1[..todo]);

            let todo = todo / OVERSAMPLE;
            for (out, &gain) in output.iter_mut().zip(self.gain.iter()) {
                if !(gain.abs() > GAIN_SILENCE_THRESHOLD) {
                    continue;
                }
                for i in 0..todo {
                    out[base + i] += gain * buf1[i * OVERSAMPLE];
                }
            }
            base += todo;
        }
    }
}
