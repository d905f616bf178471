//! Envelope-following resonant peaking filter.

use std::f32::consts::TAU;

use crate::ambisonic::{compute_pan_gains, MAX_AMBI_CHANNELS};
use crate::audio::{lerpf, Buffer, FloatBufferLine, MAX_OUTPUT_CHANNELS};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;

use super::{
    set_ambi_pan_identity, AutowahProps, EffectProcessor, EffectProps, EffectTarget, OutTarget,
    SlotParams, MAX_UPDATE_SAMPLES,
};

const GAIN_SCALE: f32 = 31621.0;
const MIN_FREQ: f32 = 20.0;
const MAX_FREQ: f32 = 2500.0;
const Q_FACTOR: f32 = 5.0;

#[derive(Clone, Copy, Default)]
struct FilterParams {
    cos_w0: f32,
    alpha: f32,
}

#[derive(Clone, Copy)]
struct Channel {
    z1: f32,
    z2: f32,
    current_gains: [f32; MAX_OUTPUT_CHANNELS],
    target_gains: [f32; MAX_OUTPUT_CHANNELS],
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            z1: 0.0,
            z2: 0.0,
            current_gains: [0.0; MAX_OUTPUT_CHANNELS],
            target_gains: [0.0; MAX_OUTPUT_CHANNELS],
        }
    }
}

pub struct AutowahState {
    attack_rate: f32,
    release_rate: f32,
    resonance_gain: f32,
    peak_gain: f32,
    freq_min_norm: f32,
    bandwidth_norm: f32,
    env_delay: f32,

    env: [FilterParams; MAX_UPDATE_SAMPLES],
    chans: [Channel; MAX_AMBI_CHANNELS],
    num_chans: usize,

    buffer_out: [f32; MAX_UPDATE_SAMPLES],
}

impl AutowahState {
    pub fn new() -> Self {
        Self {
            attack_rate: 1.0,
            release_rate: 1.0,
            resonance_gain: 10.0,
            peak_gain: 4.5,
            freq_min_norm: 4.5e-4,
            bandwidth_norm: 0.05,
            env_delay: 0.0,
            env: [FilterParams::default(); MAX_UPDATE_SAMPLES],
            chans: [Channel::default(); MAX_AMBI_CHANNELS],
            num_chans: 0,
            buffer_out: [0.0; MAX_UPDATE_SAMPLES],
        }
    }

    fn follow_envelope(&mut self, input: &[f32]) {
        let mut env_delay = self.env_delay;
        for (params, &sample) in self.env.iter_mut().zip(input) {
            let s = self.peak_gain * sample.abs();
            let a = if s > env_delay {
                self.attack_rate
            } else {
                self.release_rate
            };
            env_delay = lerpf(s, env_delay, a);

            let w0 = (self.bandwidth_norm * env_delay + self.freq_min_norm).min(0.46) * TAU;
            params.cos_w0 = w0.cos();
            params.alpha = w0.sin() / (2.0 * Q_FACTOR);
        }
        self.env_delay = env_delay;
    }
}

impl Default for AutowahState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for AutowahState {
    fn device_update(&mut self, _device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        *self = Self::new();
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
            EffectProps::Autowah(p) => *p,
            _ => AutowahProps::default(),
        };
        let frequency = device.frequency as f32;

        let release_time = props.release_time.clamp(0.001, 1.0);
        self.attack_rate = (-1.0 / (props.attack_time * frequency)).exp();
        self.release_rate = (-1.0 / (release_time * frequency)).exp();
        // 0-20dB resonance peak gain
        self.resonance_gain = (props.resonance.log10() * 10.0 / 3.0).sqrt();
        self.peak_gain = 1.0 - (props.peak_gain / GAIN_SCALE).log10();
        self.freq_min_norm = MIN_FREQ / frequency;
        self.bandwidth_norm = (MAX_FREQ - MIN_FREQ) / frequency;

        self.num_chans = slot.wet_channels.min(MAX_AMBI_CHANNELS);
        let chans = &mut self.chans;
        set_ambi_pan_identity(self.num_chans, |i, coeffs| {
            compute_pan_gains(&target.main.ambi_map, coeffs, slot.gain, &mut chans[i].target_gains);
        });
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let Some(first) = input.first() else {
            return;
        };
        let res_gain = self.resonance_gain;

        let mut base = 0;
        while base < samples_to_do {
            let todo = MAX_UPDATE_SAMPLES.min(samples_to_do - base);
            // The envelope follows the W channel only.
            self.follow_envelope(&first[base..base + todo]);

            for (chan, insamples) in self.chans[..self.num_chans].iter_mut().zip(input.iter()) {
                let mut z1 = chan.z1;
                let mut z2 = chan.z2;
                for i in 0..todo {
                    let alpha = self.env[i].alpha;
                    let cos_w0 = self.env[i].cos_w0;

                    let b0 = 1.0 + alpha * res_gain;
                    let b1 = -2.0 * cos_w0;
                    let b2 = 1.0 - alpha * res_gain;
                    let a0 = 1.0 + alpha / res_gain;
                    let a1 = -2.0 * cos_w0;
                    let a2 = 1.0 - alpha / res_gain;

                    let smp = insamples[base + i];
                    let out = smp * (b0 / a0) + z1;
                    z1 = smp * (b1 / a0) - out * (a1 / a0) + z2;
                    z2 = smp * (b2 / a0) - out * (a2 / a0);
                    self.buffer_out[i] = out;
                }
                chan.z1 = z1;
                chan.z2 = z2;

                mix(
                    &self.buffer_out[..todo],
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
