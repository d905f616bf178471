//! Automatic gain control: a slow envelope on the W channel drives an
//! inverse gain applied to every wet channel.

use crate::ambisonic::{compute_pan_gains, MAX_AMBI_CHANNELS};
use crate::audio::{Buffer, FloatBufferLine, GAIN_SILENCE_THRESHOLD, MAX_OUTPUT_CHANNELS};
use crate::device::DeviceInfo;
use crate::error::Result;

use super::{
    set_ambi_pan_identity, CompressorProps, EffectProcessor, EffectProps, EffectTarget, OutTarget,
    SlotParams, MAX_UPDATE_SAMPLES,
};

const AMP_ENVELOPE_MIN: f32 = 0.5;
const AMP_ENVELOPE_MAX: f32 = 2.0;

const ATTACK_TIME: f32 = 0.1;
const RELEASE_TIME: f32 = 0.2;

pub struct CompressorState {
    gains: [[f32; MAX_OUTPUT_CHANNELS]; MAX_AMBI_CHANNELS],
    num_chans: usize,

    enabled: bool,
    attack_mult: f32,
    release_mult: f32,
    env_follower: f32,
}

impl CompressorState {
    pub fn new() -> Self {
        Self {
            gains: [[0.0; MAX_OUTPUT_CHANNELS]; MAX_AMBI_CHANNELS],
            num_chans: 0,
            enabled: true,
            attack_mult: 1.0,
            release_mult: 1.0,
            env_follower: 1.0,
        }
    }
}

impl Default for CompressorState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for CompressorState {
    fn device_update(&mut self, device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        // Multipliers that move the envelope across its whole range in the
        // attack or release time.
        let frequency = device.frequency as f32;
        let attack_count = frequency * ATTACK_TIME;
        let release_count = frequency * RELEASE_TIME;

        self.attack_mult = (AMP_ENVELOPE_MAX / AMP_ENVELOPE_MIN).powf(1.0 / attack_count);
        self.release_mult = (AMP_ENVELOPE_MIN / AMP_ENVELOPE_MAX).powf(1.0 / release_count);
        self.env_follower = 1.0;
        Ok(())
    }

    fn update(
        &mut self,
        _device: &DeviceInfo,
        slot: &SlotParams,
        props: &EffectProps,
        target: EffectTarget<'_>,
    ) -> OutTarget {
        let props = match props {
            EffectProps::Compressor(p) => *p,
            _ => CompressorProps::default(),
        };
        self.enabled = props.on;

        self.num_chans = slot.wet_channels.min(MAX_AMBI_CHANNELS);
        let gains = &mut self.gains;
        set_ambi_pan_identity(self.num_chans, |i, coeffs| {
            compute_pan_gains(&target.main.ambi_map, coeffs, slot.gain, &mut gains[i]);
        });
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let Some(first) = input.first() else {
            return;
        };
        let mut gains = [0.0f32; MAX_UPDATE_SAMPLES];

        let mut base = 0;
        while base < samples_to_do {
            let todo = MAX_UPDATE_SAMPLES.min(samples_to_do - base);

            let attack = self.attack_mult;
            let release = self.release_mult;
            let mut env = self.env_follower;
            for (gain, &sample) in gains[..todo].iter_mut().zip(&first[base..base + todo]) {
                let amplitude = if self.enabled {
                    sample.abs().clamp(AMP_ENVELOPE_MIN, AMP_ENVELOPE_MAX)
                } else {
                    1.0
                };
                if amplitude > env {
                    env = (env * attack).min(amplitude);
                } else if amplitude < env {
                    env = (env * release).max(amplitude);
                }
                // Normalize the envelope back to unity.
                *gain = 1.0 / env;
            }
            self.env_follower = env;

            for (insamples, chan_gains) in input.iter().zip(self.gains[..self.num_chans].iter()) {
                for (out, &gain) in output.iter_mut().zip(chan_gains.iter()) {
                    if !(gain.abs() > GAIN_SILENCE_THRESHOLD) {
                        continue;
                    }
                    for i in 0..todo {
                        out[base + i] += insamples[base + i] * gains[i] * gain;
                    }
                }
            }
            base += todo;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::test_util::run_effect;
    use crate::effects::EffectState;

    #[test]
    fn loud_input_is_pulled_down() {
        let mut state = EffectState::Compressor(Box::new(CompressorState::new()));
        let props = EffectProps::Compressor(CompressorProps { on: true });
        let input = vec![1.8f32; 1024];
        let out = run_effect(&mut state, &props, &input, 8000);
        // The first sample is near the unity envelope; later samples approach
        // an output of 1.
        assert!(out[0][0] > 1.7);
        assert!(out[0][1023] < out[0][0]);
        assert!(out[0][1023] >= 1.0 - 1e-4);
    }

    #[test]
    fn disabled_compressor_is_transparent() {
        let mut state = EffectState::Compressor(Box::new(CompressorState::new()));
        let props = EffectProps::Compressor(CompressorProps { on: false });
        let input: Vec<f32> = (0..512).map(|i| (i as f32 * 0.01).sin() * 1.5).collect();
        let out = run_effect(&mut state, &props, &input, 48000);
        for i in 0..512 {
            assert!((out[0][i] - input[i]).abs() < 1e-6);
        }
    }
}
