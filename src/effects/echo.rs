//! Two-tap echo. The second tap feeds back into the line through a
//! high-shelf cut, and the taps are spread symmetrically around the front.

use crate::ambisonic::{calc_angle_coeffs, compute_pan_gains};
use crate::audio::{Buffer, FloatBufferLine, BUFFER_LINE_SIZE, MAX_OUTPUT_CHANNELS};
use crate::biquad::{Biquad, BiquadType};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;

use super::props::{ECHO_MAX_DELAY, ECHO_MAX_LR_DELAY};
use super::{EchoProps, EffectProcessor, EffectProps, EffectTarget, OutTarget, SlotParams};

/// Reference frequency of the damping shelf.
const LOWPASS_FREQ_REF: f32 = 5000.0;

pub struct EchoState {
    sample_buffer: Vec<f32>,
    /// Tap delays in samples; the first is never zero.
    tap: [usize; 2],
    offset: usize,

    current_gains: [[f32; MAX_OUTPUT_CHANNELS]; 2],
    target_gains: [[f32; MAX_OUTPUT_CHANNELS]; 2],

    filter: Biquad,
    feed_gain: f32,

    temp: Box<[FloatBufferLine; 2]>,
}

impl EchoState {
    pub fn new() -> Self {
        Self {
            sample_buffer: Vec::new(),
            tap: [1, 1],
            offset: 0,
            current_gains: [[0.0; MAX_OUTPUT_CHANNELS]; 2],
            target_gains: [[0.0; MAX_OUTPUT_CHANNELS]; 2],
            filter: Biquad::new(),
            feed_gain: 0.0,
            temp: Box::new([[0.0; BUFFER_LINE_SIZE]; 2]),
        }
    }
}

impl Default for EchoState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for EchoState {
    fn device_update(&mut self, device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        let frequency = device.frequency as f32;
        let maxlen = (((ECHO_MAX_DELAY * frequency + 0.5) as usize)
            + ((ECHO_MAX_LR_DELAY * frequency + 0.5) as usize))
            .next_power_of_two();
        self.sample_buffer = vec![0.0; maxlen];
        self.offset = 0;
        self.filter.clear();
        self.current_gains = [[0.0; MAX_OUTPUT_CHANNELS]; 2];
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
            EffectProps::Echo(p) => *p,
            _ => EchoProps::default(),
        };
        let frequency = device.frequency as f32;

        self.tap[0] = ((props.delay * frequency + 0.5) as usize).max(1);
        self.tap[1] = (props.lr_delay * frequency + 0.5) as usize + self.tap[0];

        // Damping is limited to -24dB.
        let gainhf = (1.0 - props.damping).max(0.0625);
        self.filter
            .set_params_from_slope(BiquadType::HighShelf, LOWPASS_FREQ_REF / frequency, gainhf, 1.0);
        self.feed_gain = props.feedback;

        // Spread 0 is centred, +/-1 is the sides.
        let angle = props.spread.asin();
        let coeffs0 = calc_angle_coeffs(-angle, 0.0, 0.0);
        let coeffs1 = calc_angle_coeffs(angle, 0.0, 0.0);
        compute_pan_gains(&target.main.ambi_map, &coeffs0, slot.gain, &mut self.target_gains[0]);
        compute_pan_gains(&target.main.ambi_map, &coeffs1, slot.gain, &mut self.target_gains[1]);
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let len = self.sample_buffer.len();
        let Some(input) = input.first() else {
            return;
        };
        if len == 0 {
            return;
        }
        let mask = len - 1;
        let buf = &mut self.sample_buffer;
        let mut offset = self.offset;
        let mut tap1 = offset.wrapping_sub(self.tap[0]);
        let mut tap2 = offset.wrapping_sub(self.tap[1]);

        let [temp0, temp1] = &mut *self.temp;
        for i in 0..samples_to_do {
            offset &= mask;
            tap1 &= mask;
            tap2 &= mask;

            buf[offset] = input[i];
            temp0[i] = buf[tap1];
            temp1[i] = buf[tap2];
            // The second tap is the feedback source.
            buf[offset] += self.filter.process_one(temp1[i]) * self.feed_gain;

            offset += 1;
            tap1 += 1;
            tap2 += 1;
        }
        self.offset = offset & mask;

        for (c, temp) in self.temp.iter().enumerate() {
            mix(
                &temp[..samples_to_do],
                output,
                &mut self.current_gains[c],
                &self.target_gains[c],
                samples_to_do,
                0,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::test_util::run_effect;
    use crate::effects::EffectState;

    #[test]
    fn taps_land_at_configured_delays() {
        let mut state = EffectState::Echo(Box::new(EchoState::new()));
        let props = EffectProps::Echo(EchoProps {
            delay: 0.005,
            lr_delay: 0.002,
            feedback: 0.0,
            spread: 0.0,
            ..EchoProps::default()
        });
        let mut input = vec![0.0f32; 1024];
        input[0] = 1.0;
        let out = run_effect(&mut state, &props, &input, 48000);
        let nonzero: Vec<usize> = (0..1024).filter(|&i| out[0][i] != 0.0).collect();
        assert_eq!(nonzero, vec![240, 336]);
    }

    #[test]
    fn feedback_repeats_the_second_tap() {
        let mut state = EffectState::Echo(Box::new(EchoState::new()));
        let props = EffectProps::Echo(EchoProps {
            delay: 0.002,
            lr_delay: 0.0,
            feedback: 0.25,
            damping: 0.0,
            spread: 0.0,
        });
        let mut input = vec![0.0f32; 1024];
        input[0] = 1.0;
        let out = run_effect(&mut state, &props, &input, 48000);
        // Both taps coincide at 96 samples; the echo of the echo is at 192.
        assert!(out[0][96] > 0.0);
        assert!(out[0][192] > 0.0);
        assert!(out[0][192] < out[0][96]);
    }
}
