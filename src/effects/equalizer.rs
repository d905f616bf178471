//! Four-band equalizer: a low shelf, two peaking mids and a high shelf on
//! every wet channel.
//!
//! ```text
//!  gain ^
//!       |  low          mid1        mid2         high
//!       |_____                                  ______
//!       |     \        /\          /\          /
//!       |      \______/  \________/  \________/
//!       +------------------------------------------> freq
//! ```

use crate::ambisonic::{compute_pan_gains, MAX_AMBI_CHANNELS};
use crate::audio::{Buffer, FloatBufferLine, BUFFER_LINE_SIZE, MAX_OUTPUT_CHANNELS};
use crate::biquad::{Biquad, BiquadType};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;

use super::{
    set_ambi_pan_identity, EffectProcessor, EffectProps, EffectTarget, EqualizerProps, OutTarget,
    SlotParams,
};

#[derive(Clone, Copy)]
struct Channel {
    filters: [Biquad; 4],
    current_gains: [f32; MAX_OUTPUT_CHANNELS],
    target_gains: [f32; MAX_OUTPUT_CHANNELS],
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            filters: [Biquad::new(); 4],
            current_gains: [0.0; MAX_OUTPUT_CHANNELS],
            target_gains: [0.0; MAX_OUTPUT_CHANNELS],
        }
    }
}

pub struct EqualizerState {
    chans: [Channel; MAX_AMBI_CHANNELS],
    num_chans: usize,
    sample_buffer: Box<FloatBufferLine>,
}

impl EqualizerState {
    pub fn new() -> Self {
        Self {
            chans: [Channel::default(); MAX_AMBI_CHANNELS],
            num_chans: 0,
            sample_buffer: Box::new([0.0; BUFFER_LINE_SIZE]),
        }
    }
}

impl Default for EqualizerState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for EqualizerState {
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
            EffectProps::Equalizer(p) => *p,
            _ => EqualizerProps::default(),
        };
        let frequency = device.frequency as f32;

        // Band gains are amplitude; the shelf and peaking formulas take the
        // square root.
        let gain = props.low_gain.sqrt().max(0.0625);
        let f0norm = props.low_cutoff / frequency;
        let mut filters = [Biquad::new(); 4];
        filters[0].set_params_from_slope(BiquadType::LowShelf, f0norm, gain, 0.75);

        let gain = props.mid1_gain.sqrt().max(0.0625);
        let f0norm = props.mid1_center / frequency;
        filters[1].set_params_from_bandwidth(BiquadType::Peaking, f0norm, gain, props.mid1_width);

        let gain = props.mid2_gain.sqrt().max(0.0625);
        let f0norm = props.mid2_center / frequency;
        filters[2].set_params_from_bandwidth(BiquadType::Peaking, f0norm, gain, props.mid2_width);

        let gain = props.high_gain.sqrt().max(0.0625);
        let f0norm = props.high_cutoff / frequency;
        filters[3].set_params_from_slope(BiquadType::HighShelf, f0norm, gain, 0.75);

        self.num_chans = slot.wet_channels.min(MAX_AMBI_CHANNELS);
        for chan in self.chans[..self.num_chans].iter_mut() {
            for (dst, src) in chan.filters.iter_mut().zip(filters.iter()) {
                dst.copy_params_from(src);
            }
        }

        let chans = &mut self.chans;
        set_ambi_pan_identity(self.num_chans, |i, coeffs| {
            compute_pan_gains(&target.main.ambi_map, coeffs, slot.gain, &mut chans[i].target_gains);
        });
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let buffer = &mut self.sample_buffer[..samples_to_do];
        for (chan, input) in self.chans[..self.num_chans].iter_mut().zip(input.iter()) {
            let [f0, f1, f2, f3] = &mut chan.filters;
            f0.dual_process(f1, &input[..samples_to_do], buffer);
            f2.dual_process_in_place(f3, buffer);

            mix(
                buffer,
                output,
                &mut chan.current_gains,
                &chan.target_gains,
                samples_to_do,
                0,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::test_util::{rms, run_effect};
    use crate::effects::EffectState;

    fn tone(freq: f32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (i as f32 * std::f32::consts::TAU * freq / 48000.0).sin() * 0.5)
            .collect()
    }

    #[test]
    fn flat_settings_pass_the_signal() {
        let mut state = EffectState::Equalizer(Box::new(EqualizerState::new()));
        let props = EffectProps::Equalizer(EqualizerProps {
            low_gain: 1.0,
            mid1_gain: 1.0,
            mid2_gain: 1.0,
            high_gain: 1.0,
            ..EqualizerProps::default()
        });
        let input = tone(1000.0, 1024);
        let out = run_effect(&mut state, &props, &input, 48000);
        // Pan gains ramp in over the whole block.
        for i in 0..1024 {
            let expected = input[i] * i as f32 / 1024.0;
            assert!((out[0][i] - expected).abs() < 1e-3, "{} vs {}", out[0][i], expected);
        }
    }

    #[test]
    fn low_shelf_cut_attenuates_bass() {
        let mut state = EffectState::Equalizer(Box::new(EqualizerState::new()));
        let props = EffectProps::Equalizer(EqualizerProps {
            low_gain: 0.126,
            mid1_gain: 1.0,
            mid2_gain: 1.0,
            high_gain: 1.0,
            ..EqualizerProps::default()
        });
        let input = tone(50.0, 1024);
        let out = run_effect(&mut state, &props, &input, 48000);
        assert!(rms(&out[0][512..]) < rms(&input[512..]) * 0.6);
    }
}
