//! Routes the slot input straight to a single speaker: the front-centre
//! channel for dialogue, or the LFE channel for low-frequency effects.

use crate::ambisonic::{calc_direction_coeffs, compute_pan_gains};
use crate::audio::{Buffer, Channel, FloatBufferLine, MAX_OUTPUT_CHANNELS};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;

use super::{EffectProcessor, EffectProps, EffectTarget, OutTarget, SlotParams};

pub struct DedicatedState {
    current_gains: [f32; MAX_OUTPUT_CHANNELS],
    target_gains: [f32; MAX_OUTPUT_CHANNELS],
}

impl DedicatedState {
    pub fn new() -> Self {
        Self {
            current_gains: [0.0; MAX_OUTPUT_CHANNELS],
            target_gains: [0.0; MAX_OUTPUT_CHANNELS],
        }
    }
}

impl Default for DedicatedState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for DedicatedState {
    fn device_update(&mut self, _device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        self.current_gains.fill(0.0);
        Ok(())
    }

    fn update(
        &mut self,
        _device: &DeviceInfo,
        slot: &SlotParams,
        props: &EffectProps,
        target: EffectTarget<'_>,
    ) -> OutTarget {
        self.target_gains.fill(0.0);
        let (lfe, gain) = match props {
            EffectProps::DedicatedLfe(p) => (true, p.gain * slot.gain),
            EffectProps::DedicatedDialog(p) => (false, p.gain * slot.gain),
            _ => (false, slot.gain),
        };

        if lfe {
            if let Some(idx) = target.real_out.and_then(|r| r.index_of(Channel::Lfe)) {
                self.target_gains[idx] = gain;
            }
            return OutTarget::RealOut;
        }

        // Dialogue goes to a real centre speaker when there is one, otherwise
        // it is panned to the front.
        if let Some(idx) = target.real_out.and_then(|r| r.index_of(Channel::FrontCenter)) {
            self.target_gains[idx] = gain;
            return OutTarget::RealOut;
        }
        let coeffs = calc_direction_coeffs([0.0, 0.0, -1.0], 0.0);
        compute_pan_gains(&target.main.ambi_map, &coeffs, gain, &mut self.target_gains);
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        if let Some(line) = input.first() {
            mix(
                &line[..samples_to_do],
                output,
                &mut self.current_gains,
                &self.target_gains,
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
    use crate::effects::{DedicatedProps, EffectState};

    #[test]
    fn dialog_without_centre_speaker_pans_front() {
        let mut state = EffectState::Dedicated(DedicatedState::new());
        let props = EffectProps::DedicatedDialog(DedicatedProps { gain: 0.5 });
        let out = run_effect(&mut state, &props, &[1.0; 64], 48000);
        // W ramps from silence toward the gain over the block.
        let expected = 0.5 * 63.0 / 64.0;
        assert!((out[0][63] - expected).abs() < 1e-5, "{}", out[0][63]);
        assert_eq!(out[1][63], 0.0);
    }

    #[test]
    fn lfe_without_lfe_speaker_is_silent() {
        let mut state = EffectState::Dedicated(DedicatedState::new());
        let props = EffectProps::DedicatedLfe(DedicatedProps::default());
        let out = run_effect(&mut state, &props, &[1.0; 64], 48000);
        assert!(out.iter().all(|l| l.iter().all(|&s| s == 0.0)));
    }
}
