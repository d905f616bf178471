//! Convolution mixers for binaural output.
//!
//! Input samples are read from a staging buffer that starts with
//! `HRTF_HISTORY_LENGTH` samples of history, so a per-ear delay can reach back
//! into the previous block. The convolution result accumulates into a
//! stereo buffer of `BUFFER_LINE_SIZE + HRIR_LENGTH` frames whose tail carries
//! over into the next block.

use crate::audio::{FloatBufferLine, GAIN_SILENCE_THRESHOLD};
use crate::biquad::BandSplitter;
use crate::hrtf::{HrirArray, HrtfFilter, HRIR_LENGTH, HRTF_HISTORY_LENGTH};

/// Coefficients and gain ramp for one mixing pass.
pub struct MixHrtfFilter<'a> {
    pub coeffs: &'a HrirArray,
    pub delay: [u32; 2],
    pub gain: f32,
    pub gain_step: f32,
}

#[inline(always)]
fn apply_coeffs(values: &mut [[f32; 2]], ir_size: usize, coeffs: &HrirArray, left: f32, right: f32) {
    for (value, coeff) in values[..ir_size].iter_mut().zip(&coeffs[..ir_size]) {
        value[0] += coeff[0] * left;
        value[1] += coeff[1] * right;
    }
}

/// Steady-state mix: fixed coefficients with an interpolated gain.
pub fn mix_hrtf(
    input: &[f32],
    accum: &mut [[f32; 2]],
    ir_size: usize,
    params: &MixHrtfFilter<'_>,
    buffer_size: usize,
) {
    let mut ldelay = HRTF_HISTORY_LENGTH - params.delay[0] as usize;
    let mut rdelay = HRTF_HISTORY_LENGTH - params.delay[1] as usize;
    let mut stepcount = 0.0f32;
    for i in 0..buffer_size {
        let g = params.gain + params.gain_step * stepcount;
        let left = input[ldelay] * g;
        let right = input[rdelay] * g;
        ldelay += 1;
        rdelay += 1;
        apply_coeffs(&mut accum[i..], ir_size, params.coeffs, left, right);
        stepcount += 1.0;
    }
}

/// Cross-fade mix: the old set fades out while the new set fades in, both
/// over `buffer_size` samples.
pub fn mix_hrtf_blend(
    input: &[f32],
    accum: &mut [[f32; 2]],
    ir_size: usize,
    old: &HrtfFilter,
    new: &MixHrtfFilter<'_>,
    buffer_size: usize,
) {
    let old_gain_step = old.gain / buffer_size as f32;
    let new_gain_step = new.gain_step;

    if old.gain > GAIN_SILENCE_THRESHOLD {
        let mut ldelay = HRTF_HISTORY_LENGTH - old.delay[0] as usize;
        let mut rdelay = HRTF_HISTORY_LENGTH - old.delay[1] as usize;
        let mut stepcount = buffer_size as f32;
        for i in 0..buffer_size {
            let g = old_gain_step * stepcount;
            let left = input[ldelay] * g;
            let right = input[rdelay] * g;
            ldelay += 1;
            rdelay += 1;
            apply_coeffs(&mut accum[i..], ir_size, &old.coeffs, left, right);
            stepcount -= 1.0;
        }
    }

    if new_gain_step * buffer_size as f32 > GAIN_SILENCE_THRESHOLD {
        let mut ldelay = HRTF_HISTORY_LENGTH + 1 - new.delay[0] as usize;
        let mut rdelay = HRTF_HISTORY_LENGTH + 1 - new.delay[1] as usize;
        let mut stepcount = 1.0f32;
        for i in 1..buffer_size {
            let g = new_gain_step * stepcount;
            let left = input[ldelay] * g;
            let right = input[rdelay] * g;
            ldelay += 1;
            rdelay += 1;
            apply_coeffs(&mut accum[i..], ir_size, new.coeffs, left, right);
            stepcount += 1.0;
        }
    }
}

/// Per-ambisonic-channel decoding state for direct HRTF output.
#[derive(Clone)]
pub struct HrtfChannelState {
    pub splitter: BandSplitter,
    pub hf_scale: f32,
    pub coeffs: HrirArray,
}

impl Default for HrtfChannelState {
    fn default() -> Self {
        Self {
            splitter: BandSplitter::default(),
            hf_scale: 1.0,
            coeffs: [[0.0; 2]; HRIR_LENGTH],
        }
    }
}

/// Decodes the ambisonic dry bus to binaural and adds the result, together
/// with anything the voices already accumulated, into `left` and `right`.
/// The accumulation tail is shifted down for the next block.
#[allow(clippy::too_many_arguments)]
pub fn mix_direct_hrtf(
    left: &mut [f32],
    right: &mut [f32],
    input: &[FloatBufferLine],
    accum: &mut [[f32; 2]],
    temp: &mut [f32],
    chan_state: &mut [HrtfChannelState],
    ir_size: usize,
    buffer_size: usize,
) {
    for (line, state) in input.iter().zip(chan_state.iter_mut()) {
        let temp = &mut temp[..buffer_size];
        temp.copy_from_slice(&line[..buffer_size]);
        state.splitter.process_hf_scale(temp, state.hf_scale);

        for (i, &insample) in temp.iter().enumerate() {
            apply_coeffs(&mut accum[i..], ir_size, &state.coeffs, insample, insample);
        }
    }

    for (out, acc) in left[..buffer_size].iter_mut().zip(accum.iter()) {
        *out += acc[0];
    }
    for (out, acc) in right[..buffer_size].iter_mut().zip(accum.iter()) {
        *out += acc[1];
    }

    accum.copy_within(buffer_size..buffer_size + HRIR_LENGTH, 0);
    accum[HRIR_LENGTH..HRIR_LENGTH + buffer_size].fill([0.0; 2]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::BUFFER_LINE_SIZE;

    fn unit_ir() -> HrirArray {
        let mut ir = [[0.0f32; 2]; HRIR_LENGTH];
        ir[0] = [1.0, 0.5];
        ir
    }

    #[test]
    fn steady_mix_applies_delay_and_gain() {
        let mut input = vec![0.0f32; HRTF_HISTORY_LENGTH + 64];
        input[HRTF_HISTORY_LENGTH] = 1.0;
        let mut accum = vec![[0.0f32; 2]; BUFFER_LINE_SIZE + HRIR_LENGTH];
        let ir = unit_ir();
        let params = MixHrtfFilter {
            coeffs: &ir,
            delay: [0, 3],
            gain: 2.0,
            gain_step: 0.0,
        };
        mix_hrtf(&input, &mut accum, 8, &params, 64);
        assert_eq!(accum[0][0], 2.0);
        assert_eq!(accum[0][1], 0.0);
        assert_eq!(accum[3][1], 1.0);
    }

    #[test]
    fn blend_gains_sum_to_target() {
        // A constant input with identical old and new sets must come out at
        // a constant level while the gains cross.
        let n = 32;
        let input = vec![1.0f32; HRTF_HISTORY_LENGTH + n];
        let ir = unit_ir();
        let old = HrtfFilter {
            coeffs: ir,
            delay: [0, 0],
            gain: 1.0,
        };
        let new = MixHrtfFilter {
            coeffs: &ir,
            delay: [0, 0],
            gain: 0.0,
            gain_step: 1.0 / n as f32,
        };
        let mut accum = vec![[0.0f32; 2]; BUFFER_LINE_SIZE + HRIR_LENGTH];
        mix_hrtf_blend(&input, &mut accum, 8, &old, &new, n);
        for (i, frame) in accum.iter().take(n).enumerate() {
            assert!((frame[0] - 1.0).abs() < 1e-5, "frame {} left {}", i, frame[0]);
        }
    }

    #[test]
    fn blend_hands_over_from_old_set_to_new_set() {
        // Old set feeds only the left ear, new set only the right ear with a
        // two sample delay. The next steady block carries on from the blend.
        let n = 32;
        let input = vec![1.0f32; HRTF_HISTORY_LENGTH + 2 * n];
        let mut left_only = [[0.0f32; 2]; HRIR_LENGTH];
        left_only[0] = [1.0, 0.0];
        let mut right_only = [[0.0f32; 2]; HRIR_LENGTH];
        right_only[0] = [0.0, 1.0];
        let old = HrtfFilter {
            coeffs: left_only,
            delay: [0, 0],
            gain: 1.0,
        };
        let new = MixHrtfFilter {
            coeffs: &right_only,
            delay: [0, 2],
            gain: 0.0,
            gain_step: 1.0 / n as f32,
        };
        let mut accum = vec![[0.0f32; 2]; 2 * n + HRIR_LENGTH];
        mix_hrtf_blend(&input, &mut accum, 8, &old, &new, n);
        let steady = MixHrtfFilter {
            coeffs: &right_only,
            delay: [0, 2],
            gain: 1.0,
            gain_step: 0.0,
        };
        mix_hrtf(&input[n..], &mut accum[n..], 8, &steady, n);

        for (i, frame) in accum.iter().take(2 * n).enumerate() {
            let fading_out = (n as f32 - i as f32).max(0.0) / n as f32;
            let fading_in = (i as f32 / n as f32).min(1.0);
            assert!((frame[0] - fading_out).abs() < 1e-6, "frame {} left {}", i, frame[0]);
            assert!((frame[1] - fading_in).abs() < 1e-6, "frame {} right {}", i, frame[1]);
        }
    }

    #[test]
    fn blend_reads_each_set_at_its_own_delay() {
        let n = 32;
        let mut input = vec![0.0f32; HRTF_HISTORY_LENGTH + n];
        input[HRTF_HISTORY_LENGTH + 10] = 1.0;
        let mut left_only = [[0.0f32; 2]; HRIR_LENGTH];
        left_only[0] = [1.0, 0.0];
        let mut right_only = [[0.0f32; 2]; HRIR_LENGTH];
        right_only[0] = [0.0, 1.0];
        let old = HrtfFilter {
            coeffs: left_only,
            delay: [0, 0],
            gain: 1.0,
        };
        let new = MixHrtfFilter {
            coeffs: &right_only,
            delay: [0, 2],
            gain: 0.0,
            gain_step: 1.0 / n as f32,
        };
        let mut accum = vec![[0.0f32; 2]; BUFFER_LINE_SIZE + HRIR_LENGTH];
        mix_hrtf_blend(&input, &mut accum, 8, &old, &new, n);

        assert!((accum[10][0] - 22.0 / 32.0).abs() < 1e-6);
        assert!((accum[12][1] - 12.0 / 32.0).abs() < 1e-6);
        let others = accum
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != 10 && i != 12)
            .all(|(_, f)| f[0] == 0.0 && f[1] == 0.0);
        assert!(others);
        assert_eq!(accum[10][1], 0.0);
        assert_eq!(accum[12][0], 0.0);
    }

    #[test]
    fn direct_mix_shifts_accumulation_tail() {
        let mut accum = vec![[0.0f32; 2]; BUFFER_LINE_SIZE + HRIR_LENGTH];
        accum[10] = [1.0, 2.0];
        accum[20] = [3.0, 4.0];
        let mut left = vec![0.0f32; 16];
        let mut right = vec![0.0f32; 16];
        mix_direct_hrtf(&mut left, &mut right, &[], &mut accum, &mut [0.0; 16], &mut [], 8, 16);
        assert_eq!(left[10], 1.0);
        assert_eq!(right[10], 2.0);
        assert_eq!(accum[4], [3.0, 4.0]);
        assert_eq!(accum[20], [0.0, 0.0]);
    }
}
