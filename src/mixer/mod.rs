//! Gain-interpolated accumulation of a mono stream into output lines.

pub mod hrtf;

use crate::audio::{FloatBufferLine, GAIN_SILENCE_THRESHOLD};

pub use hrtf::{mix_direct_hrtf, mix_hrtf, mix_hrtf_blend, HrtfChannelState, MixHrtfFilter};

/// Adds `input` into each line of `out` starting at `out_pos`.
///
/// The gain for line `k` moves linearly from `current[k]` toward `target[k]`
/// over `counter` samples and then holds. `current` is updated to the gain
/// reached at the end of the call. Lines whose resulting gain is below the
/// silence threshold skip the hold section entirely.
pub fn mix(
    input: &[f32],
    out: &mut [FloatBufferLine],
    current: &mut [f32],
    target: &[f32],
    counter: usize,
    out_pos: usize,
) {
    let delta = if counter > 0 { 1.0 / counter as f32 } else { 0.0 };
    let min_len = counter.min(input.len());
    for ((output, cur), &tgt) in out.iter_mut().zip(current.iter_mut()).zip(target) {
        let dst = &mut output[out_pos..out_pos + input.len()];
        *cur = mix_line(input, dst, *cur, tgt, delta, counter, min_len);
    }
}

/// Single-line variant of [`mix`].
pub fn mix_single(
    input: &[f32],
    out: &mut [f32],
    current: &mut f32,
    target: f32,
    counter: usize,
) {
    let delta = if counter > 0 { 1.0 / counter as f32 } else { 0.0 };
    let min_len = counter.min(input.len());
    let dst = &mut out[..input.len()];
    *current = mix_line(input, dst, *current, target, delta, counter, min_len);
}

#[inline(always)]
fn mix_line(
    input: &[f32],
    dst: &mut [f32],
    mut gain: f32,
    target: f32,
    delta: f32,
    counter: usize,
    min_len: usize,
) -> f32 {
    let step = (target - gain) * delta;

    let mut pos = 0;
    if !(step.abs() > f32::EPSILON) {
        gain = target;
    } else {
        let mut step_count = 0.0f32;
        while pos != min_len {
            dst[pos] += input[pos] * (gain + step * step_count);
            step_count += 1.0;
            pos += 1;
        }
        if pos == counter {
            gain = target;
        } else {
            gain += step * step_count;
        }
    }

    if gain.abs() > GAIN_SILENCE_THRESHOLD {
        for (d, &s) in dst[pos..].iter_mut().zip(&input[pos..]) {
            *d += s * gain;
        }
    }
    gain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{new_lines, BUFFER_LINE_SIZE};

    #[test]
    fn silent_gains_leave_output_untouched() {
        let input = vec![1.0f32; 256];
        let mut out = new_lines(2);
        let mut current = [0.0f32; 2];
        mix(&input, &mut out, &mut current, &[0.0, 0.0], 64, 0);
        assert!(out.iter().all(|line| line.iter().all(|&s| s == 0.0)));
        assert_eq!(current, [0.0, 0.0]);
    }

    #[test]
    fn gain_fades_linearly_then_holds() {
        let n = 100;
        let input = vec![1.0f32; 256];
        let mut out = new_lines(1);
        let mut current = [0.25f32];
        mix(&input, &mut out, &mut current, &[0.75], n, 0);
        for i in 0..256 {
            let t = i.min(n) as f32 / n as f32;
            let expected = 0.25 + (0.75 - 0.25) * t;
            assert!(
                (out[0][i] - expected).abs() < 1e-6,
                "sample {}: {} vs {}",
                i,
                out[0][i],
                expected
            );
        }
        assert_eq!(current[0], 0.75);
    }

    #[test]
    fn long_fade_stops_part_way() {
        let input = vec![1.0f32; 64];
        let mut out = new_lines(1);
        let mut current = [0.0f32];
        mix(&input, &mut out, &mut current, &[1.0], 128, 0);
        assert!(current[0] < 1.0);
        assert!((current[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn offset_mixes_after_position() {
        let input = vec![0.5f32; 16];
        let mut out = new_lines(1);
        let mut current = [1.0f32];
        mix(&input, &mut out, &mut current, &[1.0], 0, BUFFER_LINE_SIZE - 16);
        assert_eq!(out[0][BUFFER_LINE_SIZE - 17], 0.0);
        assert_eq!(out[0][BUFFER_LINE_SIZE - 1], 0.5);
    }
}
