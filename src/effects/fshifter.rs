//! Frequency shifter. The input is turned into its analytic signal with an
//! overlapped FFT Hilbert transform, then single-sideband modulated.

use std::f64::consts::TAU;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::ambisonic::{calc_direction_coeffs, compute_pan_gains};
use crate::audio::{Buffer, FloatBufferLine, BUFFER_LINE_SIZE, MAX_OUTPUT_CHANNELS};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;

use super::{EffectProcessor, EffectProps, EffectTarget, FShifterDirection, FshifterProps, OutTarget, SlotParams};

const HIL_SIZE: usize = 1024;
const HIL_HALF_SIZE: usize = HIL_SIZE >> 1;
const OVERSAMP: usize = 1 << 2;

const HIL_STEP: usize = HIL_SIZE / OVERSAMP;
const FIFO_LATENCY: usize = HIL_STEP * (OVERSAMP - 1);

const MOD_FRACBITS: u32 = 12;
const MOD_FRACONE: u32 = 1 << MOD_FRACBITS;
const MOD_FRACMASK: u32 = MOD_FRACONE - 1;

/// Hann window over the Hilbert block.
pub(crate) static HANN_WINDOW: Lazy<[f64; HIL_SIZE]> = Lazy::new(|| {
    let mut ret = [0.0f64; HIL_SIZE];
    for i in 0..HIL_SIZE >> 1 {
        let val = (std::f64::consts::PI * (i + 1) as f64 / HIL_SIZE as f64).sin();
        ret[i] = val * val;
        ret[HIL_SIZE - 1 - i] = val * val;
    }
    ret
});

/// Forward and inverse transforms plus scratch space for one block size.
pub(crate) struct FftPair {
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl FftPair {
    pub(crate) fn new(size: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Self {
            forward,
            inverse,
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        }
    }

    pub(crate) fn forward(&mut self, buffer: &mut [Complex<f64>]) {
        self.forward.process_with_scratch(buffer, &mut self.scratch);
    }

    pub(crate) fn inverse(&mut self, buffer: &mut [Complex<f64>]) {
        self.inverse.process_with_scratch(buffer, &mut self.scratch);
    }
}

/// Replaces `buffer` with the analytic signal of its real part, `x + jH(x)`.
fn analytic_signal(fft: &mut FftPair, buffer: &mut [Complex<f64>; HIL_SIZE]) {
    fft.forward(buffer);
    // Keep DC and Nyquist, double the positive bins, drop the negative ones.
    for bin in buffer[1..HIL_HALF_SIZE].iter_mut() {
        *bin *= 2.0;
    }
    for bin in buffer[HIL_HALF_SIZE + 1..].iter_mut() {
        *bin = Complex::new(0.0, 0.0);
    }
    fft.inverse(buffer);
    let scale = 1.0 / HIL_SIZE as f64;
    for s in buffer.iter_mut() {
        *s *= scale;
    }
}

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

pub struct FshifterState {
    count: usize,
    pos: usize,
    phase_step: [u32; 2],
    phase: [u32; 2],
    sign: [f64; 2],

    in_fifo: [f64; HIL_SIZE],
    out_fifo: [Complex<f64>; HIL_STEP],
    output_accum: [Complex<f64>; HIL_SIZE],
    analytic: [Complex<f64>; HIL_SIZE],
    outdata: Box<[Complex<f64>; BUFFER_LINE_SIZE]>,
    buffer_out: Box<FloatBufferLine>,

    fft: FftPair,
    gains: [Gains; 2],
}

impl FshifterState {
    pub fn new() -> Self {
        Self {
            count: 0,
            pos: FIFO_LATENCY,
            phase_step: [0; 2],
            phase: [0; 2],
            sign: [1.0; 2],
            in_fifo: [0.0; HIL_SIZE],
            out_fifo: [Complex::new(0.0, 0.0); HIL_STEP],
            output_accum: [Complex::new(0.0, 0.0); HIL_SIZE],
            analytic: [Complex::new(0.0, 0.0); HIL_SIZE],
            outdata: Box::new([Complex::new(0.0, 0.0); BUFFER_LINE_SIZE]),
            buffer_out: Box::new([0.0; BUFFER_LINE_SIZE]),
            fft: FftPair::new(HIL_SIZE),
            gains: [Gains::default(); 2],
        }
    }

    fn set_direction(&mut self, c: usize, direction: FShifterDirection, step: u32) {
        match direction {
            FShifterDirection::Down => {
                self.sign[c] = -1.0;
                self.phase_step[c] = step;
            }
            FShifterDirection::Up => {
                self.sign[c] = 1.0;
                self.phase_step[c] = step;
            }
            FShifterDirection::Off => {
                self.phase[c] = 0;
                self.phase_step[c] = 0;
            }
        }
    }
}

impl Default for FshifterState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for FshifterState {
    fn device_update(&mut self, _device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        self.count = 0;
        self.pos = FIFO_LATENCY;
        self.phase_step = [0; 2];
        self.phase = [0; 2];
        self.sign = [1.0; 2];
        self.in_fifo.fill(0.0);
        self.out_fifo.fill(Complex::new(0.0, 0.0));
        self.output_accum.fill(Complex::new(0.0, 0.0));
        self.analytic.fill(Complex::new(0.0, 0.0));
        self.gains = [Gains::default(); 2];
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
            EffectProps::FrequencyShifter(p) => *p,
            _ => FshifterProps::default(),
        };

        let step = props.frequency / device.frequency as f32;
        let step = (step.min(1.0) * MOD_FRACONE as f32) as u32;
        self.set_direction(0, props.left_direction, step);
        self.set_direction(1, props.right_direction, step);

        let lcoeffs = calc_direction_coeffs([-1.0, 0.0, 0.0], 0.0);
        let rcoeffs = calc_direction_coeffs([1.0, 0.0, 0.0], 0.0);
        compute_pan_gains(&target.main.ambi_map, &lcoeffs, slot.gain, &mut self.gains[0].target);
        compute_pan_gains(&target.main.ambi_map, &rcoeffs, slot.gain, &mut self.gains[1].target);
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let Some(input) = input.first() else {
            return;
        };

        let mut base = 0;
        while base < samples_to_do {
            let todo = (HIL_STEP - self.count).min(samples_to_do - base);

            // Fill FIFO buffer with samples data
            let pos = self.pos;
            let mut count = self.count;
            while count < self.count + todo {
                self.in_fifo[pos + count] = f64::from(input[base]);
                self.outdata[base] = self.out_fifo[count];
                count += 1;
                base += 1;
            }
            self.count = count;

            // Check whether FIFO buffer is filled
            if self.count < HIL_STEP {
                break;
            }
            self.count = 0;
            self.pos = (self.pos + HIL_STEP) & (HIL_SIZE - 1);

            // Real signal windowing and store in the analytic buffer, read
            // from the oldest sample.
            let window = &*HANN_WINDOW;
            let (head, tail) = self.in_fifo.split_at(self.pos);
            for (k, &s) in tail.iter().chain(head.iter()).enumerate() {
                self.analytic[k] = Complex::new(s * window[k], 0.0);
            }

            analytic_signal(&mut self.fft, &mut self.analytic);

            // Windowed overlap-add; the Hann window at 4x overlap sums to 2.
            let scale = 2.0 / OVERSAMP as f64;
            for k in 0..HIL_SIZE {
                let idx = (self.pos + k) & (HIL_SIZE - 1);
                self.output_accum[idx] += self.analytic[k] * (scale * window[k]);
            }

            // Copy out the accumulated result, then clear for the next
            // iteration.
            let pos = self.pos;
            self.out_fifo
                .copy_from_slice(&self.output_accum[pos..pos + HIL_STEP]);
            self.output_accum[pos..pos + HIL_STEP].fill(Complex::new(0.0, 0.0));
        }

        // Process frequency shifter using the analytic signal obtained.
        for c in 0..2 {
            let sign = self.sign[c];
            let step = self.phase_step[c];
            let mut phase_idx = self.phase[c];
            for k in 0..samples_to_do {
                let phase = f64::from(phase_idx) * (TAU / MOD_FRACONE as f64);
                let s = self.outdata[k];
                self.buffer_out[k] = (s.re * phase.cos() - s.im * phase.sin() * sign) as f32;
                phase_idx = phase_idx.wrapping_add(step) & MOD_FRACMASK;
            }
            self.phase[c] = phase_idx;

            // Now, mix the processed sound data to the output.
            mix(
                &self.buffer_out[..samples_to_do],
                output,
                &mut self.gains[c].current,
                &self.gains[c].target,
                samples_to_do.max(512),
                0,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::test_util::{device, run_effect};
    use crate::effects::EffectState;

    #[test]
    fn analytic_signal_of_cosine_is_complex_exponential() {
        let mut fft = FftPair::new(HIL_SIZE);
        let mut buf = [Complex::new(0.0, 0.0); HIL_SIZE];
        let bin = 16.0;
        for (i, s) in buf.iter_mut().enumerate() {
            s.re = (TAU * bin * i as f64 / HIL_SIZE as f64).cos();
        }
        analytic_signal(&mut fft, &mut buf);
        for (i, s) in buf.iter().enumerate() {
            let w = TAU * bin * i as f64 / HIL_SIZE as f64;
            assert!((s.re - w.cos()).abs() < 1e-9);
            assert!((s.im - w.sin()).abs() < 1e-9);
        }
    }

    #[test]
    fn window_is_symmetric() {
        for i in 0..HIL_SIZE {
            assert!((HANN_WINDOW[i] - HANN_WINDOW[HIL_SIZE - 1 - i]).abs() < 1e-12);
        }
    }

    #[test]
    fn unshifted_impulse_emerges_after_one_block() {
        let dev = device(48000);
        let mut state = FshifterState::new();
        state.device_update(&dev, None).unwrap();
        let main = crate::audio::MixParams::acn_identity(4);
        let slot = SlotParams {
            gain: 1.0,
            wet_channels: 4,
        };
        state.update(
            &dev,
            &slot,
            &EffectProps::FrequencyShifter(FshifterProps {
                frequency: 0.0,
                left_direction: FShifterDirection::Up,
                right_direction: FShifterDirection::Up,
            }),
            EffectTarget {
                main: &main,
                real_out: None,
            },
        );

        let mut wet = crate::audio::new_lines(4);
        wet[0][0] = 1.0;
        let mut out = crate::audio::new_lines(4);
        state.process(BUFFER_LINE_SIZE, &wet, &mut out);
        assert!(out[0].iter().all(|s| s.abs() < 1e-6));

        wet[0][0] = 0.0;
        let mut out = crate::audio::new_lines(4);
        state.process(BUFFER_LINE_SIZE, &wet, &mut out);
        assert!(out[0][0] > 0.5, "{}", out[0][0]);
        assert!(out[0][1..].iter().all(|s| s.abs() < 1e-4));
    }

    #[test]
    fn shifted_tone_stays_finite() {
        let mut state = EffectState::Fshifter(Box::new(FshifterState::new()));
        let props = EffectProps::FrequencyShifter(FshifterProps {
            frequency: 100.0,
            ..FshifterProps::default()
        });
        let input: Vec<f32> = (0..1024).map(|i| (i as f32 * 0.05).sin()).collect();
        let out = run_effect(&mut state, &props, &input, 48000);
        assert!(out[0].iter().all(|s| s.is_finite()));
    }
}
