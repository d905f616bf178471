//! Phase-vocoder pitch shifter on the W channel.

use std::f64::consts::{PI, TAU};

use rustfft::num_complex::Complex;

use crate::ambisonic::{calc_direction_coeffs, compute_pan_gains};
use crate::audio::{Buffer, FloatBufferLine, BUFFER_LINE_SIZE, MAX_OUTPUT_CHANNELS};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;
use crate::resampler::{MIXER_FRAC_BITS, MIXER_FRAC_ONE};

use super::fshifter::{FftPair, HANN_WINDOW};
use super::{EffectProcessor, EffectProps, EffectTarget, OutTarget, PshifterProps, SlotParams};

const STFT_SIZE: usize = 1024;
const STFT_HALF_SIZE: usize = STFT_SIZE >> 1;
const OVERSAMP: usize = 1 << 2;

const STFT_STEP: usize = STFT_SIZE / OVERSAMP;
const FIFO_LATENCY: usize = STFT_STEP * (OVERSAMP - 1);

/// Phase advance per hop expected of each bin (bin 1 is x1, bin 2 is x2).
const EXPECTED_CYCLES: f64 = TAU / OVERSAMP as f64;

#[derive(Clone, Copy, Default)]
struct FrequencyBin {
    amplitude: f64,
    freq_bin: f64,
}

pub struct PshifterState {
    count: usize,
    pos: usize,
    pitch_shift_i: u32,
    pitch_shift: f64,

    fifo: [f64; STFT_SIZE],
    last_phase: [f64; STFT_HALF_SIZE + 1],
    sum_phase: [f64; STFT_HALF_SIZE + 1],
    output_accum: [f64; STFT_SIZE],

    fft_buffer: [Complex<f64>; STFT_SIZE],
    analysis: [FrequencyBin; STFT_HALF_SIZE + 1],
    synthesis: [FrequencyBin; STFT_HALF_SIZE + 1],

    buffer_out: Box<FloatBufferLine>,
    fft: FftPair,

    current_gains: [f32; MAX_OUTPUT_CHANNELS],
    target_gains: [f32; MAX_OUTPUT_CHANNELS],
}

impl PshifterState {
    pub fn new() -> Self {
        Self {
            count: 0,
            pos: FIFO_LATENCY,
            pitch_shift_i: MIXER_FRAC_ONE,
            pitch_shift: 1.0,
            fifo: [0.0; STFT_SIZE],
            last_phase: [0.0; STFT_HALF_SIZE + 1],
            sum_phase: [0.0; STFT_HALF_SIZE + 1],
            output_accum: [0.0; STFT_SIZE],
            fft_buffer: [Complex::new(0.0, 0.0); STFT_SIZE],
            analysis: [FrequencyBin::default(); STFT_HALF_SIZE + 1],
            synthesis: [FrequencyBin::default(); STFT_HALF_SIZE + 1],
            buffer_out: Box::new([0.0; BUFFER_LINE_SIZE]),
            fft: FftPair::new(STFT_SIZE),
            current_gains: [0.0; MAX_OUTPUT_CHANNELS],
            target_gains: [0.0; MAX_OUTPUT_CHANNELS],
        }
    }

    fn analyze(&mut self) {
        for k in 0..=STFT_HALF_SIZE {
            let bin = self.fft_buffer[k];
            let amplitude = bin.norm();
            let phase = bin.arg();

            let mut tmp = (phase - self.last_phase[k]) - k as f64 * EXPECTED_CYCLES;
            // Map delta phase into +/- Pi interval
            let qpd = (tmp / PI) as i32;
            tmp -= PI * f64::from(qpd + qpd % 2);
            tmp /= EXPECTED_CYCLES;

            self.analysis[k] = FrequencyBin {
                amplitude,
                freq_bin: k as f64 + tmp,
            };
            self.last_phase[k] = phase;
        }
    }

    fn shift_bins(&mut self) {
        self.synthesis = [FrequencyBin::default(); STFT_HALF_SIZE + 1];
        let half = MIXER_FRAC_ONE as usize >> 1;
        let pitch_i = self.pitch_shift_i.max(1) as usize;
        let bin_count = (STFT_HALF_SIZE + 1)
            .min((((STFT_HALF_SIZE + 1) << MIXER_FRAC_BITS) - half - 1) / pitch_i + 1);
        for k in 0..bin_count {
            let j = (k * pitch_i + half) >> MIXER_FRAC_BITS;
            self.synthesis[j].amplitude += self.analysis[k].amplitude;
            self.synthesis[j].freq_bin = self.analysis[k].freq_bin * self.pitch_shift;
        }
    }
}

impl Default for PshifterState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for PshifterState {
    fn device_update(&mut self, _device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        self.count = 0;
        self.pos = FIFO_LATENCY;
        self.pitch_shift_i = MIXER_FRAC_ONE;
        self.pitch_shift = 1.0;

        self.fifo.fill(0.0);
        self.last_phase.fill(0.0);
        self.sum_phase.fill(0.0);
        self.output_accum.fill(0.0);
        self.fft_buffer.fill(Complex::new(0.0, 0.0));
        self.analysis.fill(FrequencyBin::default());
        self.synthesis.fill(FrequencyBin::default());

        self.current_gains.fill(0.0);
        self.target_gains.fill(0.0);
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
            EffectProps::PitchShifter(p) => *p,
            _ => PshifterProps::default(),
        };
        let tune = props.coarse_tune * 100 + props.fine_tune;
        let pitch = 2.0f32.powf(tune as f32 / 1200.0);
        self.pitch_shift_i = (pitch * MIXER_FRAC_ONE as f32) as u32;
        self.pitch_shift = f64::from(self.pitch_shift_i) * (1.0 / f64::from(MIXER_FRAC_ONE));

        let coeffs = calc_direction_coeffs([0.0, 0.0, -1.0], 0.0);
        compute_pan_gains(&target.main.ambi_map, &coeffs, slot.gain, &mut self.target_gains);
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let Some(input) = input.first() else {
            return;
        };
        let window = &*HANN_WINDOW;

        let mut base = 0;
        while base < samples_to_do {
            let todo = (STFT_STEP - self.count).min(samples_to_do - base);

            // The FIFO slot holds a finished output sample until the new
            // input overwrites it.
            let start = self.pos + self.count;
            for i in 0..todo {
                self.buffer_out[base + i] = self.fifo[start + i] as f32;
                self.fifo[start + i] = f64::from(input[base + i]);
            }
            self.count += todo;
            base += todo;

            if self.count < STFT_STEP {
                break;
            }
            self.count = 0;
            self.pos = (self.pos + STFT_STEP) & (STFT_SIZE - 1);

            let (head, tail) = self.fifo.split_at(self.pos);
            for (k, &s) in tail.iter().chain(head.iter()).enumerate() {
                self.fft_buffer[k] = Complex::new(s * window[k], 0.0);
            }
            self.fft.forward(&mut self.fft_buffer);

            self.analyze();
            self.shift_bins();

            for k in 0..=STFT_HALF_SIZE {
                self.sum_phase[k] += self.synthesis[k].freq_bin * EXPECTED_CYCLES;
                self.fft_buffer[k] = Complex::from_polar(self.synthesis[k].amplitude, self.sum_phase[k]);
            }
            for k in STFT_HALF_SIZE + 1..STFT_SIZE {
                self.fft_buffer[k] = self.fft_buffer[STFT_SIZE - k].conj();
            }

            self.fft.inverse(&mut self.fft_buffer);
            let scale = 4.0 / OVERSAMP as f64 / STFT_SIZE as f64;
            for k in 0..STFT_SIZE {
                let dst = (self.pos + k) & (STFT_SIZE - 1);
                self.output_accum[dst] += window[k] * self.fft_buffer[k].re * scale;
            }

            let pos = self.pos;
            self.fifo[pos..pos + STFT_STEP].copy_from_slice(&self.output_accum[pos..pos + STFT_STEP]);
            self.output_accum[pos..pos + STFT_STEP].fill(0.0);
        }

        mix(
            &self.buffer_out[..samples_to_do],
            output,
            &mut self.current_gains,
            &self.target_gains,
            samples_to_do.max(512),
            0,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::test_util::{device, rms};

    fn setup(coarse_tune: i32) -> PshifterState {
        let dev = device(48000);
        let mut state = PshifterState::new();
        state.device_update(&dev, None).unwrap();
        let main = crate::audio::MixParams::acn_identity(4);
        let slot = SlotParams {
            gain: 1.0,
            wet_channels: 4,
        };
        state.update(
            &dev,
            &slot,
            &EffectProps::PitchShifter(PshifterProps {
                coarse_tune,
                fine_tune: 0,
            }),
            EffectTarget {
                main: &main,
                real_out: None,
            },
        );
        state
    }

    #[test]
    fn octave_up_doubles_the_fixed_point_pitch() {
        let state = setup(12);
        assert_eq!(state.pitch_shift_i, 2 * MIXER_FRAC_ONE);
        assert_eq!(state.pitch_shift, 2.0);
        let state = setup(-12);
        assert_eq!(state.pitch_shift_i, MIXER_FRAC_ONE / 2);
    }

    #[test]
    fn octave_up_moves_energy_up() {
        let mut state = setup(12);
        // A tone centred on bin 32 of the analysis block.
        let freq = 32.0 * 48000.0 / STFT_SIZE as f64;
        let mut wet = crate::audio::new_lines(4);
        let mut out = crate::audio::new_lines(4);
        let mut t = 0usize;
        for _ in 0..4 {
            for s in wet[0].iter_mut() {
                *s = (TAU * freq * t as f64 / 48000.0).sin() as f32 * 0.5;
                t += 1;
            }
            for line in out.iter_mut() {
                line.fill(0.0);
            }
            state.process(BUFFER_LINE_SIZE, &wet, &mut out);
        }
        assert!(rms(&out[0]) > 0.05);
        // Count zero crossings to estimate the dominant frequency.
        let crossings = out[0]
            .windows(2)
            .filter(|w| (w[0] < 0.0) != (w[1] < 0.0))
            .count();
        // 1500 Hz over 1024 samples crosses zero 64 times; the shifted
        // tone should cross about twice as often.
        assert!(crossings > 100, "crossings {}", crossings);
    }
}
