//! Ambisonic to speaker decoding.

use std::f32::consts::FRAC_PI_2;

use crate::ambisonic::MAX_AMBI_CHANNELS;
use crate::audio::{FloatBufferLine, BUFFER_LINE_SIZE};
use crate::biquad::BandSplitter;
use crate::mixer::mix;

use super::delay_samples;

/// Decoding coefficients for one output channel, indexed by dry bus channel.
pub type ChannelDec = [f32; MAX_AMBI_CHANNELS];

const HF_BAND: usize = 0;
const LF_BAND: usize = 1;

/// Delay line and band-splitting state for keeping a stable phantom centre.
pub struct FrontStablizer {
    side: Vec<f32>,
    mid_direct: Vec<f32>,
    mid_delay: [f32; FrontStablizer::DELAY_LENGTH],
    temp: Vec<f32>,
    mid_filter: BandSplitter,
    mid_lf: Box<FloatBufferLine>,
    mid_hf: Box<FloatBufferLine>,
    delay_buf: Vec<[f32; FrontStablizer::DELAY_LENGTH]>,
}

impl FrontStablizer {
    pub const DELAY_LENGTH: usize = 256;

    /// Creates a stabilizer for `num_chans` outputs, with the mid signal
    /// split at 5kHz.
    pub fn new(num_chans: usize, sample_rate: u32) -> Self {
        Self {
            side: vec![0.0; BUFFER_LINE_SIZE + Self::DELAY_LENGTH],
            mid_direct: vec![0.0; BUFFER_LINE_SIZE + Self::DELAY_LENGTH],
            mid_delay: [0.0; Self::DELAY_LENGTH],
            temp: vec![0.0; BUFFER_LINE_SIZE + Self::DELAY_LENGTH],
            mid_filter: BandSplitter::new(5000.0 / sample_rate as f32),
            mid_lf: Box::new([0.0; BUFFER_LINE_SIZE]),
            mid_hf: Box::new([0.0; BUFFER_LINE_SIZE]),
            delay_buf: vec![[0.0; Self::DELAY_LENGTH]; num_chans],
        }
    }
}

struct DecoderChannel {
    splitter: BandSplitter,
    gains: [[f32; crate::audio::MAX_OUTPUT_CHANNELS]; 2],
}

pub struct BFormatDec {
    dual_band: bool,
    num_outputs: usize,
    channels: Vec<DecoderChannel>,
    bands: Box<[FloatBufferLine; 2]>,
    stablizer: Option<Box<FrontStablizer>>,
}

impl BFormatDec {
    /// `coeffs` holds one row per output channel. When `coeffs_lf` is not
    /// empty the decoder runs dual-band, splitting each input at
    /// `xover_f0norm`.
    pub fn new(
        in_chans: usize,
        coeffs: &[ChannelDec],
        coeffs_lf: &[ChannelDec],
        xover_f0norm: f32,
        stablizer: Option<Box<FrontStablizer>>,
    ) -> Self {
        let dual_band = !coeffs_lf.is_empty();
        let splitter = BandSplitter::new(xover_f0norm);
        let channels = (0..in_chans)
            .map(|j| {
                let mut gains = [[0.0; crate::audio::MAX_OUTPUT_CHANNELS]; 2];
                for (out, row) in gains[HF_BAND].iter_mut().zip(coeffs) {
                    *out = row[j];
                }
                for (out, row) in gains[LF_BAND].iter_mut().zip(coeffs_lf) {
                    *out = row[j];
                }
                DecoderChannel { splitter, gains }
            })
            .collect();
        Self {
            dual_band,
            num_outputs: coeffs.len(),
            channels,
            bands: Box::new([[0.0; BUFFER_LINE_SIZE]; 2]),
            stablizer,
        }
    }

    pub fn has_stablizer(&self) -> bool {
        self.stablizer.is_some()
    }

    pub fn is_dual_band(&self) -> bool {
        self.dual_band
    }

    /// Decodes `input` and adds the result into `out`.
    pub fn process(&mut self, out: &mut [FloatBufferLine], input: &[FloatBufferLine], samples_to_do: usize) {
        let nout = self.num_outputs.min(out.len());
        let out = &mut out[..nout];
        if self.dual_band {
            let (hf, lf) = self.bands.split_at_mut(1);
            let hf = &mut hf[0][..samples_to_do];
            let lf = &mut lf[0][..samples_to_do];
            for (chan, line) in self.channels.iter_mut().zip(input) {
                chan.splitter.process(&line[..samples_to_do], hf, lf);
                let mut cur = chan.gains[HF_BAND];
                mix(hf, out, &mut cur[..nout], &chan.gains[HF_BAND][..nout], 0, 0);
                let mut cur = chan.gains[LF_BAND];
                mix(lf, out, &mut cur[..nout], &chan.gains[LF_BAND][..nout], 0, 0);
            }
        } else {
            for (chan, line) in self.channels.iter().zip(input) {
                let mut cur = chan.gains[HF_BAND];
                mix(&line[..samples_to_do], out, &mut cur[..nout], &chan.gains[HF_BAND][..nout], 0, 0);
            }
        }
    }

    /// Decodes with front image stabilization. Everything except the
    /// recombined front pair comes out delayed by
    /// [`FrontStablizer::DELAY_LENGTH`] samples.
    pub fn process_stablize(
        &mut self,
        out: &mut [FloatBufferLine],
        input: &[FloatBufferLine],
        lidx: usize,
        ridx: usize,
        cidx: usize,
        samples_to_do: usize,
    ) {
        let Some(mut stab) = self.stablizer.take() else {
            self.process(out, input, samples_to_do);
            return;
        };
        const DELAY: usize = FrontStablizer::DELAY_LENGTH;
        let n = samples_to_do;

        // Pull the direct front pair out so only the decode gets stabilized.
        for i in 0..n {
            let (l, r) = (out[lidx][i], out[ridx][i]);
            stab.mid_direct[DELAY + i] = l + r;
            stab.side[DELAY + i] = l - r;
        }
        out[lidx][..n].fill(0.0);
        out[ridx][..n].fill(0.0);

        self.process(out, input, n);

        for (i, line) in out.iter_mut().enumerate() {
            if i == lidx || i == ridx {
                continue;
            }
            if let Some(delay) = stab.delay_buf.get_mut(i) {
                delay_samples(&mut line[..n], delay);
            }
        }

        for i in 0..n {
            stab.side[DELAY + i] += out[lidx][i] - out[ridx][i];
        }

        // Delayed mid followed by the freshly decoded mid.
        stab.temp[..DELAY].copy_from_slice(&stab.mid_delay);
        for i in 0..n {
            stab.temp[DELAY + i] = out[lidx][i] + out[ridx][i];
        }
        stab.mid_delay.copy_from_slice(&stab.temp[n..n + DELAY]);

        // The reverse all-pass over the future samples cancels the phase
        // shift of the forward split.
        stab.mid_filter.apply_allpass_rev(&mut stab.temp[..n + DELAY]);
        {
            let FrontStablizer {
                temp,
                mid_filter,
                mid_hf,
                mid_lf,
                ..
            } = &mut *stab;
            mid_filter.process(&temp[..n], &mut mid_hf[..n], &mut mid_lf[..n]);
        }

        // Low frequencies pan 1/3 toward the centre, highs 1/4.
        let (sin_lf, cos_lf) = (FRAC_PI_2 / 3.0).sin_cos();
        let (sin_hf, cos_hf) = (FRAC_PI_2 / 4.0).sin_cos();
        for i in 0..n {
            let m = stab.mid_lf[i] * cos_lf + stab.mid_hf[i] * cos_hf + stab.mid_direct[i];
            let c = stab.mid_lf[i] * sin_lf + stab.mid_hf[i] * sin_hf;
            let s = stab.side[i];

            out[lidx][i] = (m + s) * 0.5;
            out[ridx][i] = (m - s) * 0.5;
            out[cidx][i] += c * 0.5;
        }

        stab.mid_direct.copy_within(n..n + DELAY, 0);
        stab.side.copy_within(n..n + DELAY, 0);

        self.stablizer = Some(stab);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::new_lines;

    fn row(values: &[f32]) -> ChannelDec {
        let mut r = [0.0; MAX_AMBI_CHANNELS];
        r[..values.len()].copy_from_slice(values);
        r
    }

    #[test]
    fn single_band_applies_matrix() {
        let coeffs = [row(&[0.5, 0.25]), row(&[0.5, -0.25])];
        let mut dec = BFormatDec::new(2, &coeffs, &[], 0.0, None);
        let mut input = new_lines(2);
        input[0][..16].fill(1.0);
        input[1][..16].fill(2.0);
        let mut out = new_lines(2);
        dec.process(&mut out, &input, 16);
        assert!((out[0][5] - 1.0).abs() < 1e-6);
        assert!((out[1][5] - 0.0).abs() < 1e-6);
        assert_eq!(out[0][16], 0.0);
    }

    #[test]
    fn extra_output_lines_are_left_alone() {
        let coeffs = [row(&[1.0])];
        let mut dec = BFormatDec::new(1, &coeffs, &[], 0.0, None);
        let mut input = new_lines(1);
        input[0][..8].fill(0.5);
        let mut out = new_lines(3);
        out[2][..8].fill(0.25);
        dec.process(&mut out, &input, 8);
        assert!((out[0][3] - 0.5).abs() < 1e-6);
        assert_eq!(out[1][3], 0.0);
        assert_eq!(out[2][3], 0.25);
    }

    #[test]
    fn dual_band_with_matched_bands_keeps_dc() {
        let coeffs = [row(&[0.7])];
        let mut dec = BFormatDec::new(1, &coeffs, &coeffs, 400.0 / 48000.0, None);
        let mut input = new_lines(1);
        input[0].fill(1.0);
        let mut out = new_lines(1);
        dec.process(&mut out, &input, BUFFER_LINE_SIZE);
        let last = out[0][BUFFER_LINE_SIZE - 1];
        assert!((last - 0.7).abs() < 1e-3, "settled at {}", last);
    }

    #[test]
    fn stablizer_delays_direct_front_pair() {
        let coeffs = [row(&[0.0]), row(&[0.0]), row(&[0.0])];
        let stab = Box::new(FrontStablizer::new(3, 48000));
        let mut dec = BFormatDec::new(1, &coeffs, &[], 0.0, Some(stab));
        assert!(dec.has_stablizer());

        let input = new_lines(1);
        let mut out = new_lines(3);
        out[0][10] = 1.0;
        out[1][20] = 0.5;
        let n = 512;
        dec.process_stablize(&mut out, &input, 0, 1, 2, n);

        let d = FrontStablizer::DELAY_LENGTH;
        assert!((out[0][10 + d] - 1.0).abs() < 1e-6);
        assert!((out[1][20 + d] - 0.5).abs() < 1e-6);
        assert!(out[0][10].abs() < 1e-6);
        assert!(out[2][..n].iter().all(|s| s.abs() < 1e-6));
    }
}
