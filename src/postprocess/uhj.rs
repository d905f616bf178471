//! UHJ encoding and decoding.
//!
//! Encoding from B-Format:
//!
//! ```text
//! S = 0.9396926*W + 0.1855740*X
//! D = j(-0.3420201*W + 0.5098604*X) + 0.6554516*Y
//! Left = (S + D)/2, Right = (S - D)/2
//! T = j(-0.1432*W + 0.6512*X) - 0.7071068*Y
//! Q = 0.9772*Z
//! ```
//!
//! Decoding back:
//!
//! ```text
//! W = 0.981532*S + 0.197484*j(0.828331*D + 0.767820*T)
//! X = 0.418496*S - j(0.828331*D + 0.767820*T)
//! Y = 0.795968*D - 0.676392*T + j(0.186633*S)
//! Z = 1.023332*Q
//! ```
//!
//! `j` is a wide-band +90 degree phase shift, applied with a linear-phase FIR.

use once_cell::sync::Lazy;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::audio::{FloatBufferLine, BUFFER_LINE_SIZE};
use crate::resampler::MAX_RESAMPLER_EDGE;

/// Latency of the phase-shift filter. The FIR is twice this long.
pub const UHJ_FILTER_DELAY: usize = 128;

const FILTER_SIZE: usize = UHJ_FILTER_DELAY * 2;

/// +90 degree phase-shift FIR.
///
/// The filter is built by shifting the spectrum of a centred impulse. Every
/// other tap of the result is zero, so only the non-zero taps are stored
/// (reversed) and applied by stepping over the input two samples at a time.
pub struct PhaseShifter {
    coeffs: [f32; FILTER_SIZE / 2],
}

impl PhaseShifter {
    pub fn new() -> Self {
        let half = FILTER_SIZE / 2;
        let mut buf = vec![Complex::new(0.0f64, 0.0); FILTER_SIZE];
        buf[half] = Complex::new(1.0, 0.0);

        let mut planner = FftPlanner::<f64>::new();
        planner.plan_fft_forward(FILTER_SIZE).process(&mut buf);
        for bin in buf[..=half].iter_mut() {
            *bin = Complex::new(-bin.im, bin.re);
        }
        for i in half + 1..FILTER_SIZE {
            buf[i] = buf[FILTER_SIZE - i].conj();
        }
        planner.plan_fft_inverse(FILTER_SIZE).process(&mut buf);

        let mut coeffs = [0.0f32; FILTER_SIZE / 2];
        for (j, coeff) in coeffs.iter_mut().enumerate() {
            *coeff = (buf[FILTER_SIZE - 1 - 2 * j].re / FILTER_SIZE as f64) as f32;
        }
        Self { coeffs }
    }

    #[inline]
    fn tap(&self, src: &[f32]) -> f32 {
        self.coeffs
            .iter()
            .zip(src.iter().step_by(2))
            .map(|(c, s)| c * s)
            .sum()
    }

    /// Writes `dst.len()` filtered samples. `src` must hold
    /// `dst.len() + FILTER_SIZE - 1` samples; output `i` is centred on
    /// `src[i + UHJ_FILTER_DELAY - 1]`.
    pub fn process(&self, dst: &mut [f32], src: &[f32]) {
        for (i, out) in dst.iter_mut().enumerate() {
            *out = self.tap(&src[i..i + FILTER_SIZE - 1]);
        }
    }

    /// Like [`PhaseShifter::process`], adding into `dst`.
    pub fn process_accum(&self, dst: &mut [f32], src: &[f32]) {
        for (i, out) in dst.iter_mut().enumerate() {
            *out += self.tap(&src[i..i + FILTER_SIZE - 1]);
        }
    }
}

impl Default for PhaseShifter {
    fn default() -> Self {
        Self::new()
    }
}

static PSHIFT: Lazy<PhaseShifter> = Lazy::new(PhaseShifter::new);

/// B-Format to stereo-compatible UHJ. Output lags the input by
/// [`UHJ_FILTER_DELAY`] samples.
pub struct UhjEncoder {
    s: Vec<f32>,
    d: Vec<f32>,
    wx_history: [f32; FILTER_SIZE - 1],
    temp: Vec<f32>,
    // T and Q channels, only used by `encode_tq`.
    t: Vec<f32>,
    q: Vec<f32>,
    t_history: [f32; FILTER_SIZE - 1],
}

impl UhjEncoder {
    pub fn new() -> Self {
        Self {
            s: vec![0.0; BUFFER_LINE_SIZE + UHJ_FILTER_DELAY],
            d: vec![0.0; BUFFER_LINE_SIZE + UHJ_FILTER_DELAY],
            wx_history: [0.0; FILTER_SIZE - 1],
            temp: vec![0.0; BUFFER_LINE_SIZE + FILTER_SIZE],
            t: vec![0.0; BUFFER_LINE_SIZE + UHJ_FILTER_DELAY],
            q: vec![0.0; BUFFER_LINE_SIZE + UHJ_FILTER_DELAY],
            t_history: [0.0; FILTER_SIZE - 1],
        }
    }

    /// Encodes W/X/Y from `input` to 2-channel UHJ. Whatever `left` and
    /// `right` already hold is treated as a direct stereo signal and is
    /// delayed along with the encode.
    pub fn encode(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        input: &[FloatBufferLine],
        samples_to_do: usize,
    ) {
        let n = samples_to_do;
        let (w, x, y) = (&input[0][..n], &input[1][..n], &input[2][..n]);
        const D: usize = UHJ_FILTER_DELAY;

        for i in 0..n {
            self.s[D + i] = 0.9396926 * w[i] + 0.1855740 * x[i] + left[i] + right[i];
            self.d[D + i] = 0.6554516 * y[i] + left[i] - right[i];
        }

        let h = self.wx_history.len();
        self.temp[..h].copy_from_slice(&self.wx_history);
        for i in 0..n {
            self.temp[h + i] = -0.3420201 * w[i] + 0.5098604 * x[i];
        }
        self.wx_history.copy_from_slice(&self.temp[n..n + h]);
        PSHIFT.process_accum(&mut self.d[..n], &self.temp[..n + h]);

        for i in 0..n {
            left[i] = (self.s[i] + self.d[i]) * 0.5;
            right[i] = (self.s[i] - self.d[i]) * 0.5;
        }

        self.s.copy_within(n..n + D, 0);
        self.d.copy_within(n..n + D, 0);
    }

    /// Produces the T channel (and Q when given and the input carries Z) for
    /// 3- and 4-channel UHJ, time-aligned with [`UhjEncoder::encode`].
    pub fn encode_tq(
        &mut self,
        t_out: &mut [f32],
        q_out: Option<&mut [f32]>,
        input: &[FloatBufferLine],
        samples_to_do: usize,
    ) {
        let n = samples_to_do;
        let (w, x, y) = (&input[0][..n], &input[1][..n], &input[2][..n]);
        const D: usize = UHJ_FILTER_DELAY;

        for i in 0..n {
            self.t[D + i] = -0.7071068 * y[i];
        }
        let h = self.t_history.len();
        self.temp[..h].copy_from_slice(&self.t_history);
        for i in 0..n {
            self.temp[h + i] = -0.1432 * w[i] + 0.6512 * x[i];
        }
        self.t_history.copy_from_slice(&self.temp[n..n + h]);
        PSHIFT.process_accum(&mut self.t[..n], &self.temp[..n + h]);
        t_out[..n].copy_from_slice(&self.t[..n]);
        self.t.copy_within(n..n + D, 0);

        if let (Some(q_out), Some(z)) = (q_out, input.get(3)) {
            for i in 0..n {
                self.q[D + i] = 0.9772 * z[i];
            }
            q_out[..n].copy_from_slice(&self.q[..n]);
            self.q.copy_within(n..n + D, 0);
        }
    }
}

impl Default for UhjEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Default super stereo width.
pub const DEFAULT_STEREO_WIDTH: f32 = 0.593;

/// UHJ (and super stereo) to B-Format, used on voice input. Needs
/// [`UHJ_FILTER_DELAY`] samples of lookahead past the decoded range.
pub struct UhjDecoder {
    s: Vec<f32>,
    d: Vec<f32>,
    t: Vec<f32>,
    dt_history: [f32; UHJ_FILTER_DELAY - 1],
    s_history: [f32; UHJ_FILTER_DELAY - 1],
    temp: Vec<f32>,
    current_width: f32,
    width_control: f32,
}

impl UhjDecoder {
    pub fn new() -> Self {
        let len = BUFFER_LINE_SIZE + MAX_RESAMPLER_EDGE + UHJ_FILTER_DELAY;
        Self {
            s: vec![0.0; len],
            d: vec![0.0; len],
            t: vec![0.0; len],
            dt_history: [0.0; UHJ_FILTER_DELAY - 1],
            s_history: [0.0; UHJ_FILTER_DELAY - 1],
            temp: vec![0.0; BUFFER_LINE_SIZE + MAX_RESAMPLER_EDGE + FILTER_SIZE],
            current_width: -1.0,
            width_control: DEFAULT_STEREO_WIDTH,
        }
    }

    /// Sets the super stereo width, limited to `[0, 0.7]`.
    pub fn set_width(&mut self, width: f32) {
        self.width_control = width.clamp(0.0, 0.7);
    }

    /// Clears the filter histories for a new stream.
    pub fn reset(&mut self) {
        self.dt_history = [0.0; UHJ_FILTER_DELAY - 1];
        self.s_history = [0.0; UHJ_FILTER_DELAY - 1];
        self.current_width = -1.0;
    }

    /// Runs the phase shift over `history ++ src[..len]`, then saves the
    /// history for the next call starting `forward` samples in.
    fn shift(
        temp: &mut [f32],
        history: &mut [f32; UHJ_FILTER_DELAY - 1],
        forward: usize,
        dst: &mut [f32],
    ) {
        let h = history.len();
        temp[..h].copy_from_slice(history);
        let filled = h + dst.len() + UHJ_FILTER_DELAY;
        PSHIFT.process(dst, &temp[..filled]);
        history.copy_from_slice(&temp[forward..forward + h]);
    }

    /// Decodes 2-, 3- or 4-channel UHJ in place. Each line holds its samples
    /// from `base`; `samples_to_do + UHJ_FILTER_DELAY` input samples are read
    /// and `samples_to_do` W/X/Y(/Z) samples are written. `forward` is how
    /// far the stream will advance before the next call.
    pub fn decode<L: AsMut<[f32]>>(
        &mut self,
        lines: &mut [L],
        base: usize,
        samples_to_do: usize,
        forward: usize,
    ) {
        let n = samples_to_do;
        let total = n + UHJ_FILTER_DELAY;
        {
            let left = &lines[0].as_mut()[base..base + total];
            for (s, l) in self.s[..total].iter_mut().zip(left) {
                *s = *l;
            }
            for (d, l) in self.d[..total].iter_mut().zip(left) {
                *d = *l;
            }
        }
        {
            let right = &lines[1].as_mut()[base..base + total];
            for i in 0..total {
                self.s[i] += right[i];
                self.d[i] -= right[i];
            }
        }
        self.t[..total].copy_from_slice(&lines[2].as_mut()[base..base + total]);

        let h = self.dt_history.len();
        for i in 0..total {
            self.temp[h + i] = 0.828331 * self.d[i] + 0.767820 * self.t[i];
        }
        {
            let x = &mut lines[1].as_mut()[base..base + n];
            Self::shift(&mut self.temp, &mut self.dt_history, forward, x);
        }
        // W and X both use j(0.828331*D + 0.767820*T), held in the X line.
        for i in 0..n {
            let jdt = lines[1].as_mut()[base + i];
            lines[0].as_mut()[base + i] = 0.981532 * self.s[i] + 0.197484 * jdt;
            lines[1].as_mut()[base + i] = 0.418496 * self.s[i] - jdt;
        }

        self.temp[h..h + total].copy_from_slice(&self.s[..total]);
        {
            let y = &mut lines[2].as_mut()[base..base + n];
            Self::shift(&mut self.temp, &mut self.s_history, forward, y);
            for i in 0..n {
                y[i] = 0.795968 * self.d[i] - 0.676392 * self.t[i] + 0.186633 * y[i];
            }
        }

        if let Some(z) = lines.get_mut(3) {
            for s in z.as_mut()[base..base + n].iter_mut() {
                *s *= 1.023332;
            }
        }
    }

    /// Decodes super stereo (plain stereo widened into first-order B-Format)
    /// in place. Lines as for [`UhjDecoder::decode`], with a third line
    /// receiving Y.
    pub fn decode_stereo<L: AsMut<[f32]>>(
        &mut self,
        lines: &mut [L],
        base: usize,
        samples_to_do: usize,
        forward: usize,
    ) {
        let n = samples_to_do;
        let total = n + UHJ_FILTER_DELAY;
        {
            let left = &lines[0].as_mut()[base..base + total];
            self.s[..total].copy_from_slice(left);
            self.d[..total].copy_from_slice(left);
        }
        {
            let right = &lines[1].as_mut()[base..base + total];
            for i in 0..total {
                self.s[i] += right[i];
                self.d[i] -= right[i];
            }
        }

        // The width factor is pre-applied to D, fading when it changes.
        let wtarget = self.width_control;
        let wcurrent = if self.current_width < 0.0 {
            wtarget
        } else {
            self.current_width
        };
        if wtarget == wcurrent || forward == 0 {
            for d in self.d[..total].iter_mut() {
                *d *= wcurrent;
            }
        } else {
            let wstep = (wtarget - wcurrent) / forward as f32;
            for (i, d) in self.d[..total].iter_mut().enumerate() {
                let w = if i < forward {
                    wcurrent + wstep * i as f32
                } else {
                    wtarget
                };
                *d *= w;
            }
            self.current_width = wtarget;
        }
        if self.current_width < 0.0 {
            self.current_width = wcurrent;
        }

        let h = self.dt_history.len();
        self.temp[h..h + total].copy_from_slice(&self.d[..total]);
        {
            let x = &mut lines[1].as_mut()[base..base + n];
            Self::shift(&mut self.temp, &mut self.dt_history, forward, x);
        }
        for i in 0..n {
            let jd = lines[1].as_mut()[base + i];
            lines[0].as_mut()[base + i] = 0.6098637 * self.s[i] - 0.6896511 * jd;
            lines[1].as_mut()[base + i] = 0.8624776 * self.s[i] + 0.7626955 * jd;
        }

        self.temp[h..h + total].copy_from_slice(&self.s[..total]);
        let y = &mut lines[2].as_mut()[base..base + n];
        Self::shift(&mut self.temp, &mut self.s_history, forward, y);
        for i in 0..n {
            y[i] = 1.6822415 * self.d[i] - 0.2156194 * y[i];
        }
    }
}

impl Default for UhjDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::new_lines;
    use std::f32::consts::TAU;

    #[test]
    fn phase_shift_turns_sine_into_cosine() {
        let shifter = PhaseShifter::new();
        let src: Vec<f32> = (0..600).map(|i| (TAU * i as f32 / 16.0).sin()).collect();
        let mut dst = vec![0.0f32; 300];
        shifter.process(&mut dst, &src);
        for (i, &v) in dst.iter().enumerate() {
            let expected = (TAU * (i + UHJ_FILTER_DELAY - 1) as f32 / 16.0).cos();
            assert!((v - expected).abs() < 1e-3, "sample {}: {} vs {}", i, v, expected);
        }
    }

    fn tone(periods: &[(f32, f32)], len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                periods
                    .iter()
                    .map(|&(period, phase)| 0.2 * (TAU * i as f32 / period + phase).sin())
                    .sum()
            })
            .collect()
    }

    #[test]
    fn three_channel_round_trip() {
        const BLOCK: usize = 256;
        const BLOCKS: usize = 16;
        let len = BLOCK * BLOCKS;
        // Periods dividing the filter length keep the FIR error negligible.
        let w = tone(&[(32.0, 0.3), (16.0, 1.0)], len);
        let x = tone(&[(64.0 / 3.0, 2.0), (8.0, 0.5)], len);
        let y = tone(&[(12.8, 1.5), (64.0, 4.0)], len);

        let mut enc = UhjEncoder::new();
        let mut left = vec![0.0f32; len];
        let mut right = vec![0.0f32; len];
        let mut t = vec![0.0f32; len];
        let mut input = new_lines(3);
        for b in 0..BLOCKS {
            let r = b * BLOCK..(b + 1) * BLOCK;
            input[0][..BLOCK].copy_from_slice(&w[r.clone()]);
            input[1][..BLOCK].copy_from_slice(&x[r.clone()]);
            input[2][..BLOCK].copy_from_slice(&y[r.clone()]);
            enc.encode(&mut left[r.clone()], &mut right[r.clone()], &input, BLOCK);
            enc.encode_tq(&mut t[r], None, &input, BLOCK);
        }

        let mut dec = UhjDecoder::new();
        let mut lines = vec![vec![0.0f32; BLOCK + UHJ_FILTER_DELAY]; 3];
        let mut out = vec![vec![0.0f32; len]; 3];
        let decode_blocks = BLOCKS - 1;
        for b in 0..decode_blocks {
            let r = b * BLOCK..(b + 1) * BLOCK + UHJ_FILTER_DELAY;
            lines[0].copy_from_slice(&left[r.clone()]);
            lines[1].copy_from_slice(&right[r.clone()]);
            lines[2].copy_from_slice(&t[r]);
            dec.decode(&mut lines, 0, BLOCK, BLOCK);
            for c in 0..3 {
                out[c][b * BLOCK..(b + 1) * BLOCK].copy_from_slice(&lines[c][..BLOCK]);
            }
        }

        let originals = [&w, &x, &y];
        for c in 0..3 {
            let mut err = 0.0f64;
            let mut sig = 0.0f64;
            for i in 1024..decode_blocks * BLOCK {
                let reference = originals[c][i - UHJ_FILTER_DELAY] as f64;
                let e = out[c][i] as f64 - reference;
                err += e * e;
                sig += reference * reference;
            }
            let db = 10.0 * (err / sig).log10();
            assert!(db < -60.0, "channel {} error {} dB", c, db);
        }
    }

    #[test]
    fn four_channel_round_trip() {
        const BLOCK: usize = 256;
        const BLOCKS: usize = 16;
        let len = BLOCK * BLOCKS;
        let w = tone(&[(32.0, 0.3), (16.0, 1.0)], len);
        let x = tone(&[(64.0 / 3.0, 2.0), (8.0, 0.5)], len);
        let y = tone(&[(12.8, 1.5), (64.0, 4.0)], len);
        let z = tone(&[(16.0, 2.5), (32.0, 0.7)], len);

        let mut enc = UhjEncoder::new();
        let mut left = vec![0.0f32; len];
        let mut right = vec![0.0f32; len];
        let mut t = vec![0.0f32; len];
        let mut q = vec![0.0f32; len];
        let mut input = new_lines(4);
        for b in 0..BLOCKS {
            let r = b * BLOCK..(b + 1) * BLOCK;
            input[0][..BLOCK].copy_from_slice(&w[r.clone()]);
            input[1][..BLOCK].copy_from_slice(&x[r.clone()]);
            input[2][..BLOCK].copy_from_slice(&y[r.clone()]);
            input[3][..BLOCK].copy_from_slice(&z[r.clone()]);
            enc.encode(&mut left[r.clone()], &mut right[r.clone()], &input, BLOCK);
            enc.encode_tq(&mut t[r.clone()], Some(&mut q[r]), &input, BLOCK);
        }

        let mut dec = UhjDecoder::new();
        let mut lines = vec![vec![0.0f32; BLOCK + UHJ_FILTER_DELAY]; 4];
        let mut out = vec![vec![0.0f32; len]; 4];
        let decode_blocks = BLOCKS - 1;
        for b in 0..decode_blocks {
            let r = b * BLOCK..(b + 1) * BLOCK + UHJ_FILTER_DELAY;
            lines[0].copy_from_slice(&left[r.clone()]);
            lines[1].copy_from_slice(&right[r.clone()]);
            lines[2].copy_from_slice(&t[r.clone()]);
            lines[3].copy_from_slice(&q[r]);
            dec.decode(&mut lines, 0, BLOCK, BLOCK);
            for c in 0..4 {
                out[c][b * BLOCK..(b + 1) * BLOCK].copy_from_slice(&lines[c][..BLOCK]);
            }
        }

        let originals = [&w, &x, &y, &z];
        for c in 0..4 {
            let mut err = 0.0f64;
            let mut sig = 0.0f64;
            for i in 1024..decode_blocks * BLOCK {
                let reference = originals[c][i - UHJ_FILTER_DELAY] as f64;
                let e = out[c][i] as f64 - reference;
                err += e * e;
                sig += reference * reference;
            }
            let db = 10.0 * (err / sig).log10();
            assert!(db < -60.0, "channel {} error {} dB", c, db);
        }
    }

    #[test]
    fn super_stereo_centre_has_no_side() {
        let mut dec = UhjDecoder::new();
        dec.set_width(0.5);
        let n = 256;
        let mut lines = vec![vec![0.0f32; n + UHJ_FILTER_DELAY]; 3];
        for i in 0..n + UHJ_FILTER_DELAY {
            let v = (TAU * i as f32 / 32.0).sin();
            lines[0][i] = v;
            lines[1][i] = v;
        }
        dec.decode_stereo(&mut lines, 0, n, n);
        // Identical channels carry no difference signal, so Y is only the
        // phase-shifted sum and W/X are pure S.
        for i in 0..n {
            let s = 2.0 * (TAU * i as f32 / 32.0).sin();
            assert!((lines[0][i] - 0.6098637 * s).abs() < 1e-4);
            assert!((lines[1][i] - 0.8624776 * s).abs() < 1e-4);
        }
    }
}
