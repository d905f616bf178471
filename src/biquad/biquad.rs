use std::f32::consts::TAU;

use serde::{Deserialize, Serialize};

/// Response shapes supported by [`Biquad`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BiquadType {
    /// Modifies the gain of frequencies below the reference.
    LowShelf,
    /// Modifies the gain of frequencies above the reference.
    HighShelf,
    /// Modifies the gain around the reference, by a given bandwidth.
    Peaking,
    LowPass,
    HighPass,
    BandPass,
}

/// A second-order IIR section in transposed direct form II.
///
/// Coefficients are normalized so `a0 == 1`. The frequency passed to the
/// parameter setters is normalized to the sample rate (`f0 / fs`) and must be
/// below 0.5.
#[derive(Clone, Copy, Debug)]
pub struct Biquad {
    // Coefficients
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    // History
    z1: f32,
    z2: f32,
}

impl Default for Biquad {
    fn default() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: 0.0,
            z2: 0.0,
        }
    }
}

impl Biquad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the filter history. Coefficients are kept.
    pub fn clear(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// Reciprocal of Q for a shelf of the given gain and slope.
    pub fn rcp_q_from_slope(gain: f32, slope: f32) -> f32 {
        ((gain + 1.0 / gain) * (1.0 / slope - 1.0) + 2.0).sqrt()
    }

    /// Reciprocal of Q for a band of `bandwidth` octaves centred on `f0norm`.
    pub fn rcp_q_from_bandwidth(f0norm: f32, bandwidth: f32) -> f32 {
        let w0 = TAU * f0norm;
        2.0 * (std::f32::consts::LN_2 / 2.0 * bandwidth * w0 / w0.sin()).sinh()
    }

    /// Sets the filter from a shelf slope. 1.0 is the steepest slope that
    /// doesn't overshoot. `gain` is limited to -60 dB.
    pub fn set_params_from_slope(&mut self, kind: BiquadType, f0norm: f32, gain: f32, slope: f32) {
        let gain = gain.max(0.001);
        self.set_params(kind, f0norm, gain, Self::rcp_q_from_slope(gain, slope));
    }

    /// Sets the filter from a bandwidth in octaves, for parametric sections.
    pub fn set_params_from_bandwidth(
        &mut self,
        kind: BiquadType,
        f0norm: f32,
        gain: f32,
        bandwidth: f32,
    ) {
        self.set_params(kind, f0norm, gain, Self::rcp_q_from_bandwidth(f0norm, bandwidth));
    }

    /// Copies the coefficients of `other`, leaving this filter's history alone.
    pub fn copy_params_from(&mut self, other: &Biquad) {
        self.b0 = other.b0;
        self.b1 = other.b1;
        self.b2 = other.b2;
        self.a1 = other.a1;
        self.a2 = other.a2;
    }

    /// Recalculates the coefficients using the Audio EQ Cookbook formulas.
    ///
    /// For shelf and peaking types, `gain` is the amplitude at the reference
    /// frequency; the filter reaches `gain * gain` in the shelved band.
    pub fn set_params(&mut self, kind: BiquadType, f0norm: f32, gain: f32, rcp_q: f32) {
        // Limit gain to -100dB
        let gain = gain.max(0.00001);

        let w0 = TAU * f0norm;
        let sin_w0 = w0.sin();
        let cos_w0 = w0.cos();
        let alpha = sin_w0 / 2.0 * rcp_q;

        let (b, a) = match kind {
            BiquadType::HighShelf => {
                let sqrtgain_alpha_2 = 2.0 * gain.sqrt() * alpha;
                (
                    [
                        gain * ((gain + 1.0) + (gain - 1.0) * cos_w0 + sqrtgain_alpha_2),
                        -2.0 * gain * ((gain - 1.0) + (gain + 1.0) * cos_w0),
                        gain * ((gain + 1.0) + (gain - 1.0) * cos_w0 - sqrtgain_alpha_2),
                    ],
                    [
                        (gain + 1.0) - (gain - 1.0) * cos_w0 + sqrtgain_alpha_2,
                        2.0 * ((gain - 1.0) - (gain + 1.0) * cos_w0),
                        (gain + 1.0) - (gain - 1.0) * cos_w0 - sqrtgain_alpha_2,
                    ],
                )
            }
            BiquadType::LowShelf => {
                let sqrtgain_alpha_2 = 2.0 * gain.sqrt() * alpha;
                (
                    [
                        gain * ((gain + 1.0) - (gain - 1.0) * cos_w0 + sqrtgain_alpha_2),
                        2.0 * gain * ((gain - 1.0) - (gain + 1.0) * cos_w0),
                        gain * ((gain + 1.0) - (gain - 1.0) * cos_w0 - sqrtgain_alpha_2),
                    ],
                    [
                        (gain + 1.0) + (gain - 1.0) * cos_w0 + sqrtgain_alpha_2,
                        -2.0 * ((gain - 1.0) + (gain + 1.0) * cos_w0),
                        (gain + 1.0) + (gain - 1.0) * cos_w0 - sqrtgain_alpha_2,
                    ],
                )
            }
            BiquadType::Peaking => (
                [1.0 + alpha * gain, -2.0 * cos_w0, 1.0 - alpha * gain],
                [1.0 + alpha / gain, -2.0 * cos_w0, 1.0 - alpha / gain],
            ),
            BiquadType::LowPass => (
                [(1.0 - cos_w0) / 2.0, 1.0 - cos_w0, (1.0 - cos_w0) / 2.0],
                [1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha],
            ),
            BiquadType::HighPass => (
                [(1.0 + cos_w0) / 2.0, -(1.0 + cos_w0), (1.0 + cos_w0) / 2.0],
                [1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha],
            ),
            BiquadType::BandPass => (
                [alpha, 0.0, -alpha],
                [1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha],
            ),
        };

        self.a1 = a[1] / a[0];
        self.a2 = a[2] / a[0];
        self.b0 = b[0] / a[0];
        self.b1 = b[1] / a[0];
        self.b2 = b[2] / a[0];
    }

    #[inline(always)]
    pub fn process_one(&mut self, input: f32) -> f32 {
        let out = input * self.b0 + self.z1;
        self.z1 = input * self.b1 - out * self.a1 + self.z2;
        self.z2 = input * self.b2 - out * self.a2;
        out
    }

    /// Filters `src` into `dst`. Both must be the same length.
    pub fn process(&mut self, src: &[f32], dst: &mut [f32]) {
        let (b0, b1, b2, a1, a2) = (self.b0, self.b1, self.b2, self.a1, self.a2);
        let mut z1 = self.z1;
        let mut z2 = self.z2;
        for (out, &input) in dst.iter_mut().zip(src) {
            let y = input * b0 + z1;
            z1 = input * b1 - y * a1 + z2;
            z2 = input * b2 - y * a2;
            *out = y;
        }
        self.z1 = z1;
        self.z2 = z2;
    }

    /// Filters a buffer in place.
    pub fn process_in_place(&mut self, buf: &mut [f32]) {
        for sample in buf.iter_mut() {
            *sample = self.process_one(*sample);
        }
    }

    /// Runs `self` then `other` over `src` in a single pass.
    pub fn dual_process(&mut self, other: &mut Biquad, src: &[f32], dst: &mut [f32]) {
        for (out, &input) in dst.iter_mut().zip(src) {
            let tmp = self.process_one(input);
            *out = other.process_one(tmp);
        }
    }

    /// In-place variant of [`Biquad::dual_process`].
    pub fn dual_process_in_place(&mut self, other: &mut Biquad, buf: &mut [f32]) {
        for sample in buf.iter_mut() {
            let tmp = self.process_one(*sample);
            *sample = other.process_one(tmp);
        }
    }

    /// Advances the history as if `src` had been processed, without output.
    pub fn process_history(&mut self, src: &[f32]) {
        for &input in src {
            self.process_one(input);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [BiquadType; 6] = [
        BiquadType::LowShelf,
        BiquadType::HighShelf,
        BiquadType::Peaking,
        BiquadType::LowPass,
        BiquadType::HighPass,
        BiquadType::BandPass,
    ];

    /// Magnitude response at normalized frequency `f`.
    fn magnitude(filter: &Biquad, f: f32) -> f32 {
        let w = TAU * f;
        let (c1, s1) = (w.cos(), -w.sin());
        let (c2, s2) = ((2.0 * w).cos(), -(2.0 * w).sin());
        let num_re = filter.b0 + filter.b1 * c1 + filter.b2 * c2;
        let num_im = filter.b1 * s1 + filter.b2 * s2;
        let den_re = 1.0 + filter.a1 * c1 + filter.a2 * c2;
        let den_im = filter.a1 * s1 + filter.a2 * s2;
        ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt()
    }

    #[test]
    fn cleared_filter_outputs_silence_for_silence() {
        let src = [0.0f32; 256];
        for &kind in &ALL_TYPES {
            for &f0 in &[0.001f32, 0.05, 0.2, 0.45] {
                for &gain in &[0.01f32, 0.5, 1.0, 4.0] {
                    let mut filter = Biquad::new();
                    filter.set_params_from_slope(kind, f0, gain, 1.0);
                    filter.process_history(&[1.0, -0.5, 0.25]);
                    filter.clear();
                    let mut dst = [1.0f32; 256];
                    filter.process(&src, &mut dst);
                    assert!(
                        dst.iter().all(|&s| s == 0.0),
                        "{:?} f0={} gain={} produced non-zero output",
                        kind,
                        f0,
                        gain
                    );
                }
            }
        }
    }

    #[test]
    fn random_settings_stay_stable_on_noise() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let noise: Vec<f32> = (0..2048).map(|_| rng.random_range(-1.0f32..1.0)).collect();
        for _ in 0..200 {
            let kind = ALL_TYPES[rng.random_range(0..ALL_TYPES.len())];
            let f0 = rng.random_range(0.0005f32..0.49);
            let gain = rng.random_range(0.01f32..8.0);
            let slope = rng.random_range(0.1f32..1.0);

            let mut filter = Biquad::new();
            filter.set_params_from_slope(kind, f0, gain, slope);
            let mut dst = vec![0.0f32; noise.len()];
            filter.process(&noise, &mut dst);
            assert!(
                dst.iter().all(|s| s.is_finite()),
                "{:?} f0={} gain={} slope={} diverged",
                kind,
                f0,
                gain,
                slope
            );
        }
    }

    #[test]
    fn shelves_reach_squared_gain() {
        let mut filter = Biquad::new();
        filter.set_params_from_slope(BiquadType::HighShelf, 5000.0 / 44100.0, 0.5, 1.0);
        assert!((magnitude(&filter, 0.0) - 1.0).abs() < 1e-4);
        assert!((magnitude(&filter, 0.5) - 0.25).abs() < 1e-3);

        filter.set_params_from_slope(BiquadType::LowShelf, 250.0 / 44100.0, 0.5, 1.0);
        assert!((magnitude(&filter, 0.0) - 0.25).abs() < 1e-3);
        assert!((magnitude(&filter, 0.5) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn peaking_gain_at_centre() {
        let mut filter = Biquad::new();
        filter.set_params_from_bandwidth(BiquadType::Peaking, 0.1, 2.0, 1.0);
        let mag = magnitude(&filter, 0.1);
        assert!((mag - 4.0).abs() < 1e-2, "peak magnitude {}", mag);
    }

    #[test]
    fn dual_process_matches_two_passes() {
        let src: Vec<f32> = (0..64).map(|i| ((i * 7) % 13) as f32 / 13.0 - 0.5).collect();
        let mut a = Biquad::new();
        let mut b = Biquad::new();
        a.set_params_from_slope(BiquadType::LowShelf, 0.01, 2.0, 0.75);
        b.set_params_from_slope(BiquadType::HighShelf, 0.2, 0.5, 0.75);
        let (mut a2, mut b2) = (a, b);

        let mut dual = vec![0.0; 64];
        a.dual_process(&mut b, &src, &mut dual);

        let mut tmp = vec![0.0; 64];
        let mut two = vec![0.0; 64];
        a2.process(&src, &mut tmp);
        b2.process(&tmp, &mut two);
        for (x, y) in dual.iter().zip(&two) {
            assert!((x - y).abs() < 1e-6);
        }
    }
}
