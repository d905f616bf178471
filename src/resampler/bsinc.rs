//! Band-limited sinc filter tables.
//!
//! Each table holds Kaiser-windowed sinc filters for `BSINC_SCALE_COUNT`
//! downsampling scales and `BSINC_PHASE_COUNT` sub-sample phases. For every
//! scale the layout is, per phase, `m` filter taps followed by `m` phase
//! deltas; then, per phase, `m` scale deltas followed by `m` scale-phase
//! deltas. The deltas turn the bilinear phase/scale interpolation into a
//! single multiply-add per tap.

use once_cell::sync::Lazy;

use super::{MAX_RESAMPLER_PADDING, MIXER_FRAC_ONE};

pub const BSINC_PHASE_BITS: u32 = 5;
pub const BSINC_PHASE_COUNT: usize = 1 << BSINC_PHASE_BITS;
pub const BSINC_SCALE_COUNT: usize = 16;

pub struct BSincTable {
    pub scale_base: f32,
    /// Reciprocal of the scale range.
    pub scale_range: f32,
    pub m: [usize; BSINC_SCALE_COUNT],
    pub filter_offset: [usize; BSINC_SCALE_COUNT],
    pub table: Vec<f32>,
}

/// Per-voice state for the sinc resamplers.
#[derive(Clone, Copy, Debug)]
pub struct BsincState {
    /// Scale interpolation factor.
    pub sf: f32,
    /// Number of taps.
    pub m: usize,
    /// Taps before the current sample.
    pub l: usize,
    pub filter: &'static [f32],
}

impl Default for BsincState {
    fn default() -> Self {
        Self {
            sf: 0.0,
            m: 0,
            l: 0,
            filter: &[],
        }
    }
}

fn sinc(x: f64) -> f64 {
    if !(x > f64::EPSILON || x < -f64::EPSILON) {
        return 1.0;
    }
    (std::f64::consts::PI * x).sin() / (std::f64::consts::PI * x)
}

/// Zero-order modified Bessel function of the first kind.
pub(crate) fn bessel_i0(x: f64) -> f64 {
    let x2 = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    let mut k = 1.0;
    loop {
        let y = x2 / k;
        k += 1.0;
        let last_sum = sum;
        term *= y * y;
        sum += term;
        if sum == last_sum {
            return sum;
        }
    }
}

/// Kaiser window for normalized `k` in [-1, 1].
pub(crate) fn kaiser(beta: f64, k: f64, besseli_0_beta: f64) -> f64 {
    if !(-1.0..=1.0).contains(&k) {
        return 0.0;
    }
    bessel_i0(beta * (1.0 - k * k).sqrt()) / besseli_0_beta
}

/// Normalized transition width of the Kaiser window for a rejection in dB.
fn kaiser_width(rejection: f64, order: u32) -> f64 {
    let tau = std::f64::consts::TAU;
    if rejection > 21.19 {
        return (rejection - 7.95) / (2.285 * tau * order as f64);
    }
    5.79 / (tau * order as f64)
}

fn kaiser_beta(rejection: f64) -> f64 {
    if rejection > 50.0 {
        0.1102 * (rejection - 8.7)
    } else if rejection >= 21.0 {
        0.5842 * (rejection - 21.0).powf(0.4) + 0.07886 * (rejection - 21.0)
    } else {
        0.0
    }
}

impl BSincTable {
    /// Builds the table for a filter of `order` with `rejection` dB of
    /// stop-band attenuation. The order doubles as the filter scales down.
    fn generate(rejection: f64, order: u32) -> Self {
        let width = kaiser_width(rejection, order);
        let beta = kaiser_beta(rejection);
        let scale_base = width / 2.0;
        let scale_range = 1.0 - scale_base;
        let besseli_0_beta = bessel_i0(beta);
        let num_points = order + 1;

        let scale_at = |si: usize| scale_base + scale_range * (si + 1) as f64 / BSINC_SCALE_COUNT as f64;

        let mut a = [0usize; BSINC_SCALE_COUNT];
        for (si, a) in a.iter_mut().enumerate() {
            let scale = scale_at(si);
            *a = ((num_points as f64 / 2.0 / scale) as u32).min(num_points) as usize;
        }

        let points_max = (a[0] * 2 + 3) & !3;
        debug_assert!(points_max <= MAX_RESAMPLER_PADDING);

        // filter[si][pi][i], with one extra phase so the last phase delta has
        // a target.
        let mut filter = vec![vec![vec![0.0f64; points_max]; BSINC_PHASE_COUNT + 1]; BSINC_SCALE_COUNT];
        for si in 0..BSINC_SCALE_COUNT {
            let m = a[si] * 2;
            let o = (points_max - m) / 2;
            let scale = scale_at(si);
            let cutoff = scale - scale_base * (scale * 2.0).max(1.0);
            let l = a[si] as f64 - 1.0 / BSINC_PHASE_COUNT as f64;

            for pi in 0..=BSINC_PHASE_COUNT {
                let phase = l.floor() + pi as f64 / BSINC_PHASE_COUNT as f64;
                for i in 0..m {
                    let x = i as f64 - phase;
                    filter[si][pi][o + i] =
                        kaiser(beta, x / l, besseli_0_beta) * cutoff * sinc(cutoff * x);
                }
            }
        }

        let mut m = [0usize; BSINC_SCALE_COUNT];
        let mut filter_offset = [0usize; BSINC_SCALE_COUNT];
        let mut table = Vec::new();
        for si in 0..BSINC_SCALE_COUNT {
            let msz = (a[si] * 2 + 3) & !3;
            let o = (points_max - msz) / 2;
            m[si] = msz;
            filter_offset[si] = table.len();

            for pi in 0..BSINC_PHASE_COUNT {
                for i in 0..msz {
                    table.push(filter[si][pi][o + i] as f32);
                }
                for i in 0..msz {
                    table.push((filter[si][pi + 1][o + i] - filter[si][pi][o + i]) as f32);
                }
            }

            if si == BSINC_SCALE_COUNT - 1 {
                table.extend(std::iter::repeat(0.0f32).take(BSINC_PHASE_COUNT * msz * 2));
            } else {
                for pi in 0..BSINC_PHASE_COUNT {
                    for i in 0..msz {
                        table.push((filter[si + 1][pi][o + i] - filter[si][pi][o + i]) as f32);
                    }
                    for i in 0..msz {
                        let sp_delta = (filter[si + 1][pi + 1][o + i] - filter[si + 1][pi][o + i])
                            - (filter[si][pi + 1][o + i] - filter[si][pi][o + i]);
                        table.push(sp_delta as f32);
                    }
                }
            }
        }

        Self {
            scale_base: scale_base as f32,
            scale_range: (1.0 / scale_range) as f32,
            m,
            filter_offset,
            table,
        }
    }

    /// Picks the filter scale for a resampling `increment`.
    pub fn prepare(&'static self, increment: u32) -> BsincState {
        let mut si = BSINC_SCALE_COUNT - 1;
        let mut sf = 0.0f32;

        if increment > MIXER_FRAC_ONE {
            sf = MIXER_FRAC_ONE as f32 / increment as f32 - self.scale_base;
            sf = (BSINC_SCALE_COUNT as f32 * sf * self.scale_range - 1.0).max(0.0);
            si = (sf as usize).min(BSINC_SCALE_COUNT - 1);
            // Fit to a diagonally-symmetric curve to reduce the transition
            // ripple between scales.
            sf = 1.0 - (sf - si as f32).asin().cos();
        }

        let m = self.m[si];
        BsincState {
            sf,
            m,
            l: m / 2 - 1,
            filter: &self.table[self.filter_offset[si]..],
        }
    }
}

/// 11th order filter (12 points), 60 dB at Nyquist.
pub static BSINC12: Lazy<BSincTable> = Lazy::new(|| BSincTable::generate(60.0, 11));

/// 23rd order filter (24 points), 60 dB at Nyquist.
pub static BSINC24: Lazy<BSincTable> = Lazy::new(|| BSincTable::generate(60.0, 23));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_counts_fit_padding() {
        for table in [&*BSINC12, &*BSINC24] {
            assert!(table.m[0] <= MAX_RESAMPLER_PADDING);
            for si in 1..BSINC_SCALE_COUNT {
                assert!(table.m[si] <= table.m[si - 1]);
                assert_eq!(table.m[si] % 4, 0);
            }
        }
        assert_eq!(BSINC24.m[0], 48);
    }

    #[test]
    fn table_size_matches_layout() {
        for table in [&*BSINC12, &*BSINC24] {
            let expected: usize = table.m.iter().map(|m| 4 * BSINC_PHASE_COUNT * m).sum();
            assert_eq!(table.table.len(), expected);
        }
    }

    #[test]
    fn unity_increment_uses_widest_scale() {
        let state = BSINC12.prepare(MIXER_FRAC_ONE);
        assert_eq!(state.m, BSINC12.m[BSINC_SCALE_COUNT - 1]);
        assert_eq!(state.sf, 0.0);

        let down = BSINC12.prepare(MIXER_FRAC_ONE * 2);
        assert!(down.m > state.m);
    }

    #[test]
    fn bessel_matches_known_value() {
        // I0(1) = 1.2660658777520084
        assert!((bessel_i0(1.0) - 1.266_065_877_752_008_4).abs() < 1e-12);
    }
}
