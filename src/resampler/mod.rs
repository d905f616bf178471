//! Fixed-point phase resamplers.
//!
//! Every kernel reads from a source slice whose current sample sits at
//! `MAX_RESAMPLER_EDGE`, so up to `MAX_RESAMPLER_EDGE` samples of history are
//! available before it. The phase `frac` holds `MIXER_FRAC_BITS` fractional
//! bits; `increment` is added per output sample.

pub mod bsinc;

use serde::{Deserialize, Serialize};

use crate::audio::cubic;
pub use bsinc::{BSincTable, BsincState, BSINC12, BSINC24};

pub const MIXER_FRAC_BITS: u32 = 12;
pub const MIXER_FRAC_ONE: u32 = 1 << MIXER_FRAC_BITS;
pub const MIXER_FRAC_MASK: u32 = MIXER_FRAC_ONE - 1;

/// Maximum pitch multiplier, including sample rate conversion.
pub const MAX_PITCH: u32 = 10;

/// Samples the widest kernel needs beyond the current position.
pub const MAX_RESAMPLER_PADDING: usize = 48;
pub const MAX_RESAMPLER_EDGE: usize = MAX_RESAMPLER_PADDING >> 1;

const FRAC_PHASE_BIT_DIFF: u32 = MIXER_FRAC_BITS - bsinc::BSINC_PHASE_BITS;
const FRAC_PHASE_DIFF_ONE: u32 = 1 << FRAC_PHASE_BIT_DIFF;

/// User-selectable resampling quality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Resampler {
    Point,
    Linear,
    #[default]
    Cubic,
    Bsinc12,
    FastBsinc12,
    Bsinc24,
    FastBsinc24,
}

impl Resampler {
    /// Resolves the kernel and state for a given step.
    pub fn prepare(self, increment: u32) -> PreparedResampler {
        let (kind, bsinc) = match self {
            Resampler::Point => (Kernel::Point, BsincState::default()),
            Resampler::Linear => (Kernel::Linear, BsincState::default()),
            Resampler::Cubic => (Kernel::Cubic, BsincState::default()),
            Resampler::Bsinc12 | Resampler::Bsinc24 => {
                let table: &'static BSincTable = if self == Resampler::Bsinc12 {
                    &BSINC12
                } else {
                    &BSINC24
                };
                let kind = if increment <= MIXER_FRAC_ONE {
                    Kernel::FastBsinc
                } else {
                    Kernel::Bsinc
                };
                (kind, table.prepare(increment))
            }
            Resampler::FastBsinc12 => (Kernel::FastBsinc, BSINC12.prepare(increment)),
            Resampler::FastBsinc24 => (Kernel::FastBsinc, BSINC24.prepare(increment)),
        };
        PreparedResampler { kind, bsinc }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kernel {
    Copy,
    Point,
    Linear,
    Cubic,
    Bsinc,
    FastBsinc,
}

/// A kernel bound to its per-voice interpolation state.
#[derive(Clone, Copy, Debug)]
pub struct PreparedResampler {
    pub kind: Kernel,
    pub bsinc: BsincState,
}

impl Default for PreparedResampler {
    fn default() -> Self {
        Self {
            kind: Kernel::Point,
            bsinc: BsincState::default(),
        }
    }
}

impl PreparedResampler {
    /// A pass-through used when the step is exactly one sample.
    pub fn copy() -> Self {
        Self {
            kind: Kernel::Copy,
            bsinc: BsincState::default(),
        }
    }

    /// Resamples into `dst`. `src[MAX_RESAMPLER_EDGE]` is the sample at the
    /// current position, and `src` must extend at least
    /// `MAX_RESAMPLER_EDGE` samples past the last position read.
    pub fn resample(&self, src: &[f32], frac: u32, increment: u32, dst: &mut [f32]) {
        let base = MAX_RESAMPLER_EDGE;
        match self.kind {
            Kernel::Copy => {
                let len = dst.len();
                dst.copy_from_slice(&src[base..base + len]);
            }
            Kernel::Point => do_resample(src, base, frac, increment, dst, |vals, _| vals[0]),
            Kernel::Linear => do_resample(src, base, frac, increment, dst, |vals, frac| {
                crate::audio::lerpf(vals[0], vals[1], frac as f32 * (1.0 / MIXER_FRAC_ONE as f32))
            }),
            Kernel::Cubic => do_resample(src, base - 1, frac, increment, dst, |vals, frac| {
                cubic(
                    vals[0],
                    vals[1],
                    vals[2],
                    vals[3],
                    frac as f32 * (1.0 / MIXER_FRAC_ONE as f32),
                )
            }),
            Kernel::Bsinc => {
                let state = self.bsinc;
                do_resample(src, base - state.l, frac, increment, dst, |vals, frac| {
                    do_bsinc(&state, vals, frac)
                })
            }
            Kernel::FastBsinc => {
                let state = self.bsinc;
                do_resample(src, base - state.l, frac, increment, dst, |vals, frac| {
                    do_fast_bsinc(&state, vals, frac)
                })
            }
        }
    }
}

#[inline(always)]
fn do_resample<F>(src: &[f32], start: usize, mut frac: u32, increment: u32, dst: &mut [f32], sampler: F)
where
    F: Fn(&[f32], u32) -> f32,
{
    let mut pos = start;
    for out in dst.iter_mut() {
        *out = sampler(&src[pos..], frac);

        frac += increment;
        pos += (frac >> MIXER_FRAC_BITS) as usize;
        frac &= MIXER_FRAC_MASK;
    }
}

#[inline(always)]
fn do_bsinc(state: &BsincState, vals: &[f32], frac: u32) -> f32 {
    let m = state.m;
    let pi = (frac >> FRAC_PHASE_BIT_DIFF) as usize;
    let pf = (frac & (FRAC_PHASE_DIFF_ONE - 1)) as f32 * (1.0 / FRAC_PHASE_DIFF_ONE as f32);

    let fil = &state.filter[m * pi * 2..];
    let phd = &fil[m..];
    let scd = &fil[bsinc::BSINC_PHASE_COUNT * 2 * m..];
    let spd = &scd[m..];

    let sf = state.sf;
    let mut r = 0.0f32;
    for j in 0..m {
        r += (fil[j] + sf * scd[j] + pf * (phd[j] + sf * spd[j])) * vals[j];
    }
    r
}

#[inline(always)]
fn do_fast_bsinc(state: &BsincState, vals: &[f32], frac: u32) -> f32 {
    let m = state.m;
    let pi = (frac >> FRAC_PHASE_BIT_DIFF) as usize;
    let pf = (frac & (FRAC_PHASE_DIFF_ONE - 1)) as f32 * (1.0 / FRAC_PHASE_DIFF_ONE as f32);

    let fil = &state.filter[m * pi * 2..];
    let phd = &fil[m..];

    let mut r = 0.0f32;
    for j in 0..m {
        r += (fil[j] + pf * phd[j]) * vals[j];
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_source(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 * 0.01 - 0.3).collect()
    }

    #[test]
    fn unit_step_reproduces_source() {
        let src = ramp_source(256);
        for resampler in [Resampler::Point, Resampler::Linear, Resampler::Cubic] {
            let prepared = resampler.prepare(MIXER_FRAC_ONE);
            let mut dst = vec![0.0; 128];
            prepared.resample(&src, 0, MIXER_FRAC_ONE, &mut dst);
            for (i, &v) in dst.iter().enumerate() {
                assert!(
                    (v - src[MAX_RESAMPLER_EDGE + i]).abs() < 1e-6,
                    "{:?} sample {} was {}",
                    resampler,
                    i,
                    v
                );
            }
        }
    }

    #[test]
    fn bsinc_unity_dc_gain() {
        let src = vec![1.0f32; 256];
        let mut dst = vec![0.0; 64];
        Resampler::Bsinc12
            .prepare(MIXER_FRAC_ONE)
            .resample(&src, 0, MIXER_FRAC_ONE, &mut dst);
        for &v in &dst {
            assert!((v - 1.0).abs() < 1e-5, "bsinc12 DC gain {}", v);
        }

        Resampler::Bsinc24
            .prepare(MIXER_FRAC_ONE)
            .resample(&src, 0, MIXER_FRAC_ONE, &mut dst);
        for &v in &dst {
            assert!((v - 1.0).abs() < 1e-3, "bsinc24 DC gain {}", v);
        }
    }

    #[test]
    fn linear_interpolates_half_step() {
        let src = ramp_source(128);
        let mut dst = vec![0.0; 8];
        Resampler::Linear
            .prepare(MIXER_FRAC_ONE / 2)
            .resample(&src, 0, MIXER_FRAC_ONE / 2, &mut dst);
        for (i, &v) in dst.iter().enumerate() {
            let expected = src[MAX_RESAMPLER_EDGE] + 0.005 * i as f32;
            assert!((v - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn downsampling_selects_full_kernel() {
        let prepared = Resampler::Bsinc24.prepare(MIXER_FRAC_ONE * 3);
        assert_eq!(prepared.kind, Kernel::Bsinc);
        let fast = Resampler::FastBsinc24.prepare(MIXER_FRAC_ONE * 3);
        assert_eq!(fast.kind, Kernel::FastBsinc);

        // Downsampled DC stays near unity for the scaled filter too.
        let src = vec![1.0f32; 512];
        let mut dst = vec![0.0; 64];
        prepared.resample(&src, 0, MIXER_FRAC_ONE * 3, &mut dst);
        for &v in &dst {
            assert!((v - 1.0).abs() < 0.05, "downsampled DC {}", v);
        }
    }

    #[test]
    fn serde_names_are_snake_case() {
        let r: Resampler = serde_json::from_str("\"fast_bsinc24\"").unwrap();
        assert_eq!(r, Resampler::FastBsinc24);
        assert_eq!(serde_json::to_string(&Resampler::Bsinc12).unwrap(), "\"bsinc12\"");
    }
}
