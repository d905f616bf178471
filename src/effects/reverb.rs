//! Standard and EAX reverb.
//!
//! A four-line feedback delay network working in A-Format. The input is
//! converted from first-order B-Format, band-limited by the master shelf
//! filters and written into a main delay line. Early reflections tap the
//! main line, pass through a vector all-pass and an echo line, and are
//! scattered back into the main line where the late stage picks them up.
//! The late stage is a recursive delay with per-line T60 damping, a
//! modulated read position and a second vector all-pass.
//!
//! Parameter changes that move delay taps or decay gains cross-fade between
//! the old and new values over exactly one processed block.

use std::f32::consts::{FRAC_1_SQRT_2, TAU};

use crate::ambisonic::{compute_pan_gains, hf_order_scales, MAX_AMBI_CHANNELS, MAX_AMBI_ORDER};
use crate::audio::{
    cubic, lerpf, Buffer, FloatBufferLine, BUFFER_LINE_SIZE, GAIN_SILENCE_THRESHOLD,
    MAX_OUTPUT_CHANNELS, REVERB_DECAY_GAIN, SPEED_OF_SOUND_METERS_PER_SEC,
};
use crate::biquad::{BandSplitter, Biquad, BiquadType};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;

use super::props::{REVERB_MAX_LATE_REVERB_DELAY, REVERB_MAX_REFLECTIONS_DELAY};
use super::{EffectProcessor, EffectProps, EffectTarget, OutTarget, ReverbProps, SlotParams};

const NUM_LINES: usize = 4;
const MAX_UPDATE_SAMPLES: usize = 256;

const MAX_MODULATION_TIME: f32 = 4.0;
const DEFAULT_MODULATION_TIME: f32 = 0.25;

const MOD_FRACBITS: u32 = 24;
const MOD_FRACONE: u32 = 1 << MOD_FRACBITS;
const MOD_FRACMASK: u32 = MOD_FRACONE - 1;

/// Limits the modulation swing so the read position only moves forward.
const MODULATION_DEPTH_COEFF: f32 = 0.05;

/// Room size in cubic meters that maps to a density of 1.
const DENSITY_SCALE: f32 = 125000.0;

const SQRT3: f32 = 1.732_050_8;

/// First-order B-Format (W, Y, Z, X) to the four A-Format lines.
const B2A: [[f32; NUM_LINES]; NUM_LINES] = [
    [0.5, 0.5, 0.5, 0.5],
    [0.5, -0.5, -0.5, 0.5],
    [0.5, 0.5, -0.5, -0.5],
    [0.5, -0.5, 0.5, -0.5],
];

/// Early lines are reversed relative to B2A, so their decode differs.
const EARLY_A2B: [[f32; NUM_LINES]; NUM_LINES] = [
    [0.5, 0.5, 0.5, 0.5],
    [0.5, -0.5, 0.5, -0.5],
    [0.5, -0.5, -0.5, 0.5],
    [0.5, 0.5, -0.5, -0.5],
];

const LATE_A2B: [[f32; NUM_LINES]; NUM_LINES] = [
    [0.5, 0.5, 0.5, 0.5],
    [FRAC_1_SQRT_2, -FRAC_1_SQRT_2, 0.0, 0.0],
    [0.0, 0.0, FRAC_1_SQRT_2, -FRAC_1_SQRT_2],
    [0.5, 0.5, -0.5, -0.5],
];

// Line lengths in seconds at a density multiplier of 1. They approximate
// the reflection spacing of an average room so every length scales with
// the same room-size multiplier.
const EARLY_TAP_LENGTHS: [f32; NUM_LINES] = [0.0000000e+0, 2.0213520e-4, 4.2531060e-4, 6.7171600e-4];
const EARLY_ALLPASS_LENGTHS: [f32; NUM_LINES] = [9.7096800e-5, 1.0720356e-4, 1.1836234e-4, 1.3068260e-4];
const EARLY_LINE_LENGTHS: [f32; NUM_LINES] = [5.9850400e-4, 1.0913150e-3, 1.5376658e-3, 1.9419362e-3];
const LATE_ALLPASS_LENGTHS: [f32; NUM_LINES] = [1.6182800e-4, 2.0389060e-4, 2.8159360e-4, 3.2365600e-4];
const LATE_LINE_LENGTHS: [f32; NUM_LINES] = [1.9419362e-3, 2.4466860e-3, 3.3791220e-3, 3.8838720e-3];

type LineFrame = [f32; NUM_LINES];
type UpdateLines = [[f32; MAX_UPDATE_SAMPLES]; NUM_LINES];

fn calc_delay_length_mult(density: f32) -> f32 {
    (density * DENSITY_SCALE).cbrt().max(5.0)
}

/// Gain per cycle of `length` seconds for a signal that reaches -60dB
/// after `decay_time` seconds.
fn calc_decay_coeff(length: f32, decay_time: f32) -> f32 {
    REVERB_DECAY_GAIN.powf(length / decay_time)
}

/// Inverse of [`calc_decay_coeff`]: the cycle length giving `coeff`.
fn calc_decay_length(coeff: f32, decay_time: f32) -> f32 {
    const LOG10_DECAYGAIN: f32 = -3.0;
    coeff.log10() * decay_time / LOG10_DECAYGAIN
}

/// Input attenuation compensating for the energy a feedback loop with gain
/// `a` accumulates.
fn calc_density_gain(a: f32) -> f32 {
    (1.0 - a * a).sqrt()
}

/// Scattering coefficients `(x, y)` with `x^2 + 3y^2 = 1`.
fn calc_matrix_coeffs(diffusion: f32) -> (f32, f32) {
    let t = diffusion * SQRT3.atan();
    (t.cos(), t.sin() / SQRT3)
}

/// Caps the HF decay ratio so HF doesn't outlast the air absorption.
fn calc_limited_hf_ratio(hf_ratio: f32, air_absorption_gain_hf: f32, decay_time: f32) -> f32 {
    let limit_ratio =
        1.0 / SPEED_OF_SOUND_METERS_PER_SEC / calc_decay_length(air_absorption_gain_hf, decay_time);
    limit_ratio.min(hf_ratio)
}

/// B-Format matrix focusing the signal toward `vec`, with its magnitude
/// (up to 1) as the focal strength. Reverb panning vectors are left-handed.
fn transform_from_vector(vec: [f32; 3]) -> [[f32; NUM_LINES]; NUM_LINES] {
    let mut mag = (vec[0] * vec[0] + vec[1] * vec[1] + vec[2] * vec[2]).sqrt();
    let norm = if mag > 1.0 {
        let n = [vec[0] / mag * -SQRT3, vec[1] / mag * SQRT3, vec[2] / mag * SQRT3];
        mag = 1.0;
        n
    } else {
        [vec[0] * -SQRT3, vec[1] * SQRT3, vec[2] * SQRT3]
    };

    [
        [1.0, 0.0, 0.0, 0.0],
        [norm[0], 1.0 - mag, 0.0, 0.0],
        [norm[1], 0.0, 1.0 - mag, 0.0],
        [norm[2], 0.0, 0.0, 1.0 - mag],
    ]
}

#[inline]
fn vector_partial_scatter(i: &LineFrame, x: f32, y: f32) -> LineFrame {
    [
        x * i[0] + y * (i[1] - i[2] + i[3]),
        x * i[1] + y * (-i[0] + i[2] + i[3]),
        x * i[2] + y * (i[0] - i[1] + i[3]),
        x * i[3] + y * (-i[0] - i[1] - i[2]),
    ]
}

/// An interleaved four-line delay with a power-of-two length.
#[derive(Default)]
struct DelayLine {
    mask: usize,
    line: Vec<LineFrame>,
}

impl DelayLine {
    fn alloc(&mut self, length: f32, frequency: f32, extra: usize) {
        let samples = ((length * frequency).ceil() as usize + extra).next_power_of_two();
        self.mask = samples - 1;
        self.line = vec![[0.0; NUM_LINES]; samples];
    }

    #[inline]
    fn at(&self, pos: usize) -> &LineFrame {
        &self.line[pos & self.mask]
    }

    fn write(&mut self, offset: usize, c: usize, input: &[f32]) {
        for (i, &s) in input.iter().enumerate() {
            self.line[offset.wrapping_add(i) & self.mask][c] = s;
        }
    }

    /// Reverses the line order of `input`, scatters it and stores it at
    /// `offset`, so each line feeds its opposite.
    fn scatter_rev_in(&mut self, offset: usize, x: f32, y: f32, input: &UpdateLines, count: usize) {
        for i in 0..count {
            let f = [input[3][i], input[2][i], input[1][i], input[0][i]];
            self.line[offset.wrapping_add(i) & self.mask] = vector_partial_scatter(&f, x, y);
        }
    }
}

/// Gerzon vector all-pass: a per-line all-pass whose delay elements feed
/// back through the scattering matrix.
#[derive(Default)]
struct VecAllpass {
    delay: DelayLine,
    coeff: f32,
    offset: [[usize; 2]; NUM_LINES],
}

impl VecAllpass {
    fn process_unfaded(&mut self, samples: &mut UpdateLines, offset: usize, x: f32, y: f32, todo: usize) {
        let feed_coeff = self.coeff;
        let taps: [usize; NUM_LINES] = std::array::from_fn(|j| offset.wrapping_sub(self.offset[j][0]));
        for i in 0..todo {
            let mut f = [0.0f32; NUM_LINES];
            for j in 0..NUM_LINES {
                let input = samples[j][i];
                let out = self.delay.at(taps[j].wrapping_add(i))[j] - feed_coeff * input;
                f[j] = input + feed_coeff * out;
                samples[j][i] = out;
            }
            let pos = offset.wrapping_add(i) & self.delay.mask;
            self.delay.line[pos] = vector_partial_scatter(&f, x, y);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_faded(
        &mut self,
        samples: &mut UpdateLines,
        offset: usize,
        x: f32,
        y: f32,
        mut fade_count: f32,
        fade_step: f32,
        todo: usize,
    ) {
        let feed_coeff = self.coeff;
        let taps: [[usize; 2]; NUM_LINES] = std::array::from_fn(|j| {
            [
                offset.wrapping_sub(self.offset[j][0]),
                offset.wrapping_sub(self.offset[j][1]),
            ]
        });
        for i in 0..todo {
            fade_count += 1.0;
            let fade = fade_count * fade_step;

            let mut f = [0.0f32; NUM_LINES];
            for j in 0..NUM_LINES {
                let old = self.delay.at(taps[j][0].wrapping_add(i))[j];
                let new = self.delay.at(taps[j][1].wrapping_add(i))[j];
                let delayed = old * (1.0 - fade) + new * fade;

                let input = samples[j][i];
                let out = delayed - feed_coeff * input;
                f[j] = input + feed_coeff * out;
                samples[j][i] = out;
            }
            let pos = offset.wrapping_add(i) & self.delay.mask;
            self.delay.line[pos] = vector_partial_scatter(&f, x, y);
        }
    }
}

/// Two shelf sections splitting the decay into low, mid and high bands.
#[derive(Clone, Copy)]
struct T60Filter {
    mid_gain: [f32; 2],
    hf_filter: Biquad,
    lf_filter: Biquad,
}

impl Default for T60Filter {
    fn default() -> Self {
        Self {
            mid_gain: [0.0; 2],
            hf_filter: Biquad::new(),
            lf_filter: Biquad::new(),
        }
    }
}

impl T60Filter {
    fn calc_coeffs(&mut self, length: f32, lf_decay: f32, mf_decay: f32, hf_decay: f32, lf0norm: f32, hf0norm: f32) {
        let mf_gain = calc_decay_coeff(length, mf_decay);
        let lf_gain = calc_decay_coeff(length, lf_decay) / mf_gain;
        let hf_gain = calc_decay_coeff(length, hf_decay) / mf_gain;

        self.mid_gain[1] = mf_gain;
        self.lf_filter
            .set_params_from_slope(BiquadType::LowShelf, lf0norm, lf_gain, 1.0);
        self.hf_filter
            .set_params_from_slope(BiquadType::HighShelf, hf0norm, hf_gain, 1.0);
    }

    fn process(&mut self, samples: &mut [f32]) {
        self.hf_filter.dual_process_in_place(&mut self.lf_filter, samples);
    }
}

struct EarlyReflections {
    vec_ap: VecAllpass,
    /// Echo line producing the secondary reflections.
    delay: DelayLine,
    offset: [[usize; 2]; NUM_LINES],
    coeff: [[f32; 2]; NUM_LINES],

    current_gain: [[f32; MAX_OUTPUT_CHANNELS]; NUM_LINES],
    pan_gain: [[f32; MAX_OUTPUT_CHANNELS]; NUM_LINES],
}

impl EarlyReflections {
    fn new() -> Self {
        Self {
            vec_ap: VecAllpass::default(),
            delay: DelayLine::default(),
            offset: [[0; 2]; NUM_LINES],
            coeff: [[0.0; 2]; NUM_LINES],
            current_gain: [[0.0; MAX_OUTPUT_CHANNELS]; NUM_LINES],
            pan_gain: [[0.0; MAX_OUTPUT_CHANNELS]; NUM_LINES],
        }
    }

    fn update_lines(&mut self, density_mult: f32, diffusion: f32, decay_time: f32, frequency: f32) {
        self.vec_ap.coeff = diffusion * diffusion * FRAC_1_SQRT_2;

        for i in 0..NUM_LINES {
            let length = EARLY_ALLPASS_LENGTHS[i] * density_mult;
            self.vec_ap.offset[i][1] = (length * frequency) as usize;

            let length = EARLY_LINE_LENGTHS[i] * density_mult;
            self.offset[i][1] = (length * frequency) as usize;
            self.coeff[i][1] = calc_decay_coeff(length, decay_time);
        }
    }
}

/// Vibrato on the late feedback read position.
struct Modulation {
    index: u32,
    step: u32,
    /// Swing of the read position, in samples.
    depth: [f32; 2],
    mod_delays: [f32; MAX_UPDATE_SAMPLES],
}

impl Modulation {
    fn new() -> Self {
        Self {
            index: 0,
            step: 1,
            depth: [0.0; 2],
            mod_delays: [0.0; MAX_UPDATE_SAMPLES],
        }
    }

    fn update(&mut self, mod_time: f32, mod_depth: f32, frequency: f32) {
        self.step = ((MOD_FRACONE as f32 / (frequency * mod_time)) as u32).max(1);

        // Half the depth is spent on each side of the sinus. Long periods
        // keep the pitch change of the default time.
        self.depth[1] = MODULATION_DEPTH_COEFF / 4.0
            * mod_time.min(DEFAULT_MODULATION_TIME)
            * mod_depth
            * frequency;
    }

    #[inline]
    fn lfo(index: u32) -> f32 {
        ((index & MOD_FRACMASK) as f32 * (TAU / MOD_FRACONE as f32)).sin()
    }

    fn calc_delays(&mut self, todo: usize) {
        let mut idx = self.index;
        let depth = self.depth[0];
        for d in self.mod_delays[..todo].iter_mut() {
            idx = idx.wrapping_add(self.step);
            *d = (Self::lfo(idx) + 1.0) * depth;
        }
        self.index = idx;
    }

    fn calc_faded_delays(&mut self, todo: usize, mut fade_count: f32, fade_step: f32) {
        let mut idx = self.index;
        let depth = self.depth[0];
        let depth_step = (self.depth[1] - depth) * fade_step;
        for d in self.mod_delays[..todo].iter_mut() {
            fade_count += 1.0;
            idx = idx.wrapping_add(self.step);
            *d = (Self::lfo(idx) + 1.0) * (depth + depth_step * fade_count);
        }
        self.index = idx;
    }
}

struct LateReverb {
    delay: DelayLine,
    offset: [[usize; 2]; NUM_LINES],
    density_gain: [f32; 2],
    t60: [T60Filter; NUM_LINES],
    modulation: Modulation,
    vec_ap: VecAllpass,

    current_gain: [[f32; MAX_OUTPUT_CHANNELS]; NUM_LINES],
    pan_gain: [[f32; MAX_OUTPUT_CHANNELS]; NUM_LINES],
}

impl LateReverb {
    fn new() -> Self {
        Self {
            delay: DelayLine::default(),
            offset: [[0; 2]; NUM_LINES],
            density_gain: [0.0; 2],
            t60: [T60Filter::default(); NUM_LINES],
            modulation: Modulation::new(),
            vec_ap: VecAllpass::default(),
            current_gain: [[0.0; MAX_OUTPUT_CHANNELS]; NUM_LINES],
            pan_gain: [[0.0; MAX_OUTPUT_CHANNELS]; NUM_LINES],
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn update_lines(
        &mut self,
        density_mult: f32,
        diffusion: f32,
        lf_decay: f32,
        mf_decay: f32,
        hf_decay: f32,
        lf0norm: f32,
        hf0norm: f32,
        frequency: f32,
    ) {
        // Normalized reference frequencies rescaled to 0..20kHz.
        let norm_weight_factor = frequency / 20000.0;

        let late_allpass_avg = LATE_ALLPASS_LENGTHS.iter().sum::<f32>() / NUM_LINES as f32;

        // The density gain is taken over the average line length, with the
        // decay time weighted by approximate bandwidth.
        let length = (LATE_LINE_LENGTHS.iter().sum::<f32>() / NUM_LINES as f32 + late_allpass_avg)
            * density_mult;
        let decay_weighted = lf0norm * norm_weight_factor * lf_decay
            + (hf0norm - lf0norm) * norm_weight_factor * mf_decay
            + (1.0 - hf0norm * norm_weight_factor) * hf_decay;
        self.density_gain[1] = calc_density_gain(calc_decay_coeff(length, decay_weighted));

        self.vec_ap.coeff = diffusion * diffusion * FRAC_1_SQRT_2;

        for i in 0..NUM_LINES {
            let length = LATE_ALLPASS_LENGTHS[i] * density_mult;
            self.vec_ap.offset[i][1] = (length * frequency) as usize;

            let mut length = LATE_LINE_LENGTHS[i] * density_mult;
            self.offset[i][1] = (length * frequency + 0.5) as usize;

            // Fold in the all-pass absorption at this diffusion and the
            // average modulation delay.
            length += lerpf(LATE_ALLPASS_LENGTHS[i], late_allpass_avg, diffusion) * density_mult
                + self.modulation.depth[1] / frequency;

            self.t60[i].calc_coeffs(length, lf_decay, mf_decay, hf_decay, lf0norm, hf0norm);
        }
    }
}

/// Values whose change requires a cross-fade.
#[derive(Clone, Copy, Debug, PartialEq)]
struct FadeParams {
    density: f32,
    diffusion: f32,
    decay_time: f32,
    hf_decay_time: f32,
    lf_decay_time: f32,
    modulation_time: f32,
    modulation_depth: f32,
    hf_reference: f32,
    lf_reference: f32,
}

impl Default for FadeParams {
    fn default() -> Self {
        Self {
            density: 1.0,
            diffusion: 1.0,
            decay_time: 1.49,
            hf_decay_time: 0.83 * 1.49,
            lf_decay_time: 1.49,
            modulation_time: 0.25,
            modulation_depth: 0.0,
            hf_reference: 5000.0,
            lf_reference: 250.0,
        }
    }
}

#[derive(Clone, Copy)]
struct MasterFilter {
    lp: Biquad,
    hp: Biquad,
}

pub struct ReverbState {
    params: FadeParams,
    filter: [MasterFilter; NUM_LINES],

    /// Main delay; early reflections and late reverb tap from here.
    delay: DelayLine,
    early_delay_tap: [[usize; 2]; NUM_LINES],
    early_delay_coeff: [[f32; 2]; NUM_LINES],

    late_feed_tap: usize,
    late_delay_tap: [[usize; 2]; NUM_LINES],

    mix_x: f32,
    mix_y: f32,

    early: EarlyReflections,
    late: LateReverb,

    do_fading: bool,
    max_update: [usize; 2],
    offset: usize,

    temp_line: Box<FloatBufferLine>,
    temp_samples: Box<UpdateLines>,
    early_samples: Box<UpdateLines>,
    late_samples: Box<UpdateLines>,

    upsample: bool,
    order_scales: [f32; MAX_AMBI_ORDER + 1],
    ambi_splitter: [[BandSplitter; NUM_LINES]; 2],
}

impl ReverbState {
    pub fn new() -> Self {
        let filter = MasterFilter {
            lp: Biquad::new(),
            hp: Biquad::new(),
        };
        Self {
            params: FadeParams::default(),
            filter: [filter; NUM_LINES],
            delay: DelayLine::default(),
            early_delay_tap: [[0; 2]; NUM_LINES],
            early_delay_coeff: [[0.0; 2]; NUM_LINES],
            late_feed_tap: 0,
            late_delay_tap: [[0; 2]; NUM_LINES],
            mix_x: 0.0,
            mix_y: 0.0,
            early: EarlyReflections::new(),
            late: LateReverb::new(),
            do_fading: false,
            max_update: [MAX_UPDATE_SAMPLES; 2],
            offset: 0,
            temp_line: Box::new([0.0; BUFFER_LINE_SIZE]),
            temp_samples: Box::new([[0.0; MAX_UPDATE_SAMPLES]; NUM_LINES]),
            early_samples: Box::new([[0.0; MAX_UPDATE_SAMPLES]; NUM_LINES]),
            late_samples: Box::new([[0.0; MAX_UPDATE_SAMPLES]; NUM_LINES]),
            upsample: false,
            order_scales: [1.0; MAX_AMBI_ORDER + 1],
            ambi_splitter: [[BandSplitter::default(); NUM_LINES]; 2],
        }
    }

    /// Whether the next processed block cross-fades old and new parameters.
    pub fn is_fading(&self) -> bool {
        self.do_fading
    }

    /// Sizes every line for the full parameter range at `frequency`.
    fn alloc_lines(&mut self, frequency: f32) {
        // Density 1 gives the longest lines.
        let multiplier = calc_delay_length_mult(1.0);

        let late_line_diff_avg = (LATE_LINE_LENGTHS[NUM_LINES - 1] - LATE_LINE_LENGTHS[0]) / NUM_LINES as f32;
        let length = REVERB_MAX_REFLECTIONS_DELAY
            + EARLY_TAP_LENGTHS[NUM_LINES - 1] * multiplier
            + REVERB_MAX_LATE_REVERB_DELAY
            + late_line_diff_avg * multiplier;
        self.delay.alloc(length, frequency, BUFFER_LINE_SIZE);

        let last = NUM_LINES - 1;
        self.early.vec_ap.delay.alloc(EARLY_ALLPASS_LENGTHS[last] * multiplier, frequency, 0);
        self.early.delay.alloc(EARLY_LINE_LENGTHS[last] * multiplier, frequency, 0);
        self.late.vec_ap.delay.alloc(LATE_ALLPASS_LENGTHS[last] * multiplier, frequency, 0);

        // The late lines also cover the widest modulation swing, plus the
        // samples the interpolator reads around it.
        let max_mod_delay = MAX_MODULATION_TIME * MODULATION_DEPTH_COEFF / 2.0;
        self.late.delay.alloc(LATE_LINE_LENGTHS[last] * multiplier + max_mod_delay, frequency, 2);
    }

    fn update_delay_line(&mut self, early_delay: f32, late_delay: f32, density_mult: f32, decay_time: f32, frequency: f32) {
        for i in 0..NUM_LINES {
            let length = EARLY_TAP_LENGTHS[i] * density_mult;
            self.early_delay_tap[i][1] = ((early_delay + length) * frequency) as usize;
            self.early_delay_coeff[i][1] = calc_decay_coeff(length, decay_time);

            let length = (LATE_LINE_LENGTHS[i] - LATE_LINE_LENGTHS[0]) / NUM_LINES as f32 * density_mult
                + late_delay;
            self.late_delay_tap[i][1] = self.late_feed_tap + (length * frequency) as usize;
        }
    }

    fn update_3d_panning(
        &mut self,
        reflections_pan: [f32; 3],
        late_reverb_pan: [f32; 3],
        early_gain: f32,
        late_gain: f32,
        target: &EffectTarget<'_>,
    ) {
        let earlymat = transform_from_vector(reflections_pan);
        let latemat = transform_from_vector(late_reverb_pan);

        let mut coeffs = [0.0f32; MAX_AMBI_CHANNELS];
        for i in 0..NUM_LINES {
            for (k, c) in coeffs[..NUM_LINES].iter_mut().enumerate() {
                *c = earlymat[k][i];
            }
            compute_pan_gains(&target.main.ambi_map, &coeffs, early_gain, &mut self.early.pan_gain[i]);
        }
        for i in 0..NUM_LINES {
            for (k, c) in coeffs[..NUM_LINES].iter_mut().enumerate() {
                *c = latemat[k][i];
            }
            compute_pan_gains(&target.main.ambi_map, &coeffs, late_gain, &mut self.late.pan_gain[i]);
        }
    }

    fn early_unfaded(&mut self, offset: usize, todo: usize) {
        let (mix_x, mix_y) = (self.mix_x, self.mix_y);

        // Primary reflections from the main delay line.
        for j in 0..NUM_LINES {
            let tap = offset.wrapping_sub(self.early_delay_tap[j][0]);
            let coeff = self.early_delay_coeff[j][0];
            for (i, out) in self.temp_samples[j][..todo].iter_mut().enumerate() {
                *out = self.delay.at(tap.wrapping_add(i))[j] * coeff;
            }
        }

        self.early
            .vec_ap
            .process_unfaded(&mut self.temp_samples, offset, mix_x, mix_y, todo);

        // Secondary reflections from the echo line.
        for j in 0..NUM_LINES {
            let tap = offset.wrapping_sub(self.early.offset[j][0]);
            let coeff = self.early.coeff[j][0];
            for i in 0..todo {
                self.early_samples[j][i] =
                    self.temp_samples[j][i] + self.early.delay.at(tap.wrapping_add(i))[j] * coeff;
            }
        }
        for j in 0..NUM_LINES {
            self.early
                .delay
                .write(offset, NUM_LINES - 1 - j, &self.temp_samples[j][..todo]);
        }

        let late_feed_tap = offset.wrapping_sub(self.late_feed_tap);
        self.delay
            .scatter_rev_in(late_feed_tap, mix_x, mix_y, &self.early_samples, todo);
    }

    fn early_faded(&mut self, offset: usize, todo: usize, fade: f32, fade_step: f32) {
        let (mix_x, mix_y) = (self.mix_x, self.mix_y);

        for j in 0..NUM_LINES {
            let tap0 = offset.wrapping_sub(self.early_delay_tap[j][0]);
            let tap1 = offset.wrapping_sub(self.early_delay_tap[j][1]);
            let old_coeff = self.early_delay_coeff[j][0];
            let old_step = -old_coeff * fade_step;
            let new_step = self.early_delay_coeff[j][1] * fade_step;
            let mut fade_count = fade;
            for i in 0..todo {
                fade_count += 1.0;
                let fade0 = old_coeff + old_step * fade_count;
                let fade1 = new_step * fade_count;
                self.temp_samples[j][i] = self.delay.at(tap0.wrapping_add(i))[j] * fade0
                    + self.delay.at(tap1.wrapping_add(i))[j] * fade1;
            }
        }

        self.early
            .vec_ap
            .process_faded(&mut self.temp_samples, offset, mix_x, mix_y, fade, fade_step, todo);

        for j in 0..NUM_LINES {
            let tap0 = offset.wrapping_sub(self.early.offset[j][0]);
            let tap1 = offset.wrapping_sub(self.early.offset[j][1]);
            let old_coeff = self.early.coeff[j][0];
            let old_step = -old_coeff * fade_step;
            let new_step = self.early.coeff[j][1] * fade_step;
            let mut fade_count = fade;
            for i in 0..todo {
                fade_count += 1.0;
                let fade0 = old_coeff + old_step * fade_count;
                let fade1 = new_step * fade_count;
                self.early_samples[j][i] = self.temp_samples[j][i]
                    + self.early.delay.at(tap0.wrapping_add(i))[j] * fade0
                    + self.early.delay.at(tap1.wrapping_add(i))[j] * fade1;
            }
        }
        for j in 0..NUM_LINES {
            self.early
                .delay
                .write(offset, NUM_LINES - 1 - j, &self.temp_samples[j][..todo]);
        }

        let late_feed_tap = offset.wrapping_sub(self.late_feed_tap);
        self.delay
            .scatter_rev_in(late_feed_tap, mix_x, mix_y, &self.early_samples, todo);
    }

    /// Reads line `j` of the late delay `fdelay` samples before `tap`.
    #[inline]
    fn read_late(line: &DelayLine, tap: usize, fdelay: f32, j: usize) -> f32 {
        let delay = fdelay as usize;
        let frac = fdelay - delay as f32;
        let pos = tap.wrapping_sub(delay);
        cubic(
            line.at(pos.wrapping_add(1))[j],
            line.at(pos)[j],
            line.at(pos.wrapping_sub(1))[j],
            line.at(pos.wrapping_sub(2))[j],
            frac,
        )
    }

    fn late_unfaded(&mut self, offset: usize, todo: usize) {
        let (mix_x, mix_y) = (self.mix_x, self.mix_y);

        self.late.modulation.calc_delays(todo);

        for j in 0..NUM_LINES {
            let delay_tap = offset.wrapping_sub(self.late_delay_tap[j][0]);
            let feedb_tap = offset.wrapping_sub(self.late.offset[j][0]);
            let mid_gain = self.late.t60[j].mid_gain[0];
            let density_gain = self.late.density_gain[0] * mid_gain;

            for i in 0..todo {
                let fdelay = self.late.modulation.mod_delays[i];
                let feedback = Self::read_late(&self.late.delay, feedb_tap.wrapping_add(i), fdelay, j);
                self.temp_samples[j][i] =
                    feedback * mid_gain + self.delay.at(delay_tap.wrapping_add(i))[j] * density_gain;
            }
            self.late.t60[j].process(&mut self.temp_samples[j][..todo]);
        }

        self.late
            .vec_ap
            .process_unfaded(&mut self.temp_samples, offset, mix_x, mix_y, todo);
        for j in 0..NUM_LINES {
            self.late_samples[j][..todo].copy_from_slice(&self.temp_samples[j][..todo]);
        }

        self.late
            .delay
            .scatter_rev_in(offset, mix_x, mix_y, &self.temp_samples, todo);
    }

    fn late_faded(&mut self, offset: usize, todo: usize, fade: f32, fade_step: f32) {
        let (mix_x, mix_y) = (self.mix_x, self.mix_y);

        self.late.modulation.calc_faded_delays(todo, fade, fade_step);

        for j in 0..NUM_LINES {
            let old_mid_gain = self.late.t60[j].mid_gain[0];
            let mid_gain = self.late.t60[j].mid_gain[1];
            let old_mid_step = -old_mid_gain * fade_step;
            let mid_step = mid_gain * fade_step;
            let old_density_gain = self.late.density_gain[0] * old_mid_gain;
            let density_gain = self.late.density_gain[1] * mid_gain;
            let old_density_step = -old_density_gain * fade_step;
            let density_step = density_gain * fade_step;

            let delay_tap0 = offset.wrapping_sub(self.late_delay_tap[j][0]);
            let delay_tap1 = offset.wrapping_sub(self.late_delay_tap[j][1]);
            let feedb_tap0 = offset.wrapping_sub(self.late.offset[j][0]);
            let feedb_tap1 = offset.wrapping_sub(self.late.offset[j][1]);
            let mut fade_count = fade;

            for i in 0..todo {
                fade_count += 1.0;
                let fdelay = self.late.modulation.mod_delays[i];
                let out0 = Self::read_late(&self.late.delay, feedb_tap0.wrapping_add(i), fdelay, j);
                let out1 = Self::read_late(&self.late.delay, feedb_tap1.wrapping_add(i), fdelay, j);

                let fade0 = old_density_gain + old_density_step * fade_count;
                let fade1 = density_step * fade_count;
                let gfade0 = old_mid_gain + old_mid_step * fade_count;
                let gfade1 = mid_step * fade_count;
                self.temp_samples[j][i] = out0 * gfade0
                    + out1 * gfade1
                    + self.delay.at(delay_tap0.wrapping_add(i))[j] * fade0
                    + self.delay.at(delay_tap1.wrapping_add(i))[j] * fade1;
            }
            self.late.t60[j].process(&mut self.temp_samples[j][..todo]);
        }

        self.late
            .vec_ap
            .process_faded(&mut self.temp_samples, offset, mix_x, mix_y, fade, fade_step, todo);
        for j in 0..NUM_LINES {
            self.late_samples[j][..todo].copy_from_slice(&self.temp_samples[j][..todo]);
        }

        self.late
            .delay
            .scatter_rev_in(offset, mix_x, mix_y, &self.temp_samples, todo);
    }

    /// Decodes the A-Format results to B-Format and mixes them out.
    fn mix_out(&mut self, output: &mut [FloatBufferLine], counter: usize, base: usize, todo: usize) {
        let stages = [
            (&EARLY_A2B, &*self.early_samples, &mut self.early.current_gain, &self.early.pan_gain),
            (&LATE_A2B, &*self.late_samples, &mut self.late.current_gain, &self.late.pan_gain),
        ];
        for (stage, (a2b, samples, current, target)) in stages.into_iter().enumerate() {
            for c in 0..NUM_LINES {
                let tmp = &mut self.temp_line[..todo];
                tmp.fill(0.0);
                for (&gain, line) in a2b[c].iter().zip(samples.iter()) {
                    if !(gain.abs() > GAIN_SILENCE_THRESHOLD) {
                        continue;
                    }
                    for (t, &s) in tmp.iter_mut().zip(line[..todo].iter()) {
                        *t += s * gain;
                    }
                }

                if self.upsample {
                    let hf_scale = if c == 0 { self.order_scales[0] } else { self.order_scales[1] };
                    self.ambi_splitter[stage][c].process_hf_scale(tmp, hf_scale);
                }

                mix(tmp, output, &mut current[c], &target[c], counter, base);
            }
        }
    }
}

impl Default for ReverbState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for ReverbState {
    fn device_update(&mut self, device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        let frequency = device.frequency as f32;

        *self = Self::new();
        self.alloc_lines(frequency);

        // The late feed sits past the latest possible early tap.
        let multiplier = calc_delay_length_mult(1.0);
        self.late_feed_tap = ((REVERB_MAX_REFLECTIONS_DELAY + EARLY_TAP_LENGTHS[NUM_LINES - 1] * multiplier)
            * frequency) as usize;

        self.do_fading = true;

        if device.ambi_order > 1 {
            self.upsample = true;
            self.order_scales = hf_order_scales(1, device.ambi_order);
        } else {
            self.upsample = false;
            self.order_scales = [1.0; MAX_AMBI_ORDER + 1];
        }
        let splitter = BandSplitter::new(device.xover_freq / frequency);
        self.ambi_splitter = [[splitter; NUM_LINES]; 2];

        log::debug!(
            "Reverb lines allocated: main {}, early {}, late {} samples",
            self.delay.line.len(),
            self.early.delay.line.len(),
            self.late.delay.line.len()
        );
        Ok(())
    }

    fn update(
        &mut self,
        device: &DeviceInfo,
        slot: &SlotParams,
        props: &EffectProps,
        target: EffectTarget<'_>,
    ) -> OutTarget {
        let defaults;
        let props = match props {
            EffectProps::Reverb(p) | EffectProps::EaxReverb(p) => p,
            _ => {
                defaults = ReverbProps::default();
                &defaults
            }
        };
        let frequency = device.frequency as f32;

        let hf0norm = (props.hf_reference / frequency).min(0.49);
        let lf0norm = (props.lf_reference / frequency).min(0.49);
        let master = &mut self.filter[0];
        master
            .lp
            .set_params_from_slope(BiquadType::HighShelf, hf0norm, props.gain_hf, 1.0);
        master
            .hp
            .set_params_from_slope(BiquadType::LowShelf, lf0norm, props.gain_lf, 1.0);
        let master = self.filter[0];
        for filter in self.filter[1..].iter_mut() {
            filter.lp.copy_params_from(&master.lp);
            filter.hp.copy_params_from(&master.hp);
        }

        let density_mult = calc_delay_length_mult(props.density);

        self.update_delay_line(
            props.reflections_delay,
            props.late_reverb_delay,
            density_mult,
            props.decay_time,
            frequency,
        );

        self.early
            .update_lines(density_mult, props.diffusion, props.decay_time, frequency);

        (self.mix_x, self.mix_y) = calc_matrix_coeffs(props.diffusion);

        let mut hf_ratio = props.decay_hf_ratio;
        if props.decay_hf_limit && props.air_absorption_gain_hf < 1.0 {
            hf_ratio = calc_limited_hf_ratio(hf_ratio, props.air_absorption_gain_hf, props.decay_time);
        }

        let lf_decay_time = (props.decay_time * props.decay_lf_ratio).clamp(0.1, 20.0);
        let hf_decay_time = (props.decay_time * hf_ratio).clamp(0.1, 20.0);

        self.late
            .modulation
            .update(props.modulation_time, props.modulation_depth, frequency);

        self.late.update_lines(
            density_mult,
            props.diffusion,
            lf_decay_time,
            props.decay_time,
            hf_decay_time,
            lf0norm,
            hf0norm,
            frequency,
        );

        let gain = props.gain * slot.gain;
        self.update_3d_panning(
            props.reflections_pan,
            props.late_reverb_pan,
            props.reflections_gain * gain,
            props.late_reverb_gain * gain,
            &target,
        );

        // Blocks can't outrun the shortest feedback delay.
        self.max_update[1] = MAX_UPDATE_SAMPLES
            .min(self.early.offset[0][1])
            .min(self.late.offset[0][1]);

        let params = FadeParams {
            density: props.density,
            diffusion: props.diffusion,
            decay_time: props.decay_time,
            hf_decay_time,
            lf_decay_time,
            modulation_time: props.modulation_time,
            modulation_depth: props.modulation_depth,
            hf_reference: props.hf_reference,
            lf_reference: props.lf_reference,
        };
        // Moved input taps also need a fade to avoid a discontinuity.
        let taps_moved = self
            .early_delay_tap
            .iter()
            .chain(self.late_delay_tap.iter())
            .any(|tap| tap[0] != tap[1]);
        if self.params != params || taps_moved {
            self.do_fading = true;
            self.params = params;
        }
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let mut offset = self.offset;

        // B-Format to A-Format, band-limit, and feed the main delay.
        let num_input = input.len().min(NUM_LINES);
        for c in 0..NUM_LINES {
            let tmp = &mut self.temp_line[..samples_to_do];
            tmp.fill(0.0);
            for (line, &gain) in input[..num_input].iter().zip(B2A[c].iter()) {
                for (t, &s) in tmp.iter_mut().zip(line.iter()) {
                    *t += s * gain;
                }
            }

            let filter = &mut self.filter[c];
            filter.lp.dual_process_in_place(&mut filter.hp, tmp);
            self.delay.write(offset, c, tmp);
        }

        if !self.do_fading {
            let mut base = 0;
            while base < samples_to_do {
                let mut todo = (samples_to_do - base).min(self.max_update[0]);
                // Keep a 4-sample alignment except for the last step.
                if base + todo < samples_to_do {
                    todo &= !3;
                }

                self.early_unfaded(offset, todo);
                self.late_unfaded(offset, todo);
                self.mix_out(output, samples_to_do - base, base, todo);

                offset = offset.wrapping_add(todo);
                base += todo;
            }
        } else {
            let fade_step = 1.0 / samples_to_do as f32;
            let mut base = 0;
            while base < samples_to_do {
                let mut todo = (samples_to_do - base).min(self.max_update[0].min(self.max_update[1]));
                if base + todo < samples_to_do {
                    todo &= !3;
                }

                let fade_count = base as f32;
                self.early_faded(offset, todo, fade_count, fade_step);
                self.late_faded(offset, todo, fade_count, fade_step);
                self.mix_out(output, samples_to_do - base, base, todo);

                offset = offset.wrapping_add(todo);
                base += todo;
            }

            for c in 0..NUM_LINES {
                self.early_delay_tap[c][0] = self.early_delay_tap[c][1];
                self.early_delay_coeff[c][0] = self.early_delay_coeff[c][1];
                self.late_delay_tap[c][0] = self.late_delay_tap[c][1];
                self.early.vec_ap.offset[c][0] = self.early.vec_ap.offset[c][1];
                self.early.offset[c][0] = self.early.offset[c][1];
                self.early.coeff[c][0] = self.early.coeff[c][1];
                self.late.offset[c][0] = self.late.offset[c][1];
                self.late.t60[c].mid_gain[0] = self.late.t60[c].mid_gain[1];
                self.late.vec_ap.offset[c][0] = self.late.vec_ap.offset[c][1];
            }
            self.late.density_gain[0] = self.late.density_gain[1];
            self.late.modulation.depth[0] = self.late.modulation.depth[1];
            self.max_update[0] = self.max_update[1];
            self.do_fading = false;
        }
        self.offset = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{new_lines, MixParams};
    use crate::effects::test_util::{device, rms};

    fn apply(state: &mut ReverbState, dev: &DeviceInfo, props: ReverbProps) {
        let main = MixParams::acn_identity(4);
        let slot = SlotParams {
            gain: 1.0,
            wet_channels: 4,
        };
        state.update(
            dev,
            &slot,
            &EffectProps::EaxReverb(props),
            EffectTarget {
                main: &main,
                real_out: None,
            },
        );
    }

    #[test]
    fn decay_helpers_agree() {
        assert!((calc_decay_coeff(1.5, 1.5) - REVERB_DECAY_GAIN).abs() < 1e-6);
        let coeff = calc_decay_coeff(0.01, 2.0);
        assert!((calc_decay_length(coeff, 2.0) - 0.01).abs() < 1e-5);
        assert!((calc_density_gain(0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn scatter_matrix_is_orthonormal() {
        for diffusion in [0.0, 0.3, 1.0] {
            let (x, y) = calc_matrix_coeffs(diffusion);
            assert!((x * x + 3.0 * y * y - 1.0).abs() < 1e-6);
            // An orthonormal matrix keeps the vector length.
            let v = [0.3, -0.7, 0.2, 0.9];
            let s = vector_partial_scatter(&v, x, y);
            let len = |a: &LineFrame| a.iter().map(|e| e * e).sum::<f32>();
            assert!((len(&v) - len(&s)).abs() < 1e-5);
        }
    }

    #[test]
    fn centred_pan_vector_is_identity() {
        let m = transform_from_vector([0.0; 3]);
        for (r, row) in m.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                assert_eq!(v, if r == c { 1.0 } else { 0.0 });
            }
        }
        let m = transform_from_vector([0.0, 0.0, 2.0]);
        assert_eq!(m[3][0], SQRT3);
        assert_eq!(m[3][3], 0.0);
    }

    #[test]
    fn density_change_fades_for_one_block() {
        let dev = device(48000);
        let mut state = ReverbState::new();
        state.device_update(&dev, None).unwrap();
        assert!(state.is_fading());
        apply(&mut state, &dev, ReverbProps::default());

        let wet = new_lines(4);
        let mut out = new_lines(4);
        state.process(BUFFER_LINE_SIZE, &wet, &mut out);
        assert!(!state.is_fading());

        apply(&mut state, &dev, ReverbProps::default());
        assert!(!state.is_fading());

        apply(
            &mut state,
            &dev,
            ReverbProps {
                density: 0.5,
                ..ReverbProps::default()
            },
        );
        assert!(state.is_fading());
        state.process(BUFFER_LINE_SIZE, &wet, &mut out);
        assert!(!state.is_fading());
        state.process(BUFFER_LINE_SIZE, &wet, &mut out);
        assert!(!state.is_fading());
    }

    #[test]
    fn reflections_arrive_after_the_delay() {
        let dev = device(48000);
        let mut state = ReverbState::new();
        state.device_update(&dev, None).unwrap();
        apply(&mut state, &dev, ReverbProps::default());

        let mut wet = new_lines(4);
        let mut out = new_lines(4);
        state.process(BUFFER_LINE_SIZE, &wet, &mut out);

        wet[0][0] = 1.0;
        let mut out = new_lines(4);
        state.process(BUFFER_LINE_SIZE, &wet, &mut out);

        // Reflections delay of 7ms at 48kHz.
        let first_tap = (0.007f32 * 48000.0) as usize;
        assert!(out[0][..first_tap - 4].iter().all(|s| s.abs() < 1e-7));
        assert!(rms(&out[0][first_tap..]) > 1e-6);
    }

    #[test]
    fn tail_decays_and_stays_finite() {
        let dev = device(48000);
        let mut state = ReverbState::new();
        state.device_update(&dev, None).unwrap();
        apply(&mut state, &dev, ReverbProps::default());

        let mut wet = new_lines(4);
        wet[0][0] = 1.0;
        let mut energy = Vec::new();
        for _ in 0..48 {
            let mut out = new_lines(4);
            state.process(BUFFER_LINE_SIZE, &wet, &mut out);
            wet[0][0] = 0.0;
            assert!(out.iter().flatten().all(|s| s.is_finite()));
            energy.push(rms(&out[0]));
        }
        let early: f32 = energy[1..5].iter().sum();
        let late: f32 = energy[40..44].iter().sum();
        assert!(early > 0.0);
        assert!(late < early * 0.25, "early {} late {}", early, late);
    }

    #[test]
    fn higher_order_output_uses_hf_scaling() {
        let mut dev = device(48000);
        dev.ambi_order = 2;
        let mut state = ReverbState::new();
        state.device_update(&dev, None).unwrap();
        assert!(state.upsample);
        assert_eq!(state.order_scales, hf_order_scales(1, 2));
    }
}
