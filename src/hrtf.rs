//! Head-related impulse response storage and lookup.
//!
//! A store holds one or more fields (measurement distances, nearest last),
//! each with a set of elevations from -90 to +90 degrees, each elevation with
//! an evenly spaced ring of azimuths running clockwise from the front. Every
//! response is a left/right pair of minimum-phase FIRs plus per-ear onset
//! delays in Q2 fixed point.

use std::sync::Arc;

use log::debug;

use crate::ambisonic::{MAX_AMBI_CHANNELS, MAX_AMBI_ORDER, ORDER_FROM_CHANNEL};
use crate::error::{MixerError, Result};
use crate::mixer::HrtfChannelState;

pub const HRIR_BITS: usize = 7;
pub const HRIR_LENGTH: usize = 1 << HRIR_BITS;
pub const HRIR_MASK: usize = HRIR_LENGTH - 1;
pub const MIN_IR_LENGTH: usize = 8;

pub const HRTF_HISTORY_BITS: usize = 6;
pub const HRTF_HISTORY_LENGTH: usize = 1 << HRTF_HISTORY_BITS;
pub const HRTF_HISTORY_MASK: usize = HRTF_HISTORY_LENGTH - 1;

pub const HRIR_DELAY_FRAC_BITS: u32 = 2;
pub const HRIR_DELAY_FRAC_ONE: u32 = 1 << HRIR_DELAY_FRAC_BITS;
pub const HRIR_DELAY_FRAC_HALF: u32 = HRIR_DELAY_FRAC_ONE >> 1;
pub const MAX_HRIR_DELAY: u32 = HRTF_HISTORY_LENGTH as u32 - 1;

const MIN_EV_COUNT: usize = 5;
const MAX_EV_COUNT: usize = 181;
const MAX_AZ_COUNT: usize = 255;

/// First coefficient of the omnidirectional response.
const PASSTHRU_COEFF: f32 = std::f32::consts::FRAC_1_SQRT_2;

pub type HrirArray = [[f32; 2]; HRIR_LENGTH];

/// A resolved filter for one voice channel.
#[derive(Clone)]
pub struct HrtfFilter {
    pub coeffs: HrirArray,
    pub delay: [u32; 2],
    pub gain: f32,
}

impl Default for HrtfFilter {
    fn default() -> Self {
        Self {
            coeffs: [[0.0; 2]; HRIR_LENGTH],
            delay: [0, 0],
            gain: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HrtfField {
    /// Measurement distance in metres.
    pub distance: f32,
    pub ev_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HrtfElevation {
    pub az_count: usize,
    pub ir_offset: usize,
}

pub struct HrtfStore {
    sample_rate: u32,
    ir_size: usize,
    fields: Vec<HrtfField>,
    elevs: Vec<HrtfElevation>,
    coeffs: Vec<HrirArray>,
    delays: Vec<[u8; 2]>,
}

#[derive(Clone, Copy)]
struct IdxBlend {
    idx: usize,
    blend: f32,
}

fn calc_ev_index(evcount: usize, ev: f32) -> IdxBlend {
    let ev = (std::f32::consts::FRAC_PI_2 + ev) * (evcount - 1) as f32 / std::f32::consts::PI;
    let idx = ev.max(0.0) as usize;
    IdxBlend {
        idx: idx.min(evcount - 1),
        blend: ev - idx as f32,
    }
}

fn calc_az_index(azcount: usize, az: f32) -> IdxBlend {
    let tau = std::f32::consts::TAU;
    let az = (tau + az) * azcount as f32 / tau;
    let idx = az.max(0.0) as usize;
    IdxBlend {
        idx: idx % azcount,
        blend: az - idx as f32,
    }
}

impl HrtfStore {
    /// Builds a store from in-memory tables. `fields` are ordered farthest
    /// first; `az_counts` lists the azimuth count of every elevation of
    /// every field in order. `coeffs` and `delays` hold one entry per
    /// response, with delays in Q2 samples.
    pub fn from_parts(
        sample_rate: u32,
        ir_size: usize,
        fields: Vec<HrtfField>,
        az_counts: &[usize],
        coeffs: Vec<HrirArray>,
        delays: Vec<[u8; 2]>,
    ) -> Result<Self> {
        if !(MIN_IR_LENGTH..=HRIR_LENGTH).contains(&ir_size) {
            return Err(MixerError::InvalidValue(format!(
                "HRIR size {} out of range [{}, {}]",
                ir_size, MIN_IR_LENGTH, HRIR_LENGTH
            )));
        }
        if fields.is_empty() {
            return Err(MixerError::InvalidValue("HRTF has no fields".into()));
        }
        let total_evs: usize = fields.iter().map(|f| f.ev_count).sum();
        for field in &fields {
            if !(MIN_EV_COUNT..=MAX_EV_COUNT).contains(&field.ev_count) {
                return Err(MixerError::InvalidValue(format!(
                    "elevation count {} out of range",
                    field.ev_count
                )));
            }
        }
        for pair in fields.windows(2) {
            if !(pair[0].distance > pair[1].distance) {
                return Err(MixerError::InvalidValue(
                    "HRTF fields must be ordered farthest first".into(),
                ));
            }
        }
        if az_counts.len() != total_evs {
            return Err(MixerError::InvalidValue(format!(
                "expected {} azimuth counts, got {}",
                total_evs,
                az_counts.len()
            )));
        }

        let mut elevs = Vec::with_capacity(total_evs);
        let mut offset = 0usize;
        for &az_count in az_counts {
            if az_count == 0 || az_count > MAX_AZ_COUNT {
                return Err(MixerError::InvalidValue(format!("azimuth count {} out of range", az_count)));
            }
            elevs.push(HrtfElevation {
                az_count,
                ir_offset: offset,
            });
            offset += az_count;
        }

        if coeffs.len() != offset || delays.len() != offset {
            return Err(MixerError::InvalidValue(format!(
                "expected {} responses, got {} coefficient sets and {} delays",
                offset,
                coeffs.len(),
                delays.len()
            )));
        }
        let max_delay = (MAX_HRIR_DELAY * HRIR_DELAY_FRAC_ONE) as u8;
        if let Some(bad) = delays.iter().flatten().find(|&&d| d > max_delay) {
            return Err(MixerError::InvalidValue(format!(
                "HRIR delay {} exceeds {}",
                f32::from(*bad) / HRIR_DELAY_FRAC_ONE as f32,
                MAX_HRIR_DELAY
            )));
        }

        debug!(
            "HRTF store: {} Hz, {} fields, {} responses, {}-sample IRs",
            sample_rate,
            fields.len(),
            offset,
            ir_size
        );

        Ok(Self {
            sample_rate,
            ir_size,
            fields,
            elevs,
            coeffs,
            delays,
        })
    }

    /// Like [`from_parts`](Self::from_parts), for data sets that only carry
    /// the left ear. The right ear is filled in from the mirrored azimuth.
    pub fn from_left_ear(
        sample_rate: u32,
        ir_size: usize,
        fields: Vec<HrtfField>,
        az_counts: &[usize],
        mut coeffs: Vec<HrirArray>,
        mut delays: Vec<[u8; 2]>,
    ) -> Result<Self> {
        let mut offset = 0usize;
        let elevs: Vec<HrtfElevation> = az_counts
            .iter()
            .map(|&az_count| {
                let elev = HrtfElevation {
                    az_count,
                    ir_offset: offset,
                };
                offset += az_count;
                elev
            })
            .collect();
        if coeffs.len() == offset && delays.len() == offset {
            mirror_left_hrirs(&elevs, &mut coeffs, &mut delays);
        }
        Self::from_parts(sample_rate, ir_size, fields, az_counts, coeffs, delays)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn ir_size(&self) -> usize {
        self.ir_size
    }

    pub fn fields(&self) -> &[HrtfField] {
        &self.fields
    }

    /// Distance of the farthest field, used as the near-field reference.
    pub fn reference_distance(&self) -> f32 {
        self.fields[0].distance
    }

    /// Interpolated response and per-ear delays (whole samples) for a
    /// direction. Elevation and azimuth are in radians, azimuth clockwise.
    /// A wider `spread` blends toward an omnidirectional pass-through.
    pub fn coeffs(&self, elevation: f32, azimuth: f32, distance: f32, spread: f32) -> (HrirArray, [u32; 2]) {
        let dirfact = 1.0 - spread / std::f32::consts::TAU;

        let mut ebase = 0usize;
        let mut field = &self.fields[0];
        for next in &self.fields[1..] {
            if !(distance < field.distance) {
                break;
            }
            ebase += field.ev_count;
            field = next;
        }

        let elev0 = calc_ev_index(field.ev_count, elevation);
        let elev1_idx = (elev0.idx + 1).min(field.ev_count - 1);
        let e0 = self.elevs[ebase + elev0.idx];
        let e1 = self.elevs[ebase + elev1_idx];

        let az0 = calc_az_index(e0.az_count, azimuth);
        let az1 = calc_az_index(e1.az_count, azimuth);

        let idx = [
            e0.ir_offset + az0.idx,
            e0.ir_offset + (az0.idx + 1) % e0.az_count,
            e1.ir_offset + az1.idx,
            e1.ir_offset + (az1.idx + 1) % e1.az_count,
        ];
        let blend = [
            (1.0 - elev0.blend) * (1.0 - az0.blend) * dirfact,
            (1.0 - elev0.blend) * az0.blend * dirfact,
            elev0.blend * (1.0 - az1.blend) * dirfact,
            elev0.blend * az1.blend * dirfact,
        ];

        let mut delays = [0u32; 2];
        for (ear, delay) in delays.iter_mut().enumerate() {
            let d: f32 = idx
                .iter()
                .zip(&blend)
                .map(|(&i, &b)| f32::from(self.delays[i][ear]) * b)
                .sum();
            *delay = (d * (1.0 / HRIR_DELAY_FRAC_ONE as f32)) as u32;
        }

        let mut coeffs = [[0.0f32; 2]; HRIR_LENGTH];
        coeffs[0] = [PASSTHRU_COEFF * (1.0 - dirfact); 2];
        for (&i, &mult) in idx.iter().zip(&blend) {
            for (out, src) in coeffs.iter_mut().zip(&self.coeffs[i]) {
                out[0] += src[0] * mult;
                out[1] += src[1] * mult;
            }
        }

        (coeffs, delays)
    }

    /// A small procedural data set: interaural time difference from a
    /// spherical head model and a level/shadowing difference from a one-pole
    /// low-pass whose strength follows how far the ear faces away.
    pub fn synthetic(sample_rate: u32) -> Result<Arc<Self>> {
        const HEAD_RADIUS: f64 = 0.0875;
        const IR_SIZE: usize = 32;
        const AZ_COUNTS: [usize; 7] = [1, 12, 24, 36, 24, 12, 1];

        let ev_count = AZ_COUNTS.len();
        let total: usize = AZ_COUNTS.iter().sum();
        let mut coeffs = Vec::with_capacity(total);
        let mut delays = Vec::with_capacity(total);

        let rate = f64::from(sample_rate);
        let max_q2 = f64::from(MAX_HRIR_DELAY * HRIR_DELAY_FRAC_ONE);
        let head_time = HEAD_RADIUS / f64::from(crate::audio::SPEED_OF_SOUND_METERS_PER_SEC);

        for (ei, &az_count) in AZ_COUNTS.iter().enumerate() {
            let ev = -std::f64::consts::FRAC_PI_2 + std::f64::consts::PI * ei as f64 / (ev_count - 1) as f64;
            for ai in 0..az_count {
                let az = std::f64::consts::TAU * ai as f64 / az_count as f64;
                // Lateral component toward the left ear.
                let lateral = (-az.sin() * ev.cos()).clamp(-1.0, 1.0);
                let lat = lateral.asin();
                let delay_sec = head_time * ((std::f64::consts::FRAC_PI_2 + 1.0) - (lat + lat.sin())) * 0.5;
                let q2 = (delay_sec * rate * f64::from(HRIR_DELAY_FRAC_ONE)).round().clamp(0.0, max_q2) as u8;

                let shadow = (1.0 - lateral) * 0.5;
                let gain = 1.0 - 0.5 * shadow;
                let pole = 0.6 * shadow;
                let mut ir = [[0.0f32; 2]; HRIR_LENGTH];
                let mut tap = gain * (1.0 - pole);
                for frame in ir.iter_mut().take(IR_SIZE) {
                    frame[0] = tap as f32;
                    tap *= pole;
                }
                coeffs.push(ir);
                delays.push([q2, 0]);
            }
        }

        let fields = vec![HrtfField {
            distance: 1.0,
            ev_count,
        }];
        Self::from_left_ear(sample_rate, IR_SIZE, fields, &AZ_COUNTS, coeffs, delays).map(Arc::new)
    }
}

/// Copies each left-ear response into the right ear of the response at the
/// mirrored azimuth.
pub fn mirror_left_hrirs(elevs: &[HrtfElevation], coeffs: &mut [HrirArray], delays: &mut [[u8; 2]]) {
    for elev in elevs {
        let azcount = elev.az_count;
        for j in 0..azcount {
            let lidx = elev.ir_offset + j;
            let ridx = elev.ir_offset + (azcount - j) % azcount;
            for k in 0..HRIR_LENGTH {
                coeffs[ridx][k][1] = coeffs[lidx][k][0];
            }
            delays[ridx][1] = delays[lidx][0];
        }
    }
}

/// A virtual speaker position for the ambisonic-to-binaural decoder.
#[derive(Clone, Copy, Debug)]
pub struct AngularPoint {
    pub elev: f32,
    pub azim: f32,
}

/// Binaural decoding state for the ambisonic dry bus: one pre-convolved
/// HRIR per ambisonic channel.
pub struct DirectHrtfState {
    pub ir_size: usize,
    pub channels: Vec<HrtfChannelState>,
}

impl DirectHrtfState {
    pub fn new(num_chans: usize) -> Self {
        Self {
            ir_size: HRIR_LENGTH,
            channels: vec![HrtfChannelState::default(); num_chans],
        }
    }

    /// Combines the nearest response for each virtual speaker with its
    /// decoder row, producing one IR pair per ambisonic channel. Onset delay
    /// is folded into the IRs, aligned to the shortest delay.
    pub fn build(
        &mut self,
        hrtf: &HrtfStore,
        ir_size: usize,
        points: &[AngularPoint],
        matrix: &[[f32; MAX_AMBI_CHANNELS]],
        xover_freq: f32,
        order_hf_gain: &[f32; MAX_AMBI_ORDER + 1],
    ) {
        let xover_norm = xover_freq / hrtf.sample_rate as f32;
        for (i, chan) in self.channels.iter_mut().enumerate() {
            let order = usize::from(ORDER_FROM_CHANNEL[i]);
            chan.splitter.init(xover_norm);
            chan.hf_scale = order_hf_gain[order];
        }

        struct Response<'a> {
            hrir: &'a HrirArray,
            ldelay: u32,
            rdelay: u32,
        }

        let mut min_delay = HRTF_HISTORY_LENGTH as u32 * HRIR_DELAY_FRAC_ONE;
        let mut max_delay = 0u32;
        let field = &hrtf.fields[0];
        let responses: Vec<Response<'_>> = points
            .iter()
            .map(|pt| {
                let elev0 = calc_ev_index(field.ev_count, pt.elev);
                let elev1_idx = (elev0.idx + 1).min(field.ev_count - 1);
                let e0 = hrtf.elevs[elev0.idx];
                let e1 = hrtf.elevs[elev1_idx];
                let az0 = calc_az_index(e0.az_count, pt.azim);
                let az1 = calc_az_index(e1.az_count, pt.azim);

                let idx = [
                    e0.ir_offset + az0.idx,
                    e0.ir_offset + (az0.idx + 1) % e0.az_count,
                    e1.ir_offset + az1.idx,
                    e1.ir_offset + (az1.idx + 1) % e1.az_count,
                ];
                let blend = [
                    (1.0 - elev0.blend) * (1.0 - az0.blend),
                    (1.0 - elev0.blend) * az0.blend,
                    elev0.blend * (1.0 - az1.blend),
                    elev0.blend * az1.blend,
                ];

                // The largest blend factor picks the closest response.
                let mut best = 0;
                for (c, &b) in blend.iter().enumerate() {
                    if b > blend[best] {
                        best = c;
                    }
                }
                let ir = idx[best];
                let res = Response {
                    hrir: &hrtf.coeffs[ir],
                    ldelay: u32::from(hrtf.delays[ir][0]),
                    rdelay: u32::from(hrtf.delays[ir][1]),
                };
                min_delay = min_delay.min(res.ldelay.min(res.rdelay));
                max_delay = max_delay.max(res.ldelay.max(res.rdelay));
                res
            })
            .collect();

        let delay_round = |d: u32| (d + HRIR_DELAY_FRAC_HALF) >> HRIR_DELAY_FRAC_BITS;

        debug!(
            "HRTF decoder: min delay {:.2}, max delay {:.2}, FIR length {}",
            min_delay as f32 / HRIR_DELAY_FRAC_ONE as f32,
            max_delay as f32 / HRIR_DELAY_FRAC_ONE as f32,
            ir_size
        );

        let per_hrir_min = self.channels.len() > 4;
        let mut tmpres = vec![[[0.0f64; 2]; HRIR_LENGTH]; self.channels.len()];
        max_delay = 0;
        for (res, row) in responses.iter().zip(matrix) {
            let base_delay = if per_hrir_min {
                res.ldelay.min(res.rdelay)
            } else {
                min_delay
            };
            let ldelay = delay_round(res.ldelay - base_delay) as usize;
            let rdelay = delay_round(res.rdelay - base_delay) as usize;
            max_delay = max_delay.max(res.ldelay.max(res.rdelay) - base_delay);

            let numirs = HRIR_LENGTH - ldelay.max(rdelay);
            for (tmp, &mult) in tmpres.iter_mut().zip(row.iter()) {
                let mult = f64::from(mult);
                for j in 0..numirs {
                    tmp[ldelay + j][0] += f64::from(res.hrir[j][0]) * mult;
                    tmp[rdelay + j][1] += f64::from(res.hrir[j][1]) * mult;
                }
            }
        }

        for (chan, tmp) in self.channels.iter_mut().zip(&tmpres) {
            for (out, src) in chan.coeffs.iter_mut().zip(tmp) {
                *out = [src[0] as f32, src[1] as f32];
            }
        }

        self.ir_size = (delay_round(max_delay) as usize + ir_size).min(HRIR_LENGTH);
        debug!(
            "HRTF decoder: new max delay {:.2}, FIR length {}",
            max_delay as f32 / HRIR_DELAY_FRAC_ONE as f32,
            self.ir_size
        );
    }
}

const DEG_35: f32 = 6.154_797e-1;
const DEG_45: f32 = std::f32::consts::FRAC_PI_4;
const DEG_90: f32 = std::f32::consts::FRAC_PI_2;
const DEG_135: f32 = DEG_45 * 3.0;
const DEG_180: f32 = std::f32::consts::PI;

const fn pt(elev: f32, azim: f32) -> AngularPoint {
    AngularPoint { elev, azim }
}

const AMBI_POINTS_1O: [AngularPoint; 8] = [
    pt(DEG_35, -DEG_45),
    pt(DEG_35, -DEG_135),
    pt(DEG_35, DEG_45),
    pt(DEG_35, DEG_135),
    pt(-DEG_35, -DEG_45),
    pt(-DEG_35, -DEG_135),
    pt(-DEG_35, DEG_45),
    pt(-DEG_35, DEG_135),
];

const AMBI_POINTS_2O: [AngularPoint; 14] = [
    pt(0.0, 0.0),
    pt(0.0, DEG_180),
    pt(0.0, -DEG_90),
    pt(0.0, DEG_90),
    pt(DEG_90, 0.0),
    pt(-DEG_90, 0.0),
    pt(DEG_35, -DEG_45),
    pt(DEG_35, -DEG_135),
    pt(DEG_35, DEG_45),
    pt(DEG_35, DEG_135),
    pt(-DEG_35, -DEG_45),
    pt(-DEG_35, -DEG_135),
    pt(-DEG_35, DEG_45),
    pt(-DEG_35, DEG_135),
];

const fn row(vals: [f32; 9]) -> [f32; MAX_AMBI_CHANNELS] {
    let mut out = [0.0f32; MAX_AMBI_CHANNELS];
    let mut i = 0;
    while i < vals.len() {
        out[i] = vals[i];
        i += 1;
    }
    out
}

const E: f32 = 1.25e-1;
const AMBI_MATRIX_1O: [[f32; MAX_AMBI_CHANNELS]; 8] = [
    row([E, E, E, E, 0.0, 0.0, 0.0, 0.0, 0.0]),
    row([E, E, E, -E, 0.0, 0.0, 0.0, 0.0, 0.0]),
    row([E, -E, E, E, 0.0, 0.0, 0.0, 0.0, 0.0]),
    row([E, -E, E, -E, 0.0, 0.0, 0.0, 0.0, 0.0]),
    row([E, E, -E, E, 0.0, 0.0, 0.0, 0.0, 0.0]),
    row([E, E, -E, -E, 0.0, 0.0, 0.0, 0.0, 0.0]),
    row([E, -E, -E, E, 0.0, 0.0, 0.0, 0.0, 0.0]),
    row([E, -E, -E, -E, 0.0, 0.0, 0.0, 0.0, 0.0]),
];

const W2: f32 = 7.142_857e-2;
const A2: f32 = 1.237_179_1e-1;
const B2: f32 = 7.453_56e-2;
const C2: f32 = 1.290_994_4e-1;
const D2: f32 = 1.490_712e-1;
const F2: f32 = 9.682_458e-2;
const AMBI_MATRIX_2O: [[f32; MAX_AMBI_CHANNELS]; 14] = [
    row([W2, 0.0, 0.0, A2, 0.0, 0.0, -B2, 0.0, C2]),
    row([W2, 0.0, 0.0, -A2, 0.0, 0.0, -B2, 0.0, C2]),
    row([W2, A2, 0.0, 0.0, 0.0, 0.0, -B2, 0.0, -C2]),
    row([W2, -A2, 0.0, 0.0, 0.0, 0.0, -B2, 0.0, -C2]),
    row([W2, 0.0, A2, 0.0, 0.0, 0.0, D2, 0.0, 0.0]),
    row([W2, 0.0, -A2, 0.0, 0.0, 0.0, D2, 0.0, 0.0]),
    row([W2, W2, W2, W2, F2, F2, 0.0, F2, 0.0]),
    row([W2, W2, W2, -W2, -F2, F2, 0.0, -F2, 0.0]),
    row([W2, -W2, W2, W2, -F2, -F2, 0.0, F2, 0.0]),
    row([W2, -W2, W2, -W2, F2, -F2, 0.0, -F2, 0.0]),
    row([W2, W2, -W2, W2, F2, -F2, 0.0, -F2, 0.0]),
    row([W2, W2, -W2, -W2, -F2, -F2, 0.0, F2, 0.0]),
    row([W2, -W2, -W2, W2, -F2, F2, 0.0, -F2, 0.0]),
    row([W2, -W2, -W2, -W2, F2, F2, 0.0, F2, 0.0]),
];

const AMBI_ORDER_HF_GAIN_1O: [f32; MAX_AMBI_ORDER + 1] = [2.0, 1.154_700_5, 0.0, 0.0];
const AMBI_ORDER_HF_GAIN_2O: [f32; MAX_AMBI_ORDER + 1] = [9.128_709e-1, 7.071_068e-1, 3.651_484e-1, 0.0];

/// Crossover for the binaural decoder's dual-band split.
pub const HRTF_XOVER_FREQ: f32 = 700.0;

/// Builds the decoder that renders an ambisonic bus of the given order (1
/// or 2) through `hrtf`.
pub fn build_bformat_hrtf(hrtf: &HrtfStore, order: usize, ir_size: usize) -> DirectHrtfState {
    let (points, matrix, gains): (&[AngularPoint], &[[f32; MAX_AMBI_CHANNELS]], _) = if order >= 2 {
        (&AMBI_POINTS_2O, &AMBI_MATRIX_2O, &AMBI_ORDER_HF_GAIN_2O)
    } else {
        (&AMBI_POINTS_1O, &AMBI_MATRIX_1O, &AMBI_ORDER_HF_GAIN_1O)
    };
    let count = crate::ambisonic::ambi_channels_from_order(order.clamp(1, 2));
    let mut state = DirectHrtfState::new(count);
    state.build(hrtf, ir_size, points, matrix, HRTF_XOVER_FREQ, gains);
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn energy(ir: &HrirArray, ear: usize) -> f32 {
        ir.iter().map(|f| f[ear] * f[ear]).sum()
    }

    #[test]
    fn rejects_inconsistent_tables() {
        let fields = vec![HrtfField {
            distance: 1.0,
            ev_count: 5,
        }];
        let res = HrtfStore::from_parts(44100, 32, fields, &[1, 4, 4, 4, 1], vec![[[0.0; 2]; HRIR_LENGTH]; 3], vec![[0, 0]; 3]);
        assert!(matches!(res, Err(MixerError::InvalidValue(_))));
    }

    #[test]
    fn synthetic_store_is_left_right_symmetric() {
        let store = HrtfStore::synthetic(48000).unwrap();
        assert_eq!(store.ir_size(), 32);
        let (left_src, ldel) = store.coeffs(0.0, -DEG_90, 1.0, 0.0);
        let (right_src, rdel) = store.coeffs(0.0, DEG_90, 1.0, 0.0);
        // A source on the left reaches the left ear first and louder.
        assert!(ldel[0] < ldel[1]);
        assert!(energy(&left_src, 0) > energy(&left_src, 1));
        assert!((ldel[0] as i32 - rdel[1] as i32).abs() <= 1);
        assert!((ldel[1] as i32 - rdel[0] as i32).abs() <= 1);
        assert!((energy(&left_src, 0) - energy(&right_src, 1)).abs() < 1e-4);
    }

    #[test]
    fn front_source_is_centered() {
        let store = HrtfStore::synthetic(44100).unwrap();
        let (ir, delay) = store.coeffs(0.0, 0.0, 1.0, 0.0);
        assert_eq!(delay[0], delay[1]);
        assert!((ir[0][0] - ir[0][1]).abs() < 1e-6);
    }

    #[test]
    fn full_spread_is_passthrough() {
        let store = HrtfStore::synthetic(44100).unwrap();
        let (ir, _) = store.coeffs(0.3, 1.0, 1.0, std::f32::consts::TAU);
        assert!((ir[0][0] - PASSTHRU_COEFF).abs() < 1e-6);
        assert!(ir[1..].iter().all(|f| f[0] == 0.0 && f[1] == 0.0));
    }

    #[test]
    fn ev_and_az_indices() {
        let e = calc_ev_index(7, 0.1);
        assert_eq!(e.idx, 3);
        assert!(e.blend > 0.0 && e.blend < 1.0);
        let top = calc_ev_index(7, DEG_90 + 0.01);
        assert_eq!(top.idx, 6);

        // Negative azimuths wrap to the end of the ring.
        let a = calc_az_index(12, -0.4);
        assert_eq!(a.idx, 11);
    }

    #[test]
    fn bformat_decoder_channels_and_length() {
        let store = HrtfStore::synthetic(48000).unwrap();
        let state = build_bformat_hrtf(&store, 1, store.ir_size());
        assert_eq!(state.channels.len(), 4);
        assert!(state.ir_size >= store.ir_size() && state.ir_size <= HRIR_LENGTH);
        assert!((state.channels[0].hf_scale - 2.0).abs() < 1e-6);
        // W feeds both ears equally by symmetry of the cube.
        let w = &state.channels[0].coeffs;
        assert!((energy(w, 0) - energy(w, 1)).abs() < 1e-4);
        // Y (left) is stronger in the left ear.
        let y = &state.channels[1].coeffs;
        let ysum_l: f32 = y.iter().map(|f| f[0]).sum();
        let ysum_r: f32 = y.iter().map(|f| f[1]).sum();
        assert!(ysum_l > ysum_r);

        let second = build_bformat_hrtf(&store, 2, store.ir_size());
        assert_eq!(second.channels.len(), 9);
    }
}
