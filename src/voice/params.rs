//! Turns a voice's properties and the listener state into mixing targets:
//! phase step, per-channel pan gains for the dry bus and every send, HRTF
//! filters, NFC adjustments and shelf filters.

use std::f32::consts::{PI, TAU};

use crate::ambisonic::{
    calc_angle_coeffs, calc_direction_coeffs, compute_pan_gains, layout_2d_for, layout_for,
    rotation_matrix, scale_azimuth_front, scales_for, wrap_radians, BFChannelConfig,
    MAX_AMBI_CHANNELS, ORDER_FROM_CHANNEL,
};
use crate::audio::{
    lerpf, Channel, ChannelLayout, GAIN_MIX_MAX, MAX_SENDS, REVERB_DECAY_GAIN,
    SPEED_OF_SOUND_METERS_PER_SEC,
};
use crate::biquad::BiquadType;
use crate::config::RenderMode;
use crate::context::ContextProps;
use crate::device::DeviceInfo;
use crate::effect_slot::{SlotMixParams, SlotRenderer, WET_CHANNELS};
use crate::effects::EffectType;
use crate::hrtf::HrtfFilter;
use crate::resampler::{MAX_PITCH, MIXER_FRAC_BITS, MIXER_FRAC_ONE};

use super::{DirectMode, DistanceModel, FilterType, SpatializeMode, Voice, VoiceProps};

type Vec3 = [f32; 3];

fn dot(a: Vec3, b: Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Normalizes in place and returns the original length. Vectors too short to
/// normalize become zero.
fn normalize(v: &mut Vec3) -> f32 {
    let len_sqr = dot(*v, *v);
    if len_sqr > f32::EPSILON * f32::EPSILON {
        let len = len_sqr.sqrt();
        let inv = 1.0 / len;
        v.iter_mut().for_each(|c| *c *= inv);
        return len;
    }
    *v = [0.0; 3];
    0.0
}

/// The listener and context values in the form the source calculations use.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ListenerParams {
    /// Rows are the listener's right, up and back vectors, so multiplying a
    /// world-space vector gives listener space.
    pub matrix: [Vec3; 3],
    pub position: Vec3,
    /// Listener velocity in listener space.
    pub velocity: Vec3,
    pub gain: f32,
    pub meters_per_unit: f32,
    pub air_absorption_gain_hf: f32,
    pub doppler_factor: f32,
    /// Speed of sound scaled by the Doppler velocity.
    pub speed_of_sound: f32,
    pub source_distance_model: bool,
    pub distance_model: DistanceModel,
}

impl ListenerParams {
    pub fn new(props: &ContextProps) -> Self {
        let mut n = props.orient_at;
        normalize(&mut n);
        let mut v = props.orient_up;
        normalize(&mut v);
        let mut u = cross(n, v);
        normalize(&mut u);

        let matrix = [u, v, [-n[0], -n[1], -n[2]]];
        let mut params = Self {
            matrix,
            position: props.position,
            velocity: [0.0; 3],
            gain: props.gain,
            meters_per_unit: props.meters_per_unit,
            air_absorption_gain_hf: props.air_absorption_gain_hf,
            doppler_factor: props.doppler_factor,
            speed_of_sound: props.speed_of_sound * props.doppler_velocity,
            source_distance_model: props.source_distance_model,
            distance_model: props.distance_model,
        };
        params.velocity = params.rotate(props.velocity);
        params
    }

    fn rotate(&self, v: Vec3) -> Vec3 {
        [dot(self.matrix[0], v), dot(self.matrix[1], v), dot(self.matrix[2], v)]
    }
}

impl Default for ListenerParams {
    fn default() -> Self {
        Self::new(&ContextProps::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct GainTriplet {
    base: f32,
    hf: f32,
    lf: f32,
}

impl Default for GainTriplet {
    fn default() -> Self {
        Self {
            base: 0.0,
            hf: 1.0,
            lf: 1.0,
        }
    }
}

/// A speaker position for one input channel: clockwise azimuth and
/// elevation in radians.
#[derive(Clone, Copy, Debug)]
struct ChanMap {
    channel: Channel,
    angle: f32,
    elevation: f32,
}

const DEG: f32 = PI / 180.0;

const fn chan(channel: Channel, angle: f32) -> ChanMap {
    ChanMap {
        channel,
        angle,
        elevation: 0.0,
    }
}

const MONO_MAP: [ChanMap; 1] = [chan(Channel::FrontCenter, 0.0)];
const REAR_MAP: [ChanMap; 2] = [
    chan(Channel::BackLeft, -150.0 * DEG),
    chan(Channel::BackRight, 150.0 * DEG),
];
const QUAD_MAP: [ChanMap; 4] = [
    chan(Channel::FrontLeft, -45.0 * DEG),
    chan(Channel::FrontRight, 45.0 * DEG),
    chan(Channel::BackLeft, -135.0 * DEG),
    chan(Channel::BackRight, 135.0 * DEG),
];
const X51_MAP: [ChanMap; 6] = [
    chan(Channel::FrontLeft, -30.0 * DEG),
    chan(Channel::FrontRight, 30.0 * DEG),
    chan(Channel::FrontCenter, 0.0),
    chan(Channel::Lfe, 0.0),
    chan(Channel::SideLeft, -110.0 * DEG),
    chan(Channel::SideRight, 110.0 * DEG),
];
const X61_MAP: [ChanMap; 7] = [
    chan(Channel::FrontLeft, -30.0 * DEG),
    chan(Channel::FrontRight, 30.0 * DEG),
    chan(Channel::FrontCenter, 0.0),
    chan(Channel::Lfe, 0.0),
    chan(Channel::BackCenter, 180.0 * DEG),
    chan(Channel::SideLeft, -90.0 * DEG),
    chan(Channel::SideRight, 90.0 * DEG),
];
const X71_MAP: [ChanMap; 8] = [
    chan(Channel::FrontLeft, -30.0 * DEG),
    chan(Channel::FrontRight, 30.0 * DEG),
    chan(Channel::FrontCenter, 0.0),
    chan(Channel::Lfe, 0.0),
    chan(Channel::BackLeft, -150.0 * DEG),
    chan(Channel::BackRight, 150.0 * DEG),
    chan(Channel::SideLeft, -90.0 * DEG),
    chan(Channel::SideRight, 90.0 * DEG),
];

/// Every slot's wet bus is first-order ACN at unit scale.
const WET_MAP: [BFChannelConfig; WET_CHANNELS] = [
    BFChannelConfig { scale: 1.0, index: 0 },
    BFChannelConfig { scale: 1.0, index: 1 },
    BFChannelConfig { scale: 1.0, index: 2 },
    BFChannelConfig { scale: 1.0, index: 3 },
];

/// Recomputes `voice`'s mixing targets if it has new properties, or
/// unconditionally with `force` (after a listener, slot or device change).
/// Returns whether anything was recomputed.
pub(crate) fn calc_source_params(
    voice: &mut Voice,
    listener: &ListenerParams,
    device: &DeviceInfo,
    slots: &[SlotRenderer],
    force: bool,
) -> bool {
    let updated = match voice.shared.props.take() {
        Some(node) => {
            voice.props.clone_from(&node);
            voice.shared.props.recycle(node);
            true
        }
        None => false,
    };
    if !updated && !force {
        return false;
    }

    let props = voice.props.clone();
    let mono = voice.layout == ChannelLayout::Mono;
    let non_attn = (props.direct_channels != DirectMode::Off && !mono && !voice.layout.is_ambisonic())
        || props.spatialize == SpatializeMode::Off
        || (props.spatialize == SpatializeMode::Auto && !mono);
    if non_attn {
        calc_non_attn(voice, &props, listener, device, slots);
    } else {
        calc_attn(voice, &props, listener, device, slots);
    }
    true
}

/// Resolves each send to a live, non-null slot.
fn send_slots<'a>(
    props: &VoiceProps,
    device: &DeviceInfo,
    slots: &'a [SlotRenderer],
) -> [Option<(usize, &'a SlotMixParams)>; MAX_SENDS] {
    let mut out = [None; MAX_SENDS];
    for (dst, send) in out.iter_mut().zip(&props.sends).take(device.num_sends) {
        let Some(id) = send.slot else { continue };
        let index = id.index();
        if let Some(slot) = slots.get(index) {
            if slot.active && slot.params.effect_type != EffectType::Null {
                *dst = Some((index, &slot.params));
            }
        }
    }
    out
}

fn set_step(voice: &mut Voice, pitch: f32, props: &VoiceProps) {
    voice.step = if !(pitch < MAX_PITCH as f32) {
        MAX_PITCH << MIXER_FRAC_BITS
    } else {
        ((pitch * MIXER_FRAC_ONE as f32) as u32).max(1)
    };
    voice.resampler = props.resampler.prepare(voice.step);
}

fn clamp_gain(gain: f32, props: &VoiceProps) -> f32 {
    gain.max(props.min_gain).min(props.max_gain)
}

fn calc_non_attn(
    voice: &mut Voice,
    props: &VoiceProps,
    listener: &ListenerParams,
    device: &DeviceInfo,
    slots: &[SlotRenderer],
) {
    let sends = send_slots(props, device, slots);

    let pitch = voice.frequency as f32 / device.frequency as f32 * props.pitch;
    set_step(voice, pitch, props);

    let gain = clamp_gain(props.gain, props);
    let dry = GainTriplet {
        base: (gain * props.direct.gain * listener.gain).min(GAIN_MIX_MAX),
        hf: props.direct.gain_hf,
        lf: props.direct.gain_lf,
    };
    let mut wet = [GainTriplet::default(); MAX_SENDS];
    for (w, send) in wet.iter_mut().zip(&props.sends).take(device.num_sends) {
        *w = GainTriplet {
            base: (gain * send.filter.gain * listener.gain).min(GAIN_MIX_MAX),
            hf: send.filter.gain_hf,
            lf: send.filter.gain_lf,
        };
    }

    let pan = Panning {
        pos: [0.0, 0.0, -1.0],
        distance: 0.0,
        spread: 0.0,
    };
    calc_panning_and_filters(voice, pan, dry, &wet, &sends, props, listener, device);
}

fn calc_attn(
    voice: &mut Voice,
    props: &VoiceProps,
    listener: &ListenerParams,
    device: &DeviceInfo,
    slots: &[SlotRenderer],
) {
    let num_sends = device.num_sends;
    let sends = send_slots(props, device, slots);
    // Sends into slots without auxiliary send auto get the dry path's
    // distance and cone attenuation.
    let use_dry_attn: [bool; MAX_SENDS] =
        std::array::from_fn(|i| sends[i].is_some_and(|(_, slot)| !slot.aux_send_auto));

    let mut position = props.position;
    let mut velocity = props.velocity;
    let mut direction = props.direction;
    if !props.head_relative {
        let rel = [
            position[0] - listener.position[0],
            position[1] - listener.position[1],
            position[2] - listener.position[2],
        ];
        position = listener.rotate(rel);
        velocity = listener.rotate(velocity);
        direction = listener.rotate(direction);
    } else {
        for (v, l) in velocity.iter_mut().zip(&listener.velocity) {
            *v += l;
        }
    }

    let directional = normalize(&mut direction) > 0.0;
    let mut to_source = position;
    let distance = normalize(&mut to_source);

    let mut dry_base = props.gain;
    let mut wet_base = props.gain;
    let model = if listener.source_distance_model {
        props.distance_model
    } else {
        listener.distance_model
    };
    let (ref_dist, max_dist) = (props.ref_distance, props.max_distance);
    let clamped = matches!(
        model,
        DistanceModel::InverseClamped | DistanceModel::LinearClamped | DistanceModel::ExponentClamped
    );
    // A clamped model with inverted limits attenuates nothing.
    let skip = clamped && max_dist < ref_dist;
    let clamped_dist = if clamped && !skip {
        distance.max(ref_dist).min(max_dist)
    } else {
        distance
    };
    if !skip {
        match model {
            DistanceModel::Inverse | DistanceModel::InverseClamped => {
                if ref_dist > 0.0 {
                    let dist = lerpf(ref_dist, clamped_dist, props.rolloff_factor);
                    if dist > 0.0 {
                        dry_base *= ref_dist / dist;
                    }
                    let dist = lerpf(ref_dist, clamped_dist, props.room_rolloff_factor);
                    if dist > 0.0 {
                        wet_base *= ref_dist / dist;
                    }
                }
            }
            DistanceModel::Linear | DistanceModel::LinearClamped => {
                if max_dist != ref_dist {
                    let scale = (clamped_dist - ref_dist) / (max_dist - ref_dist);
                    dry_base *= (1.0 - scale * props.rolloff_factor).max(0.0);
                    wet_base *= (1.0 - scale * props.room_rolloff_factor).max(0.0);
                }
            }
            DistanceModel::Exponent | DistanceModel::ExponentClamped => {
                if clamped_dist > 0.0 && ref_dist > 0.0 {
                    let ratio = clamped_dist / ref_dist;
                    dry_base *= ratio.powf(-props.rolloff_factor);
                    wet_base *= ratio.powf(-props.room_rolloff_factor);
                }
            }
            DistanceModel::Disable => {}
        }
    }

    let mut cone_hf = 1.0;
    let mut wet_cone_hf = 1.0;
    if directional && props.inner_angle < 360.0 {
        let angle = 2.0 * (-dot(direction, to_source)).clamp(-1.0, 1.0).acos().to_degrees();
        let (dry_hf_auto, wet_auto, wet_hf_auto) = (
            f32::from(u8::from(props.dry_gain_hf_auto)),
            f32::from(u8::from(props.wet_gain_auto)),
            f32::from(u8::from(props.wet_gain_hf_auto)),
        );
        let mut cone_gain = 1.0;
        if angle >= props.outer_angle {
            cone_gain = props.outer_gain;
            cone_hf = lerpf(1.0, props.outer_gain_hf, dry_hf_auto);
        } else if angle >= props.inner_angle {
            let scale = (angle - props.inner_angle) / (props.outer_angle - props.inner_angle);
            cone_gain = lerpf(1.0, props.outer_gain, scale);
            cone_hf = lerpf(1.0, props.outer_gain_hf, scale * dry_hf_auto);
        }
        dry_base *= cone_gain;
        wet_base *= lerpf(1.0, cone_gain, wet_auto);
        wet_cone_hf = lerpf(1.0, cone_hf, wet_hf_auto);
    }

    let dry_base = clamp_gain(dry_base, props) * listener.gain;
    let wet_base = clamp_gain(wet_base, props) * listener.gain;

    let mut dry = GainTriplet {
        base: (dry_base * props.direct.gain).min(GAIN_MIX_MAX),
        hf: cone_hf * props.direct.gain_hf,
        lf: props.direct.gain_lf,
    };
    let mut wet = [GainTriplet::default(); MAX_SENDS];
    for (i, w) in wet.iter_mut().enumerate().take(num_sends) {
        let send = &props.sends[i].filter;
        let (gain, hf) = if use_dry_attn[i] {
            (dry_base, cone_hf)
        } else {
            (wet_base, wet_cone_hf)
        };
        *w = GainTriplet {
            base: (gain * send.gain).min(GAIN_MIX_MAX),
            hf: hf * send.gain_hf,
            lf: send.gain_lf,
        };
    }

    if distance > ref_dist {
        let distance_base = (distance - ref_dist) * props.rolloff_factor;
        let absorption = distance_base * listener.meters_per_unit * props.air_absorption_factor;
        if absorption > f32::EPSILON {
            let hfattn = listener.air_absorption_gain_hf.powf(absorption);
            dry.hf *= hfattn;
            for w in wet.iter_mut().take(num_sends) {
                w.hf *= hfattn;
            }
        }

        if props.wet_gain_auto {
            for (w, send) in wet.iter_mut().zip(&sends).take(num_sends) {
                let Some((_, slot)) = send else { continue };
                apply_send_decay(w, slot, distance, distance_base, props);
            }
        }
    }

    let mut pitch = props.pitch;
    let doppler = props.doppler_factor * listener.doppler_factor;
    if doppler > 0.0 {
        let vss = dot(velocity, to_source) * -doppler;
        let vls = dot(listener.velocity, to_source) * -doppler;
        let sos = listener.speed_of_sound;
        if !(vls < sos) {
            // The listener outruns the wavefront.
            pitch = 0.0;
        } else if !(vss < sos) {
            pitch = f32::INFINITY;
        } else {
            pitch *= (sos - vls) / (sos - vss);
        }
    }
    pitch *= voice.frequency as f32 / device.frequency as f32;
    set_step(voice, pitch, props);

    let spread = if props.radius > distance {
        TAU - distance / props.radius * PI
    } else if distance > 0.0 {
        (props.radius / distance).asin() * 2.0
    } else {
        0.0
    };

    let pan = Panning {
        pos: to_source,
        distance: distance * listener.meters_per_unit,
        spread,
    };
    calc_panning_and_filters(voice, pan, dry, &wet, &sends, props, listener, device);
}

/// Room rolloff and the initial reverb decay over the source distance.
fn apply_send_decay(
    wet: &mut GainTriplet,
    slot: &SlotMixParams,
    distance: f32,
    distance_base: f32,
    props: &VoiceProps,
) {
    let attenuation = |rolloff: f32| {
        let dist = lerpf(props.ref_distance, distance, rolloff);
        if dist > props.ref_distance {
            props.ref_distance / dist
        } else {
            1.0
        }
    };

    wet.base *= attenuation(slot.room_rolloff);
    if !slot.aux_send_auto {
        return;
    }

    // Distances at which the decay reaches -60dB.
    let decay_base = slot.decay_time * SPEED_OF_SOUND_METERS_PER_SEC;
    let decay_lf = decay_base * slot.decay_lf_ratio;
    let mut decay_hf = decay_base * slot.decay_hf_ratio;
    if slot.decay_hf_limit && slot.air_absorption_gain_hf < 1.0 {
        let absorb_dist = REVERB_DECAY_GAIN.log10() / slot.air_absorption_gain_hf.log10();
        decay_hf = decay_hf.min(absorb_dist);
    }

    let base_attn = attenuation(props.rolloff_factor);
    let decayed = |decay_dist: f32| REVERB_DECAY_GAIN.powf(distance_base / decay_dist) * (1.0 - base_attn) + base_attn;

    let gain = decayed(decay_base);
    wet.base *= gain;
    if gain > 0.0 {
        wet.hf *= (decayed(decay_hf) / gain).min(1.0);
        wet.lf *= (decayed(decay_lf) / gain).min(1.0);
    }
}

/// Direction (listener space, unit length), distance in meters and angular
/// spread of a source.
#[derive(Clone, Copy, Debug)]
struct Panning {
    pos: Vec3,
    distance: f32,
    spread: f32,
}

fn pan_coeffs(pos: Vec3, mode: RenderMode, spread: f32) -> [f32; MAX_AMBI_CHANNELS] {
    if mode != RenderMode::Pairwise {
        return calc_direction_coeffs(pos, spread);
    }
    let ev = pos[1].clamp(-1.0, 1.0).asin();
    let az = pos[0].atan2(-pos[2]);
    // Stretches +/-60 degrees out to the speakers at +/-90.
    calc_angle_coeffs(scale_azimuth_front(az, 1.5), ev, spread)
}

#[allow(clippy::too_many_arguments)]
fn calc_panning_and_filters(
    voice: &mut Voice,
    pan: Panning,
    dry: GainTriplet,
    wet: &[GainTriplet; MAX_SENDS],
    sends: &[Option<(usize, &SlotMixParams)>; MAX_SENDS],
    props: &VoiceProps,
    listener: &ListenerParams,
    device: &DeviceInfo,
) {
    let frequency = device.frequency as f32;
    let num_sends = device.num_sends;
    let num_channels = voice.num_channels.max(1);
    let Panning { pos, distance, spread } = pan;

    for (i, target) in voice.sends.iter_mut().enumerate() {
        target.slot = if i < num_sends { sends[i].map(|(idx, _)| idx) } else { None };
    }
    for chan in voice.chans[..num_channels].iter_mut() {
        chan.dry.hrtf.target = HrtfFilter::default();
        chan.dry.target.fill(0.0);
        for send in chan.wet[..num_sends].iter_mut() {
            send.target.fill(0.0);
        }
    }

    let mut direct_mode = props.direct_channels;
    let stereo_map = [
        ChanMap {
            channel: Channel::FrontLeft,
            angle: if direct_mode == DirectMode::Off { wrap_radians(-props.stereo_pan[0]) } else { -30.0 * DEG },
            elevation: 0.0,
        },
        ChanMap {
            channel: Channel::FrontRight,
            angle: if direct_mode == DirectMode::Off { wrap_radians(-props.stereo_pan[1]) } else { 30.0 * DEG },
            elevation: 0.0,
        },
    ];
    let chans: &[ChanMap] = match voice.layout {
        ChannelLayout::Mono => {
            direct_mode = DirectMode::Off;
            &MONO_MAP
        }
        ChannelLayout::Stereo => &stereo_map,
        ChannelLayout::Rear => &REAR_MAP,
        ChannelLayout::Quad => &QUAD_MAP,
        ChannelLayout::X51 => &X51_MAP,
        ChannelLayout::X61 => &X61_MAP,
        ChannelLayout::X71 => &X71_MAP,
        _ => {
            direct_mode = DirectMode::Off;
            &[]
        }
    };

    voice.flags.has_hrtf = false;
    voice.flags.has_nfc = false;
    voice.direct.to_real = false;
    voice.set_decoder_width(props.enh_width.min(0.7));

    let near_zero = !(distance > f32::EPSILON);
    let nfc_w0 = |dist: f32| {
        // Very close sources are clamped to avoid excessive bass.
        let mdist = dist.max(device.avg_speaker_dist / 4.0);
        SPEED_OF_SOUND_METERS_PER_SEC / (mdist * frequency)
    };
    let wet_gains = |i: usize| wet[i].base;

    if voice.layout.is_ambisonic() {
        if device.avg_speaker_dist > 0.0
            && !matches!(voice.layout, ChannelLayout::Uhj2 | ChannelLayout::SuperStereo)
        {
            // Only W needs adjusting; the higher orders were set up for
            // plane-wave input.
            let w0 = if near_zero { 0.0 } else { nfc_w0(distance) };
            voice.chans[0].dry.nfc.adjust(w0);
            voice.flags.has_nfc = true;
        }

        // W pans like a mono source, and the spread blends between that and
        // full coverage.
        let coverage = if near_zero { 1.0 } else { spread / TAU };
        let mut coeffs = pan_coeffs(pos, device.render_mode, 0.0);
        coeffs[1..].iter_mut().for_each(|c| *c *= 1.0 - coverage);

        let scales = scales_for(voice.ambi_scaling);
        compute_pan_gains(&device.dry.ambi_map, &coeffs, dry.base * scales[0], &mut voice.chans[0].dry.target);
        for i in 0..num_sends {
            if sends[i].is_some() {
                compute_pan_gains(&WET_MAP, &coeffs, wet_gains(i) * scales[0], &mut voice.chans[0].wet[i].target);
            }
        }

        if coverage > 0.0 {
            let mut n = props.orient_at;
            normalize(&mut n);
            let mut v = props.orient_up;
            normalize(&mut v);
            if !props.head_relative {
                n = listener.rotate(n);
                v = listener.rotate(v);
            }
            let mut u = cross(n, v);
            normalize(&mut u);

            let order = voice.ambi_order.min(device.ambi_order);
            let shrot = rotation_matrix(n, v, u, order);

            let is_2d = matches!(
                voice.layout,
                ChannelLayout::BFormat2D | ChannelLayout::Uhj2 | ChannelLayout::Uhj3 | ChannelLayout::SuperStereo
            );
            let index_map: &[u8] = if is_2d {
                layout_2d_for(voice.ambi_layout)
            } else {
                layout_for(voice.ambi_layout)
            };

            const CHANS_PER_ORDER: [usize; 4] = [1, 3, 5, 7];
            const ORDER_OFFSET: [usize; 4] = [0, 1, 4, 9];
            for c in 1..num_channels {
                let acn = index_map[c] as usize;
                let order = ORDER_FROM_CHANNEL[acn] as usize;
                let offset = ORDER_OFFSET[order];
                let scale = scales[acn] * coverage;

                let mut coeffs = [0.0f32; MAX_AMBI_CHANNELS];
                for x in 0..CHANS_PER_ORDER[order] {
                    coeffs[offset + x] = shrot[offset + x][acn] * scale;
                }

                compute_pan_gains(&device.dry.ambi_map, &coeffs, dry.base, &mut voice.chans[c].dry.target);
                for i in 0..num_sends {
                    if sends[i].is_some() {
                        compute_pan_gains(&WET_MAP, &coeffs, wet_gains(i), &mut voice.chans[c].wet[i].target);
                    }
                }
            }
        }
    } else if direct_mode != DirectMode::Off && !device.remix.is_empty() {
        // Direct channels skip the virtual bus and go straight to the
        // matching speakers.
        voice.direct.to_real = true;
        for (c, map) in chans.iter().enumerate().take(num_channels) {
            let target = &mut voice.chans[c].dry.target;
            if let Some(idx) = device.real_out.index_of(map.channel) {
                target[idx] = dry.base;
            } else if direct_mode == DirectMode::RemixMismatch {
                if let Some(remap) = device.remix.iter().find(|r| r.channel == map.channel) {
                    for &(channel, mix) in remap.targets.iter() {
                        if let Some(idx) = device.real_out.index_of(channel) {
                            target[idx] = dry.base * mix;
                        }
                    }
                }
            }
        }

        // Sends mix to B-Format, which has no speakers to match.
        for (c, map) in chans.iter().enumerate().take(num_channels) {
            let coeffs = calc_angle_coeffs(map.angle, map.elevation, 0.0);
            for i in 0..num_sends {
                if sends[i].is_some() {
                    compute_pan_gains(&WET_MAP, &coeffs, wet_gains(i), &mut voice.chans[c].wet[i].target);
                }
            }
        }
    } else if device.render_mode == RenderMode::Hrtf && device.hrtf.is_some() {
        voice.direct.to_real = true;
        let hrtf = device.hrtf.as_deref();
        if !near_zero {
            let ev = pos[1].clamp(-1.0, 1.0).asin();
            let az = pos[0].atan2(-pos[2]);
            if let Some(store) = hrtf {
                let (coeffs, delay) = store.coeffs(ev, az, distance, spread);
                voice.chans[0].dry.hrtf.target = HrtfFilter {
                    coeffs,
                    delay,
                    gain: dry.base,
                };
            }
            for c in 1..num_channels {
                if chans.get(c).is_some_and(|m| m.channel == Channel::Lfe) {
                    continue;
                }
                voice.chans[c].dry.hrtf.target = voice.chans[0].dry.hrtf.target.clone();
            }

            let coeffs = calc_direction_coeffs(pos, spread);
            for c in 0..num_channels {
                if chans.get(c).is_some_and(|m| m.channel == Channel::Lfe) {
                    continue;
                }
                for i in 0..num_sends {
                    if sends[i].is_some() {
                        compute_pan_gains(&WET_MAP, &coeffs, wet_gains(i), &mut voice.chans[c].wet[i].target);
                    }
                }
            }
        } else {
            // Local sources get each channel placed at its speaker angle,
            // as virtual speakers.
            for (c, map) in chans.iter().enumerate().take(num_channels) {
                if map.channel == Channel::Lfe {
                    continue;
                }
                if let Some(store) = hrtf {
                    let (coeffs, delay) = store.coeffs(map.elevation, map.angle, f32::INFINITY, spread);
                    voice.chans[c].dry.hrtf.target = HrtfFilter {
                        coeffs,
                        delay,
                        gain: dry.base,
                    };
                }
                let coeffs = calc_angle_coeffs(map.angle, map.elevation, spread);
                for i in 0..num_sends {
                    if sends[i].is_some() {
                        compute_pan_gains(&WET_MAP, &coeffs, wet_gains(i), &mut voice.chans[c].wet[i].target);
                    }
                }
            }
        }
        voice.flags.has_hrtf = true;
    } else {
        let lfe_index = device.real_out.index_of(Channel::Lfe).filter(|_| device.dry_is_real);
        if !near_zero {
            if device.avg_speaker_dist > 0.0 {
                let w0 = nfc_w0(distance);
                for chan in voice.chans[..num_channels].iter_mut() {
                    chan.dry.nfc.adjust(w0);
                }
                voice.flags.has_nfc = true;
            }

            let coeffs = pan_coeffs(pos, device.render_mode, spread);
            for (c, map) in chans.iter().enumerate().take(num_channels) {
                if map.channel == Channel::Lfe {
                    if let Some(idx) = lfe_index {
                        voice.chans[c].dry.target[idx] = dry.base;
                    }
                    continue;
                }
                compute_pan_gains(&device.dry.ambi_map, &coeffs, dry.base, &mut voice.chans[c].dry.target);
                for i in 0..num_sends {
                    if sends[i].is_some() {
                        compute_pan_gains(&WET_MAP, &coeffs, wet_gains(i), &mut voice.chans[c].wet[i].target);
                    }
                }
            }
        } else {
            if device.avg_speaker_dist > 0.0 {
                // Zero distance is a plane wave.
                for chan in voice.chans[..num_channels].iter_mut() {
                    chan.dry.nfc.adjust(0.0);
                }
                voice.flags.has_nfc = true;
            }

            for (c, map) in chans.iter().enumerate().take(num_channels) {
                if map.channel == Channel::Lfe {
                    if let Some(idx) = lfe_index {
                        voice.chans[c].dry.target[idx] = dry.base;
                    }
                    continue;
                }
                let angle = if device.render_mode == RenderMode::Pairwise {
                    scale_azimuth_front(map.angle, 3.0)
                } else {
                    map.angle
                };
                let coeffs = calc_angle_coeffs(angle, map.elevation, spread);
                compute_pan_gains(&device.dry.ambi_map, &coeffs, dry.base, &mut voice.chans[c].dry.target);
                for i in 0..num_sends {
                    if sends[i].is_some() {
                        compute_pan_gains(&WET_MAP, &coeffs, wet_gains(i), &mut voice.chans[c].wet[i].target);
                    }
                }
            }
        }
    }

    let hf_norm = props.direct.hf_reference / frequency;
    let lf_norm = props.direct.lf_reference / frequency;
    voice.direct.filter = FilterType::from_gains(dry.hf, dry.lf);
    let (first, rest) = voice.chans[..num_channels].split_at_mut(1);
    let first = &mut first[0];
    first.dry.low_pass.set_params_from_slope(BiquadType::HighShelf, hf_norm, dry.hf, 1.0);
    first.dry.high_pass.set_params_from_slope(BiquadType::LowShelf, lf_norm, dry.lf, 1.0);
    for chan in rest.iter_mut() {
        chan.dry.low_pass.copy_params_from(&first.dry.low_pass);
        chan.dry.high_pass.copy_params_from(&first.dry.high_pass);
    }

    for i in 0..num_sends {
        let send = &props.sends[i].filter;
        let hf_norm = send.hf_reference / frequency;
        let lf_norm = send.lf_reference / frequency;
        voice.sends[i].filter = FilterType::from_gains(wet[i].hf, wet[i].lf);
        first.wet[i].low_pass.set_params_from_slope(BiquadType::HighShelf, hf_norm, wet[i].hf, 1.0);
        first.wet[i].high_pass.set_params_from_slope(BiquadType::LowShelf, lf_norm, wet[i].lf, 1.0);
        for chan in rest.iter_mut() {
            chan.wet[i].low_pass.copy_params_from(&first.wet[i].low_pass);
            chan.wet[i].high_pass.copy_params_from(&first.wet[i].high_pass);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::audio::Buffer;
    use crate::audio::BufferQueueItem;
    use crate::audio::SampleType;
    use crate::effect_slot::{SlotId, SlotShared};
    use crate::voice::{VoiceShared, VoiceStart};

    fn voice_for(layout: ChannelLayout, device: &DeviceInfo) -> Voice {
        let frames = 64;
        let data = vec![0u8; frames * layout.channel_count(1) * 4];
        let buffer = Arc::new(Buffer::new(48_000, SampleType::F32, layout, data).unwrap());
        let item = BufferQueueItem::new(buffer.clone());
        let mut voice = Voice::new(Arc::new(VoiceShared::new()));
        voice.start(
            VoiceStart {
                queue: item.clone(),
                current: item,
                buffer_index: 0,
                position: 0,
                position_frac: 0,
                fading: false,
                is_static: true,
                format: buffer,
                super_stereo: false,
                callback_data: None,
            },
            device,
        );
        voice
    }

    fn publish(voice: &Voice, props: VoiceProps) {
        voice.shared.props.publish(props);
    }

    fn w_gain(voice: &Voice) -> f32 {
        voice.chans[0].dry.target[0]
    }

    #[test]
    fn nothing_happens_without_new_props() {
        let device = DeviceInfo::for_tests(48_000);
        let mut voice = voice_for(ChannelLayout::Mono, &device);
        let listener = ListenerParams::default();
        assert!(!calc_source_params(&mut voice, &listener, &device, &[], false));
        publish(&voice, VoiceProps::default());
        assert!(calc_source_params(&mut voice, &listener, &device, &[], false));
        assert!(!calc_source_params(&mut voice, &listener, &device, &[], false));
        assert!(calc_source_params(&mut voice, &listener, &device, &[], true));
    }

    #[test]
    fn inverse_distance_halves_gain_at_twice_the_reference() {
        let device = DeviceInfo::for_tests(48_000);
        let listener = ListenerParams::default();
        let mut voice = voice_for(ChannelLayout::Mono, &device);

        let mut props = VoiceProps::default();
        props.position = [0.0, 0.0, -1.0];
        publish(&voice, props.clone());
        calc_source_params(&mut voice, &listener, &device, &[], false);
        let near = w_gain(&voice);

        props.position = [0.0, 0.0, -2.0];
        publish(&voice, props);
        calc_source_params(&mut voice, &listener, &device, &[], false);
        let far = w_gain(&voice);

        assert!((near - 1.0).abs() < 1e-5, "near gain {near}");
        assert!((far - 0.5).abs() < 1e-5, "far gain {far}");
    }

    #[test]
    fn linear_clamped_reaches_silence_at_max_distance() {
        let device = DeviceInfo::for_tests(48_000);
        let listener = ListenerParams::default();
        let mut voice = voice_for(ChannelLayout::Mono, &device);
        let mut props = VoiceProps::default();
        props.distance_model = DistanceModel::LinearClamped;
        props.max_distance = 10.0;
        props.position = [0.0, 0.0, -20.0];
        let mut listener = listener;
        listener.source_distance_model = true;
        publish(&voice, props);
        calc_source_params(&mut voice, &listener, &device, &[], false);
        assert_eq!(w_gain(&voice), 0.0);
    }

    #[test]
    fn source_to_the_right_pans_right() {
        let device = DeviceInfo::for_tests(48_000);
        let listener = ListenerParams::default();
        let mut voice = voice_for(ChannelLayout::Mono, &device);
        let mut props = VoiceProps::default();
        props.position = [1.0, 0.0, 0.0];
        publish(&voice, props);
        calc_source_params(&mut voice, &listener, &device, &[], false);
        // ACN 1 is Y (left), ACN 3 is X (front).
        let target = &voice.chans[0].dry.target;
        assert!(target[1] < -0.5, "Y gain {}", target[1]);
        assert!(target[3].abs() < 1e-4, "X gain {}", target[3]);
    }

    #[test]
    fn listener_orientation_rotates_sources() {
        let device = DeviceInfo::for_tests(48_000);
        let mut ctx = ContextProps::default();
        // Facing +X puts a source at +X straight ahead.
        ctx.orient_at = [1.0, 0.0, 0.0];
        let listener = ListenerParams::new(&ctx);
        let mut voice = voice_for(ChannelLayout::Mono, &device);
        let mut props = VoiceProps::default();
        props.position = [1.0, 0.0, 0.0];
        publish(&voice, props);
        calc_source_params(&mut voice, &listener, &device, &[], false);
        let target = &voice.chans[0].dry.target;
        assert!(target[3] > 0.5, "X gain {}", target[3]);
        assert!(target[1].abs() < 1e-4, "Y gain {}", target[1]);
    }

    #[test]
    fn doppler_saturates_at_max_pitch() {
        let device = DeviceInfo::for_tests(48_000);
        let mut ctx = ContextProps::default();
        ctx.speed_of_sound = 343.0;
        let listener = ListenerParams::new(&ctx);
        let mut voice = voice_for(ChannelLayout::Mono, &device);
        let mut props = VoiceProps::default();
        props.position = [0.0, 0.0, -10.0];
        props.velocity = [0.0, 0.0, 340.0];
        publish(&voice, props);
        calc_source_params(&mut voice, &listener, &device, &[], false);
        assert_eq!(voice.step, MAX_PITCH << MIXER_FRAC_BITS);
    }

    #[test]
    fn non_finite_pitch_saturates_the_step() {
        let device = DeviceInfo::for_tests(48_000);
        let mut voice = voice_for(ChannelLayout::Mono, &device);
        let props = VoiceProps::default();
        for pitch in [f32::NAN, f32::INFINITY] {
            voice.step = 0;
            set_step(&mut voice, pitch, &props);
            assert_eq!(voice.step, MAX_PITCH << MIXER_FRAC_BITS, "pitch {}", pitch);
        }
        set_step(&mut voice, 0.0, &props);
        assert_eq!(voice.step, 1);
    }

    #[test]
    fn unit_pitch_gives_unit_step() {
        let device = DeviceInfo::for_tests(48_000);
        let listener = ListenerParams::default();
        let mut voice = voice_for(ChannelLayout::Stereo, &device);
        publish(&voice, VoiceProps::default());
        calc_source_params(&mut voice, &listener, &device, &[], false);
        assert_eq!(voice.step, MIXER_FRAC_ONE);
    }

    #[test]
    fn outside_the_cone_uses_outer_gain() {
        let device = DeviceInfo::for_tests(48_000);
        let listener = ListenerParams::default();
        let mut voice = voice_for(ChannelLayout::Mono, &device);
        let mut props = VoiceProps::default();
        props.position = [0.0, 0.0, -1.0];
        // Pointing away from the listener.
        props.direction = [0.0, 0.0, -1.0];
        props.inner_angle = 30.0;
        props.outer_angle = 90.0;
        props.outer_gain = 0.25;
        publish(&voice, props);
        calc_source_params(&mut voice, &listener, &device, &[], false);
        assert!((w_gain(&voice) - 0.25).abs() < 1e-5, "gain {}", w_gain(&voice));
    }

    #[test]
    fn hf_gain_selects_low_pass() {
        let device = DeviceInfo::for_tests(48_000);
        let listener = ListenerParams::default();
        let mut voice = voice_for(ChannelLayout::Mono, &device);
        let mut props = VoiceProps::default();
        props.direct.gain_hf = 0.5;
        publish(&voice, props);
        calc_source_params(&mut voice, &listener, &device, &[], false);
        assert_eq!(voice.direct.filter, FilterType::LowPass);
        assert_eq!(voice.sends[0].filter, FilterType::None);
    }

    #[test]
    fn sends_to_null_slots_are_dropped() {
        let device = DeviceInfo::for_tests(48_000);
        let listener = ListenerParams::default();
        let mut voice = voice_for(ChannelLayout::Mono, &device);
        let mut slots = vec![SlotRenderer::new(Arc::new(SlotShared::new()))];
        slots[0].active = true;

        let mut props = VoiceProps::default();
        props.sends[0].slot = Some(SlotId(0));
        publish(&voice, props.clone());
        calc_source_params(&mut voice, &listener, &device, &slots, false);
        assert_eq!(voice.sends[0].slot, None);

        slots[0].params.effect_type = EffectType::Reverb;
        publish(&voice, props);
        calc_source_params(&mut voice, &listener, &device, &slots, false);
        assert_eq!(voice.sends[0].slot, Some(0));
        assert!(voice.chans[0].wet[0].target[0] > 0.0);
    }
}
