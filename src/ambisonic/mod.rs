//! Ambisonic constants, channel orderings and panning coefficients.
//!
//! Internally everything is ACN ordered with N3D normalization. The scale
//! tables convert *from* another normalization into N3D by multiplication;
//! decoder coefficients are divided by them.

pub mod rotator;

pub use rotator::{ambi_rotator, rotation_matrix, AmbiMatrix};

use crate::audio::buffer::{AmbiLayout, AmbiScaling};

pub const MAX_AMBI_ORDER: usize = 3;
pub const MAX_AMBI_CHANNELS: usize = ambi_channels_from_order(MAX_AMBI_ORDER);
pub const MAX_AMBI2D_CHANNELS: usize = ambi_2d_channels_from_order(MAX_AMBI_ORDER);

/// ACN channels that carry height information.
pub const AMBI_PERIPHONIC_MASK: u32 = 0x00fe_7ce4;

pub const fn ambi_channels_from_order(order: usize) -> usize {
    (order + 1) * (order + 1)
}

pub const fn ambi_2d_channels_from_order(order: usize) -> usize {
    order * 2 + 1
}

pub const FROM_N3D: [f32; MAX_AMBI_CHANNELS] = [1.0; MAX_AMBI_CHANNELS];

pub const FROM_SN3D: [f32; MAX_AMBI_CHANNELS] = [
    1.000000000,
    1.732050808,
    1.732050808,
    1.732050808,
    2.236067978,
    2.236067978,
    2.236067978,
    2.236067978,
    2.236067978,
    2.645751311,
    2.645751311,
    2.645751311,
    2.645751311,
    2.645751311,
    2.645751311,
    2.645751311,
];

pub const FROM_FUMA: [f32; MAX_AMBI_CHANNELS] = [
    1.414213562, // W
    1.732050808, // Y
    1.732050808, // Z
    1.732050808, // X
    1.936491673, // V
    1.936491673, // T
    2.236067978, // R
    1.936491673, // S
    1.936491673, // U
    2.091650066, // Q
    1.972026594, // O
    2.231093404, // M
    2.645751311, // K
    2.231093404, // L
    1.972026594, // N
    2.091650066, // P
];

/// UHJ only defines first order; higher channels are passed through.
pub const FROM_UHJ: [f32; MAX_AMBI_CHANNELS] = [
    1.000000000,
    1.224744871,
    1.224744871,
    1.224744871,
    1.0,
    1.0,
    1.0,
    1.0,
    1.0,
    1.0,
    1.0,
    1.0,
    1.0,
    1.0,
    1.0,
    1.0,
];

/// ACN index for each FuMa channel (W X Y Z R S T U V K L M N O P Q).
pub const FROM_FUMA_INDEX: [u8; MAX_AMBI_CHANNELS] = [0, 3, 1, 2, 6, 7, 5, 8, 4, 12, 13, 11, 14, 10, 15, 9];
pub const FROM_FUMA_2D_INDEX: [u8; MAX_AMBI2D_CHANNELS] = [0, 3, 1, 8, 4, 15, 9];
pub const FROM_ACN_INDEX: [u8; MAX_AMBI_CHANNELS] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
pub const FROM_ACN_2D_INDEX: [u8; MAX_AMBI2D_CHANNELS] = [0, 1, 3, 4, 8, 9, 15];

pub const ORDER_FROM_CHANNEL: [u8; MAX_AMBI_CHANNELS] = [0, 1, 1, 1, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3];
pub const ORDER_FROM_2D_CHANNEL: [u8; MAX_AMBI2D_CHANNELS] = [0, 1, 1, 2, 2, 3, 3];

pub fn scales_for(scaling: AmbiScaling) -> &'static [f32; MAX_AMBI_CHANNELS] {
    match scaling {
        AmbiScaling::FuMa => &FROM_FUMA,
        AmbiScaling::Sn3d => &FROM_SN3D,
        AmbiScaling::N3d => &FROM_N3D,
        AmbiScaling::Uhj => &FROM_UHJ,
    }
}

pub fn layout_for(layout: AmbiLayout) -> &'static [u8; MAX_AMBI_CHANNELS] {
    match layout {
        AmbiLayout::FuMa => &FROM_FUMA_INDEX,
        AmbiLayout::Acn => &FROM_ACN_INDEX,
    }
}

pub fn layout_2d_for(layout: AmbiLayout) -> &'static [u8; MAX_AMBI2D_CHANNELS] {
    match layout {
        AmbiLayout::FuMa => &FROM_FUMA_2D_INDEX,
        AmbiLayout::Acn => &FROM_ACN_2D_INDEX,
    }
}

const DECODER_HF_SCALE_1O: [f32; MAX_AMBI_ORDER + 1] = [1.0, 1.0, 0.0, 0.0];
const DECODER_HF_SCALE_2O: [f32; MAX_AMBI_ORDER + 1] = [0.745355990, 1.0, 1.0, 0.0];
const DECODER_HF_SCALE_3O: [f32; MAX_AMBI_ORDER + 1] = [0.589792205, 0.879693856, 1.0, 1.0];

fn decoder_hf_scales(order: usize) -> &'static [f32; MAX_AMBI_ORDER + 1] {
    match order {
        3 => &DECODER_HF_SCALE_3O,
        2 => &DECODER_HF_SCALE_2O,
        _ => &DECODER_HF_SCALE_1O,
    }
}

/// Per-order high-frequency gains for playing `in_order` content through a
/// decoder built for `out_order`. Orders above `in_order` are zero.
pub fn hf_order_scales(in_order: usize, out_order: usize) -> [f32; MAX_AMBI_ORDER + 1] {
    let mut ret = [0.0f32; MAX_AMBI_ORDER + 1];
    let target = decoder_hf_scales(out_order);
    let input = decoder_hf_scales(in_order);
    for i in 0..=in_order.min(MAX_AMBI_ORDER) {
        ret[i] = input[i] / target[i];
    }
    ret
}

/// Third-order N3D coefficients for the ambisonic-space direction
/// (`y` left, `z` up, `x` front). `spread` is the angular width in radians;
/// a non-zero spread widens the response with zonal harmonic weighting.
pub fn calc_ambi_coeffs(y: f32, z: f32, x: f32, spread: f32) -> [f32; MAX_AMBI_CHANNELS] {
    let xx = x * x;
    let yy = y * y;
    let zz = z * z;
    let xy = x * y;
    let yz = y * z;
    let xz = x * z;

    let mut coeffs = [
        // Zeroth-order
        1.0,
        // First-order
        1.732050808 * y,
        1.732050808 * z,
        1.732050808 * x,
        // Second-order
        3.872983346 * xy,
        3.872983346 * yz,
        1.118033989 * (3.0 * zz - 1.0),
        3.872983346 * xz,
        1.936491673 * (xx - yy),
        // Third-order
        2.091650066 * (y * (3.0 * xx - yy)),
        10.246950766 * (z * xy),
        1.620185175 * (y * (5.0 * zz - 1.0)),
        1.322875656 * (z * (5.0 * zz - 3.0)),
        1.620185175 * (x * (5.0 * zz - 1.0)),
        5.123475383 * (z * (xx - yy)),
        2.091650066 * (x * (xx - 3.0 * yy)),
    ];

    if spread > 0.0 {
        // Zonal harmonics for a cap of the given angle, normalized so the
        // total energy stays constant as the cap grows.
        let ca = (spread * 0.5).cos();
        let scale = (1.0 + spread / std::f32::consts::PI).sqrt();

        let zh0_norm = scale;
        let zh1_norm = scale * 0.5 * (ca + 1.0);
        let zh2_norm = scale * 0.5 * (ca + 1.0) * ca;
        let zh3_norm = scale * 0.125 * (ca + 1.0) * (5.0 * ca * ca - 1.0);

        coeffs[0] *= zh0_norm;
        for c in &mut coeffs[1..4] {
            *c *= zh1_norm;
        }
        for c in &mut coeffs[4..9] {
            *c *= zh2_norm;
        }
        for c in &mut coeffs[9..16] {
            *c *= zh3_norm;
        }
    }

    coeffs
}

/// Coefficients for a direction given in world coordinates (right-handed,
/// -Z in front, +Y up).
pub fn calc_direction_coeffs(dir: [f32; 3], spread: f32) -> [f32; MAX_AMBI_CHANNELS] {
    calc_ambi_coeffs(-dir[0], dir[1], -dir[2], spread)
}

/// Coefficients for an azimuth (clockwise, radians, 0 in front) and
/// elevation.
pub fn calc_angle_coeffs(azimuth: f32, elevation: f32, spread: f32) -> [f32; MAX_AMBI_CHANNELS] {
    let y = -azimuth.sin() * elevation.cos();
    let z = elevation.sin();
    let x = azimuth.cos() * elevation.cos();
    calc_ambi_coeffs(y, z, x, spread)
}

/// One channel of an ambisonic mix bus: which ACN component it carries and
/// how that component is scaled on the bus.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BFChannelConfig {
    pub scale: f32,
    pub index: usize,
}

impl BFChannelConfig {
    pub fn acn(index: usize) -> Self {
        Self { scale: 1.0, index }
    }
}

/// Projects `coeffs` onto a bus described by `ambimap`, writing one gain per
/// bus channel. Gains past the bus width are zeroed.
pub fn compute_pan_gains(ambimap: &[BFChannelConfig], coeffs: &[f32; MAX_AMBI_CHANNELS], ingain: f32, gains: &mut [f32]) {
    for (i, gain) in gains.iter_mut().enumerate() {
        *gain = ambimap
            .get(i)
            .map_or(0.0, |chanmap| chanmap.scale * coeffs[chanmap.index] * ingain);
    }
}

/// Scales an azimuth toward the sides for positions in front.
pub fn scale_azimuth_front(azimuth: f32, scale: f32) -> f32 {
    let half_pi = std::f32::consts::FRAC_PI_2;
    let abs_azi = azimuth.abs();
    if !(abs_azi >= half_pi) {
        return (abs_azi * scale).min(half_pi).copysign(azimuth);
    }
    azimuth
}

/// Wraps radians into [-pi, pi].
pub fn wrap_radians(r: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    if r > PI {
        return (PI + r) % TAU - PI;
    }
    if r < -PI {
        return PI - (PI - r) % TAU;
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32; MAX_AMBI_CHANNELS], b: &[f32; MAX_AMBI_CHANNELS]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn channel_counts() {
        assert_eq!(MAX_AMBI_CHANNELS, 16);
        assert_eq!(MAX_AMBI2D_CHANNELS, 7);
        assert_eq!(ambi_channels_from_order(1), 4);
        assert_eq!(ambi_2d_channels_from_order(2), 5);
    }

    #[test]
    fn front_direction_is_positive_x() {
        let c = calc_direction_coeffs([0.0, 0.0, -1.0], 0.0);
        assert_eq!(c[0], 1.0);
        assert!(c[1].abs() < 1e-6);
        assert!(c[2].abs() < 1e-6);
        assert!((c[3] - 3f32.sqrt()).abs() < 1e-6);

        let a = calc_angle_coeffs(0.0, 0.0, 0.0);
        for i in 0..MAX_AMBI_CHANNELS {
            assert!((a[i] - c[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn azimuth_is_clockwise() {
        // Positive azimuth is to the right, which is negative Y.
        let right = calc_angle_coeffs(std::f32::consts::FRAC_PI_2, 0.0, 0.0);
        assert!(right[1] < -1.7);
    }

    #[test]
    fn energy_matches_order_count() {
        // With N3D each order contributes 2l+1 to the squared norm.
        let c = calc_ambi_coeffs(0.3, -0.5, (1.0f32 - 0.34).sqrt(), 0.0);
        assert!((dot(&c, &c) - 16.0).abs() < 1e-3, "{}", dot(&c, &c));
    }

    #[test]
    fn spread_widens_response() {
        let narrow = calc_angle_coeffs(0.0, 0.0, 0.0);
        let wide = calc_angle_coeffs(0.0, 0.0, std::f32::consts::PI);
        assert!(wide[0] > narrow[0]);
        assert!(wide[3] < narrow[3] * 1.5);
        // Full spread leaves only the omni term.
        let full = calc_angle_coeffs(0.0, 0.0, std::f32::consts::TAU);
        assert!((full[0] - 3f32.sqrt()).abs() < 1e-5);
        assert!(full[3].abs() < 1e-5);
    }

    #[test]
    fn hf_scales_for_upmix() {
        let s = hf_order_scales(1, 3);
        assert!((s[0] - 1.0 / 0.589792205).abs() < 1e-5);
        assert!((s[1] - 1.0 / 0.879693856).abs() < 1e-5);
        assert_eq!(s[2], 0.0);

        let same = hf_order_scales(2, 2);
        for &v in &same[..3] {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn pan_gains_follow_map_and_zero_tail() {
        let coeffs = calc_direction_coeffs([0.0, 0.0, -1.0], 0.0);
        let map = [
            BFChannelConfig::acn(0),
            BFChannelConfig { scale: 0.5, index: 3 },
        ];
        let mut gains = [9.0f32; 4];
        compute_pan_gains(&map, &coeffs, 2.0, &mut gains);
        assert_eq!(gains[0], 2.0);
        assert!((gains[1] - 3f32.sqrt()).abs() < 1e-6);
        assert_eq!(gains[2], 0.0);
        assert_eq!(gains[3], 0.0);
    }

    #[test]
    fn default_orientation_rotation_is_identity() {
        let at = [0.0, 0.0, -1.0];
        let up = [0.0, 1.0, 0.0];
        let right = [1.0, 0.0, 0.0];
        let m = rotation_matrix(at, up, right, 3);
        for i in 0..MAX_AMBI_CHANNELS {
            for j in 0..MAX_AMBI_CHANNELS {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((m[i][j] - expected).abs() < 1e-5, "m[{}][{}] = {}", i, j, m[i][j]);
            }
        }
    }

    #[test]
    fn azimuth_helpers() {
        use std::f32::consts::PI;
        assert!((scale_azimuth_front(0.5, 1.5) - 0.75).abs() < 1e-6);
        assert!((scale_azimuth_front(-1.2, 1.5) + PI / 2.0).abs() < 1e-6);
        assert_eq!(scale_azimuth_front(2.0, 1.5), 2.0);
        assert!((wrap_radians(PI + 0.5) - (-PI + 0.5)).abs() < 1e-5);
        assert!((wrap_radians(-PI - 0.5) - (PI - 0.5)).abs() < 1e-5);
    }
}
