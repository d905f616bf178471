//! Rotation matrices for higher-order B-Format.
//!
//! First order is a plain 3x3 rotation. Each higher band is generated from the
//! band below it using the recursion of Ivanic and Ruedenberg, with the
//! constant `u`, `v`, `w` terms precomputed.

use once_cell::sync::Lazy;

use super::MAX_AMBI_CHANNELS;

pub type AmbiMatrix = [[f32; MAX_AMBI_CHANNELS]; MAX_AMBI_CHANNELS];

#[derive(Clone, Copy, Debug, Default)]
struct RotatorCoeffs {
    u: f32,
    v: f32,
    w: f32,
}

fn gen_coeffs(l: i32, out: &mut Vec<RotatorCoeffs>) {
    for m in -l..=l {
        for n in -l..=l {
            let d = if m == 0 { 1.0f32 } else { 0.0 };
            let denom = if n.abs() == l {
                ((2 * l) * (2 * l - 1)) as f32
            } else {
                (l * l - n * n) as f32
            };
            let abs_m = m.abs();
            out.push(RotatorCoeffs {
                u: ((l * l - m * m) as f32 / denom).sqrt(),
                v: ((l + abs_m - 1) as f32 * (l + abs_m) as f32 / denom).sqrt()
                    * (1.0 + d)
                    * (1.0 - 2.0 * d)
                    * 0.5,
                w: ((l - abs_m - 1) as f32 * (l - abs_m) as f32 / denom).sqrt() * (1.0 - d) * -0.5,
            });
        }
    }
}

/// Second-order terms followed by third-order terms.
static ROTATOR_COEFFS: Lazy<Vec<RotatorCoeffs>> = Lazy::new(|| {
    let mut coeffs = Vec::with_capacity(25 + 49);
    gen_coeffs(2, &mut coeffs);
    gen_coeffs(3, &mut coeffs);
    coeffs
});

fn p(i: i32, l: i32, a: i32, n: i32, last_band: usize, r: &AmbiMatrix) -> f32 {
    let row = &r[(i + 2) as usize];
    let ri1 = row[3];
    let rim1 = row[1];
    let ri0 = row[2];

    let vec = &r[(a + l - 1) as usize + last_band][last_band..];
    if n == -l {
        return ri1 * vec[0] + rim1 * vec[(l - 1) as usize * 2];
    }
    if n == l {
        return ri1 * vec[(l - 1) as usize * 2] - rim1 * vec[0];
    }
    ri0 * vec[(n + l - 1) as usize]
}

fn u(l: i32, m: i32, n: i32, last_band: usize, r: &AmbiMatrix) -> f32 {
    p(0, l, m, n, last_band, r)
}

fn v(l: i32, m: i32, n: i32, last_band: usize, r: &AmbiMatrix) -> f32 {
    if m > 0 {
        let p0 = p(1, l, m - 1, n, last_band, r);
        if m == 1 {
            return p0 * std::f32::consts::SQRT_2;
        }
        let p1 = p(-1, l, -m + 1, n, last_band, r);
        return p0 - p1;
    }
    let p1 = p(-1, l, -m - 1, n, last_band, r);
    if m == -1 {
        return p1 * std::f32::consts::SQRT_2;
    }
    let p0 = p(1, l, m + 1, n, last_band, r);
    p0 + p1
}

fn w(l: i32, m: i32, n: i32, last_band: usize, r: &AmbiMatrix) -> f32 {
    if m > 0 {
        let p0 = p(1, l, m + 1, n, last_band, r);
        let p1 = p(-1, l, -m - 1, n, last_band, r);
        return p0 + p1;
    }
    let p0 = p(1, l, m - 1, n, last_band, r);
    let p1 = p(-1, l, -m + 1, n, last_band, r);
    p0 - p1
}

/// Fills in the bands above first order, up to and including `order`. The
/// matrix must already hold the zeroth- and first-order rotation, in ACN
/// layout.
pub fn ambi_rotator(matrix: &mut AmbiMatrix, order: usize) {
    if order < 2 {
        return;
    }

    let mut coeffs = ROTATOR_COEFFS.iter();
    let mut band_idx = 4usize;
    let mut last_band = 1usize;
    for l in 2..=order as i32 {
        let mut y = band_idx;
        for m in -l..=l {
            let mut x = band_idx;
            for n in -l..=l {
                let c = coeffs.next().copied().unwrap_or_default();
                let mut r = 0.0f32;
                if c.u != 0.0 {
                    r += c.u * u(l, m, n, last_band, matrix);
                }
                if c.v != 0.0 {
                    r += c.v * v(l, m, n, last_band, matrix);
                }
                if c.w != 0.0 {
                    r += c.w * w(l, m, n, last_band, matrix);
                }
                matrix[y][x] = r;
                x += 1;
            }
            y += 1;
        }
        last_band = band_idx;
        band_idx += l as usize * 2 + 1;
    }
}

/// Builds a full rotation from a source's `at` (`n`), `up` (`v`) and right
/// (`u`) vectors, all in listener space.
pub fn rotation_matrix(n: [f32; 3], v: [f32; 3], u: [f32; 3], order: usize) -> AmbiMatrix {
    let mut m = [[0.0f32; MAX_AMBI_CHANNELS]; MAX_AMBI_CHANNELS];
    m[0][0] = 1.0;
    m[1][1] = u[0];
    m[1][2] = -v[0];
    m[1][3] = -n[0];
    m[2][1] = -u[1];
    m[2][2] = v[1];
    m[2][3] = n[1];
    m[3][1] = u[2];
    m[3][2] = -v[2];
    m[3][3] = -n[2];
    ambi_rotator(&mut m, order);
    m
}

/// Identity matrix up to third order.
pub fn identity() -> AmbiMatrix {
    let mut m = [[0.0f32; MAX_AMBI_CHANNELS]; MAX_AMBI_CHANNELS];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    m
}
