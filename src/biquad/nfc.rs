//! Near-field control filters.
//!
//! Each filter pairs a bass-boost for a simulated source distance (`w0`) with
//! a bass-cut for the speaker distance (`w1`). Both are expressed as
//! `1 / (reference_delay * sample_rate)`, where the reference delay is the
//! distance divided by the speed of sound. `w1` must be positive; `w0 == 0`
//! applies compensation only.

const B: [[f32; 4]; 5] = [
    [0.0, 0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0, 0.0],
    [3.0, 3.0, 0.0, 0.0],
    [3.6778, 6.4595, 2.3222, 0.0],
    [4.2076, 11.4877, 5.7924, 9.1401],
];

#[derive(Clone, Copy, Debug, Default)]
struct NfcFilter1 {
    base_gain: f32,
    gain: f32,
    b1: f32,
    a1: f32,
    z: [f32; 1],
}

#[derive(Clone, Copy, Debug, Default)]
struct NfcFilter2 {
    base_gain: f32,
    gain: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z: [f32; 2],
}

#[derive(Clone, Copy, Debug, Default)]
struct NfcFilter3 {
    base_gain: f32,
    gain: f32,
    b1: f32,
    b2: f32,
    b3: f32,
    a1: f32,
    a2: f32,
    a3: f32,
    z: [f32; 3],
}

#[derive(Clone, Copy, Debug, Default)]
struct NfcFilter4 {
    base_gain: f32,
    gain: f32,
    b1: f32,
    b2: f32,
    b3: f32,
    b4: f32,
    a1: f32,
    a2: f32,
    a3: f32,
    a4: f32,
    z: [f32; 4],
}

/// First-order section terms `(b_00, g_0)` for distance term `r`.
fn first_order(row: usize, col: usize, r: f32) -> (f32, f32) {
    let b_00 = B[row][col] * r;
    (b_00, 1.0 + b_00)
}

/// Second-order section terms `(b_10, b_11, g_1)` for distance term `r`.
fn second_order(row: usize, col: usize, r: f32) -> (f32, f32, f32) {
    let b_10 = B[row][col] * r;
    let b_11 = B[row][col + 1] * r * r;
    (b_10, b_11, 1.0 + b_10 + b_11)
}

impl NfcFilter1 {
    fn create(w0: f32, w1: f32) -> Self {
        let mut nfc = Self::default();
        let (b_00, g_0) = first_order(1, 0, 0.5 * w1);
        nfc.base_gain = 1.0 / g_0;
        nfc.a1 = 2.0 * b_00 / g_0;
        nfc.adjust(w0);
        nfc
    }

    fn adjust(&mut self, w0: f32) {
        let (b_00, g_0) = first_order(1, 0, 0.5 * w0);
        self.gain = self.base_gain * g_0;
        self.b1 = 2.0 * b_00 / g_0;
    }
}

impl NfcFilter2 {
    fn create(w0: f32, w1: f32) -> Self {
        let mut nfc = Self::default();
        let (b_10, b_11, g_1) = second_order(2, 0, 0.5 * w1);
        nfc.base_gain = 1.0 / g_1;
        nfc.a1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        nfc.a2 = 4.0 * b_11 / g_1;
        nfc.adjust(w0);
        nfc
    }

    fn adjust(&mut self, w0: f32) {
        let (b_10, b_11, g_1) = second_order(2, 0, 0.5 * w0);
        self.gain = self.base_gain * g_1;
        self.b1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        self.b2 = 4.0 * b_11 / g_1;
    }
}

impl NfcFilter3 {
    fn create(w0: f32, w1: f32) -> Self {
        let mut nfc = Self::default();
        let r = 0.5 * w1;
        let (b_10, b_11, g_1) = second_order(3, 0, r);
        let (b_00, g_0) = first_order(3, 2, r);
        nfc.base_gain = 1.0 / (g_1 * g_0);
        nfc.a1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        nfc.a2 = 4.0 * b_11 / g_1;
        nfc.a3 = 2.0 * b_00 / g_0;
        nfc.adjust(w0);
        nfc
    }

    fn adjust(&mut self, w0: f32) {
        let r = 0.5 * w0;
        let (b_10, b_11, g_1) = second_order(3, 0, r);
        let (b_00, g_0) = first_order(3, 2, r);
        self.gain = self.base_gain * (g_1 * g_0);
        self.b1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        self.b2 = 4.0 * b_11 / g_1;
        self.b3 = 2.0 * b_00 / g_0;
    }
}

impl NfcFilter4 {
    fn create(w0: f32, w1: f32) -> Self {
        let mut nfc = Self::default();
        let r = 0.5 * w1;
        let (b_10, b_11, g_1) = second_order(4, 0, r);
        let (b_00, b_01, g_0) = second_order(4, 2, r);
        nfc.base_gain = 1.0 / (g_1 * g_0);
        nfc.a1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        nfc.a2 = 4.0 * b_11 / g_1;
        nfc.a3 = (2.0 * b_00 + 4.0 * b_01) / g_0;
        nfc.a4 = 4.0 * b_01 / g_0;
        nfc.adjust(w0);
        nfc
    }

    fn adjust(&mut self, w0: f32) {
        let r = 0.5 * w0;
        let (b_10, b_11, g_1) = second_order(4, 0, r);
        let (b_00, b_01, g_0) = second_order(4, 2, r);
        self.gain = self.base_gain * (g_1 * g_0);
        self.b1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        self.b2 = 4.0 * b_11 / g_1;
        self.b3 = (2.0 * b_00 + 4.0 * b_01) / g_0;
        self.b4 = 4.0 * b_01 / g_0;
    }
}

/// Bank of NFC filters for ambisonic orders 1 through 4. `process_n` is
/// applied to every channel of order `n`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NfcFilter {
    first: NfcFilter1,
    second: NfcFilter2,
    third: NfcFilter3,
    fourth: NfcFilter4,
}

impl NfcFilter {
    /// Sets up compensation for speaker control term `w1` with no boost, and
    /// clears the history.
    pub fn init(&mut self, w1: f32) {
        self.first = NfcFilter1::create(0.0, w1);
        self.second = NfcFilter2::create(0.0, w1);
        self.third = NfcFilter3::create(0.0, w1);
        self.fourth = NfcFilter4::create(0.0, w1);
    }

    /// Changes the source distance term `w0`, keeping the history.
    pub fn adjust(&mut self, w0: f32) {
        self.first.adjust(w0);
        self.second.adjust(w0);
        self.third.adjust(w0);
        self.fourth.adjust(w0);
    }

    pub fn process1(&mut self, src: &[f32], dst: &mut [f32]) {
        let f = &mut self.first;
        let (gain, b1, a1) = (f.gain, f.b1, f.a1);
        let mut z1 = f.z[0];
        for (out, &input) in dst.iter_mut().zip(src) {
            let y = input * gain - a1 * z1;
            *out = y + b1 * z1;
            z1 += y;
        }
        f.z[0] = z1;
    }

    pub fn process2(&mut self, src: &[f32], dst: &mut [f32]) {
        let f = &mut self.second;
        let (gain, b1, b2, a1, a2) = (f.gain, f.b1, f.b2, f.a1, f.a2);
        let [mut z1, mut z2] = f.z;
        for (out, &input) in dst.iter_mut().zip(src) {
            let y = input * gain - a1 * z1 - a2 * z2;
            *out = y + b1 * z1 + b2 * z2;
            z2 += z1;
            z1 += y;
        }
        f.z = [z1, z2];
    }

    pub fn process3(&mut self, src: &[f32], dst: &mut [f32]) {
        let f = &mut self.third;
        let (gain, b1, b2, b3, a1, a2, a3) = (f.gain, f.b1, f.b2, f.b3, f.a1, f.a2, f.a3);
        let [mut z1, mut z2, mut z3] = f.z;
        for (out, &input) in dst.iter_mut().zip(src) {
            let mut y = input * gain - a1 * z1 - a2 * z2;
            let mut o = y + b1 * z1 + b2 * z2;
            z2 += z1;
            z1 += y;

            y = o - a3 * z3;
            o = y + b3 * z3;
            z3 += y;
            *out = o;
        }
        f.z = [z1, z2, z3];
    }

    pub fn process4(&mut self, src: &[f32], dst: &mut [f32]) {
        let f = &mut self.fourth;
        let (gain, b1, b2, b3, b4) = (f.gain, f.b1, f.b2, f.b3, f.b4);
        let (a1, a2, a3, a4) = (f.a1, f.a2, f.a3, f.a4);
        let [mut z1, mut z2, mut z3, mut z4] = f.z;
        for (out, &input) in dst.iter_mut().zip(src) {
            let mut y = input * gain - a1 * z1 - a2 * z2;
            let mut o = y + b1 * z1 + b2 * z2;
            z2 += z1;
            z1 += y;

            y = o - a3 * z3 - a4 * z4;
            o = y + b3 * z3 + b4 * z4;
            z4 += z3;
            z3 += y;
            *out = o;
        }
        f.z = [z1, z2, z3, z4];
    }

    /// Dispatches to the filter for ambisonic `order` (1 to 4).
    pub fn process_order(&mut self, order: usize, src: &[f32], dst: &mut [f32]) {
        match order {
            1 => self.process1(src, dst),
            2 => self.process2(src, dst),
            3 => self.process3(src, dst),
            4 => self.process4(src, dst),
            _ => dst.copy_from_slice(src),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse_response_sum(order: usize, w0: f32, w1: f32) -> f32 {
        let mut nfc = NfcFilter::default();
        nfc.init(w1);
        nfc.adjust(w0);
        let mut src = vec![0.0f32; 32768];
        src[0] = 1.0;
        let mut dst = vec![0.0f32; 32768];
        nfc.process_order(order, &src, &mut dst);
        dst.iter().sum()
    }

    #[test]
    fn matching_distances_are_transparent() {
        let w = 343.3 / (1.5 * 48000.0);
        for order in 1..=4 {
            let mut nfc = NfcFilter::default();
            nfc.init(w);
            nfc.adjust(w);
            let src: Vec<f32> = (0..64).map(|i| (i as f32 * 0.3).sin()).collect();
            let mut dst = vec![0.0; 64];
            nfc.process_order(order, &src, &mut dst);
            for (a, b) in src.iter().zip(&dst) {
                assert!((a - b).abs() < 1e-4, "order {} not transparent", order);
            }
        }
    }

    #[test]
    fn compensation_only_removes_dc() {
        let w1 = 343.3 / (2.0 * 44100.0);
        for order in 1..=4 {
            let dc = impulse_response_sum(order, 0.0, w1);
            assert!(dc.abs() < 1e-3, "order {} DC gain {}", order, dc);
        }
    }
}
