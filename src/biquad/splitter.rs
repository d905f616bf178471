use std::f32::consts::TAU;

/// Linkwitz-Riley style band splitter. The two outputs are phase-matched so
/// `hp + lp` is an all-pass of the input.
#[derive(Clone, Copy, Debug, Default)]
pub struct BandSplitter {
    coeff: f32,
    lp_z1: f32,
    lp_z2: f32,
    ap_z1: f32,
}

impl BandSplitter {
    pub fn new(f0norm: f32) -> Self {
        let mut splitter = Self::default();
        splitter.init(f0norm);
        splitter
    }

    /// Sets the crossover from a normalized frequency and clears the history.
    pub fn init(&mut self, f0norm: f32) {
        let w = f0norm * TAU;
        let cw = w.cos();
        self.coeff = if cw > f32::EPSILON {
            (w.sin() - 1.0) / cw
        } else {
            cw * -0.5
        };
        self.clear();
    }

    pub fn clear(&mut self) {
        self.lp_z1 = 0.0;
        self.lp_z2 = 0.0;
        self.ap_z1 = 0.0;
    }

    /// Splits one sample into `(hp, lp)`.
    #[inline(always)]
    fn split(&mut self, input: f32) -> (f32, f32) {
        let ap_coeff = self.coeff;
        let lp_coeff = self.coeff * 0.5 + 0.5;

        let mut d = (input - self.lp_z1) * lp_coeff;
        let mut lp_y = self.lp_z1 + d;
        self.lp_z1 = lp_y + d;

        d = (lp_y - self.lp_z2) * lp_coeff;
        lp_y = self.lp_z2 + d;
        self.lp_z2 = lp_y + d;

        let ap_y = input * ap_coeff + self.ap_z1;
        self.ap_z1 = input - ap_y * ap_coeff;

        (ap_y - lp_y, lp_y)
    }

    /// Splits `input` into separate high- and low-frequency outputs.
    pub fn process(&mut self, input: &[f32], hpout: &mut [f32], lpout: &mut [f32]) {
        for ((&x, hp), lp) in input.iter().zip(hpout.iter_mut()).zip(lpout.iter_mut()) {
            let (h, l) = self.split(x);
            *hp = h;
            *lp = l;
        }
    }

    /// In-place variant that scales the high band by `hfscale`.
    pub fn process_hf_scale(&mut self, samples: &mut [f32], hfscale: f32) {
        for s in samples.iter_mut() {
            let (hp, lp) = self.split(*s);
            *s = hp * hfscale + lp;
        }
    }

    /// In-place variant that scales each band independently.
    pub fn process_scale(&mut self, samples: &mut [f32], hfscale: f32, lfscale: f32) {
        for s in samples.iter_mut() {
            let (hp, lp) = self.split(*s);
            *s = hp * hfscale + lp * lfscale;
        }
    }

    /// Applies only the all-pass portion of the splitter, keeping its history.
    pub fn process_all_pass(&mut self, samples: &mut [f32]) {
        let coeff = self.coeff;
        let mut z1 = self.ap_z1;
        for s in samples.iter_mut() {
            let input = *s;
            let out = input * coeff + z1;
            z1 = input - out * coeff;
            *s = out;
        }
        self.ap_z1 = z1;
    }

    /// Applies the all-pass portion in reverse order, from a cleared history.
    /// Together with a forward pass this cancels the splitter's phase shift.
    pub fn apply_allpass_rev(&self, samples: &mut [f32]) {
        let coeff = self.coeff;
        let mut z1 = 0.0f32;
        for s in samples.iter_mut().rev() {
            let input = *s;
            let out = input * coeff + z1;
            z1 = input - out * coeff;
            *s = out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_sum_to_allpass() {
        let f0 = 400.0 / 48000.0;
        let mut splitter = BandSplitter::new(f0);
        let mut allpass = BandSplitter::new(f0);

        let input: Vec<f32> = (0..512)
            .map(|i| (i as f32 * 0.05).sin() + 0.3 * (i as f32 * 0.9).sin())
            .collect();
        let mut hp = vec![0.0; 512];
        let mut lp = vec![0.0; 512];
        splitter.process(&input, &mut hp, &mut lp);

        let mut reference = input.clone();
        allpass.process_all_pass(&mut reference);
        for i in 0..512 {
            assert!(
                (hp[i] + lp[i] - reference[i]).abs() < 1e-5,
                "sample {} differs: {} vs {}",
                i,
                hp[i] + lp[i],
                reference[i]
            );
        }
    }

    #[test]
    fn unit_hf_scale_is_allpass() {
        let f0 = 700.0 / 44100.0;
        let mut a = BandSplitter::new(f0);
        let mut b = BandSplitter::new(f0);
        let mut x: Vec<f32> = (0..128).map(|i| if i == 0 { 1.0 } else { 0.0 }).collect();
        let mut y = x.clone();
        a.process_hf_scale(&mut x, 1.0);
        b.process_all_pass(&mut y);
        for (p, q) in x.iter().zip(&y) {
            assert!((p - q).abs() < 1e-6);
        }
    }

    #[test]
    fn low_band_passes_dc() {
        let mut splitter = BandSplitter::new(0.01);
        let input = vec![1.0f32; 4096];
        let mut hp = vec![0.0; 4096];
        let mut lp = vec![0.0; 4096];
        splitter.process(&input, &mut hp, &mut lp);
        assert!((lp[4095] - 1.0).abs() < 1e-3);
        assert!(hp[4095].abs() < 1e-3);
    }
}
