//! Bauer stereophonic-to-binaural crossfeed.
//!
//! Each channel is split into a low-passed copy, fed into the opposite
//! channel, and a high-boosted direct copy. Levels 1 to 3 are the classic
//! presets; 4 to 6 are the same cut frequencies with lower feed levels.

/// (low cut Hz, high boost Hz, low gain, high gain) per level.
const LEVELS: [(f64, f64, f64, f64); 6] = [
    (360.0, 501.0, 0.398107170553497, 0.205671765275719),
    (500.0, 711.0, 0.459726988530872, 0.228208484414988),
    (700.0, 1021.0, 0.530884444230988, 0.250105790667544),
    (360.0, 494.0, 0.316227766016838, 0.168236228897329),
    (500.0, 689.0, 0.354813389233575, 0.187169483835901),
    (700.0, 975.0, 0.398107170553497, 0.205671765275719),
];

pub const MIN_LEVEL: u8 = 1;
pub const MAX_LEVEL: u8 = 6;

#[derive(Clone, Copy, Default)]
struct ChannelState {
    lo: f32,
    hi: f32,
}

pub struct Bs2b {
    level: u8,
    sample_rate: u32,
    a0_lo: f32,
    b1_lo: f32,
    a0_hi: f32,
    a1_hi: f32,
    b1_hi: f32,
    history: [ChannelState; 2],
}

impl Bs2b {
    /// `level` is clamped to 1..=6.
    pub fn new(level: u8, sample_rate: u32) -> Self {
        let mut bs2b = Self {
            level: 0,
            sample_rate,
            a0_lo: 0.0,
            b1_lo: 0.0,
            a0_hi: 0.0,
            a1_hi: 0.0,
            b1_hi: 0.0,
            history: [ChannelState::default(); 2],
        };
        bs2b.set_params(level, sample_rate);
        bs2b
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_params(&mut self, level: u8, sample_rate: u32) {
        let level = level.clamp(MIN_LEVEL, MAX_LEVEL);
        let (fc_lo, fc_hi, g_lo, g_hi) = LEVELS[usize::from(level - 1)];
        let srate = f64::from(sample_rate.max(1));
        let g = 1.0 / (1.0 - g_hi + g_lo);

        let x = (-std::f64::consts::TAU * fc_lo / srate).exp();
        self.b1_lo = x as f32;
        self.a0_lo = (g_lo * (1.0 - x) * g) as f32;

        let x = (-std::f64::consts::TAU * fc_hi / srate).exp();
        self.b1_hi = x as f32;
        self.a0_hi = ((1.0 - g_hi * (1.0 - x)) * g) as f32;
        self.a1_hi = (-x * g) as f32;

        self.level = level;
        self.sample_rate = sample_rate;
        self.clear();
    }

    pub fn clear(&mut self) {
        self.history = [ChannelState::default(); 2];
    }

    /// Applies the crossfeed in place.
    pub fn cross_feed(&mut self, left: &mut [f32], right: &mut [f32]) {
        let Self {
            a0_lo,
            b1_lo,
            a0_hi,
            a1_hi,
            b1_hi,
            ..
        } = *self;
        let [lstate, rstate] = &mut self.history;
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let lin = *l;
            let rin = *r;

            let llo = a0_lo * lin + lstate.lo;
            lstate.lo = b1_lo * llo;
            let lhi = a0_hi * lin + lstate.hi;
            lstate.hi = a1_hi * lin + b1_hi * lhi;

            let rlo = a0_lo * rin + rstate.lo;
            rstate.lo = b1_lo * rlo;
            let rhi = a0_hi * rin + rstate.hi;
            rstate.hi = a1_hi * rin + b1_hi * rhi;

            *l = lhi + rlo;
            *r = rhi + llo;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dc_reaches_both_channels() {
        let mut bs2b = Bs2b::new(3, 44100);
        let mut left = vec![1.0f32; 8192];
        let mut right = vec![0.0f32; 8192];
        bs2b.cross_feed(&mut left, &mut right);

        // At DC the direct path gives (1 - G_hi)g and the crossfeed G_lo*g.
        let (_, _, g_lo, g_hi) = LEVELS[2];
        let g = 1.0 / (1.0 - g_hi + g_lo);
        let direct = ((1.0 - g_hi) * g) as f32;
        let feed = (g_lo * g) as f32;
        let (l, r) = (left[8191], right[8191]);
        assert!((l - direct).abs() < 1e-3, "left {} vs {}", l, direct);
        assert!((r - feed).abs() < 1e-3, "right {} vs {}", r, feed);
        assert!((l + r - 1.0).abs() < 1e-3);
    }

    #[test]
    fn level_is_clamped() {
        let bs2b = Bs2b::new(9, 48000);
        assert_eq!(bs2b.level(), MAX_LEVEL);
        let bs2b = Bs2b::new(0, 48000);
        assert_eq!(bs2b.level(), MIN_LEVEL);
    }

    #[test]
    fn silence_stays_silent() {
        let mut bs2b = Bs2b::new(1, 48000);
        let mut left = vec![0.0f32; 256];
        let mut right = vec![0.0f32; 256];
        bs2b.cross_feed(&mut left, &mut right);
        assert!(left.iter().chain(&right).all(|&s| s == 0.0));
    }
}
