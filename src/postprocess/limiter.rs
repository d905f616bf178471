//! Feed-forward compressor / limiter for the real output bus.
//!
//! Works in the log domain with optional automation of knee width,
//! attack/release times, make-up gain and clipping reduction, following
//! Giannoulis, Massberg and Reiss, "Parameter automation in a dynamic range
//! compressor" (2013).

use std::f32::consts::LN_10;

use crate::audio::{lerpf, FloatBufferLine, BUFFER_LINE_SIZE};

use super::delay_samples;

/// Construction parameters, in seconds and decibels.
#[derive(Clone, Copy, Debug)]
pub struct CompressorParams {
    pub auto_knee: bool,
    pub auto_attack: bool,
    pub auto_release: bool,
    pub auto_post_gain: bool,
    pub auto_declip: bool,
    pub look_ahead_time: f32,
    pub hold_time: f32,
    pub pre_gain_db: f32,
    pub post_gain_db: f32,
    pub threshold_db: f32,
    pub ratio: f32,
    pub knee_db: f32,
    pub attack_time: f32,
    pub release_time: f32,
}

impl CompressorParams {
    /// The device output limiter settings.
    pub fn limiter(threshold_db: f32) -> Self {
        Self {
            auto_knee: true,
            auto_attack: true,
            auto_release: true,
            auto_post_gain: true,
            auto_declip: true,
            look_ahead_time: 0.001,
            hold_time: 0.002,
            pre_gain_db: 0.0,
            post_gain_db: 0.0,
            threshold_db,
            ratio: f32::INFINITY,
            knee_db: 0.0,
            attack_time: 0.02,
            release_time: 0.2,
        }
    }
}

/// Sliding window maximum with an instant attack, a fixed hold and an
/// instant release to the next highest held level (descending maxima).
struct SlidingHold {
    values: Box<[f32; BUFFER_LINE_SIZE]>,
    expiries: Box<[u32; BUFFER_LINE_SIZE]>,
    lower: usize,
    upper: usize,
    length: u32,
}

impl SlidingHold {
    const MASK: usize = BUFFER_LINE_SIZE - 1;

    fn new(length: u32) -> Self {
        let mut values = Box::new([0.0; BUFFER_LINE_SIZE]);
        let mut expiries = Box::new([0; BUFFER_LINE_SIZE]);
        values[0] = f32::NEG_INFINITY;
        expiries[0] = length;
        Self {
            values,
            expiries,
            lower: 0,
            upper: 0,
            length,
        }
    }

    fn update(&mut self, i: u32, input: f32) -> f32 {
        let mut lower = self.lower;
        let mut upper = self.upper;

        if i >= self.expiries[upper] {
            upper = (upper + 1) & Self::MASK;
        }

        if input >= self.values[upper] {
            self.values[upper] = input;
            self.expiries[upper] = i + self.length;
            lower = upper;
        } else {
            while input >= self.values[lower] {
                lower = if lower == 0 { Self::MASK } else { lower - 1 };
            }
            lower = (lower + 1) & Self::MASK;
            self.values[lower] = input;
            self.expiries[lower] = i + self.length;
        }

        self.lower = lower;
        self.upper = upper;
        self.values[upper]
    }

    /// Rebases the live expiries after a block of `n` samples.
    fn shift(&mut self, n: u32) {
        let mut i = self.upper;
        loop {
            self.expiries[i] = self.expiries[i].saturating_sub(n);
            if i == self.lower {
                break;
            }
            i = (i + 1) & Self::MASK;
        }
    }
}

pub struct Compressor {
    num_chans: usize,
    auto_knee: bool,
    auto_attack: bool,
    auto_release: bool,
    auto_post_gain: bool,
    auto_declip: bool,

    look_ahead: usize,

    pre_gain: f32,
    post_gain: f32,

    threshold: f32,
    slope: f32,
    knee: f32,

    attack: f32,
    release: f32,

    side_chain: Vec<f32>,
    crest_factor: Vec<f32>,

    hold: Option<SlidingHold>,
    delay: Vec<Vec<f32>>,

    crest_coeff: f32,
    gain_estimate: f32,
    adapt_coeff: f32,

    last_peak_sq: f32,
    last_rms_sq: f32,
    last_release: f32,
    last_attack: f32,
    last_gain_dev: f32,
}

impl Compressor {
    pub fn new(num_chans: usize, sample_rate: f32, params: &CompressorParams) -> Self {
        let max_samples = (BUFFER_LINE_SIZE - 1) as f32;
        let look_ahead = (params.look_ahead_time * sample_rate)
            .round()
            .clamp(0.0, max_samples) as usize;
        let hold = (params.hold_time * sample_rate)
            .round()
            .clamp(0.0, max_samples) as u32;

        // A one-sample hold would only hand back its input.
        let hold = (look_ahead > 0 && hold > 1).then(|| SlidingHold::new(hold));
        let delay = if look_ahead > 0 {
            vec![vec![0.0; look_ahead]; num_chans]
        } else {
            Vec::new()
        };

        let threshold = params.threshold_db * LN_10 / 20.0;
        // Knee automation runs the compressor as a limiter.
        let slope = if params.auto_knee {
            -1.0
        } else {
            1.0 / params.ratio.max(1.0) - 1.0
        };

        Self {
            num_chans,
            auto_knee: params.auto_knee,
            auto_attack: params.auto_attack,
            auto_release: params.auto_release,
            auto_post_gain: params.auto_post_gain,
            auto_declip: params.auto_post_gain && params.auto_declip,
            look_ahead,
            pre_gain: 10.0f32.powf(params.pre_gain_db / 20.0),
            post_gain: params.post_gain_db * LN_10 / 20.0,
            threshold,
            slope,
            knee: (params.knee_db * LN_10 / 20.0).max(0.0),
            attack: (params.attack_time * sample_rate).max(1.0),
            release: (params.release_time * sample_rate).max(1.0),
            side_chain: vec![0.0; BUFFER_LINE_SIZE * 2],
            crest_factor: vec![0.0; BUFFER_LINE_SIZE],
            hold,
            delay,
            crest_coeff: (-1.0 / (0.200 * sample_rate)).exp(),
            gain_estimate: threshold * -0.5 * slope,
            adapt_coeff: (-1.0 / (2.0 * sample_rate)).exp(),
            last_peak_sq: 0.0,
            last_rms_sq: 0.0,
            last_release: 0.0,
            last_attack: 0.0,
            last_gain_dev: 0.0,
        }
    }

    /// Builds the output limiter for a device bus.
    pub fn device_limiter(num_chans: usize, sample_rate: u32, threshold_db: f32) -> Self {
        Self::new(
            num_chans,
            sample_rate as f32,
            &CompressorParams::limiter(threshold_db),
        )
    }

    /// Latency added to the output, in samples.
    pub fn look_ahead(&self) -> usize {
        self.look_ahead
    }

    pub fn process(&mut self, buffers: &mut [FloatBufferLine], samples_to_do: usize) {
        let n = samples_to_do;
        if n == 0 {
            return;
        }
        let num_chans = self.num_chans.min(buffers.len());
        let buffers = &mut buffers[..num_chans];

        if self.pre_gain != 1.0 {
            let gain = self.pre_gain;
            for line in buffers.iter_mut() {
                line[..n].iter_mut().for_each(|s| *s *= gain);
            }
        }

        self.link_channels(buffers, n);
        if self.auto_attack || self.auto_release {
            self.crest_detector(n);
        }
        if self.hold.is_some() {
            self.peak_hold_detector(n);
        } else {
            self.peak_detector(n);
        }
        self.gain_compressor(n);

        if !self.delay.is_empty() {
            for (line, delay) in buffers.iter_mut().zip(self.delay.iter_mut()) {
                delay_samples(&mut line[..n], delay);
            }
        }

        for line in buffers.iter_mut() {
            for (s, g) in line[..n].iter_mut().zip(&self.side_chain[..n]) {
                *s *= g;
            }
        }

        let la = self.look_ahead;
        self.side_chain.copy_within(n..n + la, 0);
    }

    /// Multichannel compression is linked through the absolute maximum of
    /// all channels.
    fn link_channels(&mut self, buffers: &[FloatBufferLine], n: usize) {
        let side = &mut self.side_chain[self.look_ahead..self.look_ahead + n];
        side.fill(0.0);
        for line in buffers {
            for (s, x) in side.iter_mut().zip(&line[..n]) {
                *s = s.max(x.abs());
            }
        }
    }

    /// Squared crest factor of the control signal, from squared peak and
    /// RMS detectors with 200ms release.
    fn crest_detector(&mut self, n: usize) {
        let a_crest = self.crest_coeff;
        let mut y2_peak = self.last_peak_sq;
        let mut y2_rms = self.last_rms_sq;

        let side = &self.side_chain[self.look_ahead..self.look_ahead + n];
        for (crest, &x_abs) in self.crest_factor.iter_mut().zip(side) {
            let x2 = (x_abs * x_abs).clamp(0.000001, 1000000.0);
            y2_peak = x2.max(lerpf(x2, y2_peak, a_crest));
            y2_rms = lerpf(x2, y2_rms, a_crest);
            *crest = y2_peak / y2_rms;
        }

        self.last_peak_sq = y2_peak;
        self.last_rms_sq = y2_rms;
    }

    fn peak_detector(&mut self, n: usize) {
        let side = &mut self.side_chain[self.look_ahead..self.look_ahead + n];
        for s in side.iter_mut() {
            *s = s.max(0.000001).ln();
        }
    }

    fn peak_hold_detector(&mut self, n: usize) {
        let Some(hold) = self.hold.as_mut() else {
            return;
        };
        let side = &mut self.side_chain[self.look_ahead..self.look_ahead + n];
        for (i, s) in side.iter_mut().enumerate() {
            let x_g = s.max(0.000001).ln();
            *s = hold.update(i as u32, x_g);
        }
        hold.shift(n as u32);
    }

    /// The gain computer and ballistics. Leaves linear gains in
    /// `side_chain[..n]`.
    fn gain_compressor(&mut self, n: usize) {
        let la = self.look_ahead;
        let threshold = self.threshold;
        let slope = self.slope;
        let attack = self.attack;
        let release = self.release;
        let c_est = self.gain_estimate;
        let a_adp = self.adapt_coeff;

        let mut post_gain = self.post_gain;
        let mut knee = self.knee;
        let mut t_att = attack;
        let mut t_rel = release - attack;
        let mut a_att = (-1.0 / t_att).exp();
        let mut a_rel = (-1.0 / t_rel).exp();
        let mut y_1 = self.last_release;
        let mut y_l = self.last_attack;
        let mut c_dev = self.last_gain_dev;

        for i in 0..n {
            if self.auto_knee {
                knee = (2.5 * (c_dev + c_est)).max(0.0);
            }
            let knee_h = 0.5 * knee;

            // Static compression curve.
            let x_over = self.side_chain[i + la] - threshold;
            let y_g = if x_over <= -knee_h {
                0.0
            } else if x_over.abs() < knee_h {
                (x_over + knee_h) * (x_over + knee_h) / (2.0 * knee)
            } else {
                x_over
            };

            let y2_crest = self.crest_factor[i];
            if self.auto_attack {
                t_att = 2.0 * attack / y2_crest;
                a_att = (-1.0 / t_att).exp();
            }
            if self.auto_release {
                t_rel = 2.0 * release / y2_crest - t_att;
                a_rel = (-1.0 / t_rel).exp();
            }

            // Smooth decoupled peak detector; attack is taken out of the
            // release for the chained mode.
            let x_l = -slope * y_g;
            y_1 = x_l.max(lerpf(x_l, y_1, a_rel));
            y_l = lerpf(y_1, y_l, a_att);

            c_dev = lerpf(-(y_l + c_est), c_dev, a_adp);
            if self.auto_post_gain {
                if self.auto_declip {
                    c_dev = c_dev.max(self.side_chain[i] - y_l - threshold - c_est);
                }
                post_gain = -(c_dev + c_est);
            }

            self.side_chain[i] = (post_gain - y_l).exp();
        }

        self.last_release = y_1;
        self.last_attack = y_l;
        self.last_gain_dev = c_dev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::new_lines;

    #[test]
    fn look_ahead_is_clamped() {
        let mut params = CompressorParams::limiter(0.0);
        params.look_ahead_time = 10.0;
        let comp = Compressor::new(2, 48000.0, &params);
        assert_eq!(comp.look_ahead(), BUFFER_LINE_SIZE - 1);

        let comp = Compressor::device_limiter(2, 48000, 0.0);
        assert_eq!(comp.look_ahead(), 48);
    }

    #[test]
    fn sliding_hold_keeps_peak_for_hold_length() {
        let mut hold = SlidingHold::new(4);
        let input = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.0];
        let out: Vec<f32> = input
            .iter()
            .enumerate()
            .map(|(i, &x)| hold.update(i as u32, x))
            .collect();
        assert_eq!(&out[..4], &[1.0, 1.0, 1.0, 1.0]);
        assert!(out[5] < 1.0);
        assert_eq!(out[6], 0.5);
    }

    #[test]
    fn limiter_keeps_loud_signal_under_threshold() {
        let mut comp = Compressor::device_limiter(1, 48000, 0.0);
        let mut peak = 0.0f32;
        for block in 0..40 {
            let mut lines = new_lines(1);
            for (i, s) in lines[0][..512].iter_mut().enumerate() {
                let t = (block * 512 + i) as f32;
                *s = 4.0 * (t * 0.05).sin();
            }
            comp.process(&mut lines, 512);
            if block >= 20 {
                peak = lines[0][..512].iter().fold(peak, |m, s| m.max(s.abs()));
            }
        }
        assert!(peak <= 1.05, "peak {}", peak);
        assert!(peak > 0.5, "peak {}", peak);
    }

    #[test]
    fn lines_past_the_limited_channels_are_untouched() {
        let mut comp = Compressor::device_limiter(1, 48000, 0.0);
        let mut lines = new_lines(2);
        lines[0][..256].fill(3.0);
        lines[1][..256].fill(3.0);
        comp.process(&mut lines, 256);
        assert!(lines[1][..256].iter().all(|&s| s == 3.0));
        assert!(lines[0][..256].iter().all(|s| s.is_finite()));
    }

    #[test]
    fn quiet_signal_passes_delayed() {
        let mut comp = Compressor::device_limiter(1, 48000, 0.0);
        let la = comp.look_ahead();
        let mut lines = new_lines(1);
        lines[0][10] = 0.01;
        comp.process(&mut lines, 256);
        let v = lines[0][10 + la];
        assert!(v > 0.009 && v < 0.0101, "got {}", v);
    }
}
