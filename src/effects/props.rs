//! Effect parameter sets with their defaults and legal ranges.
//!
//! Every struct deserializes with defaults for missing fields, so a scene
//! file only lists the parameters it changes. `clamped` pulls each field
//! into its legal range; the slot setters apply it before publishing.

use serde::{Deserialize, Serialize};

use crate::error::{MixerError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectType {
    Null,
    Reverb,
    EaxReverb,
    Chorus,
    Flanger,
    Echo,
    Distortion,
    Equalizer,
    Autowah,
    Compressor,
    RingModulator,
    FrequencyShifter,
    PitchShifter,
    VocalMorpher,
    Convolution,
    DedicatedDialog,
    DedicatedLfe,
}

impl EffectType {
    pub fn is_reverb(self) -> bool {
        matches!(self, EffectType::Reverb | EffectType::EaxReverb)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverbProps {
    pub density: f32,
    pub diffusion: f32,
    pub gain: f32,
    pub gain_hf: f32,
    pub gain_lf: f32,
    pub decay_time: f32,
    pub decay_hf_ratio: f32,
    pub decay_lf_ratio: f32,
    pub reflections_gain: f32,
    pub reflections_delay: f32,
    pub reflections_pan: [f32; 3],
    pub late_reverb_gain: f32,
    pub late_reverb_delay: f32,
    pub late_reverb_pan: [f32; 3],
    pub echo_time: f32,
    pub echo_depth: f32,
    pub modulation_time: f32,
    pub modulation_depth: f32,
    pub air_absorption_gain_hf: f32,
    pub hf_reference: f32,
    pub lf_reference: f32,
    pub room_rolloff_factor: f32,
    pub decay_hf_limit: bool,
}

impl Default for ReverbProps {
    fn default() -> Self {
        Self {
            density: 1.0,
            diffusion: 1.0,
            gain: 0.32,
            gain_hf: 0.89,
            gain_lf: 1.0,
            decay_time: 1.49,
            decay_hf_ratio: 0.83,
            decay_lf_ratio: 1.0,
            reflections_gain: 0.05,
            reflections_delay: 0.007,
            reflections_pan: [0.0; 3],
            late_reverb_gain: 1.26,
            late_reverb_delay: 0.011,
            late_reverb_pan: [0.0; 3],
            echo_time: 0.25,
            echo_depth: 0.0,
            modulation_time: 0.25,
            modulation_depth: 0.0,
            air_absorption_gain_hf: 0.994,
            hf_reference: 5000.0,
            lf_reference: 250.0,
            room_rolloff_factor: 0.0,
            decay_hf_limit: true,
        }
    }
}

pub const REVERB_MAX_REFLECTIONS_DELAY: f32 = 0.3;
pub const REVERB_MAX_LATE_REVERB_DELAY: f32 = 0.1;

impl ReverbProps {
    pub fn clamped(mut self) -> Self {
        self.density = self.density.clamp(0.0, 1.0);
        self.diffusion = self.diffusion.clamp(0.0, 1.0);
        self.gain = self.gain.clamp(0.0, 1.0);
        self.gain_hf = self.gain_hf.clamp(0.0, 1.0);
        self.gain_lf = self.gain_lf.clamp(0.0, 1.0);
        self.decay_time = self.decay_time.clamp(0.1, 20.0);
        self.decay_hf_ratio = self.decay_hf_ratio.clamp(0.1, 2.0);
        self.decay_lf_ratio = self.decay_lf_ratio.clamp(0.1, 2.0);
        self.reflections_gain = self.reflections_gain.clamp(0.0, 3.16);
        self.reflections_delay = self.reflections_delay.clamp(0.0, REVERB_MAX_REFLECTIONS_DELAY);
        self.late_reverb_gain = self.late_reverb_gain.clamp(0.0, 10.0);
        self.late_reverb_delay = self.late_reverb_delay.clamp(0.0, REVERB_MAX_LATE_REVERB_DELAY);
        for v in self.reflections_pan.iter_mut().chain(self.late_reverb_pan.iter_mut()) {
            *v = sanitize(*v, 0.0);
        }
        self.echo_time = self.echo_time.clamp(0.075, 0.25);
        self.echo_depth = self.echo_depth.clamp(0.0, 1.0);
        self.modulation_time = self.modulation_time.clamp(0.04, 4.0);
        self.modulation_depth = self.modulation_depth.clamp(0.0, 1.0);
        self.air_absorption_gain_hf = self.air_absorption_gain_hf.clamp(0.892, 1.0);
        self.hf_reference = self.hf_reference.clamp(1000.0, 20000.0);
        self.lf_reference = self.lf_reference.clamp(20.0, 1000.0);
        self.room_rolloff_factor = self.room_rolloff_factor.clamp(0.0, 10.0);
        self
    }

    /// Standard (non-EAX) reverb ignores the extended parameters.
    pub fn standard(mut self) -> Self {
        let defaults = Self::default();
        self.gain_lf = defaults.gain_lf;
        self.decay_lf_ratio = defaults.decay_lf_ratio;
        self.reflections_pan = defaults.reflections_pan;
        self.late_reverb_pan = defaults.late_reverb_pan;
        self.echo_time = defaults.echo_time;
        self.echo_depth = defaults.echo_depth;
        self.modulation_time = defaults.modulation_time;
        self.modulation_depth = defaults.modulation_depth;
        self.hf_reference = defaults.hf_reference;
        self.lf_reference = defaults.lf_reference;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChorusWaveform {
    Sinusoid,
    Triangle,
}

pub const CHORUS_MAX_DELAY: f32 = 0.016;
pub const FLANGER_MAX_DELAY: f32 = 0.004;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusProps {
    pub waveform: ChorusWaveform,
    /// Degrees, -180 to 180.
    pub phase: i32,
    pub rate: f32,
    pub depth: f32,
    pub feedback: f32,
    pub delay: f32,
}

impl Default for ChorusProps {
    fn default() -> Self {
        Self {
            waveform: ChorusWaveform::Triangle,
            phase: 90,
            rate: 1.1,
            depth: 0.1,
            feedback: 0.25,
            delay: 0.016,
        }
    }
}

impl ChorusProps {
    pub fn clamped(mut self) -> Self {
        self.phase = self.phase.clamp(-180, 180);
        self.rate = self.rate.clamp(0.0, 10.0);
        self.depth = self.depth.clamp(0.0, 1.0);
        self.feedback = self.feedback.clamp(-1.0, 1.0);
        self.delay = self.delay.clamp(0.0, CHORUS_MAX_DELAY);
        self
    }
}

/// Same controls as the chorus over a much shorter delay range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlangerProps {
    pub waveform: ChorusWaveform,
    pub phase: i32,
    pub rate: f32,
    pub depth: f32,
    pub feedback: f32,
    pub delay: f32,
}

impl Default for FlangerProps {
    fn default() -> Self {
        Self {
            waveform: ChorusWaveform::Triangle,
            phase: 0,
            rate: 0.27,
            depth: 1.0,
            feedback: -0.5,
            delay: 0.002,
        }
    }
}

impl FlangerProps {
    pub fn clamped(mut self) -> Self {
        self.phase = self.phase.clamp(-180, 180);
        self.rate = self.rate.clamp(0.0, 10.0);
        self.depth = self.depth.clamp(0.0, 1.0);
        self.feedback = self.feedback.clamp(-1.0, 1.0);
        self.delay = self.delay.clamp(0.0, FLANGER_MAX_DELAY);
        self
    }

    pub(crate) fn as_chorus(&self) -> ChorusProps {
        ChorusProps {
            waveform: self.waveform,
            phase: self.phase,
            rate: self.rate,
            depth: self.depth,
            feedback: self.feedback,
            delay: self.delay,
        }
    }
}

pub const ECHO_MAX_DELAY: f32 = 0.207;
pub const ECHO_MAX_LR_DELAY: f32 = 0.404;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoProps {
    pub delay: f32,
    pub lr_delay: f32,
    pub damping: f32,
    pub feedback: f32,
    pub spread: f32,
}

impl Default for EchoProps {
    fn default() -> Self {
        Self {
            delay: 0.1,
            lr_delay: 0.1,
            damping: 0.5,
            feedback: 0.5,
            spread: -1.0,
        }
    }
}

impl EchoProps {
    pub fn clamped(mut self) -> Self {
        self.delay = self.delay.clamp(0.0, ECHO_MAX_DELAY);
        self.lr_delay = self.lr_delay.clamp(0.0, ECHO_MAX_LR_DELAY);
        self.damping = self.damping.clamp(0.0, 0.99);
        self.feedback = self.feedback.clamp(0.0, 1.0);
        self.spread = self.spread.clamp(-1.0, 1.0);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistortionProps {
    pub edge: f32,
    pub gain: f32,
    pub lowpass_cutoff: f32,
    pub eq_center: f32,
    pub eq_bandwidth: f32,
}

impl Default for DistortionProps {
    fn default() -> Self {
        Self {
            edge: 0.2,
            gain: 0.05,
            lowpass_cutoff: 8000.0,
            eq_center: 3600.0,
            eq_bandwidth: 3600.0,
        }
    }
}

impl DistortionProps {
    pub fn clamped(mut self) -> Self {
        self.edge = self.edge.clamp(0.0, 1.0);
        self.gain = self.gain.clamp(0.01, 1.0);
        self.lowpass_cutoff = self.lowpass_cutoff.clamp(80.0, 24000.0);
        self.eq_center = self.eq_center.clamp(80.0, 24000.0);
        self.eq_bandwidth = self.eq_bandwidth.clamp(80.0, 24000.0);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizerProps {
    pub low_cutoff: f32,
    pub low_gain: f32,
    pub mid1_center: f32,
    pub mid1_gain: f32,
    pub mid1_width: f32,
    pub mid2_center: f32,
    pub mid2_gain: f32,
    pub mid2_width: f32,
    pub high_cutoff: f32,
    pub high_gain: f32,
}

impl Default for EqualizerProps {
    fn default() -> Self {
        Self {
            low_cutoff: 200.0,
            low_gain: 1.0,
            mid1_center: 500.0,
            mid1_gain: 1.0,
            mid1_width: 1.0,
            mid2_center: 3000.0,
            mid2_gain: 1.0,
            mid2_width: 1.0,
            high_cutoff: 6000.0,
            high_gain: 1.0,
        }
    }
}

impl EqualizerProps {
    pub fn clamped(mut self) -> Self {
        const GAIN: (f32, f32) = (0.126, 7.943);
        self.low_cutoff = self.low_cutoff.clamp(50.0, 800.0);
        self.low_gain = self.low_gain.clamp(GAIN.0, GAIN.1);
        self.mid1_center = self.mid1_center.clamp(200.0, 3000.0);
        self.mid1_gain = self.mid1_gain.clamp(GAIN.0, GAIN.1);
        self.mid1_width = self.mid1_width.clamp(0.01, 1.0);
        self.mid2_center = self.mid2_center.clamp(1000.0, 8000.0);
        self.mid2_gain = self.mid2_gain.clamp(GAIN.0, GAIN.1);
        self.mid2_width = self.mid2_width.clamp(0.01, 1.0);
        self.high_cutoff = self.high_cutoff.clamp(4000.0, 16000.0);
        self.high_gain = self.high_gain.clamp(GAIN.0, GAIN.1);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutowahProps {
    pub attack_time: f32,
    pub release_time: f32,
    pub resonance: f32,
    pub peak_gain: f32,
}

impl Default for AutowahProps {
    fn default() -> Self {
        Self {
            attack_time: 0.06,
            release_time: 0.06,
            resonance: 1000.0,
            peak_gain: 11.22,
        }
    }
}

impl AutowahProps {
    pub fn clamped(mut self) -> Self {
        self.attack_time = self.attack_time.clamp(0.0001, 1.0);
        self.release_time = self.release_time.clamp(0.0001, 1.0);
        self.resonance = self.resonance.clamp(2.0, 1000.0);
        self.peak_gain = self.peak_gain.clamp(0.00003, 31621.0);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorProps {
    pub on: bool,
}

impl Default for CompressorProps {
    fn default() -> Self {
        Self { on: true }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulatorWaveform {
    Sinusoid,
    Sawtooth,
    Square,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulatorProps {
    pub frequency: f32,
    pub high_pass_cutoff: f32,
    pub waveform: ModulatorWaveform,
}

impl Default for ModulatorProps {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            high_pass_cutoff: 800.0,
            waveform: ModulatorWaveform::Sinusoid,
        }
    }
}

impl ModulatorProps {
    pub fn clamped(mut self) -> Self {
        self.frequency = self.frequency.clamp(0.0, 8000.0);
        self.high_pass_cutoff = self.high_pass_cutoff.clamp(0.0, 24000.0);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FShifterDirection {
    Down,
    Up,
    Off,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FshifterProps {
    pub frequency: f32,
    pub left_direction: FShifterDirection,
    pub right_direction: FShifterDirection,
}

impl Default for FshifterProps {
    fn default() -> Self {
        Self {
            frequency: 0.0,
            left_direction: FShifterDirection::Down,
            right_direction: FShifterDirection::Down,
        }
    }
}

impl FshifterProps {
    pub fn clamped(mut self) -> Self {
        self.frequency = self.frequency.clamp(0.0, 24000.0);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PshifterProps {
    /// Semitones.
    pub coarse_tune: i32,
    /// Cents.
    pub fine_tune: i32,
}

impl Default for PshifterProps {
    fn default() -> Self {
        Self {
            coarse_tune: 12,
            fine_tune: 0,
        }
    }
}

impl PshifterProps {
    pub fn clamped(mut self) -> Self {
        self.coarse_tune = self.coarse_tune.clamp(-12, 12);
        self.fine_tune = self.fine_tune.clamp(-50, 50);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phoneme {
    A,
    E,
    I,
    O,
    U,
    Aa,
    Ae,
    Ah,
    Ao,
    Eh,
    Er,
    Ih,
    Iy,
    Uh,
    Uw,
    B,
    D,
    F,
    G,
    J,
    K,
    L,
    M,
    N,
    P,
    R,
    S,
    T,
    V,
    Z,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VMorpherWaveform {
    Sinusoid,
    Triangle,
    Sawtooth,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmorpherProps {
    pub phoneme_a: Phoneme,
    pub phoneme_a_coarse_tuning: i32,
    pub phoneme_b: Phoneme,
    pub phoneme_b_coarse_tuning: i32,
    pub waveform: VMorpherWaveform,
    pub rate: f32,
}

impl Default for VmorpherProps {
    fn default() -> Self {
        Self {
            phoneme_a: Phoneme::A,
            phoneme_a_coarse_tuning: 0,
            phoneme_b: Phoneme::Er,
            phoneme_b_coarse_tuning: 0,
            waveform: VMorpherWaveform::Sinusoid,
            rate: 1.41,
        }
    }
}

impl VmorpherProps {
    pub fn clamped(mut self) -> Self {
        self.phoneme_a_coarse_tuning = self.phoneme_a_coarse_tuning.clamp(-24, 24);
        self.phoneme_b_coarse_tuning = self.phoneme_b_coarse_tuning.clamp(-24, 24);
        self.rate = self.rate.clamp(0.0, 10.0);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedicatedProps {
    pub gain: f32,
}

impl Default for DedicatedProps {
    fn default() -> Self {
        Self { gain: 1.0 }
    }
}

impl DedicatedProps {
    pub fn clamped(mut self) -> Self {
        self.gain = sanitize(self.gain, 1.0).max(0.0);
        self
    }
}

/// Parameters for one effect, tagged by type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectProps {
    Null,
    Reverb(ReverbProps),
    EaxReverb(ReverbProps),
    Chorus(ChorusProps),
    Flanger(FlangerProps),
    Echo(EchoProps),
    Distortion(DistortionProps),
    Equalizer(EqualizerProps),
    Autowah(AutowahProps),
    Compressor(CompressorProps),
    RingModulator(ModulatorProps),
    FrequencyShifter(FshifterProps),
    PitchShifter(PshifterProps),
    VocalMorpher(VmorpherProps),
    /// Convolution takes its impulse response from the slot's buffer.
    Convolution,
    DedicatedDialog(DedicatedProps),
    DedicatedLfe(DedicatedProps),
}

impl Default for EffectProps {
    fn default() -> Self {
        EffectProps::Null
    }
}

impl EffectProps {
    pub fn default_for(kind: EffectType) -> Self {
        match kind {
            EffectType::Null => EffectProps::Null,
            EffectType::Reverb => EffectProps::Reverb(ReverbProps::default()),
            EffectType::EaxReverb => EffectProps::EaxReverb(ReverbProps::default()),
            EffectType::Chorus => EffectProps::Chorus(ChorusProps::default()),
            EffectType::Flanger => EffectProps::Flanger(FlangerProps::default()),
            EffectType::Echo => EffectProps::Echo(EchoProps::default()),
            EffectType::Distortion => EffectProps::Distortion(DistortionProps::default()),
            EffectType::Equalizer => EffectProps::Equalizer(EqualizerProps::default()),
            EffectType::Autowah => EffectProps::Autowah(AutowahProps::default()),
            EffectType::Compressor => EffectProps::Compressor(CompressorProps::default()),
            EffectType::RingModulator => EffectProps::RingModulator(ModulatorProps::default()),
            EffectType::FrequencyShifter => EffectProps::FrequencyShifter(FshifterProps::default()),
            EffectType::PitchShifter => EffectProps::PitchShifter(PshifterProps::default()),
            EffectType::VocalMorpher => EffectProps::VocalMorpher(VmorpherProps::default()),
            EffectType::Convolution => EffectProps::Convolution,
            EffectType::DedicatedDialog => EffectProps::DedicatedDialog(DedicatedProps::default()),
            EffectType::DedicatedLfe => EffectProps::DedicatedLfe(DedicatedProps::default()),
        }
    }

    pub fn effect_type(&self) -> EffectType {
        match self {
            EffectProps::Null => EffectType::Null,
            EffectProps::Reverb(_) => EffectType::Reverb,
            EffectProps::EaxReverb(_) => EffectType::EaxReverb,
            EffectProps::Chorus(_) => EffectType::Chorus,
            EffectProps::Flanger(_) => EffectType::Flanger,
            EffectProps::Echo(_) => EffectType::Echo,
            EffectProps::Distortion(_) => EffectType::Distortion,
            EffectProps::Equalizer(_) => EffectType::Equalizer,
            EffectProps::Autowah(_) => EffectType::Autowah,
            EffectProps::Compressor(_) => EffectType::Compressor,
            EffectProps::RingModulator(_) => EffectType::RingModulator,
            EffectProps::FrequencyShifter(_) => EffectType::FrequencyShifter,
            EffectProps::PitchShifter(_) => EffectType::PitchShifter,
            EffectProps::VocalMorpher(_) => EffectType::VocalMorpher,
            EffectProps::Convolution => EffectType::Convolution,
            EffectProps::DedicatedDialog(_) => EffectType::DedicatedDialog,
            EffectProps::DedicatedLfe(_) => EffectType::DedicatedLfe,
        }
    }

    pub fn clamped(self) -> Self {
        match self {
            EffectProps::Reverb(p) => EffectProps::Reverb(p.clamped().standard()),
            EffectProps::EaxReverb(p) => EffectProps::EaxReverb(p.clamped()),
            EffectProps::Chorus(p) => EffectProps::Chorus(p.clamped()),
            EffectProps::Flanger(p) => EffectProps::Flanger(p.clamped()),
            EffectProps::Echo(p) => EffectProps::Echo(p.clamped()),
            EffectProps::Distortion(p) => EffectProps::Distortion(p.clamped()),
            EffectProps::Equalizer(p) => EffectProps::Equalizer(p.clamped()),
            EffectProps::Autowah(p) => EffectProps::Autowah(p.clamped()),
            EffectProps::RingModulator(p) => EffectProps::RingModulator(p.clamped()),
            EffectProps::FrequencyShifter(p) => EffectProps::FrequencyShifter(p.clamped()),
            EffectProps::PitchShifter(p) => EffectProps::PitchShifter(p.clamped()),
            EffectProps::VocalMorpher(p) => EffectProps::VocalMorpher(p.clamped()),
            EffectProps::DedicatedDialog(p) => EffectProps::DedicatedDialog(p.clamped()),
            EffectProps::DedicatedLfe(p) => EffectProps::DedicatedLfe(p.clamped()),
            other => other,
        }
    }

    /// Reverb parameters, if this is either reverb variant.
    pub fn reverb(&self) -> Option<&ReverbProps> {
        match self {
            EffectProps::Reverb(p) | EffectProps::EaxReverb(p) => Some(p),
            _ => None,
        }
    }

    /// Rejects non-finite values, which clamping cannot repair.
    pub fn validate(&self) -> Result<()> {
        let finite = match self {
            EffectProps::Reverb(p) | EffectProps::EaxReverb(p) => [
                p.density,
                p.diffusion,
                p.gain,
                p.gain_hf,
                p.gain_lf,
                p.decay_time,
                p.decay_hf_ratio,
                p.decay_lf_ratio,
                p.reflections_gain,
                p.reflections_delay,
                p.late_reverb_gain,
                p.late_reverb_delay,
                p.echo_time,
                p.echo_depth,
                p.modulation_time,
                p.modulation_depth,
                p.air_absorption_gain_hf,
                p.hf_reference,
                p.lf_reference,
                p.room_rolloff_factor,
            ]
            .iter()
            .all(|v| v.is_finite()),
            EffectProps::Chorus(p) => [p.rate, p.depth, p.feedback, p.delay].iter().all(|v| v.is_finite()),
            EffectProps::Flanger(p) => [p.rate, p.depth, p.feedback, p.delay].iter().all(|v| v.is_finite()),
            EffectProps::Echo(p) => [p.delay, p.lr_delay, p.damping, p.feedback, p.spread]
                .iter()
                .all(|v| v.is_finite()),
            EffectProps::Distortion(p) => [p.edge, p.gain, p.lowpass_cutoff, p.eq_center, p.eq_bandwidth]
                .iter()
                .all(|v| v.is_finite()),
            EffectProps::Equalizer(p) => [
                p.low_cutoff,
                p.low_gain,
                p.mid1_center,
                p.mid1_gain,
                p.mid1_width,
                p.mid2_center,
                p.mid2_gain,
                p.mid2_width,
                p.high_cutoff,
                p.high_gain,
            ]
            .iter()
            .all(|v| v.is_finite()),
            EffectProps::Autowah(p) => [p.attack_time, p.release_time, p.resonance, p.peak_gain]
                .iter()
                .all(|v| v.is_finite()),
            EffectProps::RingModulator(p) => p.frequency.is_finite() && p.high_pass_cutoff.is_finite(),
            EffectProps::FrequencyShifter(p) => p.frequency.is_finite(),
            EffectProps::VocalMorpher(p) => p.rate.is_finite(),
            EffectProps::DedicatedDialog(p) | EffectProps::DedicatedLfe(p) => p.gain.is_finite(),
            EffectProps::Null
            | EffectProps::Compressor(_)
            | EffectProps::PitchShifter(_)
            | EffectProps::Convolution => true,
        };
        if finite {
            Ok(())
        } else {
            Err(MixerError::InvalidValue(format!(
                "non-finite {:?} parameter",
                self.effect_type()
            )))
        }
    }
}

fn sanitize(v: f32, fallback: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_values_are_clamped() {
        let props = EffectProps::Echo(EchoProps {
            delay: 1.0,
            lr_delay: -1.0,
            damping: 2.0,
            feedback: 0.3,
            spread: 5.0,
        })
        .clamped();
        match props {
            EffectProps::Echo(p) => {
                assert_eq!(p.delay, ECHO_MAX_DELAY);
                assert_eq!(p.lr_delay, 0.0);
                assert_eq!(p.damping, 0.99);
                assert_eq!(p.feedback, 0.3);
                assert_eq!(p.spread, 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn standard_reverb_drops_extended_fields() {
        let props = EffectProps::Reverb(ReverbProps {
            modulation_depth: 0.8,
            echo_depth: 0.5,
            ..ReverbProps::default()
        })
        .clamped();
        let reverb = props.reverb().unwrap();
        assert_eq!(reverb.modulation_depth, 0.0);
        assert_eq!(reverb.echo_depth, 0.0);
    }

    #[test]
    fn props_parse_with_defaults() {
        let props: EffectProps =
            serde_json::from_str(r#"{ "type": "chorus", "rate": 2.0 }"#).unwrap();
        match props {
            EffectProps::Chorus(p) => {
                assert_eq!(p.rate, 2.0);
                assert_eq!(p.delay, 0.016);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            EffectProps::default_for(EffectType::Flanger).effect_type(),
            EffectType::Flanger
        );
    }

    #[test]
    fn nan_is_rejected() {
        let props = EffectProps::Echo(EchoProps {
            delay: f32::NAN,
            ..EchoProps::default()
        });
        assert!(props.validate().is_err());
    }
}
