//! Effect processors run on the wet bus of each effect slot.
//!
//! Every processor implements [`EffectProcessor`]. `device_update` runs on the
//! app thread when a state is created for a slot and may allocate;
//! `update` and `process` run on the mixer and must not.

pub mod autowah;
pub mod chorus;
pub mod compressor;
pub mod convolution;
pub mod dedicated;
pub mod distortion;
pub mod echo;
pub mod equalizer;
pub mod fshifter;
pub mod modulator;
pub mod null;
pub mod presets;
pub mod props;
pub mod pshifter;
pub mod reverb;
pub mod vmorpher;

use crate::ambisonic::MAX_AMBI_CHANNELS;
use crate::audio::{Buffer, FloatBufferLine, MixParams, RealMixParams};
use crate::device::DeviceInfo;
use crate::error::Result;

pub use props::{
    AutowahProps, ChorusProps, ChorusWaveform, CompressorProps, DedicatedProps, DistortionProps,
    EchoProps, EffectProps, EffectType, EqualizerProps, FShifterDirection, FlangerProps,
    FshifterProps, ModulatorProps, ModulatorWaveform, Phoneme, PshifterProps, ReverbProps,
    VMorpherWaveform, VmorpherProps,
};

use autowah::AutowahState;
use chorus::ChorusState;
use compressor::CompressorState;
use convolution::ConvolutionState;
use dedicated::DedicatedState;
use distortion::DistortionState;
use echo::EchoState;
use equalizer::EqualizerState;
use fshifter::FshifterState;
use modulator::ModulatorState;
use null::NullState;
use pshifter::PshifterState;
use reverb::ReverbState;
use vmorpher::VmorpherState;

/// Samples processed per inner step by the block-based effects.
pub const MAX_UPDATE_SAMPLES: usize = 256;

/// Slot values an effect needs when its parameters are applied.
#[derive(Clone, Copy, Debug)]
pub struct SlotParams {
    pub gain: f32,
    /// Number of channels on the slot's wet (input) bus.
    pub wet_channels: usize,
}

/// Where a slot's output lands: the target slot's wet bus or the device dry
/// bus (`main`), and the device speaker bus when the slot is not chained.
#[derive(Clone, Copy)]
pub struct EffectTarget<'a> {
    pub main: &'a MixParams,
    pub real_out: Option<&'a RealMixParams>,
}

/// Which bus an effect decided to write into during `update`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutTarget {
    Main,
    RealOut,
}

pub trait EffectProcessor {
    /// Resets histories and sizes internal buffers for the device format.
    /// `buffer` is the slot's attached buffer (only used by convolution).
    fn device_update(&mut self, device: &DeviceInfo, buffer: Option<&Buffer>) -> Result<()>;

    /// Applies new parameters and installs pan gains toward `target`.
    fn update(
        &mut self,
        device: &DeviceInfo,
        slot: &SlotParams,
        props: &EffectProps,
        target: EffectTarget<'_>,
    ) -> OutTarget;

    /// Reads the wet bus `input` and adds the result into `output`.
    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]);
}

/// A processor for one effect type.
pub enum EffectState {
    Null(NullState),
    Reverb(Box<ReverbState>),
    Chorus(Box<ChorusState>),
    Echo(Box<EchoState>),
    Distortion(Box<DistortionState>),
    Equalizer(Box<EqualizerState>),
    Autowah(Box<AutowahState>),
    Compressor(Box<CompressorState>),
    Modulator(Box<ModulatorState>),
    Fshifter(Box<FshifterState>),
    Pshifter(Box<PshifterState>),
    Vmorpher(Box<VmorpherState>),
    Convolution(Box<ConvolutionState>),
    Dedicated(DedicatedState),
}

impl EffectState {
    pub fn new(kind: EffectType) -> Self {
        match kind {
            EffectType::Null => EffectState::Null(NullState),
            EffectType::Reverb | EffectType::EaxReverb => {
                EffectState::Reverb(Box::new(ReverbState::new()))
            }
            EffectType::Chorus | EffectType::Flanger => {
                EffectState::Chorus(Box::new(ChorusState::new()))
            }
            EffectType::Echo => EffectState::Echo(Box::new(EchoState::new())),
            EffectType::Distortion => EffectState::Distortion(Box::new(DistortionState::new())),
            EffectType::Equalizer => EffectState::Equalizer(Box::new(EqualizerState::new())),
            EffectType::Autowah => EffectState::Autowah(Box::new(AutowahState::new())),
            EffectType::Compressor => EffectState::Compressor(Box::new(CompressorState::new())),
            EffectType::RingModulator => EffectState::Modulator(Box::new(ModulatorState::new())),
            EffectType::FrequencyShifter => EffectState::Fshifter(Box::new(FshifterState::new())),
            EffectType::PitchShifter => EffectState::Pshifter(Box::new(PshifterState::new())),
            EffectType::VocalMorpher => EffectState::Vmorpher(Box::new(VmorpherState::new())),
            EffectType::Convolution => {
                EffectState::Convolution(Box::new(ConvolutionState::new()))
            }
            EffectType::DedicatedDialog | EffectType::DedicatedLfe => {
                EffectState::Dedicated(DedicatedState::new())
            }
        }
    }

    fn processor(&mut self) -> &mut dyn EffectProcessor {
        match self {
            EffectState::Null(s) => s,
            EffectState::Reverb(s) => s.as_mut(),
            EffectState::Chorus(s) => s.as_mut(),
            EffectState::Echo(s) => s.as_mut(),
            EffectState::Distortion(s) => s.as_mut(),
            EffectState::Equalizer(s) => s.as_mut(),
            EffectState::Autowah(s) => s.as_mut(),
            EffectState::Compressor(s) => s.as_mut(),
            EffectState::Modulator(s) => s.as_mut(),
            EffectState::Fshifter(s) => s.as_mut(),
            EffectState::Pshifter(s) => s.as_mut(),
            EffectState::Vmorpher(s) => s.as_mut(),
            EffectState::Convolution(s) => s.as_mut(),
            EffectState::Dedicated(s) => s,
        }
    }
}

impl EffectProcessor for EffectState {
    fn device_update(&mut self, device: &DeviceInfo, buffer: Option<&Buffer>) -> Result<()> {
        self.processor().device_update(device, buffer)
    }

    fn update(
        &mut self,
        device: &DeviceInfo,
        slot: &SlotParams,
        props: &EffectProps,
        target: EffectTarget<'_>,
    ) -> OutTarget {
        self.processor().update(device, slot, props, target)
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        self.processor().process(samples_to_do, input, output)
    }
}

/// Calls `f(i, coeffs)` for each of the first `count` wet channels with a
/// unit coefficient on ACN channel `i`, which pans wet channel `i` straight
/// through to the same component of the target bus.
pub fn set_ambi_pan_identity(count: usize, mut f: impl FnMut(usize, &[f32; MAX_AMBI_CHANNELS])) {
    let mut coeffs = [0.0f32; MAX_AMBI_CHANNELS];
    for i in 0..count.min(MAX_AMBI_CHANNELS) {
        coeffs[i] = 1.0;
        f(i, &coeffs);
        coeffs[i] = 0.0;
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;

    use crate::audio::{new_lines, FloatBufferLine, MixParams};
    use crate::device::DeviceInfo;

    use super::*;

    pub fn device(frequency: u32) -> DeviceInfo {
        DeviceInfo::for_tests(frequency)
    }

    /// Runs `state` with `props` on a first-order wet bus and returns the
    /// four-channel output for `input` fed into channel 0.
    pub fn run_effect(
        state: &mut EffectState,
        props: &EffectProps,
        input: &[f32],
        frequency: u32,
    ) -> Vec<FloatBufferLine> {
        let device = Arc::new(device(frequency));
        state.device_update(&device, None).unwrap();
        let main = MixParams::acn_identity(4);
        let slot = SlotParams {
            gain: 1.0,
            wet_channels: 4,
        };
        state.update(
            &device,
            &slot,
            props,
            EffectTarget {
                main: &main,
                real_out: Some(&device.real_out),
            },
        );
        let mut wet = new_lines(4);
        let mut out = new_lines(4);
        let n = input.len().min(crate::audio::BUFFER_LINE_SIZE);
        wet[0][..n].copy_from_slice(&input[..n]);
        state.process(n, &wet, &mut out);
        out
    }

    pub fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len().max(1) as f32).sqrt()
    }
}
