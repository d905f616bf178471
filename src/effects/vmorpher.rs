//! Vocal morpher: two banks of four formant filters, one per phoneme, with
//! an LFO blending between them.

use std::f32::consts::{PI, TAU};

use crate::ambisonic::{compute_pan_gains, MAX_AMBI_CHANNELS};
use crate::audio::{lerpf, Buffer, FloatBufferLine, MAX_OUTPUT_CHANNELS};
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;

use super::{
    set_ambi_pan_identity, EffectProcessor, EffectProps, EffectTarget, OutTarget, Phoneme,
    SlotParams, VMorpherWaveform, VmorpherProps, MAX_UPDATE_SAMPLES,
};

const NUM_FORMANTS: usize = 4;
const NUM_FILTERS: usize = 2;
const Q_FACTOR: f32 = 5.0;

const VOWEL_A_INDEX: usize = 0;
const VOWEL_B_INDEX: usize = 1;

const WAVEFORM_FRACBITS: u32 = 24;
const WAVEFORM_FRACONE: u32 = 1 << WAVEFORM_FRACBITS;
const WAVEFORM_FRACMASK: u32 = WAVEFORM_FRACONE - 1;

fn sin_wave(index: u32) -> f32 {
    (index as f32 * (TAU / WAVEFORM_FRACONE as f32)).sin() * 0.5 + 0.5
}

fn saw_wave(index: u32) -> f32 {
    index as f32 / WAVEFORM_FRACONE as f32
}

fn triangle_wave(index: u32) -> f32 {
    (index as f32 * (2.0 / WAVEFORM_FRACONE as f32) - 1.0).abs()
}

fn half_wave(_index: u32) -> f32 {
    0.5
}

/// Band-pass state variable filter (topology-preserving transform).
#[derive(Clone, Copy, Debug)]
struct FormantFilter {
    coeff: f32,
    gain: f32,
    s1: f32,
    s2: f32,
}

impl Default for FormantFilter {
    fn default() -> Self {
        Self {
            coeff: 0.0,
            gain: 1.0,
            s1: 0.0,
            s2: 0.0,
        }
    }
}

impl FormantFilter {
    fn new(f0norm: f32, gain: f32) -> Self {
        Self {
            coeff: (PI * f0norm).tan(),
            gain,
            ..Self::default()
        }
    }

    /// Adds the filtered input, scaled by the formant gain, into `output`.
    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let g = self.coeff;
        let gain = self.gain;
        let h = 1.0 / (1.0 + (g / Q_FACTOR) + (g * g));
        let mut s1 = self.s1;
        let mut s2 = self.s2;

        for (out, &x) in output.iter_mut().zip(input) {
            let hp = (x - (1.0 / Q_FACTOR + g) * s1 - s2) * h;
            let bp = g * hp + s1;
            let lp = g * bp + s2;

            s1 = g * hp + bp;
            s2 = g * bp + lp;

            *out += bp * gain;
        }
        self.s1 = s1;
        self.s2 = s2;
    }

    fn clear(&mut self) {
        self.s1 = 0.0;
        self.s2 = 0.0;
    }
}

/// Formant filters for the vowels; other phonemes have no formants and
/// produce silence.
fn filters_by_phoneme(phoneme: Phoneme, frequency: f32, pitch: f32) -> [FormantFilter; NUM_FORMANTS] {
    let table: [(f32, f32); NUM_FORMANTS] = match phoneme {
        Phoneme::A => [(800.0, 1.0), (1150.0, 0.501187), (2900.0, 0.025118), (3900.0, 0.100000)],
        Phoneme::E => [(350.0, 1.0), (2000.0, 0.100000), (2800.0, 0.177827), (3600.0, 0.009999)],
        Phoneme::I => [(270.0, 1.0), (2140.0, 0.251188), (2950.0, 0.050118), (3900.0, 0.050118)],
        Phoneme::O => [(450.0, 1.0), (800.0, 0.281838), (2830.0, 0.079432), (3800.0, 0.079432)],
        Phoneme::U => [(325.0, 1.0), (700.0, 0.158489), (2700.0, 0.017782), (3800.0, 0.009999)],
        _ => return [FormantFilter::default(); NUM_FORMANTS],
    };
    table.map(|(hz, gain)| FormantFilter::new(hz * pitch / frequency, gain))
}

#[derive(Clone, Copy)]
struct Channel {
    formants: [[FormantFilter; NUM_FORMANTS]; NUM_FILTERS],
    current_gains: [f32; MAX_OUTPUT_CHANNELS],
    target_gains: [f32; MAX_OUTPUT_CHANNELS],
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            formants: [[FormantFilter::default(); NUM_FORMANTS]; NUM_FILTERS],
            current_gains: [0.0; MAX_OUTPUT_CHANNELS],
            target_gains: [0.0; MAX_OUTPUT_CHANNELS],
        }
    }
}

pub struct VmorpherState {
    chans: [Channel; MAX_AMBI_CHANNELS],
    num_chans: usize,

    get_samples: fn(u32) -> f32,
    index: u32,
    step: u32,

    sample_buffer_a: [f32; MAX_UPDATE_SAMPLES],
    sample_buffer_b: [f32; MAX_UPDATE_SAMPLES],
    lfo: [f32; MAX_UPDATE_SAMPLES],
}

impl VmorpherState {
    pub fn new() -> Self {
        Self {
            chans: [Channel::default(); MAX_AMBI_CHANNELS],
            num_chans: 0,
            get_samples: half_wave,
            index: 0,
            step: 1,
            sample_buffer_a: [0.0; MAX_UPDATE_SAMPLES],
            sample_buffer_b: [0.0; MAX_UPDATE_SAMPLES],
            lfo: [0.0; MAX_UPDATE_SAMPLES],
        }
    }

    fn oscillate(&mut self, todo: usize) {
        let mut index = self.index;
        for dst in self.lfo[..todo].iter_mut() {
            index = index.wrapping_add(self.step) & WAVEFORM_FRACMASK;
            *dst = (self.get_samples)(index);
        }
    }
}

impl Default for VmorpherState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for VmorpherState {
    fn device_update(&mut self, _device: &DeviceInfo, _buffer: Option<&Buffer>) -> Result<()> {
        for chan in self.chans.iter_mut() {
            for bank in chan.formants.iter_mut() {
                bank.iter_mut().for_each(FormantFilter::clear);
            }
            chan.current_gains.fill(0.0);
        }
        Ok(())
    }

    fn update(
        &mut self,
        device: &DeviceInfo,
        slot: &SlotParams,
        props: &EffectProps,
        target: EffectTarget<'_>,
    ) -> OutTarget {
        let props = match props {
            EffectProps::VocalMorpher(p) => *p,
            _ => VmorpherProps::default(),
        };
        let frequency = device.frequency as f32;
        let step = props.rate / frequency;
        self.step = (step * WAVEFORM_FRACONE as f32).clamp(0.0, (WAVEFORM_FRACONE - 1) as f32) as u32;

        self.get_samples = if self.step == 0 {
            half_wave
        } else {
            match props.waveform {
                VMorpherWaveform::Sinusoid => sin_wave,
                VMorpherWaveform::Triangle => triangle_wave,
                VMorpherWaveform::Sawtooth => saw_wave,
            }
        };

        let pitch_a = 2.0f32.powf(props.phoneme_a_coarse_tuning as f32 / 12.0);
        let pitch_b = 2.0f32.powf(props.phoneme_b_coarse_tuning as f32 / 12.0);
        let vowel_a = filters_by_phoneme(props.phoneme_a, frequency, pitch_a);
        let vowel_b = filters_by_phoneme(props.phoneme_b, frequency, pitch_b);

        // Only coefficients change; filter histories carry over.
        self.num_chans = slot.wet_channels.min(MAX_AMBI_CHANNELS);
        for chan in self.chans[..self.num_chans].iter_mut() {
            for (bank, vowel) in chan.formants.iter_mut().zip([&vowel_a, &vowel_b]) {
                for (f, src) in bank.iter_mut().zip(vowel.iter()) {
                    f.coeff = src.coeff;
                    f.gain = src.gain;
                }
            }
        }

        let chans = &mut self.chans;
        set_ambi_pan_identity(self.num_chans, |i, coeffs| {
            compute_pan_gains(&target.main.ambi_map, coeffs, slot.gain, &mut chans[i].target_gains);
        });
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let mut base = 0;
        while base < samples_to_do {
            let td = MAX_UPDATE_SAMPLES.min(samples_to_do - base);

            self.oscillate(td);
            self.index = self.index.wrapping_add(self.step.wrapping_mul(td as u32)) & WAVEFORM_FRACMASK;

            for (chan, insamples) in self.chans[..self.num_chans].iter_mut().zip(input.iter()) {
                let insamples = &insamples[base..base + td];

                let buf_a = &mut self.sample_buffer_a[..td];
                buf_a.fill(0.0);
                for f in chan.formants[VOWEL_A_INDEX].iter_mut() {
                    f.process(insamples, buf_a);
                }

                let buf_b = &mut self.sample_buffer_b[..td];
                buf_b.fill(0.0);
                for f in chan.formants[VOWEL_B_INDEX].iter_mut() {
                    f.process(insamples, buf_b);
                }

                let mut blended = [0.0f32; MAX_UPDATE_SAMPLES];
                for i in 0..td {
                    blended[i] = lerpf(buf_a[i], buf_b[i], self.lfo[i]);
                }

                mix(
                    &blended[..td],
                    output,
                    &mut chan.current_gains,
                    &chan.target_gains,
                    samples_to_do - base,
                    base,
                );
            }
            base += td;
        }
    }
}
