//! Dithering and conversion of the real output bus into backend buffers.

use dasp_sample::Sample;

use crate::audio::FloatBufferLine;

/// Initial state of the dither noise generator.
pub const DITHER_RNG_SEED: u32 = 22222;

#[inline]
fn dither_rng(seed: &mut u32) -> u32 {
    *seed = seed.wrapping_mul(96314165).wrapping_add(907633515);
    *seed
}

/// Adds triangular-distributed noise at `quant_scale` steps (e.g. 32768 for
/// 16-bit output) and rounds to the nearest step.
pub fn apply_dither(
    samples: &mut [FloatBufferLine],
    seed: &mut u32,
    quant_scale: f32,
    samples_to_do: usize,
) {
    let invscale = 1.0 / quant_scale;
    let mut rng = *seed;
    for line in samples.iter_mut() {
        for s in line[..samples_to_do].iter_mut() {
            let mut val = *s * quant_scale;
            let rng0 = dither_rng(&mut rng);
            let rng1 = dither_rng(&mut rng);
            val += (f64::from(rng0) * (1.0 / f64::from(u32::MAX))
                - f64::from(rng1) * (1.0 / f64::from(u32::MAX))) as f32;
            *s = val.round() * invscale;
        }
    }
    *seed = rng;
}

/// A backend buffer in one of the device output formats.
pub enum OutputBuffer<'a> {
    U8(&'a mut [u8]),
    I8(&'a mut [i8]),
    U16(&'a mut [u16]),
    I16(&'a mut [i16]),
    U32(&'a mut [u32]),
    I32(&'a mut [i32]),
    F32(&'a mut [f32]),
}

impl OutputBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            OutputBuffer::U8(b) => b.len(),
            OutputBuffer::I8(b) => b.len(),
            OutputBuffer::U16(b) => b.len(),
            OutputBuffer::I16(b) => b.len(),
            OutputBuffer::U32(b) => b.len(),
            OutputBuffer::I32(b) => b.len(),
            OutputBuffer::F32(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Saturating conversion of a normalised sample. Integer conversions clamp to
/// the largest value a float can represent exactly at that width.
pub trait OutputSample: Copy {
    fn from_output(val: f32) -> Self;
}

impl OutputSample for f32 {
    #[inline]
    fn from_output(val: f32) -> Self {
        val
    }
}

impl OutputSample for i32 {
    #[inline]
    fn from_output(val: f32) -> Self {
        (val * 2147483648.0)
            .clamp(-2147483648.0, 2147483520.0)
            .round() as i32
    }
}

impl OutputSample for i16 {
    #[inline]
    fn from_output(val: f32) -> Self {
        i16::from_sample(clamp_scaled(val, 32768.0, 32767.0))
    }
}

impl OutputSample for i8 {
    #[inline]
    fn from_output(val: f32) -> Self {
        i8::from_sample(clamp_scaled(val, 128.0, 127.0))
    }
}

impl OutputSample for u32 {
    #[inline]
    fn from_output(val: f32) -> Self {
        (i32::from_output(val) as u32).wrapping_add(2147483648)
    }
}

impl OutputSample for u16 {
    #[inline]
    fn from_output(val: f32) -> Self {
        u16::from_sample(i16::from_output(val))
    }
}

impl OutputSample for u8 {
    #[inline]
    fn from_output(val: f32) -> Self {
        u8::from_sample(i8::from_output(val))
    }
}

/// Rounds to the integer grid of `scale` and clamps so the value maps to
/// `[-scale, max]` once scaled back up.
#[inline]
fn clamp_scaled(val: f32, scale: f32, max: f32) -> f32 {
    (val * scale).round().clamp(-scale, max) / scale
}

fn write_typed<T: OutputSample>(
    input: &[FloatBufferLine],
    out: &mut [T],
    offset: usize,
    samples_to_do: usize,
    frame_step: usize,
) {
    let base = offset * frame_step;
    let chans = input.len().min(frame_step);
    for (c, line) in input[..chans].iter().enumerate() {
        for (i, &s) in line[..samples_to_do].iter().enumerate() {
            out[base + i * frame_step + c] = T::from_output(s);
        }
    }
    if chans < frame_step {
        let silence = T::from_output(0.0);
        for i in 0..samples_to_do {
            let frame = base + i * frame_step;
            out[frame + chans..frame + frame_step].fill(silence);
        }
    }
}

/// Interleaves `samples_to_do` frames of `input` into `out` starting at frame
/// `offset`. Frames are `frame_step` samples wide; slots past the number of
/// input channels are filled with silence.
pub fn write_interleaved(
    input: &[FloatBufferLine],
    out: &mut OutputBuffer<'_>,
    offset: usize,
    samples_to_do: usize,
    frame_step: usize,
) {
    match out {
        OutputBuffer::U8(b) => write_typed(input, b, offset, samples_to_do, frame_step),
        OutputBuffer::I8(b) => write_typed(input, b, offset, samples_to_do, frame_step),
        OutputBuffer::U16(b) => write_typed(input, b, offset, samples_to_do, frame_step),
        OutputBuffer::I16(b) => write_typed(input, b, offset, samples_to_do, frame_step),
        OutputBuffer::U32(b) => write_typed(input, b, offset, samples_to_do, frame_step),
        OutputBuffer::I32(b) => write_typed(input, b, offset, samples_to_do, frame_step),
        OutputBuffer::F32(b) => write_typed(input, b, offset, samples_to_do, frame_step),
    }
}

/// Copies float output channel by channel.
pub fn write_planar(
    input: &[FloatBufferLine],
    out: &mut [&mut [f32]],
    offset: usize,
    samples_to_do: usize,
) {
    for (dst, line) in out.iter_mut().zip(input) {
        dst[offset..offset + samples_to_do].copy_from_slice(&line[..samples_to_do]);
    }
}
