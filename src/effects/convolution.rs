//! Partitioned convolution with an impulse response buffer.
//!
//! The response is cut into 128-sample segments. The first segment runs as a
//! direct FIR on each incoming sample so there is no added latency; the rest
//! are transformed once at load time and applied in the frequency domain,
//! one 128-sample block at a time, against a sliding history of transformed
//! input blocks. Each inverse transform yields 256 samples: the first half
//! completes the current block and the second half overlaps into the next.

use std::f32::consts::PI;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use rustfft::num_complex::Complex;

use crate::ambisonic::{
    calc_angle_coeffs, compute_pan_gains, hf_order_scales, layout_2d_for, layout_for,
    scale_azimuth_front, scales_for, MAX_AMBI_CHANNELS,
};
use crate::audio::{
    AmbiLayout, AmbiScaling, Buffer, Channel, ChannelLayout, FloatBufferLine, BUFFER_LINE_SIZE,
    MAX_OUTPUT_CHANNELS,
};
use crate::biquad::BandSplitter;
use crate::config::RenderMode;
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::mixer::mix;

use super::fshifter::FftPair;
use super::{EffectProcessor, EffectProps, EffectTarget, OutTarget, SlotParams};

const CONVOLVE_UPDATE_SIZE: usize = 256;
const CONVOLVE_UPDATE_SAMPLES: usize = CONVOLVE_UPDATE_SIZE / 2;
/// Complex bins kept per transformed segment.
const NUM_BINS: usize = CONVOLVE_UPDATE_SIZE / 2 + 1;

const MAX_CONVOLVE_AMBI_ORDER: u32 = 1;

struct ChanMap {
    channel: Channel,
    angle: f32,
    elevation: f32,
}

const fn deg2rad(x: f32) -> f32 {
    x * (PI / 180.0)
}

const fn chan(channel: Channel, degrees: f32) -> ChanMap {
    ChanMap {
        channel,
        angle: deg2rad(degrees),
        elevation: 0.0,
    }
}

// Stereo and rear pairs sit at 45 degrees from centre, wider than the
// source panning maps.
static MONO_MAP: [ChanMap; 1] = [chan(Channel::FrontCenter, 0.0)];
static STEREO_MAP: [ChanMap; 2] = [chan(Channel::FrontLeft, -45.0), chan(Channel::FrontRight, 45.0)];
static REAR_MAP: [ChanMap; 2] = [chan(Channel::BackLeft, -135.0), chan(Channel::BackRight, 135.0)];
static QUAD_MAP: [ChanMap; 4] = [
    chan(Channel::FrontLeft, -45.0),
    chan(Channel::FrontRight, 45.0),
    chan(Channel::BackLeft, -135.0),
    chan(Channel::BackRight, 135.0),
];
static X51_MAP: [ChanMap; 6] = [
    chan(Channel::FrontLeft, -30.0),
    chan(Channel::FrontRight, 30.0),
    chan(Channel::FrontCenter, 0.0),
    chan(Channel::Lfe, 0.0),
    chan(Channel::SideLeft, -110.0),
    chan(Channel::SideRight, 110.0),
];
static X61_MAP: [ChanMap; 7] = [
    chan(Channel::FrontLeft, -30.0),
    chan(Channel::FrontRight, 30.0),
    chan(Channel::FrontCenter, 0.0),
    chan(Channel::Lfe, 0.0),
    chan(Channel::BackCenter, 180.0),
    chan(Channel::SideLeft, -90.0),
    chan(Channel::SideRight, 90.0),
];
static X71_MAP: [ChanMap; 8] = [
    chan(Channel::FrontLeft, -30.0),
    chan(Channel::FrontRight, 30.0),
    chan(Channel::FrontCenter, 0.0),
    chan(Channel::Lfe, 0.0),
    chan(Channel::BackLeft, -150.0),
    chan(Channel::BackRight, 150.0),
    chan(Channel::SideLeft, -90.0),
    chan(Channel::SideRight, 90.0),
];

fn apply_fir(dst: &mut [f32], src: &[f32], filter: &[f32; CONVOLVE_UPDATE_SAMPLES]) {
    for (i, out) in dst.iter_mut().enumerate() {
        *out = src[i..i + CONVOLVE_UPDATE_SAMPLES]
            .iter()
            .zip(filter.iter())
            .map(|(s, f)| s * f)
            .sum();
    }
}

/// Resamples one channel of an impulse response to the device rate and
/// returns exactly `out_len` samples.
fn resample_channel(src: &[f64], src_rate: u32, dst_rate: u32, out_len: usize) -> Result<Vec<f64>> {
    let ratio = f64::from(dst_rate) / f64::from(src_rate);
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let chunk_size = 1024;
    let mut resampler = SincFixedIn::<f64>::new(ratio, 1.0, params, chunk_size, 1)?;
    let delay = resampler.output_delay();

    let mut resampled: Vec<f64> = Vec::with_capacity(out_len + delay + chunk_size);
    for block in src.chunks(chunk_size) {
        let mut block = block.to_vec();
        block.resize(chunk_size, 0.0);
        let out = resampler.process(&[block], None)?;
        resampled.extend_from_slice(&out[0]);
    }
    // Flush the filter tail until the delayed response is complete.
    while resampled.len() < out_len + delay {
        let out = resampler.process(&[vec![0.0; chunk_size]], None)?;
        if out[0].is_empty() {
            break;
        }
        resampled.extend_from_slice(&out[0]);
    }

    let mut ret: Vec<f64> = resampled.into_iter().skip(delay).take(out_len).collect();
    ret.resize(out_len, 0.0);
    Ok(ret)
}

/// Channel layout information captured from the impulse response.
#[derive(Clone, Copy, Debug)]
struct IrFormat {
    layout: ChannelLayout,
    ambi_layout: AmbiLayout,
    ambi_scaling: AmbiScaling,
    ambi_order: u32,
}

struct ChannelData {
    buffer: Box<FloatBufferLine>,
    hf_scale: f32,
    filter: BandSplitter,
    current: [f32; MAX_OUTPUT_CHANNELS],
    target: [f32; MAX_OUTPUT_CHANNELS],
}

pub struct ConvolutionState {
    format: Option<IrFormat>,

    fifo_pos: usize,
    input: [f32; CONVOLVE_UPDATE_SAMPLES * 2],
    filter: Vec<[f32; CONVOLVE_UPDATE_SAMPLES]>,
    output: Vec<[f32; CONVOLVE_UPDATE_SAMPLES * 2]>,

    fft_buffer: [Complex<f64>; CONVOLVE_UPDATE_SIZE],
    fft: FftPair,

    current_segment: usize,
    num_convolve_segs: usize,

    chans: Vec<ChannelData>,
    /// `num_convolve_segs` transformed input blocks, followed by the
    /// transformed filter segments of each channel.
    complex_data: Vec<Complex<f64>>,
    upsample: bool,
}

impl ConvolutionState {
    pub fn new() -> Self {
        Self {
            format: None,
            fifo_pos: 0,
            input: [0.0; CONVOLVE_UPDATE_SAMPLES * 2],
            filter: Vec::new(),
            output: Vec::new(),
            fft_buffer: [Complex::new(0.0, 0.0); CONVOLVE_UPDATE_SIZE],
            fft: FftPair::new(CONVOLVE_UPDATE_SIZE),
            current_segment: 0,
            num_convolve_segs: 0,
            chans: Vec::new(),
            complex_data: Vec::new(),
            upsample: false,
        }
    }

    /// Decodes a WAV impulse response held in memory. Four-channel files are
    /// taken as first-order ACN/SN3D B-Format.
    pub fn load_impulse_response(data: &[u8]) -> Result<Buffer> {
        let buffer = Buffer::from_wav_bytes(data)?;
        log::debug!(
            "Loaded impulse response: {} channels, {} frames at {}hz",
            buffer.channel_count(),
            buffer.sample_len(),
            buffer.frequency()
        );
        if buffer.channel_count() != 4 {
            return Ok(buffer);
        }
        Buffer::new_ambisonic(
            buffer.frequency(),
            buffer.sample_type(),
            ChannelLayout::BFormat3D,
            1,
            AmbiLayout::Acn,
            AmbiScaling::Sn3d,
            buffer.bytes().to_vec(),
        )
    }

    pub fn num_segments(&self) -> usize {
        self.num_convolve_segs
    }

    fn reset(&mut self) {
        self.format = None;
        self.fifo_pos = 0;
        self.input.fill(0.0);
        self.filter.clear();
        self.output.clear();
        self.fft_buffer.fill(Complex::new(0.0, 0.0));
        self.current_segment = 0;
        self.num_convolve_segs = 0;
        self.chans.clear();
        self.complex_data.clear();
        self.upsample = false;
    }

    fn mix_out(&mut self, output: &mut [FloatBufferLine], samples_to_do: usize) {
        for chan in self.chans.iter_mut() {
            let src = &mut chan.buffer[..samples_to_do];
            if self.upsample {
                chan.filter.process_hf_scale(src, chan.hf_scale);
            }
            mix(src, output, &mut chan.current, &chan.target, samples_to_do, 0);
        }
    }
}

impl Default for ConvolutionState {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectProcessor for ConvolutionState {
    fn device_update(&mut self, device: &DeviceInfo, buffer: Option<&Buffer>) -> Result<()> {
        self.reset();

        // An empty buffer doesn't need a convolution filter.
        let Some(buffer) = buffer.filter(|b| b.sample_len() > 0 && !b.is_callback()) else {
            return Ok(());
        };

        let ambi_order = buffer.ambi_order().min(MAX_CONVOLVE_AMBI_ORDER);
        let num_channels = buffer.layout().channel_count(ambi_order);
        let src_rate = buffer.frequency();
        let dst_rate = device.frequency;
        let src_len = buffer.sample_len() as usize;
        let resampled_count =
            ((src_len as u64 * u64::from(dst_rate) + u64::from(src_rate) - 1) / u64::from(src_rate)) as usize;

        let splitter = BandSplitter::new(device.xover_freq / dst_rate as f32);
        self.chans = (0..num_channels)
            .map(|_| ChannelData {
                buffer: Box::new([0.0; BUFFER_LINE_SIZE]),
                hf_scale: 1.0,
                filter: splitter,
                current: [0.0; MAX_OUTPUT_CHANNELS],
                target: [0.0; MAX_OUTPUT_CHANNELS],
            })
            .collect();
        self.filter = vec![[0.0; CONVOLVE_UPDATE_SAMPLES]; num_channels];
        self.output = vec![[0.0; CONVOLVE_UPDATE_SAMPLES * 2]; num_channels];

        // One segment is applied as the time-domain FIR; keep at least one
        // transformed segment.
        let num_segs = resampled_count.div_ceil(CONVOLVE_UPDATE_SAMPLES).max(2) - 1;
        self.num_convolve_segs = num_segs;
        self.complex_data = vec![Complex::new(0.0, 0.0); num_segs * NUM_BINS * (num_channels + 1)];

        self.format = Some(IrFormat {
            layout: buffer.layout(),
            ambi_layout: buffer.ambi_layout(),
            ambi_scaling: buffer.ambi_scaling(),
            ambi_order,
        });

        let mut filter_pos = num_segs * NUM_BINS;
        for c in 0..num_channels {
            let src: Vec<f64> = buffer.channel_to_f32(c).into_iter().map(f64::from).collect();
            let samples = if src_rate != dst_rate {
                resample_channel(&src, src_rate, dst_rate, resampled_count).inspect_err(|err| {
                    log::warn!("Failed to resample impulse response channel {}: {}", c, err);
                })?
            } else {
                src
            };

            // The first segment is stored reversed for the FIR.
            let first_size = resampled_count.min(CONVOLVE_UPDATE_SAMPLES);
            for (dst, &s) in self.filter[c].iter_mut().rev().zip(&samples[..first_size]) {
                *dst = s as f32;
            }

            let mut done = first_size;
            for _ in 0..num_segs {
                let todo = (resampled_count - done).min(CONVOLVE_UPDATE_SAMPLES);
                for (dst, &s) in self.fft_buffer.iter_mut().zip(&samples[done..done + todo]) {
                    *dst = Complex::new(s, 0.0);
                }
                self.fft_buffer[todo..].fill(Complex::new(0.0, 0.0));
                done += todo;

                self.fft.forward(&mut self.fft_buffer);
                self.complex_data[filter_pos..filter_pos + NUM_BINS]
                    .copy_from_slice(&self.fft_buffer[..NUM_BINS]);
                filter_pos += NUM_BINS;
            }
        }
        self.fft_buffer.fill(Complex::new(0.0, 0.0));
        log::debug!(
            "Convolution set up with {} channels, {} segments",
            num_channels,
            num_segs
        );
        Ok(())
    }

    fn update(
        &mut self,
        device: &DeviceInfo,
        slot: &SlotParams,
        _props: &EffectProps,
        target: EffectTarget<'_>,
    ) -> OutTarget {
        let Some(format) = self.format else {
            return OutTarget::Main;
        };
        if self.num_convolve_segs < 1 {
            return OutTarget::Main;
        }

        self.upsample = false;
        for chan in self.chans.iter_mut() {
            chan.target.fill(0.0);
        }
        let gain = slot.gain;

        // UHJ goes straight to the front pair when the output has one.
        if format.layout.is_uhj() && format.layout != ChannelLayout::SuperStereo {
            let real = target.real_out.and_then(|real| {
                Some((real.index_of(Channel::FrontLeft)?, real.index_of(Channel::FrontRight)?))
            });
            if let Some((lidx, ridx)) = real {
                self.chans[0].target[lidx] = gain;
                self.chans[1].target[ridx] = gain;
                return OutTarget::RealOut;
            }
        }

        if format.layout.is_bformat() {
            if device.ambi_order > format.ambi_order as usize {
                self.upsample = true;
                let scales = hf_order_scales(format.ambi_order as usize, device.ambi_order);
                for (i, chan) in self.chans.iter_mut().enumerate() {
                    chan.hf_scale = if i == 0 { scales[0] } else { scales[1] };
                }
            }

            let scales = scales_for(format.ambi_scaling);
            let index_map: &[u8] = if format.layout == ChannelLayout::BFormat2D {
                layout_2d_for(format.ambi_layout)
            } else {
                layout_for(format.ambi_layout)
            };
            let mut coeffs = [0.0f32; MAX_AMBI_CHANNELS];
            for (chan, &acn) in self.chans.iter_mut().zip(index_map.iter()) {
                let acn = acn as usize;
                coeffs[acn] = scales[acn];
                compute_pan_gains(&target.main.ambi_map, &coeffs, gain, &mut chan.target);
                coeffs[acn] = 0.0;
            }
            return OutTarget::Main;
        }

        let chanmap: &[ChanMap] = match format.layout {
            ChannelLayout::Mono => &MONO_MAP,
            ChannelLayout::Stereo | ChannelLayout::SuperStereo => &STEREO_MAP,
            ChannelLayout::Rear => &REAR_MAP,
            ChannelLayout::Quad => &QUAD_MAP,
            ChannelLayout::X51 => &X51_MAP,
            ChannelLayout::X61 => &X61_MAP,
            ChannelLayout::X71 => &X71_MAP,
            _ => &[],
        };

        // LFE has no place on the ambisonic main bus.
        let pairwise = device.render_mode == RenderMode::Pairwise;
        for (chan, map) in self.chans.iter_mut().zip(chanmap.iter()) {
            if map.channel == Channel::Lfe {
                continue;
            }
            let angle = if pairwise {
                scale_azimuth_front(map.angle, 2.0)
            } else {
                map.angle
            };
            let coeffs = calc_angle_coeffs(angle, map.elevation, 0.0);
            compute_pan_gains(&target.main.ambi_map, &coeffs, gain, &mut chan.target);
        }
        OutTarget::Main
    }

    fn process(&mut self, samples_to_do: usize, input: &[FloatBufferLine], output: &mut [FloatBufferLine]) {
        let num_segs = self.num_convolve_segs;
        if num_segs < 1 {
            return;
        }
        let Some(input) = input.first() else {
            return;
        };
        let mut curseg = self.current_segment;

        let mut base = 0;
        while base < samples_to_do {
            let todo = (CONVOLVE_UPDATE_SAMPLES - self.fifo_pos).min(samples_to_do - base);
            let fifo_pos = self.fifo_pos;

            self.input[CONVOLVE_UPDATE_SAMPLES + fifo_pos..CONVOLVE_UPDATE_SAMPLES + fifo_pos + todo]
                .copy_from_slice(&input[base..base + todo]);

            // Apply the FIR for the new samples and add the overlap from
            // the last inverse transform.
            for (c, chan) in self.chans.iter_mut().enumerate() {
                let dst = &mut chan.buffer[base..base + todo];
                apply_fir(dst, &self.input[1 + fifo_pos..], &self.filter[c]);
                for (d, &o) in dst.iter_mut().zip(&self.output[c][fifo_pos..fifo_pos + todo]) {
                    *d += o;
                }
            }

            self.fifo_pos += todo;
            base += todo;

            if self.fifo_pos < CONVOLVE_UPDATE_SAMPLES {
                break;
            }
            self.fifo_pos = 0;

            // Move the newest input to the front for the next block's history.
            self.input.copy_within(CONVOLVE_UPDATE_SAMPLES.., 0);

            for (dst, &s) in self.fft_buffer.iter_mut().zip(&self.input[..CONVOLVE_UPDATE_SAMPLES]) {
                *dst = Complex::new(f64::from(s), 0.0);
            }
            self.fft_buffer[CONVOLVE_UPDATE_SAMPLES..].fill(Complex::new(0.0, 0.0));
            self.fft.forward(&mut self.fft_buffer);

            self.complex_data[curseg * NUM_BINS..(curseg + 1) * NUM_BINS]
                .copy_from_slice(&self.fft_buffer[..NUM_BINS]);

            let (history, filters) = self.complex_data.split_at(num_segs * NUM_BINS);
            for (c, chan_filters) in filters.chunks_exact(num_segs * NUM_BINS).enumerate() {
                self.fft_buffer[..NUM_BINS].fill(Complex::new(0.0, 0.0));

                // Each history block pairs with the filter segment aligned
                // to it in time.
                let segments = (curseg..num_segs).chain(0..curseg);
                for (seg_filter, s) in chan_filters.chunks_exact(NUM_BINS).zip(segments) {
                    let seg_input = &history[s * NUM_BINS..(s + 1) * NUM_BINS];
                    for ((acc, &x), &h) in self.fft_buffer[..NUM_BINS]
                        .iter_mut()
                        .zip(seg_input)
                        .zip(seg_filter)
                    {
                        *acc += x * h;
                    }
                }

                for i in NUM_BINS..CONVOLVE_UPDATE_SIZE {
                    self.fft_buffer[i] = self.fft_buffer[CONVOLVE_UPDATE_SIZE - i].conj();
                }
                self.fft.inverse(&mut self.fft_buffer);

                let scale = 1.0 / CONVOLVE_UPDATE_SIZE as f64;
                let out = &mut self.output[c];
                for i in 0..CONVOLVE_UPDATE_SAMPLES {
                    out[i] = (self.fft_buffer[i].re * scale) as f32 + out[CONVOLVE_UPDATE_SAMPLES + i];
                }
                for i in 0..CONVOLVE_UPDATE_SAMPLES {
                    out[CONVOLVE_UPDATE_SAMPLES + i] =
                        (self.fft_buffer[CONVOLVE_UPDATE_SAMPLES + i].re * scale) as f32;
                }
            }

            curseg = if curseg > 0 { curseg - 1 } else { num_segs - 1 };
        }
        self.current_segment = curseg;

        self.mix_out(output, samples_to_do);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{new_lines, MixParams, SampleType};
    use crate::effects::test_util::device;

    fn setup(state: &mut ConvolutionState, ir: &Buffer, dev: &DeviceInfo) {
        state.device_update(dev, Some(ir)).unwrap();
        let main = MixParams::acn_identity(4);
        let slot = SlotParams {
            gain: 1.0,
            wet_channels: 4,
        };
        state.update(
            dev,
            &slot,
            &EffectProps::Convolution,
            EffectTarget {
                main: &main,
                real_out: Some(&dev.real_out),
            },
        );
    }

    #[test]
    fn empty_buffer_disables_processing() {
        let dev = device(48000);
        let mut state = ConvolutionState::new();
        let ir = Buffer::from_f32(48000, ChannelLayout::Mono, &[]).unwrap();
        setup(&mut state, &ir, &dev);
        assert_eq!(state.num_segments(), 0);
        let wet = new_lines(4);
        let mut out = new_lines(4);
        state.process(256, &wet, &mut out);
        assert!(out[0].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn impulse_reproduces_the_response() {
        let dev = device(48000);
        let mut state = ConvolutionState::new();
        let mut samples = vec![0.0f32; 301];
        samples[0] = 1.0;
        samples[300] = 0.5;
        let ir = Buffer::from_f32(48000, ChannelLayout::Mono, &samples).unwrap();
        setup(&mut state, &ir, &dev);
        assert_eq!(state.num_segments(), 2);

        // Let the pan gains settle first.
        let mut wet = new_lines(4);
        let mut out = new_lines(4);
        state.process(BUFFER_LINE_SIZE, &wet, &mut out);

        wet[0][0] = 1.0;
        let mut out = new_lines(4);
        state.process(BUFFER_LINE_SIZE, &wet, &mut out);
        assert!((out[0][0] - 1.0).abs() < 1e-4, "{}", out[0][0]);
        assert!((out[0][300] - 0.5).abs() < 1e-4, "{}", out[0][300]);
        for (i, &s) in out[0].iter().enumerate() {
            if i != 0 && i != 300 {
                assert!(s.abs() < 1e-4, "sample {} = {}", i, s);
            }
        }
    }

    #[test]
    fn response_is_resampled_to_the_device_rate() {
        let dev = device(48000);
        let mut state = ConvolutionState::new();
        let samples: Vec<f32> = (0..600).map(|i| (-(i as f32) / 100.0).exp()).collect();
        let ir = Buffer::from_f32(24000, ChannelLayout::Mono, &samples).unwrap();
        setup(&mut state, &ir, &dev);
        // 1200 resampled samples span 10 segments, one of them as the FIR.
        assert_eq!(state.num_segments(), 9);

        let mut wet = new_lines(4);
        wet[0][0] = 1.0;
        let mut out = new_lines(4);
        state.process(BUFFER_LINE_SIZE, &wet, &mut out);
        assert!(out[0].iter().all(|s| s.is_finite()));
        assert!(out[0].iter().any(|&s| s.abs() > 1e-3));
    }

    #[test]
    fn four_channel_wav_loads_as_bformat() {
        let spec = hound::WavSpec {
            channels: 4,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..64i16 {
                for c in 0..4i16 {
                    writer.write_sample(i * 100 + c).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        let buffer = ConvolutionState::load_impulse_response(cursor.get_ref()).unwrap();
        assert_eq!(buffer.layout(), ChannelLayout::BFormat3D);
        assert_eq!(buffer.ambi_order(), 1);
        assert_eq!(buffer.sample_len(), 64);
        assert_eq!(buffer.sample_type(), SampleType::I16);
    }
}
