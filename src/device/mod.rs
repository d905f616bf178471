//! The output device: bus layout, the render loop and the device clock.
//!
//! A [`Device`] is driven by the backend callback through
//! [`Device::render_samples`]. Each call is cut into blocks of at most
//! [`BUFFER_LINE_SIZE`] frames; every block mixes each registered context
//! into the dry bus, runs the post-process stage that turns the dry bus
//! into speaker feeds, applies the limiter, distance compensation and
//! dither, and finally converts into the backend's sample format.

mod panning;

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::ambisonic::MAX_AMBI_ORDER;
use crate::audio::{new_lines, Channel, FloatBufferLine, MixParams, RealMixParams, BUFFER_LINE_SIZE};
use crate::biquad::NfcFilter;
use crate::config::{DevChannels, DevSampleType, DeviceConfig, RenderMode};
use crate::context::{Context, ContextRenderer};
use crate::error::{MixerError, Result};
use crate::events::WarningKind;
use crate::hrtf::{HrtfStore, HRIR_LENGTH};
use crate::postprocess::{
    apply_dither, write_interleaved, write_planar, Compressor, DistanceComp, OutputBuffer,
    DITHER_RNG_SEED,
};
use crate::resampler::Resampler;
use crate::voice::VoiceScratch;

pub use panning::RemixEntry;
use panning::{init_renderer, speaker_channels, PostProcess};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Everything the mixer needs to know about the output, fixed once the
/// device is created. Voices and effects read it on every update.
#[derive(Clone)]
pub struct DeviceInfo {
    pub frequency: u32,
    pub channels: DevChannels,
    pub sample_type: DevSampleType,
    pub update_size: u32,
    pub ambi_order: usize,

    /// The virtual (ambisonic) bus voices pan into.
    pub dry: MixParams,
    /// The speaker bus the backend receives.
    pub real_out: RealMixParams,
    /// Ambisonic output: the dry bus is handed to the backend as is.
    pub dry_is_real: bool,
    /// Where direct-channel sources send channels the layout lacks.
    pub remix: &'static [RemixEntry],

    pub avg_speaker_dist: f32,
    pub num_channels_per_order: [usize; MAX_AMBI_ORDER + 1],
    pub nfc_filter: NfcFilter,
    pub xover_freq: f32,
    pub render_mode: RenderMode,
    pub hrtf: Option<Arc<HrtfStore>>,
    pub ir_size: usize,
    pub uhj_encoder: bool,

    pub num_sends: usize,
    pub resampler: Resampler,
    pub event_queue_size: usize,
    pub max_voices: usize,
    pub max_slots: usize,
    pub hold_updates_default: bool,
    pub stop_voices_on_disconnect: bool,
}

impl DeviceInfo {
    /// The format fields of `config`; the bus layout is filled in by the
    /// panning setup.
    fn from_config(config: &DeviceConfig) -> Self {
        let speakers = speaker_channels(config.channels, config.ambi_order);
        Self {
            frequency: config.frequency,
            channels: config.channels,
            sample_type: config.sample_type,
            update_size: config.update_size,
            ambi_order: 1,
            dry: MixParams::acn_identity(4),
            real_out: RealMixParams::new(&speakers),
            dry_is_real: false,
            remix: &[],
            avg_speaker_dist: 0.0,
            num_channels_per_order: [0; MAX_AMBI_ORDER + 1],
            nfc_filter: NfcFilter::default(),
            xover_freq: 400.0,
            render_mode: RenderMode::Normal,
            hrtf: None,
            ir_size: HRIR_LENGTH,
            uhj_encoder: false,
            num_sends: config.sends,
            resampler: config.resampler,
            event_queue_size: config.event_queue_size,
            max_voices: config.max_voices,
            max_slots: config.max_slots,
            hold_updates_default: config.hold_updates_default,
            stop_voices_on_disconnect: config.stop_voices_on_disconnect,
        }
    }

    /// A first-order stereo device without post-processing state, for unit
    /// tests of the mixing stages.
    #[cfg(test)]
    pub(crate) fn for_tests(frequency: u32) -> Self {
        let config = DeviceConfig {
            frequency,
            ..DeviceConfig::default()
        };
        let mut info = Self::from_config(&config);
        info.remix = &panning::STEREO_DOWNMIX;
        info
    }

    /// Channels the backend receives per frame.
    pub fn output_channels(&self) -> usize {
        self.real_out.num_channels
    }

    pub fn output_layout(&self) -> Vec<Channel> {
        speaker_channels(self.channels, self.ambi_order as u32)
    }
}

/// Counters the render thread publishes for the app side.
pub(crate) struct DeviceShared {
    /// Odd while a block is being mixed.
    pub mix_count: AtomicU32,
    samples_done: AtomicU32,
    clock_base_ns: AtomicU64,
    pub connected: AtomicBool,
    frequency: u32,
}

impl DeviceShared {
    fn new(frequency: u32) -> Self {
        Self {
            mix_count: AtomicU32::new(0),
            samples_done: AtomicU32::new(0),
            clock_base_ns: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            frequency,
        }
    }

    /// Runs `read` until it sees a state no mix was touching.
    pub fn consistent_read<T>(&self, mut read: impl FnMut() -> T) -> T {
        loop {
            let count = self.wait_for_mix();
            let value = read();
            fence(Ordering::Acquire);
            if self.mix_count.load(Ordering::Relaxed) == count {
                return value;
            }
        }
    }

    fn wait_for_mix(&self) -> u32 {
        loop {
            let count = self.mix_count.load(Ordering::Acquire);
            if count & 1 == 0 {
                return count;
            }
            std::hint::spin_loop();
        }
    }

    fn begin_mix(&self) {
        self.mix_count.fetch_add(1, Ordering::AcqRel);
    }

    fn end_mix(&self) {
        self.mix_count.fetch_add(1, Ordering::Release);
    }

    /// Only called by the render thread, between `begin_mix` and `end_mix`.
    fn advance(&self, samples: usize) {
        let freq = u64::from(self.frequency);
        let done = u64::from(self.samples_done.load(Ordering::Relaxed)) + samples as u64;
        let secs = done / freq;
        if secs > 0 {
            self.clock_base_ns.fetch_add(secs * NANOS_PER_SEC, Ordering::Relaxed);
        }
        self.samples_done.store((done % freq) as u32, Ordering::Relaxed);
    }

    fn clock_time(&self) -> Duration {
        self.consistent_read(|| {
            let base = self.clock_base_ns.load(Ordering::Relaxed);
            let done = u64::from(self.samples_done.load(Ordering::Relaxed));
            let ns = base + done * NANOS_PER_SEC / u64::from(self.frequency);
            Duration::from_nanos(ns)
        })
    }
}

/// A cloneable handle for reading the device clock from any thread.
#[derive(Clone)]
pub struct DeviceClock {
    shared: Arc<DeviceShared>,
}

impl DeviceClock {
    /// Rendered time since the device was created.
    pub fn time(&self) -> Duration {
        self.shared.clock_time()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

/// The device-wide buses every context mixes into.
pub(crate) struct MixBuses {
    pub dry: Vec<FloatBufferLine>,
    /// Empty when the dry bus is the output.
    pub real: Vec<FloatBufferLine>,
    /// Binaural accumulation of HRTF voices, one block plus the IR tail.
    pub hrtf_accum: Vec<[f32; 2]>,
}

impl MixBuses {
    pub(crate) fn new(info: &DeviceInfo) -> Self {
        Self {
            dry: new_lines(info.dry.num_channels()),
            real: if info.dry_is_real {
                Vec::new()
            } else {
                new_lines(info.real_out.num_channels)
            },
            hrtf_accum: vec![[0.0; 2]; BUFFER_LINE_SIZE + HRIR_LENGTH],
        }
    }

    fn clear(&mut self, samples_to_do: usize) {
        for line in self.dry.iter_mut().chain(self.real.iter_mut()) {
            line[..samples_to_do].fill(0.0);
        }
    }

    fn output_mut(&mut self) -> &mut [FloatBufferLine] {
        if self.real.is_empty() {
            &mut self.dry
        } else {
            &mut self.real
        }
    }

    fn output(&self) -> &[FloatBufferLine] {
        if self.real.is_empty() {
            &self.dry
        } else {
            &self.real
        }
    }
}

pub struct Device {
    info: Arc<DeviceInfo>,
    shared: Arc<DeviceShared>,
    buses: MixBuses,
    scratch: VoiceScratch,
    post: PostProcess,
    limiter: Option<Box<Compressor>>,
    distance_comp: Option<DistanceComp>,
    dither_scale: f32,
    dither_seed: u32,
    contexts: Vec<ContextRenderer>,
    next_context_id: u32,
}

impl Device {
    /// Sets up the output for `config`. `hrtf` is only used for stereo
    /// output with HRTF encoding.
    pub fn new(config: &DeviceConfig, hrtf: Option<Arc<HrtfStore>>) -> Result<Self> {
        let config = config.clone().sanitized()?;
        let mut info = DeviceInfo::from_config(&config);
        let post = init_renderer(&mut info, &config, hrtf);

        let num_outputs = info.real_out.num_channels;
        let distance_comp = match &config.speaker_distances {
            Some(_) if info.dry_is_real => {
                log::debug!("Distance compensation is not used for ambisonic output");
                None
            }
            Some(dists) => {
                if dists.len() != num_outputs {
                    return Err(MixerError::InvalidValue(format!(
                        "{} speaker distances given for {} output channels",
                        dists.len(),
                        num_outputs
                    )));
                }
                DistanceComp::new(dists, info.frequency)
            }
            None => None,
        };
        if distance_comp.as_ref().is_some_and(DistanceComp::truncated) {
            log::warn!("Speaker distance compensation truncated to the delay line length");
        }

        let limiter = if config.limiter_enabled() {
            let threshold_db = limiter_threshold_db(config.sample_type);
            let limiter = Compressor::device_limiter(num_outputs, info.frequency, threshold_db);
            log::info!(
                "Output limiter enabled: {:.2}dB threshold, {} sample look-ahead",
                threshold_db,
                limiter.look_ahead()
            );
            Some(Box::new(limiter))
        } else {
            None
        };

        let dither_scale = config.dither_scale();
        if dither_scale > 0.0 {
            log::info!("Dithering to {} steps", dither_scale);
        }
        log::info!(
            "Device created: {}hz {:?} {:?}, {} sends, {} voices",
            info.frequency,
            info.channels,
            info.sample_type,
            info.num_sends,
            info.max_voices
        );

        let buses = MixBuses::new(&info);
        Ok(Self {
            shared: Arc::new(DeviceShared::new(info.frequency)),
            info: Arc::new(info),
            buses,
            scratch: VoiceScratch::new(),
            post,
            limiter,
            distance_comp,
            dither_scale,
            dither_seed: DITHER_RNG_SEED,
            contexts: Vec::new(),
            next_context_id: 1,
        })
    }

    pub fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }

    pub fn clock(&self) -> DeviceClock {
        DeviceClock {
            shared: self.shared.clone(),
        }
    }

    pub fn clock_time(&self) -> Duration {
        self.shared.clock_time()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Latency the output stages add on top of the backend's, in frames.
    pub fn latency_frames(&self) -> usize {
        self.limiter.as_ref().map_or(0, |l| l.look_ahead())
    }

    /// Creates a context and registers its mixer side with this device.
    pub fn create_context(&mut self) -> Result<Context> {
        if !self.is_connected() {
            return Err(MixerError::Disconnected);
        }
        let id = self.next_context_id;
        self.next_context_id += 1;
        let (context, mut renderer) = Context::new(id, self.info.clone(), self.shared.clone())?;
        if self.distance_comp.as_ref().is_some_and(DistanceComp::truncated) {
            renderer.queue_warning(WarningKind::DistanceCompTruncated);
        }
        self.contexts.push(renderer);
        log::debug!("Context {} created", id);
        Ok(context)
    }

    /// Unregisters `context`. Its voices stop producing output right away.
    pub fn remove_context(&mut self, context: Context) -> Result<()> {
        let id = context.id();
        let Some(pos) = self.contexts.iter().position(|c| c.id() == id) else {
            return Err(MixerError::InvalidValue(format!("context {} is not on this device", id)));
        };
        self.contexts.remove(pos);
        log::debug!("Context {} removed", id);
        Ok(())
    }

    /// Marks the device disconnected and tells every context. Only the first
    /// call has any effect.
    pub fn handle_disconnect(&mut self, message: &str) {
        if !self.shared.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        log::warn!("Device disconnected: {}", message);
        self.shared.begin_mix();
        let stop_voices = self.info.stop_voices_on_disconnect;
        for context in self.contexts.iter_mut() {
            context.disconnect(message, stop_voices);
        }
        self.shared.end_mix();
    }

    /// Renders `num_samples` interleaved frames, `frame_step` samples apart,
    /// into `out`. Frames that do not fit in `out` are not rendered.
    pub fn render_samples(&mut self, out: &mut OutputBuffer<'_>, num_samples: usize, frame_step: usize) {
        let frame_step = frame_step.max(1);
        let num_samples = num_samples.min(out.len() / frame_step);
        let mut done = 0;
        while done < num_samples {
            let todo = (num_samples - done).min(BUFFER_LINE_SIZE);
            self.render_block(todo);
            write_interleaved(self.buses.output(), out, done, todo, frame_step);
            done += todo;
        }
    }

    /// Renders into one float slice per output channel. The frame count is
    /// the length of the shortest slice.
    pub fn render_samples_float(&mut self, out: &mut [&mut [f32]]) {
        let num_samples = out.iter().map(|c| c.len()).min().unwrap_or(0);
        let mut done = 0;
        while done < num_samples {
            let todo = (num_samples - done).min(BUFFER_LINE_SIZE);
            self.render_block(todo);
            write_planar(self.buses.output(), out, done, todo);
            done += todo;
        }
    }

    fn render_block(&mut self, samples_to_do: usize) {
        self.buses.clear(samples_to_do);
        if !self.is_connected() {
            return;
        }

        self.shared.begin_mix();
        for context in self.contexts.iter_mut() {
            context.process(&self.info, &mut self.buses, &mut self.scratch, samples_to_do);
        }
        self.shared.advance(samples_to_do);
        self.shared.end_mix();

        let MixBuses {
            dry,
            real,
            hrtf_accum,
        } = &mut self.buses;
        self.post.process(&self.info, dry, real, hrtf_accum, samples_to_do);

        let output = self.buses.output_mut();
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.process(output, samples_to_do);
        }
        if let Some(comp) = self.distance_comp.as_mut() {
            comp.process(output, samples_to_do);
        }
        if self.dither_scale > 0.0 {
            apply_dither(output, &mut self.dither_seed, self.dither_scale, samples_to_do);
        }
    }
}

/// One quantization step below full scale for integer output, 0dB for
/// float.
fn limiter_threshold_db(sample_type: DevSampleType) -> f32 {
    let bits = match sample_type {
        DevSampleType::U8 | DevSampleType::I8 => 8,
        DevSampleType::U16 | DevSampleType::I16 => 16,
        DevSampleType::U32 | DevSampleType::I32 => 32,
        DevSampleType::F32 => return 0.0,
    };
    let full = 2.0f64.powi(bits - 1);
    (20.0 * ((full - 1.0) / full).log10()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_device() -> Device {
        let config = DeviceConfig {
            frequency: 48000,
            ..DeviceConfig::default()
        };
        Device::new(&config, None).unwrap()
    }

    #[test]
    fn a_device_without_contexts_renders_silence() {
        let mut device = stereo_device();
        let mut out = vec![1.0f32; 2 * 3000];
        device.render_samples(&mut OutputBuffer::F32(&mut out), 3000, 2);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn clock_follows_rendered_frames() {
        let mut device = stereo_device();
        let mut out = vec![0.0f32; 2 * 24000];
        device.render_samples(&mut OutputBuffer::F32(&mut out), 24000, 2);
        assert_eq!(device.clock_time(), Duration::from_millis(500));
        for _ in 0..3 {
            device.render_samples(&mut OutputBuffer::F32(&mut out), 24000, 2);
        }
        assert_eq!(device.clock().time(), Duration::from_secs(2));
        assert_eq!(device.shared.mix_count.load(Ordering::Relaxed) % 2, 0);
    }

    #[test]
    fn render_stops_at_the_output_length() {
        let mut device = stereo_device();
        let mut out = vec![0i16; 2 * 100];
        device.render_samples(&mut OutputBuffer::I16(&mut out), 1000, 2);
        assert_eq!(device.clock_time(), Duration::from_nanos(100 * NANOS_PER_SEC / 48000));
    }

    #[test]
    fn integer_output_enables_the_limiter() {
        let config = DeviceConfig {
            sample_type: DevSampleType::I16,
            ..DeviceConfig::default()
        };
        let device = Device::new(&config, None).unwrap();
        assert!(device.limiter.is_some());
        assert!(device.latency_frames() > 0);
        assert!(stereo_device().limiter.is_none());
    }

    #[test]
    fn limiter_threshold_sits_one_step_below_full_scale() {
        assert_eq!(limiter_threshold_db(DevSampleType::F32), 0.0);
        let db = limiter_threshold_db(DevSampleType::I16);
        assert!((db - -0.000_265).abs() < 1e-5, "got {}", db);
        assert!(limiter_threshold_db(DevSampleType::U8) < db);
    }

    #[test]
    fn speaker_distances_must_match_the_layout() {
        let config = DeviceConfig {
            channels: DevChannels::Quad,
            speaker_distances: Some(vec![1.0, 1.0]),
            ..DeviceConfig::default()
        };
        assert!(matches!(Device::new(&config, None), Err(MixerError::InvalidValue(_))));
    }

    #[test]
    fn disconnect_silences_the_output_once() {
        let mut device = stereo_device();
        let context = device.create_context().unwrap();
        device.handle_disconnect("unplugged");
        device.handle_disconnect("again");
        assert!(!device.is_connected());
        assert!(matches!(device.create_context(), Err(MixerError::Disconnected)));

        let mut out = vec![0u8; 2 * 64];
        device.render_samples(&mut OutputBuffer::U8(&mut out), 64, 2);
        assert!(out.iter().all(|&s| s == 128));
        assert_eq!(device.clock_time(), Duration::ZERO);
        device.remove_context(context).unwrap();
    }

    #[test]
    fn planar_output_uses_the_shortest_channel() {
        let mut device = stereo_device();
        let mut left = vec![1.0f32; 300];
        let mut right = vec![1.0f32; 200];
        device.render_samples_float(&mut [&mut left[..], &mut right[..]]);
        assert!(left[..200].iter().all(|&s| s == 0.0));
        assert_eq!(left[250], 1.0);
        assert!(right.iter().all(|&s| s == 0.0));
    }
}
