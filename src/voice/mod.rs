//! Mixer-side playback of one source.
//!
//! A [`Voice`] walks its buffer queue, resamples each channel to the device
//! rate, runs the per-path shelf filters and pans the result into the dry
//! bus and the effect slot sends. The pan targets come from
//! [`calc_source_params`]; gains move from their current values to the
//! targets over the first block after a change.
//!
//! The application never touches a `Voice`. It talks to the mixer through
//! [`VoiceShared`] (play state, position, pending properties) and through
//! [`VoiceChange`] commands that the context drains at the start of a mix.

mod params;
mod props;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::ambisonic::{
    hf_order_scales, MAX_AMBI_CHANNELS, MAX_AMBI_ORDER, ORDER_FROM_2D_CHANNEL, ORDER_FROM_CHANNEL,
};
use crate::audio::buffer::{load_samples, BufferData};
use crate::audio::{
    lerpf, AmbiLayout, AmbiScaling, Buffer, BufferQueueItem, ChannelLayout, FloatBufferLine,
    SampleType, BUFFER_LINE_SIZE, MAX_OUTPUT_CHANNELS, MAX_SENDS,
};
use crate::biquad::{BandSplitter, Biquad, NfcFilter};
use crate::device::DeviceInfo;
use crate::effect_slot::SlotRenderer;
use crate::events::{Event, EventSender, SourceState, EVENT_BUFFER_COMPLETED, EVENT_SOURCE_STATE};
use crate::hrtf::{HrtfFilter, HRTF_HISTORY_LENGTH};
use crate::mixer::{mix, mix_hrtf, mix_hrtf_blend, MixHrtfFilter};
use crate::postprocess::{UhjDecoder, UHJ_FILTER_DELAY};
use crate::props::PropsSlot;
use crate::resampler::{
    PreparedResampler, MAX_RESAMPLER_EDGE, MAX_RESAMPLER_PADDING, MIXER_FRAC_BITS, MIXER_FRAC_MASK,
    MIXER_FRAC_ONE,
};

pub(crate) use params::{calc_source_params, ListenerParams};
pub use props::{
    DirectMode, DistanceModel, FilterProps, SendProps, SpatializeMode, StereoMode, VoiceProps,
};

/// Samples per staging line: one block, the resampler padding and the UHJ
/// decoder's lookahead.
pub(crate) const MIXER_LINE_SIZE: usize = BUFFER_LINE_SIZE + MAX_RESAMPLER_PADDING + UHJ_FILTER_DELAY;

/// Most channels one voice mixes (third-order periphonic B-Format).
pub(crate) const MAX_VOICE_CHANNELS: usize = MAX_AMBI_CHANNELS;

/// Marks [`VoiceShared::buffer_index`] when the voice has no buffer.
pub(crate) const NO_BUFFER: u32 = u32::MAX;

/// Fade length used to settle the filters of a voice whose queue ran dry.
const END_FADE_SAMPLES: usize = 64;

const SILENT_TARGET: [f32; MAX_OUTPUT_CHANNELS] = [0.0; MAX_OUTPUT_CHANNELS];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PlayState {
    Stopped = 0,
    Playing = 1,
    /// Mixed one more block with silent targets, then stopped.
    Stopping = 2,
    /// Waiting for a restart command before it may be mixed.
    Pending = 3,
}

impl PlayState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlayState::Playing,
            2 => PlayState::Stopping,
            3 => PlayState::Pending,
            _ => PlayState::Stopped,
        }
    }
}

/// State both threads see. The mixer writes the position fields with
/// release stores at the end of each mix; the app reads them between mixes.
pub(crate) struct VoiceShared {
    play_state: AtomicU8,
    pub source_id: AtomicU32,
    pub position: AtomicU32,
    pub position_frac: AtomicU32,
    /// Queue index of the current buffer, counted from the play-time head.
    pub buffer_index: AtomicU32,
    /// Set while a command for this voice is in flight.
    pub pending_change: AtomicBool,
    pub looping: AtomicBool,
    pub props: PropsSlot<VoiceProps>,
}

impl VoiceShared {
    pub fn new() -> Self {
        Self {
            play_state: AtomicU8::new(PlayState::Stopped as u8),
            source_id: AtomicU32::new(0),
            position: AtomicU32::new(0),
            position_frac: AtomicU32::new(0),
            buffer_index: AtomicU32::new(NO_BUFFER),
            pending_change: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            props: PropsSlot::new(),
        }
    }

    pub fn play_state(&self) -> PlayState {
        PlayState::from_u8(self.play_state.load(Ordering::Acquire))
    }

    pub fn set_play_state(&self, state: PlayState) {
        self.play_state.store(state as u8, Ordering::Release);
    }

    /// Moves from `from` to `to` if the voice is still in `from`.
    pub fn transition(&self, from: PlayState, to: PlayState) -> bool {
        self.play_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True when no source owns the voice and nothing is in flight for it.
    pub fn is_free(&self) -> bool {
        self.play_state() == PlayState::Stopped
            && self.source_id.load(Ordering::Acquire) == 0
            && !self.pending_change.load(Ordering::Acquire)
    }
}

/// What a voice needs to begin playing a queue.
pub(crate) struct VoiceStart {
    pub queue: Arc<BufferQueueItem>,
    pub current: Arc<BufferQueueItem>,
    pub buffer_index: u32,
    pub position: u32,
    pub position_frac: u32,
    /// Starting part way in; fade the gains in from silence.
    pub fading: bool,
    /// A single buffer set directly on the source rather than queued.
    pub is_static: bool,
    /// First buffer with data. Every buffer of a queue shares its format.
    pub format: Arc<Buffer>,
    pub super_stereo: bool,
    /// Staging for callback buffers, `MIXER_LINE_SIZE` frames long.
    pub callback_data: Option<Box<[u8]>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChangeKind {
    Reset,
    Stop,
    Play,
    Pause,
    Restart,
}

/// A command posted by the app. `old_voice` is the voice handed off from
/// on restart or replay.
pub(crate) struct VoiceChange {
    pub voice: Option<usize>,
    pub old_voice: Option<usize>,
    pub source_id: u32,
    pub kind: ChangeKind,
    pub start: Option<VoiceStart>,
}

impl ChangeKind {
    pub fn event_state(self) -> SourceState {
        match self {
            ChangeKind::Reset => SourceState::Initial,
            ChangeKind::Stop => SourceState::Stopped,
            ChangeKind::Play | ChangeKind::Restart => SourceState::Playing,
            ChangeKind::Pause => SourceState::Paused,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub(crate) enum FilterType {
    #[default]
    None,
    LowPass,
    HighPass,
    BandPass,
}

impl FilterType {
    pub fn from_gains(gain_hf: f32, gain_lf: f32) -> Self {
        match (gain_hf != 1.0, gain_lf != 1.0) {
            (false, false) => FilterType::None,
            (true, false) => FilterType::LowPass,
            (false, true) => FilterType::HighPass,
            (true, true) => FilterType::BandPass,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
enum DecodeMode {
    #[default]
    None,
    Uhj,
    SuperStereo,
}

#[derive(Clone)]
pub(crate) struct HrtfParams {
    pub old: HrtfFilter,
    pub target: HrtfFilter,
    history: [f32; HRTF_HISTORY_LENGTH],
}

impl Default for HrtfParams {
    fn default() -> Self {
        Self {
            old: HrtfFilter::default(),
            target: HrtfFilter::default(),
            history: [0.0; HRTF_HISTORY_LENGTH],
        }
    }
}

#[derive(Clone)]
pub(crate) struct DirectParams {
    pub low_pass: Biquad,
    pub high_pass: Biquad,
    pub nfc: NfcFilter,
    pub hrtf: HrtfParams,
    pub current: [f32; MAX_OUTPUT_CHANNELS],
    pub target: [f32; MAX_OUTPUT_CHANNELS],
}

impl DirectParams {
    fn new(nfc: NfcFilter) -> Self {
        Self {
            low_pass: Biquad::new(),
            high_pass: Biquad::new(),
            nfc,
            hrtf: HrtfParams::default(),
            current: [0.0; MAX_OUTPUT_CHANNELS],
            target: [0.0; MAX_OUTPUT_CHANNELS],
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct SendParams {
    pub low_pass: Biquad,
    pub high_pass: Biquad,
    pub current: [f32; MAX_AMBI_CHANNELS],
    pub target: [f32; MAX_AMBI_CHANNELS],
}

impl Default for SendParams {
    fn default() -> Self {
        Self {
            low_pass: Biquad::new(),
            high_pass: Biquad::new(),
            current: [0.0; MAX_AMBI_CHANNELS],
            target: [0.0; MAX_AMBI_CHANNELS],
        }
    }
}

/// Per input channel state.
#[derive(Clone)]
pub(crate) struct ChannelState {
    prev_samples: [f32; MAX_RESAMPLER_PADDING],
    ambi_hf_scale: f32,
    ambi_lf_scale: f32,
    ambi_splitter: BandSplitter,
    pub dry: DirectParams,
    pub wet: [SendParams; MAX_SENDS],
}

impl ChannelState {
    fn new() -> Self {
        Self {
            prev_samples: [0.0; MAX_RESAMPLER_PADDING],
            ambi_hf_scale: 1.0,
            ambi_lf_scale: 1.0,
            ambi_splitter: BandSplitter::default(),
            dry: DirectParams::new(NfcFilter::default()),
            wet: [SendParams::default(); MAX_SENDS],
        }
    }

    fn reset(&mut self, nfc: NfcFilter) {
        self.prev_samples = [0.0; MAX_RESAMPLER_PADDING];
        self.dry = DirectParams::new(nfc);
        self.wet = [SendParams::default(); MAX_SENDS];
    }
}

/// Where the direct path goes and how it is filtered.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DirectTarget {
    pub filter: FilterType,
    /// Mix into the speaker bus instead of the dry bus.
    pub to_real: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SendTarget {
    pub slot: Option<usize>,
    pub filter: FilterType,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct VoiceFlags {
    pub fading: bool,
    pub is_static: bool,
    pub is_callback: bool,
    pub callback_stopped: bool,
    pub is_ambisonic: bool,
    pub has_hrtf: bool,
    pub has_nfc: bool,
}

/// Device-wide mixing scratch shared by every voice in turn.
pub(crate) struct VoiceScratch {
    lines: Vec<Vec<f32>>,
    resampled: Box<FloatBufferLine>,
    filtered: Box<FloatBufferLine>,
    nfc: Box<FloatBufferLine>,
    hrtf_source: Vec<f32>,
}

impl VoiceScratch {
    pub fn new() -> Self {
        Self {
            lines: vec![vec![0.0; MIXER_LINE_SIZE]; MAX_VOICE_CHANNELS],
            resampled: Box::new([0.0; BUFFER_LINE_SIZE]),
            filtered: Box::new([0.0; BUFFER_LINE_SIZE]),
            nfc: Box::new([0.0; BUFFER_LINE_SIZE]),
            hrtf_source: vec![0.0; HRTF_HISTORY_LENGTH + BUFFER_LINE_SIZE],
        }
    }
}

/// The buses a voice mixes into for one block.
pub(crate) struct MixOutput<'a> {
    pub dry: &'a mut [FloatBufferLine],
    /// The speaker bus, when it is separate from the dry bus.
    pub real: Option<&'a mut [FloatBufferLine]>,
    pub hrtf_accum: &'a mut [[f32; 2]],
    pub slots: &'a mut [SlotRenderer],
}

pub(crate) struct Voice {
    pub shared: Arc<VoiceShared>,
    /// Properties last applied by [`calc_source_params`].
    pub props: VoiceProps,

    pub frequency: u32,
    pub layout: ChannelLayout,
    sample_type: SampleType,
    /// Channels stored per frame in the buffer.
    stored_channels: usize,
    frame_size: usize,
    pub ambi_order: usize,
    pub ambi_layout: AmbiLayout,
    pub ambi_scaling: AmbiScaling,
    pub num_channels: usize,

    queue: Option<Arc<BufferQueueItem>>,
    current: Option<Arc<BufferQueueItem>>,
    buffer_index: u32,
    position: u32,
    position_frac: u32,

    pub step: u32,
    pub resampler: PreparedResampler,
    pub flags: VoiceFlags,

    num_callback_samples: usize,
    callback_data: Box<[u8]>,
    decode: DecodeMode,
    decoder: Box<UhjDecoder>,

    pub direct: DirectTarget,
    pub sends: [SendTarget; MAX_SENDS],
    pub chans: Vec<ChannelState>,
}

impl Voice {
    pub fn new(shared: Arc<VoiceShared>) -> Self {
        Self {
            shared,
            props: VoiceProps::default(),
            frequency: 0,
            layout: ChannelLayout::Mono,
            sample_type: SampleType::F32,
            stored_channels: 1,
            frame_size: 4,
            ambi_order: 0,
            ambi_layout: AmbiLayout::Acn,
            ambi_scaling: AmbiScaling::N3d,
            num_channels: 0,
            queue: None,
            current: None,
            buffer_index: NO_BUFFER,
            position: 0,
            position_frac: 0,
            step: 0,
            resampler: PreparedResampler::default(),
            flags: VoiceFlags::default(),
            num_callback_samples: 0,
            callback_data: Box::default(),
            decode: DecodeMode::None,
            decoder: Box::new(UhjDecoder::new()),
            direct: DirectTarget::default(),
            sends: [SendTarget::default(); MAX_SENDS],
            chans: vec![ChannelState::new(); MAX_VOICE_CHANNELS],
        }
    }

    /// Loads the queue and format from `start` and resets all filter state.
    pub fn start(&mut self, start: VoiceStart, device: &DeviceInfo) {
        let format = &start.format;
        self.layout = if start.super_stereo && format.layout() == ChannelLayout::Stereo {
            ChannelLayout::SuperStereo
        } else {
            format.layout()
        };
        self.frequency = format.frequency();
        self.sample_type = format.sample_type();
        self.stored_channels = format.channel_count();
        self.frame_size = format.frame_size();
        if format.layout().is_bformat() {
            self.ambi_order = format.ambi_order() as usize;
            self.ambi_layout = format.ambi_layout();
            self.ambi_scaling = format.ambi_scaling();
        } else if self.layout.is_uhj() {
            self.ambi_order = 1;
            self.ambi_layout = AmbiLayout::FuMa;
            self.ambi_scaling = AmbiScaling::Uhj;
        } else {
            self.ambi_order = 0;
            self.ambi_layout = AmbiLayout::Acn;
            self.ambi_scaling = AmbiScaling::N3d;
        }

        self.queue = Some(start.queue);
        self.current = Some(start.current);
        self.buffer_index = start.buffer_index;
        self.position = start.position;
        self.position_frac = start.position_frac;

        self.flags = VoiceFlags {
            fading: start.fading,
            is_static: start.is_static,
            is_callback: format.is_callback(),
            ..VoiceFlags::default()
        };
        self.num_callback_samples = 0;
        if let Some(data) = start.callback_data {
            self.callback_data = data;
        }

        self.shared.position.store(self.position, Ordering::Relaxed);
        self.shared.position_frac.store(self.position_frac, Ordering::Relaxed);
        self.shared.buffer_index.store(self.buffer_index, Ordering::Release);

        self.prepare(device);
    }

    /// Drops the buffer references. The voice produces silence afterwards.
    pub fn clear_buffers(&mut self) {
        self.current = None;
        self.queue = None;
        self.shared.buffer_index.store(NO_BUFFER, Ordering::Release);
    }

    fn prepare(&mut self, device: &DeviceInfo) {
        let dev_order = device.ambi_order;
        let is_2d = matches!(
            self.layout,
            ChannelLayout::BFormat2D | ChannelLayout::Uhj2 | ChannelLayout::Uhj3 | ChannelLayout::SuperStereo
        );
        self.num_channels = match self.layout {
            ChannelLayout::Uhj2 | ChannelLayout::SuperStereo => 3,
            layout => layout.channel_count(self.ambi_order.min(dev_order) as u32),
        }
        .min(MAX_VOICE_CHANNELS);

        self.decode = match self.layout {
            ChannelLayout::SuperStereo => DecodeMode::SuperStereo,
            l if l.is_uhj() => DecodeMode::Uhj,
            _ => DecodeMode::None,
        };
        if self.decode != DecodeMode::None {
            self.decoder.reset();
        }
        self.step = 0;

        // Two-channel UHJ loses some low end, so those channels get a
        // matching LF boost when decoded.
        const UHJ2_LF_SCALES: [f32; 3] = [0.661, 1.293, 1.293];
        let chans = &mut self.chans[..self.num_channels];
        if self.ambi_order > 0 && dev_order > self.ambi_order {
            let order_of: &[u8] = if is_2d { &ORDER_FROM_2D_CHANNEL } else { &ORDER_FROM_CHANNEL };
            let scales = hf_order_scales(self.ambi_order, dev_order);
            let splitter = BandSplitter::new(device.xover_freq / device.frequency as f32);
            for (i, chan) in chans.iter_mut().enumerate() {
                chan.ambi_hf_scale = scales[order_of[i] as usize];
                chan.ambi_lf_scale = 1.0;
                chan.ambi_splitter = splitter;
                chan.reset(device.nfc_filter);
            }
            if self.layout == ChannelLayout::Uhj2 {
                for (chan, &lf) in chans.iter_mut().zip(&UHJ2_LF_SCALES) {
                    chan.ambi_lf_scale = lf;
                }
            }
            self.flags.is_ambisonic = true;
        } else if self.layout == ChannelLayout::Uhj2 && !device.uhj_encoder {
            let splitter = BandSplitter::new(device.xover_freq / device.frequency as f32);
            for (chan, &lf) in chans.iter_mut().zip(&UHJ2_LF_SCALES) {
                chan.ambi_hf_scale = 1.0;
                chan.ambi_lf_scale = lf;
                chan.ambi_splitter = splitter;
                chan.reset(device.nfc_filter);
            }
            self.flags.is_ambisonic = true;
        } else {
            for chan in chans.iter_mut() {
                chan.reset(device.nfc_filter);
            }
            self.flags.is_ambisonic = false;
        }
    }

    pub fn has_buffer(&self) -> bool {
        self.current.is_some()
    }

    pub fn set_decoder_width(&mut self, width: f32) {
        self.decoder.set_width(width);
    }

    /// Mixes `samples_to_do` frames. `state` is the play state read at the
    /// start of the block; a `Stopping` voice mixes toward silence and then
    /// stops.
    pub fn mix(
        &mut self,
        state: PlayState,
        device: &DeviceInfo,
        out: &mut MixOutput<'_>,
        scratch: &mut VoiceScratch,
        events: &mut EventSender,
        samples_to_do: usize,
    ) {
        let increment = self.step;
        if increment < 1 {
            // Nothing advances without a step, and a stopping voice simply
            // ends.
            if state == PlayState::Stopping {
                self.shared.set_play_state(PlayState::Stopped);
            }
            return;
        }
        let playing = state == PlayState::Playing;
        let loop_item = if self.shared.looping.load(Ordering::Acquire) {
            self.queue.clone()
        } else {
            None
        };

        let resampler = if increment == MIXER_FRAC_ONE && self.position_frac == 0 {
            PreparedResampler::copy()
        } else {
            self.resampler
        };

        let num_chans = self.num_channels;
        let mut counter = if self.flags.fading { samples_to_do } else { 0 };
        if counter == 0 {
            // Starting fresh: jump straight to the targets.
            for chan in self.chans[..num_chans].iter_mut() {
                if self.flags.has_hrtf {
                    chan.dry.hrtf.old.clone_from(&chan.dry.hrtf.target);
                } else {
                    chan.dry.current = chan.dry.target;
                }
                for (wet, send) in chan.wet.iter_mut().zip(&self.sends) {
                    if send.slot.is_some() {
                        wet.current = wet.target;
                    }
                }
            }
        } else if self.current.is_none() {
            counter = counter.min(END_FADE_SAMPLES);
        }

        let post_padding = MAX_RESAMPLER_EDGE
            + if self.decode != DecodeMode::None {
                UHJ_FILTER_DELAY
            } else {
                0
            };

        let mut pos = self.position as usize;
        let mut frac = self.position_frac;
        let mut buffer_index = self.buffer_index;
        let mut buffers_done = 0u32;
        let mut out_pos = 0usize;

        loop {
            let mut dst_size = samples_to_do - out_pos;
            let mut src_size;
            if increment <= MIXER_FRAC_ONE {
                src_size = ((((dst_size - 1) as u64 * increment as u64 + frac as u64)
                    >> MIXER_FRAC_BITS) as usize)
                    + 1
                    + post_padding;
            } else {
                src_size = (((dst_size as u64 * increment as u64 + frac as u64) >> MIXER_FRAC_BITS)
                    as usize)
                    + post_padding;
                let limit = MIXER_LINE_SIZE - MAX_RESAMPLER_EDGE;
                if src_size > limit {
                    // Too many input samples for one pass; cut this pass to
                    // what fits and come back for the rest.
                    src_size = limit;
                    let fit = ((((src_size - post_padding) as u64) << MIXER_FRAC_BITS)
                        - frac as u64)
                        / increment as u64;
                    if (fit as usize) < dst_size {
                        dst_size = fit as usize & !3;
                        if state == PlayState::Stopping {
                            counter = counter.min(dst_size);
                        }
                    }
                }
            }
            let src_offset =
                ((increment as u64 * dst_size as u64 + frac as u64) >> MIXER_FRAC_BITS) as usize;

            let lines = &mut scratch.lines[..num_chans];
            match self.current.as_ref() {
                None => {
                    let end = MAX_RESAMPLER_EDGE + src_size - post_padding + MAX_RESAMPLER_EDGE;
                    for (chan, line) in self.chans.iter_mut().zip(lines.iter_mut()) {
                        line[..MAX_RESAMPLER_PADDING].copy_from_slice(&chan.prev_samples);
                        // Hold the quietest recent sample so an early end
                        // fades out cleanly.
                        let mut quietest = MAX_RESAMPLER_EDGE;
                        for i in MAX_RESAMPLER_EDGE..MAX_RESAMPLER_PADDING {
                            if line[i].abs() < line[quietest].abs() {
                                quietest = i;
                            }
                        }
                        let hold = line[quietest];
                        line[quietest + 1..end].fill(hold);
                        chan.prev_samples
                            .copy_from_slice(&line[src_offset..src_offset + MAX_RESAMPLER_PADDING]);
                    }
                }
                Some(item) => {
                    for (chan, line) in self.chans.iter().zip(lines.iter_mut()) {
                        line[..MAX_RESAMPLER_EDGE]
                            .copy_from_slice(&chan.prev_samples[..MAX_RESAMPLER_EDGE]);
                    }
                    let format = SampleFormat {
                        layout: self.layout,
                        stored: self.stored_channels,
                        kind: self.sample_type,
                    };
                    if self.flags.is_static {
                        load_static(lines, format, item, loop_item.is_some(), pos, src_size);
                    } else if self.flags.is_callback {
                        if !self.flags.callback_stopped && src_size > self.num_callback_samples {
                            let offset = self.num_callback_samples * self.frame_size;
                            let need = src_size * self.frame_size - offset;
                            let got = match (&item.buffer.data, self.callback_data.get_mut(offset..offset + need)) {
                                (BufferData::Callback(callback), Some(staging)) => match callback.lock() {
                                    Ok(mut callback) => callback.fill(staging),
                                    Err(_) => -1,
                                },
                                _ => -1,
                            };
                            if got < 0 {
                                self.flags.callback_stopped = true;
                            } else if (got as usize) < need {
                                self.flags.callback_stopped = true;
                                self.num_callback_samples += got as usize / self.frame_size;
                            } else {
                                self.num_callback_samples = src_size;
                            }
                        }
                        let available = src_size.min(self.num_callback_samples);
                        load_frames(lines, MAX_RESAMPLER_EDGE, &self.callback_data, 0, format, available);
                        fill_tail(lines, MAX_RESAMPLER_EDGE + available, MAX_RESAMPLER_EDGE + src_size);
                    } else {
                        load_queue(lines, format, item, loop_item.as_ref(), pos, src_size);
                    }

                    match self.decode {
                        DecodeMode::None => {}
                        mode => {
                            let decode_size = src_size - post_padding + MAX_RESAMPLER_EDGE;
                            let forward = if playing { src_offset } else { 0 };
                            if mode == DecodeMode::SuperStereo {
                                self.decoder.decode_stereo(lines, MAX_RESAMPLER_EDGE, decode_size, forward);
                            } else {
                                self.decoder.decode(lines, MAX_RESAMPLER_EDGE, decode_size, forward);
                            }
                        }
                    }
                    if playing {
                        for (chan, line) in self.chans.iter_mut().zip(lines.iter()) {
                            chan.prev_samples
                                .copy_from_slice(&line[src_offset..src_offset + MAX_RESAMPLER_PADDING]);
                        }
                    }
                }
            }

            let resampled = &mut scratch.resampled[..dst_size];
            for (chan, line) in self.chans[..num_chans].iter_mut().zip(scratch.lines.iter()) {
                resampler.resample(line, frac, increment, resampled);
                if self.flags.is_ambisonic {
                    chan.ambi_splitter
                        .process_scale(resampled, chan.ambi_hf_scale, chan.ambi_lf_scale);
                }

                {
                    let dry = &mut chan.dry;
                    let samples = apply_filters(
                        &mut dry.low_pass,
                        &mut dry.high_pass,
                        &mut scratch.filtered[..dst_size],
                        resampled,
                        self.direct.filter,
                    );
                    if self.flags.has_hrtf {
                        let target_gain = if playing { dry.hrtf.target.gain } else { 0.0 };
                        hrtf_mix(
                            samples,
                            &mut dry.hrtf,
                            target_gain,
                            counter,
                            out_pos,
                            playing,
                            device.ir_size,
                            &mut scratch.hrtf_source,
                            out.hrtf_accum,
                        );
                    } else {
                        let target = if playing { dry.target } else { SILENT_TARGET };
                        let buffer: &mut [FloatBufferLine] = match (self.direct.to_real, out.real.as_deref_mut()) {
                            (true, Some(real)) => real,
                            _ => &mut *out.dry,
                        };
                        if self.flags.has_nfc {
                            nfc_mix(
                                samples,
                                buffer,
                                dry,
                                &target,
                                counter,
                                out_pos,
                                &device.num_channels_per_order,
                                &mut scratch.nfc[..dst_size],
                            );
                        } else {
                            let count = buffer.len().min(MAX_OUTPUT_CHANNELS);
                            mix(
                                samples,
                                &mut buffer[..count],
                                &mut dry.current[..count],
                                &target[..count],
                                counter,
                                out_pos,
                            );
                        }
                    }
                }

                for (wet, send) in chan.wet.iter_mut().zip(&self.sends) {
                    let Some(slot_index) = send.slot else {
                        continue;
                    };
                    let Some(slot) = out.slots.get_mut(slot_index) else {
                        continue;
                    };
                    let samples = apply_filters(
                        &mut wet.low_pass,
                        &mut wet.high_pass,
                        &mut scratch.filtered[..dst_size],
                        resampled,
                        send.filter,
                    );
                    let target: &[f32] = if playing { &wet.target } else { &SILENT_TARGET[..MAX_AMBI_CHANNELS] };
                    let count = slot.wet.len().min(MAX_AMBI_CHANNELS);
                    mix(
                        samples,
                        &mut slot.wet[..count],
                        &mut wet.current[..count],
                        &target[..count],
                        counter,
                        out_pos,
                    );
                }
            }

            if state == PlayState::Stopping {
                break;
            }

            frac += increment * dst_size as u32;
            let src_done = (frac >> MIXER_FRAC_BITS) as usize;
            pos += src_done;
            frac &= MIXER_FRAC_MASK;

            out_pos += dst_size;
            counter = counter.max(dst_size) - dst_size;

            if let Some(item) = self.current.as_ref() {
                if self.flags.is_static {
                    let buffer = &item.buffer;
                    if loop_item.is_some() {
                        let (start, end) = (buffer.loop_start() as usize, buffer.loop_end() as usize);
                        if pos >= end && end > start {
                            pos = (pos - start) % (end - start) + start;
                        }
                    } else if pos >= buffer.sample_len() as usize {
                        self.current = None;
                        break;
                    }
                } else if self.flags.is_callback {
                    if src_done < self.num_callback_samples {
                        let offset = src_done * self.frame_size;
                        let end = self.num_callback_samples * self.frame_size;
                        self.callback_data.copy_within(offset..end, 0);
                        self.num_callback_samples -= src_done;
                    } else {
                        self.current = None;
                        self.num_callback_samples = 0;
                    }
                } else {
                    while let Some(item) = self.current.as_ref() {
                        let len = item.buffer.sample_len() as usize;
                        if len > pos {
                            break;
                        }
                        pos -= len;
                        buffers_done += 1;
                        let next = match item.next() {
                            Some(next) => {
                                buffer_index = buffer_index.wrapping_add(1);
                                Some(next.clone())
                            }
                            None => {
                                buffer_index = 0;
                                loop_item.clone()
                            }
                        };
                        self.current = next;
                    }
                }
            }

            if out_pos >= samples_to_do {
                break;
            }
        }

        self.flags.fading = true;

        if state == PlayState::Stopping {
            self.shared.set_play_state(PlayState::Stopped);
            return;
        }

        let source_id = self.shared.source_id.load(Ordering::Relaxed);
        self.position = pos as u32;
        self.position_frac = frac;
        self.buffer_index = if self.current.is_some() { buffer_index } else { NO_BUFFER };
        self.shared.position.store(self.position, Ordering::Relaxed);
        self.shared.position_frac.store(frac, Ordering::Relaxed);
        self.shared.buffer_index.store(self.buffer_index, Ordering::Relaxed);
        if self.current.is_none() {
            self.queue = None;
            self.shared.source_id.store(0, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);

        if buffers_done > 0 && events.is_enabled(EVENT_BUFFER_COMPLETED) {
            let _ = events.send(Event::BufferCompleted {
                id: source_id,
                count: buffers_done,
            });
        }

        if self.current.is_none() {
            // Mix one more block toward silence so the filters settle.
            self.shared.set_play_state(PlayState::Stopping);
            if events.is_enabled(EVENT_SOURCE_STATE) {
                let _ = events.send(Event::SourceStateChange {
                    id: source_id,
                    state: SourceState::Stopped,
                });
            }
        }
    }
}

#[derive(Clone, Copy)]
struct SampleFormat {
    layout: ChannelLayout,
    stored: usize,
    kind: SampleType,
}

/// Decodes `count` frames starting at frame `src_frame` of `src` into each
/// line at `dst`. Two-channel UHJ and super stereo fill lines 0 and 1 and
/// clear line 2 for the decoder.
fn load_frames(
    lines: &mut [Vec<f32>],
    dst: usize,
    src: &[u8],
    src_frame: usize,
    format: SampleFormat,
    count: usize,
) {
    if count == 0 {
        return;
    }
    let frame_size = format.stored * format.kind.bytes();
    let start = (src_frame * frame_size).min(src.len());
    let src = &src[start..];
    match format.layout {
        ChannelLayout::Uhj2 | ChannelLayout::SuperStereo => {
            for (c, line) in lines.iter_mut().take(2).enumerate() {
                load_samples(&mut line[dst..dst + count], src, c, 2, format.kind);
            }
            if let Some(line) = lines.get_mut(2) {
                line[dst..dst + count].fill(0.0);
            }
        }
        _ => {
            for (c, line) in lines.iter_mut().enumerate() {
                load_samples(&mut line[dst..dst + count], src, c, format.stored, format.kind);
            }
        }
    }
}

/// Repeats the sample before `from` up to `to` on every line.
fn fill_tail(lines: &mut [Vec<f32>], from: usize, to: usize) {
    if from >= to {
        return;
    }
    for line in lines.iter_mut() {
        let last = line[from - 1];
        line[from..to].fill(last);
    }
}

fn load_static(
    lines: &mut [Vec<f32>],
    format: SampleFormat,
    item: &BufferQueueItem,
    looping: bool,
    pos: usize,
    count: usize,
) {
    let buffer = &item.buffer;
    let data = buffer.bytes();
    let (loop_start, loop_end) = (buffer.loop_start() as usize, buffer.loop_end() as usize);
    let base = MAX_RESAMPLER_EDGE;

    if !looping || pos >= loop_end || loop_end <= loop_start {
        let remaining = count.min((buffer.sample_len() as usize).saturating_sub(pos));
        load_frames(lines, base, data, pos, format, remaining);
        fill_tail(lines, base + remaining, base + count);
        return;
    }

    let first = count.min(loop_end - pos);
    load_frames(lines, base, data, pos, format, first);
    let loop_size = loop_end - loop_start;
    let mut loaded = first;
    while loaded < count {
        let chunk = (count - loaded).min(loop_size);
        load_frames(lines, base + loaded, data, loop_start, format, chunk);
        loaded += chunk;
    }
}

fn load_queue(
    lines: &mut [Vec<f32>],
    format: SampleFormat,
    start: &Arc<BufferQueueItem>,
    loop_item: Option<&Arc<BufferQueueItem>>,
    mut pos: usize,
    count: usize,
) {
    let base = MAX_RESAMPLER_EDGE;
    let mut item = Some(start);
    let mut loaded = 0;
    while let Some(cur) = item {
        if loaded >= count {
            break;
        }
        let len = cur.buffer.sample_len() as usize;
        if pos >= len {
            pos -= len;
            item = cur.next().or(loop_item);
            continue;
        }
        let chunk = (count - loaded).min(len - pos);
        load_frames(lines, base + loaded, cur.buffer.bytes(), pos, format, chunk);
        loaded += chunk;
        pos = 0;
        item = cur.next().or(loop_item);
    }
    fill_tail(lines, base + loaded, base + count);
}

/// Runs the shelf pair selected by `kind`, returning the filtered samples.
fn apply_filters<'a>(
    low_pass: &mut Biquad,
    high_pass: &mut Biquad,
    dst: &'a mut [f32],
    src: &'a [f32],
    kind: FilterType,
) -> &'a [f32] {
    match kind {
        FilterType::None => {
            low_pass.clear();
            high_pass.clear();
            src
        }
        FilterType::LowPass => {
            low_pass.process(src, dst);
            high_pass.clear();
            dst
        }
        FilterType::HighPass => {
            low_pass.clear();
            high_pass.process(src, dst);
            dst
        }
        FilterType::BandPass => {
            low_pass.dual_process(high_pass, src, dst);
            dst
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn hrtf_mix(
    samples: &[f32],
    hrtf: &mut HrtfParams,
    target_gain: f32,
    counter: usize,
    mut out_pos: usize,
    playing: bool,
    ir_size: usize,
    source: &mut [f32],
    accum: &mut [[f32; 2]],
) {
    let n = samples.len();
    source[..HRTF_HISTORY_LENGTH].copy_from_slice(&hrtf.history);
    source[HRTF_HISTORY_LENGTH..HRTF_HISTORY_LENGTH + n].copy_from_slice(samples);
    if playing {
        hrtf.history.copy_from_slice(&source[n..n + HRTF_HISTORY_LENGTH]);
    }

    // A change of coefficients cross-fades from the old filter over the
    // first part of the block.
    let mut fade_len = 0;
    if counter > 0 && out_pos == 0 {
        fade_len = n.min(counter);
        let gain = if counter > fade_len {
            lerpf(hrtf.old.gain, target_gain, fade_len as f32 / counter as f32)
        } else {
            target_gain
        };
        let params = MixHrtfFilter {
            coeffs: &hrtf.target.coeffs,
            delay: hrtf.target.delay,
            gain: 0.0,
            gain_step: gain / fade_len as f32,
        };
        mix_hrtf_blend(source, &mut accum[out_pos..], ir_size, &hrtf.old, &params, fade_len);
        hrtf.old.clone_from(&hrtf.target);
        hrtf.old.gain = gain;
        out_pos += fade_len;
    }

    if fade_len < n {
        let todo = n - fade_len;
        let gain = if counter > n {
            lerpf(hrtf.old.gain, target_gain, todo as f32 / (counter - fade_len) as f32)
        } else {
            target_gain
        };
        let params = MixHrtfFilter {
            coeffs: &hrtf.target.coeffs,
            delay: hrtf.target.delay,
            gain: hrtf.old.gain,
            gain_step: (gain - hrtf.old.gain) / todo as f32,
        };
        mix_hrtf(&source[fade_len..], &mut accum[out_pos..], ir_size, &params, todo);
        hrtf.old.gain = gain;
    }
}

#[allow(clippy::too_many_arguments)]
fn nfc_mix(
    samples: &[f32],
    out: &mut [FloatBufferLine],
    params: &mut DirectParams,
    target: &[f32; MAX_OUTPUT_CHANNELS],
    counter: usize,
    out_pos: usize,
    channels_per_order: &[usize; MAX_AMBI_ORDER + 1],
    temp: &mut [f32],
) {
    // W has no near-field term.
    mix(samples, &mut out[..1], &mut params.current[..1], &target[..1], counter, out_pos);
    let mut chan = 1;
    for (order, &count) in channels_per_order.iter().enumerate().skip(1) {
        if count == 0 {
            break;
        }
        let end = (chan + count).min(out.len());
        params.nfc.process_order(order, samples, temp);
        mix(
            temp,
            &mut out[chan..end],
            &mut params.current[chan..end],
            &target[chan..end],
            counter,
            out_pos,
        );
        chan = end;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32 as TestAtomic;

    use super::*;
    use crate::audio::new_lines;
    use crate::events::{event_queue, EventReceiver, EVENT_ALL};
    use crate::resampler::Resampler;

    fn events() -> (EventSender, EventReceiver) {
        event_queue(16, Arc::new(TestAtomic::new(EVENT_ALL)))
    }

    fn start_for(buffers: &[Arc<Buffer>], is_static: bool) -> VoiceStart {
        let queue = BufferQueueItem::chain(buffers).unwrap();
        VoiceStart {
            current: queue.clone(),
            queue,
            buffer_index: 0,
            position: 0,
            position_frac: 0,
            fading: false,
            is_static,
            format: buffers[0].clone(),
            super_stereo: false,
            callback_data: None,
        }
    }

    /// A mono voice at unit step panned fully into channel 0 of the dry bus.
    fn unit_voice(device: &DeviceInfo, start: VoiceStart) -> Voice {
        let mut voice = Voice::new(Arc::new(VoiceShared::new()));
        voice.start(start, device);
        voice.step = MIXER_FRAC_ONE;
        voice.resampler = Resampler::Point.prepare(MIXER_FRAC_ONE);
        voice.chans[0].dry.target[0] = 1.0;
        voice.shared.source_id.store(7, Ordering::Relaxed);
        voice.shared.set_play_state(PlayState::Playing);
        voice
    }

    fn render(voice: &mut Voice, device: &DeviceInfo, tx: &mut EventSender, n: usize) -> Vec<FloatBufferLine> {
        let mut dry = new_lines(device.dry.num_channels());
        let mut accum = vec![[0.0f32; 2]; BUFFER_LINE_SIZE + crate::hrtf::HRIR_LENGTH];
        let mut scratch = VoiceScratch::new();
        let mut out = MixOutput {
            dry: &mut dry,
            real: None,
            hrtf_accum: &mut accum,
            slots: &mut [],
        };
        let state = voice.shared.play_state();
        voice.mix(state, device, &mut out, &mut scratch, tx, n);
        dry
    }

    fn ramp(len: usize) -> Arc<Buffer> {
        let samples: Vec<f32> = (0..len).map(|i| (i + 1) as f32 / len as f32).collect();
        Arc::new(Buffer::from_f32(48000, ChannelLayout::Mono, &samples).unwrap())
    }

    #[test]
    fn unit_step_copies_the_buffer() {
        let device = DeviceInfo::for_tests(48000);
        let buffer = ramp(256);
        let mut voice = unit_voice(&device, start_for(&[buffer], true));
        let (mut tx, _rx) = events();
        let out = render(&mut voice, &device, &mut tx, 128);
        for i in 0..128 {
            let expected = (i + 1) as f32 / 256.0;
            assert!((out[0][i] - expected).abs() < 1e-6, "sample {}: {}", i, out[0][i]);
        }
        assert!(out[1].iter().all(|&s| s == 0.0));
        assert_eq!(voice.shared.position.load(Ordering::Relaxed), 128);
        assert_eq!(voice.shared.play_state(), PlayState::Playing);
    }

    #[test]
    fn static_end_stops_and_reports() {
        let device = DeviceInfo::for_tests(48000);
        let mut voice = unit_voice(&device, start_for(&[ramp(100)], true));
        let (mut tx, mut rx) = events();
        let out = render(&mut voice, &device, &mut tx, 256);
        assert!((out[0][99] - 1.0).abs() < 1e-6);
        assert!(!voice.has_buffer());
        assert_eq!(voice.shared.play_state(), PlayState::Stopping);
        assert_eq!(voice.shared.source_id.load(Ordering::Relaxed), 0);
        tx.signal();
        let evs = rx.poll();
        assert!(matches!(
            evs.as_slice(),
            [Event::SourceStateChange { id: 7, state: SourceState::Stopped }]
        ));

        // The settling block ends the voice.
        render(&mut voice, &device, &mut tx, 256);
        assert_eq!(voice.shared.play_state(), PlayState::Stopped);
    }

    #[test]
    fn looping_static_wraps_at_loop_end() {
        let device = DeviceInfo::for_tests(48000);
        let samples: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let buffer = Arc::new(
            Buffer::from_f32(48000, ChannelLayout::Mono, &samples)
                .unwrap()
                .with_loop_points(16, 32)
                .unwrap(),
        );
        let mut voice = unit_voice(&device, start_for(&[buffer], true));
        voice.shared.looping.store(true, Ordering::Relaxed);
        let (mut tx, _rx) = events();
        let out = render(&mut voice, &device, &mut tx, 64);
        assert_eq!(out[0][31], 31.0);
        assert_eq!(out[0][32], 16.0);
        assert_eq!(out[0][48], 16.0);
        // 64 wraps back to 16 + (64 - 16) % 16.
        assert_eq!(voice.shared.position.load(Ordering::Relaxed), 16);
        assert!(voice.has_buffer());
    }

    #[test]
    fn queue_advances_and_counts_completed_buffers() {
        let device = DeviceInfo::for_tests(48000);
        let a = Arc::new(Buffer::from_f32(48000, ChannelLayout::Mono, &[0.25; 40]).unwrap());
        let b = Arc::new(Buffer::from_f32(48000, ChannelLayout::Mono, &[0.5; 40]).unwrap());
        let c = Arc::new(Buffer::from_f32(48000, ChannelLayout::Mono, &[0.75; 400]).unwrap());
        let mut voice = unit_voice(&device, start_for(&[a, b, c], false));
        let (mut tx, mut rx) = events();
        let out = render(&mut voice, &device, &mut tx, 100);
        assert_eq!(out[0][39], 0.25);
        assert_eq!(out[0][40], 0.5);
        assert_eq!(out[0][80], 0.75);
        assert_eq!(voice.shared.buffer_index.load(Ordering::Relaxed), 2);
        assert_eq!(voice.shared.position.load(Ordering::Relaxed), 20);
        tx.signal();
        assert!(matches!(rx.poll().as_slice(), [Event::BufferCompleted { id: 7, count: 2 }]));
    }

    #[test]
    fn silent_targets_leave_the_bus_untouched() {
        let device = DeviceInfo::for_tests(48000);
        let mut voice = unit_voice(&device, start_for(&[ramp(512)], true));
        voice.chans[0].dry.target = [0.0; MAX_OUTPUT_CHANNELS];
        let (mut tx, _rx) = events();
        let out = render(&mut voice, &device, &mut tx, 256);
        assert!(out.iter().all(|line| line.iter().all(|&s| s == 0.0)));
    }

    struct Counting {
        remaining: usize,
    }

    impl crate::audio::BufferCallback for Counting {
        fn fill(&mut self, dst: &mut [u8]) -> isize {
            let frames = (dst.len() / 4).min(self.remaining);
            for frame in dst.chunks_exact_mut(4).take(frames) {
                frame.copy_from_slice(&0.5f32.to_ne_bytes());
            }
            self.remaining -= frames;
            (frames * 4) as isize
        }
    }

    #[test]
    fn short_callback_read_plays_out_then_stops() {
        let device = DeviceInfo::for_tests(48000);
        let buffer = Arc::new(
            Buffer::from_callback(48000, SampleType::F32, ChannelLayout::Mono, Box::new(Counting { remaining: 300 }))
                .unwrap(),
        );
        let mut start = start_for(&[buffer], false);
        start.callback_data = Some(vec![0u8; MIXER_LINE_SIZE * 4].into_boxed_slice());
        let mut voice = unit_voice(&device, start);
        let (mut tx, _rx) = events();

        // The first block pulls 280 frames (block plus padding) and keeps the
        // 24 it did not consume.
        let out = render(&mut voice, &device, &mut tx, 256);
        assert!(out[0][..256].iter().all(|&s| s == 0.5));
        assert!(!voice.flags.callback_stopped);
        assert!(voice.has_buffer());

        // Only 20 more frames come before the stream runs dry.
        let out = render(&mut voice, &device, &mut tx, 256);
        assert_eq!(out[0][43], 0.5);
        assert!(voice.flags.callback_stopped);
        assert!(!voice.has_buffer());
        assert_eq!(voice.shared.play_state(), PlayState::Stopping);
    }

    #[test]
    fn zero_step_stopping_voice_just_stops() {
        let device = DeviceInfo::for_tests(48000);
        let mut voice = unit_voice(&device, start_for(&[ramp(64)], true));
        voice.step = 0;
        voice.shared.set_play_state(PlayState::Stopping);
        let (mut tx, _rx) = events();
        render(&mut voice, &device, &mut tx, 64);
        assert_eq!(voice.shared.play_state(), PlayState::Stopped);
    }

    #[test]
    fn filter_type_follows_the_shelf_gains() {
        assert_eq!(FilterType::from_gains(1.0, 1.0), FilterType::None);
        assert_eq!(FilterType::from_gains(0.5, 1.0), FilterType::LowPass);
        assert_eq!(FilterType::from_gains(1.0, 0.2), FilterType::HighPass);
        assert_eq!(FilterType::from_gains(0.5, 0.2), FilterType::BandPass);
    }

    #[test]
    fn first_order_voice_upsamples_on_a_higher_order_bus() {
        let mut device = DeviceInfo::for_tests(48000);
        device.ambi_order = 2;
        let buffer = Arc::new(
            Buffer::new_ambisonic(
                48000,
                SampleType::F32,
                ChannelLayout::BFormat3D,
                1,
                AmbiLayout::Acn,
                AmbiScaling::N3d,
                vec![0u8; 4 * 4 * 16],
            )
            .unwrap(),
        );
        let mut voice = Voice::new(Arc::new(VoiceShared::new()));
        voice.start(start_for(&[buffer], true), &device);
        assert_eq!(voice.num_channels, 4);
        assert!(voice.flags.is_ambisonic);
        // W is boosted to match the second-order decoder's rE weighting.
        assert!(voice.chans[0].ambi_hf_scale > 1.0);
        assert_eq!(voice.chans[1].ambi_hf_scale, 1.0);
    }
}
