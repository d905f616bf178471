//! Contexts: a listener, its sources and its effect slots.
//!
//! [`Context`] is the application's handle. It never touches mixer state
//! directly; property changes go through [`PropsSlot`]s and playback
//! commands through a ring of [`VoiceChange`]s that the mixer side
//! ([`ContextRenderer`]) drains at the start of every block.

mod renderer;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rtrb::{Producer, PushError, RingBuffer};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::audio::{Buffer, BufferQueueItem, AIR_ABSORB_GAIN_HF, SPEED_OF_SOUND_METERS_PER_SEC};
use crate::device::{DeviceInfo, DeviceShared};
use crate::effect_slot::{EffectSlot, EffectSlotProps, SlotId, SlotShared};
use crate::error::{MixerError, Result};
use crate::events::{event_queue, Event, EventReceiver, SourceState, EVENT_ALL};
use crate::props::PropsSlot;
use crate::resampler::MIXER_FRAC_ONE;
use crate::voice::{
    ChangeKind, DistanceModel, StereoMode, VoiceChange, VoiceProps, VoiceShared,
    VoiceStart, MIXER_LINE_SIZE, NO_BUFFER,
};

pub(crate) use renderer::ContextRenderer;

/// Commands the app can have in flight before the mixer catches up.
const MIN_CHANGE_QUEUE_SIZE: usize = 256;

/// Listener and world properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextProps {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub orient_at: [f32; 3],
    pub orient_up: [f32; 3],
    pub gain: f32,
    pub meters_per_unit: f32,
    pub air_absorption_gain_hf: f32,
    pub doppler_factor: f32,
    pub doppler_velocity: f32,
    pub speed_of_sound: f32,
    /// Let each source pick its own distance model.
    pub source_distance_model: bool,
    pub distance_model: DistanceModel,
}

impl Default for ContextProps {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            velocity: [0.0; 3],
            orient_at: [0.0, 0.0, -1.0],
            orient_up: [0.0, 1.0, 0.0],
            gain: 1.0,
            meters_per_unit: 1.0,
            air_absorption_gain_hf: AIR_ABSORB_GAIN_HF,
            doppler_factor: 1.0,
            doppler_velocity: 1.0,
            speed_of_sound: SPEED_OF_SOUND_METERS_PER_SEC,
            source_distance_model: false,
            distance_model: DistanceModel::InverseClamped,
        }
    }
}

impl ContextProps {
    pub fn validate(&self) -> Result<()> {
        let vectors = [self.position, self.velocity, self.orient_at, self.orient_up];
        if !vectors.iter().flatten().all(|v| v.is_finite()) {
            return Err(MixerError::InvalidValue("listener vector is not finite".into()));
        }
        let checks = [
            (self.gain >= 0.0 && self.gain.is_finite(), "listener gain"),
            (self.meters_per_unit >= f32::MIN_POSITIVE && self.meters_per_unit.is_finite(), "meters per unit"),
            ((0.0..=1.0).contains(&self.air_absorption_gain_hf), "air absorption gain"),
            (self.doppler_factor >= 0.0 && self.doppler_factor.is_finite(), "doppler factor"),
            (self.doppler_velocity > 0.0 && self.doppler_velocity.is_finite(), "doppler velocity"),
            (self.speed_of_sound > 0.0 && self.speed_of_sound.is_finite(), "speed of sound"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, name)) => Err(MixerError::InvalidValue(format!("{} out of range", name))),
            None => Ok(()),
        }
    }
}

pub(crate) struct ContextShared {
    pub props: PropsSlot<ContextProps>,
    /// While set the mixer leaves pending properties alone.
    pub hold: AtomicBool,
}

/// A source's mixing voice, as the app last assigned it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceHandle {
    pub source: u32,
    pub voice: usize,
}

/// Playback position of a source.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SourceOffset {
    /// Index of the buffer being played, counted from the queue head.
    pub buffer_index: usize,
    /// Sample frame within that buffer.
    pub position: u32,
    /// Fraction of a frame, `[0, 1)`.
    pub fraction: f32,
    /// Frames from the start of the queue.
    pub queue_offset: u64,
}

struct Source {
    props: VoiceProps,
    looping: bool,
    items: VecDeque<Arc<BufferQueueItem>>,
    is_static: bool,
    state: SourceState,
    voice: Option<usize>,
    /// Buffers removed from the front of the queue since it started playing.
    unqueued_since_play: usize,
    /// Start offset in frames for the next play.
    offset: Option<f64>,
}

impl Source {
    fn new(props: VoiceProps) -> Self {
        Self {
            props,
            looping: false,
            items: VecDeque::new(),
            is_static: false,
            state: SourceState::Initial,
            voice: None,
            unqueued_since_play: 0,
            offset: None,
        }
    }

    fn first_buffer(&self) -> Option<&Arc<Buffer>> {
        self.items.front().map(|item| &item.buffer)
    }

    fn total_frames(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.buffer.sample_len())).sum()
    }
}

fn same_format(a: &Buffer, b: &Buffer) -> bool {
    a.frequency() == b.frequency()
        && a.layout() == b.layout()
        && a.sample_type() == b.sample_type()
        && a.ambi_order() == b.ambi_order()
        && a.ambi_layout() == b.ambi_layout()
        && a.ambi_scaling() == b.ambi_scaling()
}

/// App-side handle to one listener and everything it hears.
pub struct Context {
    id: u32,
    device: Arc<DeviceInfo>,
    device_shared: Arc<DeviceShared>,
    props: ContextProps,
    shared: Arc<ContextShared>,
    event_mask: Arc<AtomicU32>,
    events: EventReceiver,
    voices: Vec<Arc<VoiceShared>>,
    changes: Producer<VoiceChange>,
    sources: FxHashMap<u32, Source>,
    next_source_id: u32,
    slots: Vec<Option<EffectSlot>>,
    slot_shared: Vec<Arc<SlotShared>>,
}

impl Context {
    pub(crate) fn new(
        id: u32,
        device: Arc<DeviceInfo>,
        device_shared: Arc<DeviceShared>,
    ) -> Result<(Self, ContextRenderer)> {
        let shared = Arc::new(ContextShared {
            props: PropsSlot::new(),
            hold: AtomicBool::new(device.hold_updates_default),
        });
        let event_mask = Arc::new(AtomicU32::new(EVENT_ALL));
        let (sender, events) = event_queue(device.event_queue_size, event_mask.clone());
        let voices: Vec<_> = (0..device.max_voices).map(|_| Arc::new(VoiceShared::new())).collect();
        let slot_shared: Vec<_> = (0..device.max_slots).map(|_| Arc::new(SlotShared::new())).collect();
        let (changes, consumer) =
            RingBuffer::new(MIN_CHANGE_QUEUE_SIZE.max(device.max_voices * 2));

        let renderer = ContextRenderer::new(id, shared.clone(), &voices, &slot_shared, consumer, sender);
        let context = Self {
            id,
            device,
            device_shared,
            props: ContextProps::default(),
            shared,
            event_mask,
            events,
            voices,
            changes,
            sources: FxHashMap::default(),
            next_source_id: 1,
            slots: (0..slot_shared.len()).map(|_| None).collect(),
            slot_shared,
        };
        log::debug!(
            "Context {}: {} voices, {} slots, {} event slots",
            id,
            context.voices.len(),
            context.slots.len(),
            context.device.event_queue_size
        );
        Ok((context, renderer))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn device(&self) -> &Arc<DeviceInfo> {
        &self.device
    }

    // Listener and world properties.

    pub fn props(&self) -> &ContextProps {
        &self.props
    }

    pub fn set_props(&mut self, props: ContextProps) -> Result<()> {
        props.validate()?;
        self.props = props;
        self.shared.props.publish(self.props.clone());
        Ok(())
    }

    fn update_props(&mut self, change: impl FnOnce(&mut ContextProps)) -> Result<()> {
        let mut props = self.props.clone();
        change(&mut props);
        self.set_props(props)
    }

    pub fn set_listener_position(&mut self, position: [f32; 3]) -> Result<()> {
        self.update_props(|p| p.position = position)
    }

    pub fn set_listener_velocity(&mut self, velocity: [f32; 3]) -> Result<()> {
        self.update_props(|p| p.velocity = velocity)
    }

    pub fn set_listener_orientation(&mut self, at: [f32; 3], up: [f32; 3]) -> Result<()> {
        self.update_props(|p| {
            p.orient_at = at;
            p.orient_up = up;
        })
    }

    pub fn set_listener_gain(&mut self, gain: f32) -> Result<()> {
        self.update_props(|p| p.gain = gain)
    }

    pub fn set_meters_per_unit(&mut self, meters: f32) -> Result<()> {
        self.update_props(|p| p.meters_per_unit = meters)
    }

    pub fn set_doppler_factor(&mut self, factor: f32) -> Result<()> {
        self.update_props(|p| p.doppler_factor = factor)
    }

    pub fn set_doppler_velocity(&mut self, velocity: f32) -> Result<()> {
        self.update_props(|p| p.doppler_velocity = velocity)
    }

    pub fn set_speed_of_sound(&mut self, speed: f32) -> Result<()> {
        self.update_props(|p| p.speed_of_sound = speed)
    }

    pub fn set_distance_model(&mut self, model: DistanceModel) -> Result<()> {
        self.update_props(|p| p.distance_model = model)
    }

    pub fn set_source_distance_model(&mut self, enable: bool) -> Result<()> {
        self.update_props(|p| p.source_distance_model = enable)
    }

    pub fn set_air_absorption_gain_hf(&mut self, gain: f32) -> Result<()> {
        self.update_props(|p| p.air_absorption_gain_hf = gain)
    }

    /// Holds (or releases) pending property changes so a batch of them
    /// lands in the same mix.
    pub fn set_hold_updates(&self, hold: bool) {
        self.shared.hold.store(hold, Ordering::Release);
    }

    pub fn hold_updates(&self) -> bool {
        self.shared.hold.load(Ordering::Acquire)
    }

    // Events.

    /// Enables the event kinds whose bits (`EVENT_*`) are set in `mask`.
    pub fn set_event_mask(&self, mask: u32) {
        self.event_mask.store(mask & EVENT_ALL, Ordering::Release);
    }

    pub fn poll_events(&mut self) -> Vec<Event> {
        self.events.poll()
    }

    pub fn wait_events(&mut self, timeout: Duration) -> Vec<Event> {
        self.events.wait_timeout(timeout)
    }

    // Sources.

    pub fn create_source(&mut self) -> u32 {
        let id = self.next_source_id;
        self.next_source_id = self.next_source_id.wrapping_add(1).max(1);
        let props = VoiceProps {
            resampler: self.device.resampler,
            ..VoiceProps::default()
        };
        self.sources.insert(id, Source::new(props));
        id
    }

    pub fn delete_source(&mut self, id: u32) -> Result<()> {
        self.stop(id)?;
        self.sources.remove(&id);
        Ok(())
    }

    fn source(&self, id: u32) -> Result<&Source> {
        self.sources
            .get(&id)
            .ok_or_else(|| MixerError::InvalidValue(format!("invalid source id {}", id)))
    }

    fn source_mut(&mut self, id: u32) -> Result<&mut Source> {
        self.sources
            .get_mut(&id)
            .ok_or_else(|| MixerError::InvalidValue(format!("invalid source id {}", id)))
    }

    pub fn source_props(&self, id: u32) -> Result<&VoiceProps> {
        Ok(&self.source(id)?.props)
    }

    /// Replaces a source's properties. Sends must name existing slots.
    pub fn set_source_props(&mut self, id: u32, props: VoiceProps) -> Result<()> {
        props.validate()?;
        for send in props.sends.iter() {
            if let Some(slot) = send.slot {
                if self.slots.get(slot.index()).map_or(true, Option::is_none) {
                    return Err(MixerError::InvalidValue(format!("invalid effect slot {}", slot.0)));
                }
            }
        }
        let props = props.clamped();
        if let Some(v) = self.live_voice(id)? {
            self.voices[v].props.publish(props.clone());
        }
        self.source_mut(id)?.props = props;
        Ok(())
    }

    /// Changes part of a source's properties.
    pub fn update_source(&mut self, id: u32, change: impl FnOnce(&mut VoiceProps)) -> Result<()> {
        let mut props = self.source(id)?.props.clone();
        change(&mut props);
        self.set_source_props(id, props)
    }

    pub fn set_looping(&mut self, id: u32, looping: bool) -> Result<()> {
        let voice = self.live_voice(id)?;
        self.source_mut(id)?.looping = looping;
        if let Some(v) = voice {
            self.voices[v].looping.store(looping, Ordering::Release);
        }
        Ok(())
    }

    /// Attaches a single buffer (or none) to a source that is not playing.
    pub fn set_buffer(&mut self, id: u32, buffer: Option<Arc<Buffer>>) -> Result<()> {
        let state = self.source_state(id)?;
        if !matches!(state, SourceState::Initial | SourceState::Stopped) {
            return Err(MixerError::InvalidOperation(format!(
                "setting the buffer of source {} while {:?}",
                id, state
            )));
        }
        let source = self.source_mut(id)?;
        source.items.clear();
        source.is_static = buffer.is_some();
        if let Some(buffer) = buffer {
            source.items.push_back(BufferQueueItem::new(buffer));
        }
        source.offset = None;
        Ok(())
    }

    /// Appends buffers to a streaming source. Every buffer of a queue must
    /// share one format.
    pub fn queue_buffers(&mut self, id: u32, buffers: &[Arc<Buffer>]) -> Result<()> {
        let source = self.source_mut(id)?;
        if source.is_static {
            return Err(MixerError::InvalidOperation(format!("queueing onto static source {}", id)));
        }
        let reference = source.first_buffer().cloned().or_else(|| buffers.first().cloned());
        for buffer in buffers {
            if buffer.is_callback() {
                return Err(MixerError::InvalidOperation("callback buffers cannot be queued".into()));
            }
            if let Some(reference) = &reference {
                if !same_format(reference, buffer) {
                    return Err(MixerError::InvalidOperation(format!(
                        "queued buffer {} does not match the queue format",
                        buffer.id()
                    )));
                }
            }
        }
        let Some(head) = BufferQueueItem::chain(buffers) else {
            return Ok(());
        };
        if let Some(tail) = source.items.back() {
            tail.set_next(head.clone())?;
        }
        let mut cur = Some(head);
        while let Some(item) = cur {
            cur = item.next().cloned();
            source.items.push_back(item);
        }
        Ok(())
    }

    pub fn buffers_queued(&self, id: u32) -> Result<usize> {
        Ok(self.source(id)?.items.len())
    }

    /// Buffers the source has finished with. Looping and static sources
    /// never finish a buffer.
    pub fn buffers_processed(&mut self, id: u32) -> Result<usize> {
        let state = self.source_state(id)?;
        let source = self.source(id)?;
        if source.looping || source.is_static {
            return Ok(0);
        }
        Ok(match state {
            SourceState::Initial => 0,
            SourceState::Stopped => source.items.len(),
            SourceState::Playing | SourceState::Paused => {
                let Some(v) = source.voice else {
                    return Ok(0);
                };
                let index = self.voices[v].buffer_index.load(Ordering::Acquire);
                if index == NO_BUFFER {
                    source.items.len()
                } else {
                    (index as usize).saturating_sub(source.unqueued_since_play).min(source.items.len())
                }
            }
        })
    }

    /// Removes `count` processed buffers from the front of the queue.
    pub fn unqueue_buffers(&mut self, id: u32, count: usize) -> Result<Vec<Arc<Buffer>>> {
        let processed = self.buffers_processed(id)?;
        let source = self.source_mut(id)?;
        if source.is_static {
            return Err(MixerError::InvalidValue(format!("unqueueing from static source {}", id)));
        }
        if source.looping {
            return Err(MixerError::InvalidValue(format!("unqueueing from looping source {}", id)));
        }
        if count > processed {
            return Err(MixerError::InvalidValue(format!(
                "unqueueing {} buffers, only {} processed",
                count, processed
            )));
        }
        if matches!(source.state, SourceState::Playing | SourceState::Paused) {
            source.unqueued_since_play += count;
        }
        Ok(source.items.drain(..count).map(|item| item.buffer.clone()).collect())
    }

    /// The voice playing `id`, if one still belongs to it.
    fn live_voice(&self, id: u32) -> Result<Option<usize>> {
        let source = self.source(id)?;
        Ok(source
            .voice
            .filter(|&v| self.voices[v].source_id.load(Ordering::Acquire) == id))
    }

    pub fn source_state(&mut self, id: u32) -> Result<SourceState> {
        let live = self.live_voice(id)?;
        let source = self.source_mut(id)?;
        if matches!(source.state, SourceState::Playing | SourceState::Paused) && live.is_none() {
            source.state = SourceState::Stopped;
            source.voice = None;
            source.offset = None;
        }
        Ok(source.state)
    }

    pub fn source_handle(&mut self, id: u32) -> Result<Option<SourceHandle>> {
        self.source_state(id)?;
        Ok(self.source(id)?.voice.map(|voice| SourceHandle { source: id, voice }))
    }

    /// Current playback position, read consistently with the mixer.
    pub fn source_offset(&mut self, id: u32) -> Result<SourceOffset> {
        let state = self.source_state(id)?;
        let source = self.source(id)?;
        let voice = match (state, source.voice) {
            (SourceState::Playing | SourceState::Paused, Some(v)) => &self.voices[v],
            _ => {
                let frames = source.offset.unwrap_or(0.0);
                return Ok(offset_from_frames(source, frames));
            }
        };
        let (index, position, frac) = self.device_shared.consistent_read(|| {
            (
                voice.buffer_index.load(Ordering::Relaxed),
                voice.position.load(Ordering::Relaxed),
                voice.position_frac.load(Ordering::Relaxed),
            )
        });
        if index == NO_BUFFER {
            return Ok(SourceOffset::default());
        }
        let buffer_index = (index as usize).saturating_sub(source.unqueued_since_play);
        let before: u64 = source
            .items
            .iter()
            .take(buffer_index)
            .map(|item| u64::from(item.buffer.sample_len()))
            .sum();
        Ok(SourceOffset {
            buffer_index,
            position,
            fraction: frac as f32 / MIXER_FRAC_ONE as f32,
            queue_offset: before + u64::from(position),
        })
    }

    /// Seeks to `frames` from the queue head. A playing or paused source
    /// moves right away; otherwise the offset applies on the next play.
    pub fn set_source_offset(&mut self, id: u32, frames: f64) -> Result<()> {
        let state = self.source_state(id)?;
        let source = self.source(id)?;
        if !frames.is_finite() || frames < 0.0 {
            return Err(MixerError::InvalidValue(format!("invalid offset {}", frames)));
        }
        if source.first_buffer().is_some_and(|b| b.is_callback()) {
            return Err(MixerError::InvalidOperation("callback sources cannot seek".into()));
        }
        if !source.items.is_empty() && frames >= source.total_frames() as f64 {
            return Err(MixerError::InvalidValue(format!("offset {} past the end of the queue", frames)));
        }

        match (state, source.voice) {
            (SourceState::Playing | SourceState::Paused, Some(old)) => {
                let new = self.free_voice(Some(old))?;
                let start = Self::voice_start(source, frames, true)?;
                self.post_voice_start(id, new, Some(old), ChangeKind::Restart, start)?;
                let source = self.source_mut(id)?;
                source.voice = Some(new);
                source.unqueued_since_play = 0;
            }
            _ => self.source_mut(id)?.offset = Some(frames),
        }
        Ok(())
    }

    /// Seeks by time, using the rate of the first buffer.
    pub fn set_source_offset_seconds(&mut self, id: u32, seconds: f64) -> Result<()> {
        let rate = self
            .source(id)?
            .first_buffer()
            .map_or(self.device.frequency, |b| b.frequency());
        self.set_source_offset(id, seconds * f64::from(rate))
    }

    pub fn play(&mut self, id: u32) -> Result<()> {
        let state = self.source_state(id)?;
        let source = self.source(id)?;

        if let (SourceState::Paused, Some(voice)) = (state, source.voice) {
            self.post(VoiceChange {
                voice: Some(voice),
                old_voice: None,
                source_id: id,
                kind: ChangeKind::Play,
                start: None,
            })?;
            self.voices[voice].pending_change.store(true, Ordering::Release);
            self.source_mut(id)?.state = SourceState::Playing;
            return Ok(());
        }

        if source.items.is_empty() {
            let source = self.source_mut(id)?;
            source.state = SourceState::Stopped;
            source.offset = None;
            return Ok(());
        }

        let old_voice = match state {
            SourceState::Playing => source.voice,
            _ => None,
        };
        let new = self.free_voice(old_voice)?;
        let frames = source.offset.unwrap_or(0.0);
        let start = Self::voice_start(source, frames, frames > 0.0)?;
        self.post_voice_start(id, new, old_voice, ChangeKind::Play, start)?;

        let source = self.source_mut(id)?;
        source.voice = Some(new);
        source.state = SourceState::Playing;
        source.offset = None;
        source.unqueued_since_play = 0;
        Ok(())
    }

    pub fn pause(&mut self, id: u32) -> Result<()> {
        let state = self.source_state(id)?;
        if state != SourceState::Playing {
            return Ok(());
        }
        let voice = self.source(id)?.voice;
        self.post(VoiceChange {
            voice,
            old_voice: None,
            source_id: id,
            kind: ChangeKind::Pause,
            start: None,
        })?;
        if let Some(v) = voice {
            self.voices[v].pending_change.store(true, Ordering::Release);
        }
        self.source_mut(id)?.state = SourceState::Paused;
        Ok(())
    }

    pub fn stop(&mut self, id: u32) -> Result<()> {
        let state = self.source_state(id)?;
        let voice = self.live_voice(id)?;
        if let Some(v) = voice {
            self.post(VoiceChange {
                voice: Some(v),
                old_voice: None,
                source_id: id,
                kind: ChangeKind::Stop,
                start: None,
            })?;
            self.voices[v].pending_change.store(true, Ordering::Release);
        }
        let source = self.source_mut(id)?;
        if state != SourceState::Initial {
            source.state = SourceState::Stopped;
        }
        source.voice = None;
        source.offset = None;
        Ok(())
    }

    /// Stops the source and returns it to the initial state. The mixer
    /// always reports the reset, even without a voice.
    pub fn rewind(&mut self, id: u32) -> Result<()> {
        self.source_state(id)?;
        let voice = self.live_voice(id)?;
        self.post(VoiceChange {
            voice,
            old_voice: None,
            source_id: id,
            kind: ChangeKind::Reset,
            start: None,
        })?;
        if let Some(v) = voice {
            self.voices[v].pending_change.store(true, Ordering::Release);
        }
        let source = self.source_mut(id)?;
        source.state = SourceState::Initial;
        source.voice = None;
        source.offset = None;
        Ok(())
    }

    fn free_voice(&self, exclude: Option<usize>) -> Result<usize> {
        self.voices
            .iter()
            .enumerate()
            .position(|(i, v)| Some(i) != exclude && v.is_free())
            .ok_or_else(|| MixerError::OutOfMemory("no free voices".into()))
    }

    /// Where a voice starts when `source` plays from `frames`.
    fn voice_start(source: &Source, frames: f64, fading: bool) -> Result<VoiceStart> {
        let head = source
            .items
            .front()
            .cloned()
            .ok_or_else(|| MixerError::InvalidState("source has no buffers".into()))?;
        let mut remaining = frames.floor() as u64;
        let mut current = head.clone();
        let mut buffer_index = 0u32;
        for item in source.items.iter() {
            let len = u64::from(item.buffer.sample_len());
            if remaining < len || item.buffer.is_callback() {
                current = item.clone();
                break;
            }
            remaining -= len;
            buffer_index += 1;
        }
        if buffer_index as usize >= source.items.len() {
            current = head.clone();
            buffer_index = 0;
            remaining = 0;
        }
        let format = source
            .items
            .iter()
            .find(|item| item.buffer.sample_len() > 0 || item.buffer.is_callback())
            .map_or_else(|| head.buffer.clone(), |item| item.buffer.clone());
        let callback_data = format
            .is_callback()
            .then(|| vec![0u8; MIXER_LINE_SIZE * format.frame_size()].into_boxed_slice());
        Ok(VoiceStart {
            queue: head,
            current,
            buffer_index,
            position: remaining as u32,
            position_frac: (frames.fract() * f64::from(MIXER_FRAC_ONE)) as u32,
            fading,
            is_static: source.is_static,
            format,
            super_stereo: source.props.stereo_mode == StereoMode::SuperStereo,
            callback_data,
        })
    }

    /// Claims voice `new` for `id` and posts the command that starts it.
    fn post_voice_start(
        &mut self,
        id: u32,
        new: usize,
        old: Option<usize>,
        kind: ChangeKind,
        start: VoiceStart,
    ) -> Result<()> {
        let source = self.source(id)?;
        let (props, looping) = (source.props.clone(), source.looping);
        let voice = &self.voices[new];
        voice.props.publish(props);
        voice.looping.store(looping, Ordering::Release);
        voice.source_id.store(id, Ordering::Release);
        voice.pending_change.store(true, Ordering::Release);

        let posted = self.post(VoiceChange {
            voice: Some(new),
            old_voice: old,
            source_id: id,
            kind,
            start: Some(start),
        });
        if posted.is_err() {
            let voice = &self.voices[new];
            voice.source_id.store(0, Ordering::Release);
            voice.pending_change.store(false, Ordering::Release);
            return posted;
        }
        if let Some(old) = old {
            self.voices[old].pending_change.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn post(&mut self, change: VoiceChange) -> Result<()> {
        match self.changes.push(change) {
            Ok(()) => Ok(()),
            Err(PushError::Full(_)) => Err(MixerError::OutOfMemory("voice change queue is full".into())),
        }
    }

    // Effect slots.

    pub fn create_slot(&mut self) -> Result<SlotId> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| MixerError::OutOfMemory("no free effect slots".into()))?;
        let id = SlotId(index as u32);
        self.slots[index] = Some(EffectSlot::new(id, self.device.clone(), self.slot_shared[index].clone()));
        Ok(id)
    }

    /// Deletes a slot no other slot targets and no source sends into.
    pub fn delete_slot(&mut self, id: SlotId) -> Result<()> {
        self.slot(id)?;
        let targeted = self.slots.iter().flatten().any(|s| s.props().target == Some(id));
        let used = self
            .sources
            .values()
            .any(|s| s.props.sends.iter().any(|send| send.slot == Some(id)));
        if targeted || used {
            return Err(MixerError::InvalidOperation(format!("effect slot {} is in use", id.0)));
        }
        if let Some(mut slot) = self.slots[id.index()].take() {
            slot.deactivate();
        }
        Ok(())
    }

    pub fn slot(&self, id: SlotId) -> Result<&EffectSlot> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| MixerError::InvalidValue(format!("invalid effect slot {}", id.0)))
    }

    pub fn slot_mut(&mut self, id: SlotId) -> Result<&mut EffectSlot> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| MixerError::InvalidValue(format!("invalid effect slot {}", id.0)))
    }

    /// Routes a slot's output into another slot, or into the device with
    /// `None`. Targets that would form a loop are refused.
    pub fn set_slot_target(&mut self, id: SlotId, target: Option<SlotId>) -> Result<()> {
        self.slot(id)?;
        if let Some(target) = target {
            self.slot(target)?;
            let mut next = Some(target);
            while let Some(cur) = next {
                if cur == id {
                    log::warn!("Effect slot {} targeting {} would form a loop", id.0, target.0);
                    return Err(MixerError::InvalidOperation(format!(
                        "effect slot {} cannot target {}: loop",
                        id.0, target.0
                    )));
                }
                next = self.slot(cur)?.props().target;
            }
        }
        self.slot_mut(id)?.set_target(target);
        Ok(())
    }

    pub fn set_slot_props(&mut self, id: SlotId, props: &EffectSlotProps) -> Result<()> {
        self.slot_mut(id)?.set_props_untargeted(props)?;
        self.set_slot_target(id, props.target)
    }
}

/// Maps a frame offset onto the queue without a voice.
fn offset_from_frames(source: &Source, frames: f64) -> SourceOffset {
    let whole = frames.floor() as u64;
    let mut remaining = whole;
    for (index, item) in source.items.iter().enumerate() {
        let len = u64::from(item.buffer.sample_len());
        if remaining < len {
            return SourceOffset {
                buffer_index: index,
                position: remaining as u32,
                fraction: frames.fract() as f32,
                queue_offset: whole,
            };
        }
        remaining -= len;
    }
    SourceOffset::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ChannelLayout;
    use crate::device::Device;
    use crate::config::DeviceConfig;
    use crate::effects::{EffectProps, EffectType, ReverbProps};
    use crate::postprocess::OutputBuffer;

    fn device() -> Device {
        let config = DeviceConfig {
            frequency: 48000,
            max_voices: 4,
            max_slots: 4,
            ..DeviceConfig::default()
        };
        Device::new(&config, None).unwrap()
    }

    fn tone(len: usize) -> Arc<Buffer> {
        let samples: Vec<f32> = (0..len).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
        Arc::new(Buffer::from_f32(48000, ChannelLayout::Mono, &samples).unwrap())
    }

    #[test]
    fn listener_values_are_range_checked() {
        let mut device = device();
        let mut ctx = device.create_context().unwrap();
        assert!(ctx.set_speed_of_sound(0.0).is_err());
        assert!(ctx.set_listener_position([f32::NAN, 0.0, 0.0]).is_err());
        assert!(ctx.set_meters_per_unit(0.0).is_err());
        ctx.set_doppler_factor(0.5).unwrap();
        assert_eq!(ctx.props().doppler_factor, 0.5);
        assert_eq!(ctx.props().speed_of_sound, SPEED_OF_SOUND_METERS_PER_SEC);
    }

    #[test]
    fn queues_reject_mixed_formats_and_static_sources() {
        let mut device = device();
        let mut ctx = device.create_context().unwrap();
        let src = ctx.create_source();
        ctx.queue_buffers(src, &[tone(100), tone(100)]).unwrap();
        let stereo = Arc::new(Buffer::from_f32(48000, ChannelLayout::Stereo, &[0.0; 64]).unwrap());
        assert!(matches!(
            ctx.queue_buffers(src, &[stereo]),
            Err(MixerError::InvalidOperation(_))
        ));
        assert_eq!(ctx.buffers_queued(src).unwrap(), 2);

        let fixed = ctx.create_source();
        ctx.set_buffer(fixed, Some(tone(10))).unwrap();
        assert!(ctx.queue_buffers(fixed, &[tone(10)]).is_err());
        assert!(ctx.unqueue_buffers(fixed, 1).is_err());
    }

    #[test]
    fn playing_without_buffers_stops() {
        let mut device = device();
        let mut ctx = device.create_context().unwrap();
        let src = ctx.create_source();
        ctx.play(src).unwrap();
        assert_eq!(ctx.source_state(src).unwrap(), SourceState::Stopped);
    }

    #[test]
    fn the_voice_pool_is_bounded() {
        let mut device = device();
        let mut ctx = device.create_context().unwrap();
        let buffer = tone(48000);
        for _ in 0..4 {
            let src = ctx.create_source();
            ctx.set_buffer(src, Some(buffer.clone())).unwrap();
            ctx.play(src).unwrap();
        }
        let extra = ctx.create_source();
        ctx.set_buffer(extra, Some(buffer)).unwrap();
        assert!(matches!(ctx.play(extra), Err(MixerError::OutOfMemory(_))));
        assert_eq!(ctx.source_state(extra).unwrap(), SourceState::Initial);
    }

    #[test]
    fn pause_and_resume_keep_the_voice() {
        let mut device = device();
        let mut ctx = device.create_context().unwrap();
        let src = ctx.create_source();
        ctx.set_buffer(src, Some(tone(48000))).unwrap();
        ctx.play(src).unwrap();
        let handle = ctx.source_handle(src).unwrap().unwrap();

        let mut out = vec![0.0f32; 2 * 512];
        device.render_samples(&mut OutputBuffer::F32(&mut out), 512, 2);
        ctx.pause(src).unwrap();
        device.render_samples(&mut OutputBuffer::F32(&mut out), 512, 2);
        assert_eq!(ctx.source_state(src).unwrap(), SourceState::Paused);
        let paused_at = ctx.source_offset(src).unwrap();
        device.render_samples(&mut OutputBuffer::F32(&mut out), 512, 2);
        assert_eq!(ctx.source_offset(src).unwrap(), paused_at);

        ctx.play(src).unwrap();
        assert_eq!(ctx.source_handle(src).unwrap(), Some(handle));
        device.render_samples(&mut OutputBuffer::F32(&mut out), 512, 2);
        assert!(ctx.source_offset(src).unwrap().position > paused_at.position);
    }

    #[test]
    fn offsets_apply_on_play_and_while_playing() {
        let mut device = device();
        let mut ctx = device.create_context().unwrap();
        let src = ctx.create_source();
        ctx.queue_buffers(src, &[tone(1000), tone(1000)]).unwrap();
        assert!(ctx.set_source_offset(src, 2000.0).is_err());
        ctx.set_source_offset(src, 1500.5).unwrap();
        let pending = ctx.source_offset(src).unwrap();
        assert_eq!((pending.buffer_index, pending.position), (1, 500));
        assert_eq!(pending.queue_offset, 1500);

        ctx.play(src).unwrap();
        let mut out = vec![0.0f32; 2 * 100];
        device.render_samples(&mut OutputBuffer::F32(&mut out), 100, 2);
        let now = ctx.source_offset(src).unwrap();
        assert_eq!(now.buffer_index, 1);
        assert_eq!(now.queue_offset, 1600);

        ctx.set_source_offset(src, 10.0).unwrap();
        device.render_samples(&mut OutputBuffer::F32(&mut out), 100, 2);
        let moved = ctx.source_offset(src).unwrap();
        assert_eq!((moved.buffer_index, moved.position), (0, 110));
    }

    #[test]
    fn processed_buffers_can_be_unqueued() {
        let mut device = device();
        let mut ctx = device.create_context().unwrap();
        let src = ctx.create_source();
        ctx.queue_buffers(src, &[tone(300), tone(300), tone(300)]).unwrap();
        ctx.play(src).unwrap();
        let mut out = vec![0.0f32; 2 * 700];
        device.render_samples(&mut OutputBuffer::F32(&mut out), 700, 2);
        assert_eq!(ctx.buffers_processed(src).unwrap(), 2);
        assert!(ctx.unqueue_buffers(src, 3).is_err());
        let done = ctx.unqueue_buffers(src, 2).unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(ctx.buffers_queued(src).unwrap(), 1);
        assert_eq!(ctx.buffers_processed(src).unwrap(), 0);

        ctx.queue_buffers(src, &[tone(300)]).unwrap();
        let offset = ctx.source_offset(src).unwrap();
        assert_eq!((offset.buffer_index, offset.position), (0, 100));
    }

    #[test]
    fn stopping_reports_through_events() {
        let mut device = device();
        let mut ctx = device.create_context().unwrap();
        let src = ctx.create_source();
        ctx.set_buffer(src, Some(tone(48000))).unwrap();
        ctx.play(src).unwrap();
        let mut out = vec![0.0f32; 2 * 64];
        device.render_samples(&mut OutputBuffer::F32(&mut out), 64, 2);
        ctx.stop(src).unwrap();
        device.render_samples(&mut OutputBuffer::F32(&mut out), 64, 2);
        let states: Vec<SourceState> = ctx
            .poll_events()
            .into_iter()
            .filter_map(|e| match e {
                Event::SourceStateChange { id, state } if id == src => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![SourceState::Playing, SourceState::Stopped]);
        assert_eq!(ctx.source_state(src).unwrap(), SourceState::Stopped);

        ctx.rewind(src).unwrap();
        device.render_samples(&mut OutputBuffer::F32(&mut out), 64, 2);
        assert!(matches!(
            ctx.poll_events()[..],
            [Event::SourceStateChange { state: SourceState::Initial, .. }]
        ));
    }

    #[test]
    fn slot_targets_cannot_loop() {
        let mut device = device();
        let mut ctx = device.create_context().unwrap();
        let a = ctx.create_slot().unwrap();
        let b = ctx.create_slot().unwrap();
        let c = ctx.create_slot().unwrap();
        ctx.set_slot_target(a, Some(b)).unwrap();
        ctx.set_slot_target(b, Some(c)).unwrap();
        assert!(matches!(ctx.set_slot_target(c, Some(a)), Err(MixerError::InvalidOperation(_))));
        assert!(ctx.set_slot_target(c, Some(c)).is_err());
        assert!(matches!(ctx.delete_slot(b), Err(MixerError::InvalidOperation(_))));
        ctx.set_slot_target(a, None).unwrap();
        ctx.delete_slot(a).unwrap();
        assert!(ctx.slot(a).is_err());
    }

    #[test]
    fn sends_must_name_live_slots() {
        let mut device = device();
        let mut ctx = device.create_context().unwrap();
        let src = ctx.create_source();
        let result = ctx.update_source(src, |p| p.sends[0].slot = Some(SlotId(2)));
        assert!(matches!(result, Err(MixerError::InvalidValue(_))));

        let slot = ctx.create_slot().unwrap();
        ctx.slot_mut(slot)
            .unwrap()
            .set_effect(EffectProps::Reverb(ReverbProps::default()))
            .unwrap();
        ctx.update_source(src, |p| p.sends[0].slot = Some(slot)).unwrap();
        assert!(ctx.delete_slot(slot).is_err());
        assert_eq!(ctx.slot(slot).unwrap().effect_type(), EffectType::Reverb);
    }
}
