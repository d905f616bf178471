use std::sync::atomic::Ordering;
use std::sync::Arc;

use rtrb::Consumer;

use super::ContextShared;
use crate::audio::MixParams;
use crate::device::{DeviceInfo, MixBuses};
use crate::effect_slot::{pair_mut, sort_slots, SlotRenderer, SlotShared, WET_CHANNELS};
use crate::effects::OutTarget;
use crate::events::{Event, EventSender, WarningKind};
use crate::voice::{
    calc_source_params, ChangeKind, ListenerParams, MixOutput, PlayState, Voice, VoiceChange,
    VoiceScratch, VoiceShared,
};

/// The mixer's half of a context.
pub(crate) struct ContextRenderer {
    id: u32,
    shared: Arc<ContextShared>,
    voices: Vec<Voice>,
    changes: Consumer<VoiceChange>,
    slots: Vec<SlotRenderer>,
    /// Processing order of the active slots.
    sorted: Vec<usize>,
    sort_valid: bool,
    cycle_warned: bool,
    events: EventSender,
    listener: ListenerParams,
    /// Channel layout of a slot's wet bus, for slots feeding other slots.
    wet_params: MixParams,
    pending_warning: Option<WarningKind>,
}

impl ContextRenderer {
    pub(super) fn new(
        id: u32,
        shared: Arc<ContextShared>,
        voices: &[Arc<VoiceShared>],
        slots: &[Arc<SlotShared>],
        changes: Consumer<VoiceChange>,
        events: EventSender,
    ) -> Self {
        Self {
            id,
            shared,
            voices: voices.iter().cloned().map(Voice::new).collect(),
            changes,
            slots: slots.iter().cloned().map(SlotRenderer::new).collect(),
            sorted: Vec::with_capacity(slots.len()),
            sort_valid: false,
            cycle_warned: false,
            events,
            listener: ListenerParams::default(),
            wet_params: MixParams::acn_identity(WET_CHANNELS),
            pending_warning: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Reports `kind` at the start of the next mix.
    pub fn queue_warning(&mut self, kind: WarningKind) {
        self.pending_warning = Some(kind);
    }

    fn send(&mut self, event: Event) {
        if let Err(event) = self.events.send(event) {
            log::trace!("Context {}: event queue full, dropped {:?}", self.id, event);
        }
    }

    /// Mixes one block of this context into `buses`.
    pub fn process(
        &mut self,
        device: &DeviceInfo,
        buses: &mut MixBuses,
        scratch: &mut VoiceScratch,
        samples_to_do: usize,
    ) {
        if let Some(kind) = self.pending_warning.take() {
            self.send(Event::Warning(kind));
        }
        self.apply_changes(device);

        if !self.shared.hold.load(Ordering::Acquire) {
            self.update_params(device);
        }

        for slot in self.slots.iter_mut().filter(|s| s.active) {
            slot.clear_wet(samples_to_do);
        }

        {
            let real = if buses.real.is_empty() {
                None
            } else {
                Some(&mut buses.real[..])
            };
            let mut out = MixOutput {
                dry: &mut buses.dry,
                real,
                hrtf_accum: &mut buses.hrtf_accum,
                slots: &mut self.slots,
            };
            for voice in self.voices.iter_mut() {
                let state = voice.shared.play_state();
                if matches!(state, PlayState::Stopped | PlayState::Pending) {
                    continue;
                }
                voice.mix(state, device, &mut out, scratch, &mut self.events, samples_to_do);
            }
        }

        if !self.sort_valid {
            self.sort();
        }
        self.process_slots(buses, samples_to_do);
        self.events.signal();
    }

    /// Applies the playback commands the app queued since the last mix.
    fn apply_changes(&mut self, device: &DeviceInfo) {
        while let Ok(change) = self.changes.pop() {
            let VoiceChange {
                voice,
                old_voice,
                source_id,
                kind,
                start,
            } = change;
            let voice = voice.filter(|&v| v < self.voices.len());
            let old_voice = old_voice.filter(|&v| v < self.voices.len());

            let send = match kind {
                ChangeKind::Reset | ChangeKind::Stop => {
                    let mut send = kind == ChangeKind::Reset;
                    if let Some(v) = voice {
                        let voice = &mut self.voices[v];
                        voice.clear_buffers();
                        let had = voice.shared.source_id.swap(0, Ordering::AcqRel) != 0;
                        send |= had;
                        voice.shared.transition(PlayState::Playing, PlayState::Stopping);
                        voice.shared.pending_change.store(false, Ordering::Release);
                    }
                    send
                }
                ChangeKind::Pause => match voice {
                    Some(v) => {
                        let shared = &self.voices[v].shared;
                        let send = shared.transition(PlayState::Playing, PlayState::Stopping);
                        shared.pending_change.store(false, Ordering::Release);
                        send
                    }
                    None => false,
                },
                ChangeKind::Play => {
                    let send = match old_voice {
                        Some(o) => {
                            let old = &mut self.voices[o];
                            old.clear_buffers();
                            old.shared.source_id.store(0, Ordering::Release);
                            let was_playing =
                                old.shared.transition(PlayState::Playing, PlayState::Stopping);
                            old.shared.pending_change.store(false, Ordering::Release);
                            !was_playing
                        }
                        None => true,
                    };
                    if let Some(v) = voice {
                        let voice = &mut self.voices[v];
                        if let Some(start) = start {
                            voice.start(start, device);
                        }
                        voice.shared.set_play_state(PlayState::Playing);
                        voice.shared.pending_change.store(false, Ordering::Release);
                    }
                    send
                }
                ChangeKind::Restart => {
                    let (had, playing) = match old_voice {
                        Some(o) => {
                            let old = &mut self.voices[o];
                            old.clear_buffers();
                            let had = old.shared.source_id.swap(0, Ordering::AcqRel) != 0;
                            let playing = had
                                && old.shared.transition(PlayState::Playing, PlayState::Stopping);
                            old.shared.pending_change.store(false, Ordering::Release);
                            (had, playing)
                        }
                        None => (false, false),
                    };
                    if let Some(v) = voice {
                        let voice = &mut self.voices[v];
                        match start {
                            Some(start) if had => {
                                voice.start(start, device);
                                voice.shared.set_play_state(if playing {
                                    PlayState::Playing
                                } else {
                                    PlayState::Stopped
                                });
                            }
                            _ => {
                                // The source stopped before the seek landed.
                                voice.clear_buffers();
                                voice.shared.source_id.store(0, Ordering::Release);
                                voice.shared.set_play_state(PlayState::Stopped);
                            }
                        }
                        voice.shared.pending_change.store(false, Ordering::Release);
                    }
                    false
                }
            };

            if send {
                self.send(Event::SourceStateChange {
                    id: source_id,
                    state: kind.event_state(),
                });
            }
        }
    }

    /// Picks up listener, slot and voice property changes.
    fn update_params(&mut self, device: &DeviceInfo) {
        let listener_changed = match self.shared.props.take() {
            Some(node) => {
                self.listener = ListenerParams::new(&node);
                self.shared.props.recycle(node);
                true
            }
            None => false,
        };

        let mut slots_changed = false;
        for slot in self.slots.iter_mut() {
            let toggled = slot.sync_active();
            let change = slot.apply_update(device, &self.wet_params, &mut self.events);
            slots_changed |= toggled || change.updated;
            if toggled || change.target_changed {
                self.sort_valid = false;
            }
        }

        let force = listener_changed || slots_changed;
        for voice in self.voices.iter_mut() {
            if voice.shared.source_id.load(Ordering::Acquire) == 0 {
                continue;
            }
            let force = force || voice.step == 0;
            calc_source_params(voice, &self.listener, device, &self.slots, force);
        }
    }

    fn sort(&mut self) {
        let slots = &self.slots;
        let active = (0..slots.len()).filter(|&s| slots[s].active);
        let acyclic = sort_slots(&mut self.sorted, active, |s| {
            slots[s].params.target.filter(|&t| slots.get(t).is_some_and(|t| t.active))
        });
        self.sort_valid = true;
        if acyclic {
            self.cycle_warned = false;
        } else if !self.cycle_warned {
            self.cycle_warned = true;
            log::warn!("Context {}: effect slot targets form a loop, skipping them", self.id);
            self.send(Event::Warning(WarningKind::EffectSlotCycle));
        }
    }

    fn process_slots(&mut self, buses: &mut MixBuses, samples_to_do: usize) {
        for &s in self.sorted.iter() {
            let target = self.slots[s].params.target;
            if let Some((slot, target)) = target.and_then(|t| pair_mut(&mut self.slots, s, t)) {
                if target.active {
                    slot.process(samples_to_do, &mut target.wet);
                    continue;
                }
            }
            let slot = &mut self.slots[s];
            match slot.out_target() {
                OutTarget::RealOut if !buses.real.is_empty() => {
                    slot.process(samples_to_do, &mut buses.real)
                }
                _ => slot.process(samples_to_do, &mut buses.dry),
            }
        }
    }

    /// Reports the disconnect and, if asked, stops every voice.
    pub fn disconnect(&mut self, message: &str, stop_voices: bool) {
        self.send(Event::Disconnected {
            message: message.to_string(),
        });
        if stop_voices {
            for voice in self.voices.iter_mut() {
                voice.clear_buffers();
                voice.shared.source_id.store(0, Ordering::Release);
                voice.shared.set_play_state(PlayState::Stopped);
                voice.shared.pending_change.store(false, Ordering::Release);
            }
        }
        self.events.signal();
    }
}
