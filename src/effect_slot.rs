//! Effect slots.
//!
//! The app side ([`EffectSlot`]) owns a slot's parameters and builds new
//! effect states, which may allocate. The mixer side ([`SlotRenderer`]) owns
//! the live state and the wet bus that voice sends mix into. Parameter
//! changes cross over through a [`PropsSlot`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::{new_lines, Buffer, FloatBufferLine, MixParams};
use crate::device::DeviceInfo;
use crate::effects::{
    EffectProcessor, EffectProps, EffectState, EffectTarget, EffectType, OutTarget, SlotParams,
};
use crate::error::{MixerError, Result};
use crate::events::{Event, EventSender};
use crate::props::PropsSlot;

/// Channels on every slot's wet bus (first-order ambisonics).
pub const WET_CHANNELS: usize = 4;

/// Index of a slot in its context's slot pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl SlotId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectSlotProps {
    pub gain: f32,
    /// Lets voice sends into this slot derive their gain from the source
    /// distance and the reverb decay.
    pub aux_send_auto: bool,
    /// Slot whose wet bus receives this slot's output; `None` is the device.
    pub target: Option<SlotId>,
    pub effect: EffectProps,
}

impl Default for EffectSlotProps {
    fn default() -> Self {
        Self {
            gain: 1.0,
            aux_send_auto: true,
            target: None,
            effect: EffectProps::Null,
        }
    }
}

/// What the mixer picks up for a slot: new parameters and, when the effect
/// type changed, a freshly built state.
pub(crate) struct SlotUpdate {
    pub props: EffectSlotProps,
    pub state: Option<Box<EffectState>>,
}

pub(crate) struct SlotShared {
    pub update: PropsSlot<SlotUpdate>,
    pub active: AtomicBool,
}

impl SlotShared {
    pub fn new() -> Self {
        Self {
            update: PropsSlot::new(),
            active: AtomicBool::new(false),
        }
    }
}

/// App-side handle to one effect slot.
pub struct EffectSlot {
    id: SlotId,
    props: EffectSlotProps,
    impulse: Option<Arc<Buffer>>,
    device: Arc<DeviceInfo>,
    shared: Arc<SlotShared>,
}

impl EffectSlot {
    pub(crate) fn new(id: SlotId, device: Arc<DeviceInfo>, shared: Arc<SlotShared>) -> Self {
        let slot = Self {
            id,
            props: EffectSlotProps::default(),
            impulse: None,
            device,
            shared,
        };
        slot.publish(Some(Box::new(EffectState::new(EffectType::Null))));
        slot.shared.active.store(true, Ordering::Release);
        slot
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn props(&self) -> &EffectSlotProps {
        &self.props
    }

    pub fn effect_type(&self) -> EffectType {
        self.props.effect.effect_type()
    }

    /// Installs a new effect. Changing the effect type builds a new state
    /// here; the mixer swaps it in and hands the old one back as an event.
    pub fn set_effect(&mut self, effect: EffectProps) -> Result<()> {
        effect.validate()?;
        let effect = effect.clamped();
        let state = if effect.effect_type() != self.effect_type() {
            Some(self.build_state(effect.effect_type())?)
        } else {
            None
        };
        self.props.effect = effect;
        self.publish(state);
        Ok(())
    }

    pub fn set_gain(&mut self, gain: f32) -> Result<()> {
        if gain.is_nan() {
            return Err(MixerError::InvalidValue("slot gain is NaN".into()));
        }
        self.props.gain = gain.clamp(0.0, 1.0);
        self.publish(None);
        Ok(())
    }

    pub fn set_aux_send_auto(&mut self, enable: bool) {
        self.props.aux_send_auto = enable;
        self.publish(None);
    }

    /// Attaches the impulse response used by the convolution effect. A
    /// convolution slot rebuilds its state right away.
    pub fn set_impulse_response(&mut self, buffer: Arc<Buffer>) -> Result<()> {
        if buffer.is_callback() {
            return Err(MixerError::InvalidOperation(
                "callback buffers cannot be impulse responses".into(),
            ));
        }
        self.impulse = Some(buffer);
        if self.effect_type() == EffectType::Convolution {
            let state = self.build_state(EffectType::Convolution)?;
            self.publish(Some(state));
        }
        Ok(())
    }

    pub fn impulse_response(&self) -> Option<&Arc<Buffer>> {
        self.impulse.as_ref()
    }

    /// Applies everything except the target, which the context validates.
    pub(crate) fn set_props_untargeted(&mut self, props: &EffectSlotProps) -> Result<()> {
        if props.gain.is_nan() {
            return Err(MixerError::InvalidValue("slot gain is NaN".into()));
        }
        self.props.gain = props.gain.clamp(0.0, 1.0);
        self.props.aux_send_auto = props.aux_send_auto;
        self.set_effect(props.effect.clone())
    }

    pub(crate) fn set_target(&mut self, target: Option<SlotId>) {
        self.props.target = target;
        self.publish(None);
    }

    /// Resets the mixer side to a silent null effect and retires the slot.
    pub(crate) fn deactivate(&mut self) {
        self.props = EffectSlotProps::default();
        self.impulse = None;
        self.shared.active.store(false, Ordering::Release);
        self.publish(Some(Box::new(EffectState::new(EffectType::Null))));
    }

    fn build_state(&self, kind: EffectType) -> Result<Box<EffectState>> {
        let mut state = Box::new(EffectState::new(kind));
        state.device_update(&self.device, self.impulse.as_deref())?;
        Ok(state)
    }

    /// Publishes the current props. A state built for an update the mixer
    /// never saw moves onto this one, unless this one brings its own.
    fn publish(&self, state: Option<Box<EffectState>>) {
        let update = SlotUpdate {
            props: self.props.clone(),
            state,
        };
        self.shared.update.publish_merged(update, |update, stale| {
            if update.state.is_none() {
                update.state = stale.state.take();
            }
        });
    }
}

/// Slot values read by voices when they compute their send gains.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SlotMixParams {
    pub gain: f32,
    pub aux_send_auto: bool,
    pub target: Option<usize>,
    pub effect_type: EffectType,
    pub room_rolloff: f32,
    pub decay_time: f32,
    pub decay_lf_ratio: f32,
    pub decay_hf_ratio: f32,
    pub decay_hf_limit: bool,
    pub air_absorption_gain_hf: f32,
}

impl Default for SlotMixParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            aux_send_auto: true,
            target: None,
            effect_type: EffectType::Null,
            room_rolloff: 0.0,
            decay_time: 0.0,
            decay_lf_ratio: 0.0,
            decay_hf_ratio: 0.0,
            decay_hf_limit: false,
            air_absorption_gain_hf: 1.0,
        }
    }
}

/// Outcome of consuming a pending slot update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SlotChange {
    pub updated: bool,
    pub target_changed: bool,
}

/// Mixer-side slot: live effect state and wet bus.
pub(crate) struct SlotRenderer {
    shared: Arc<SlotShared>,
    pub active: bool,
    pub params: SlotMixParams,
    state: Box<EffectState>,
    out_target: OutTarget,
    pub wet: Vec<FloatBufferLine>,
}

impl SlotRenderer {
    pub fn new(shared: Arc<SlotShared>) -> Self {
        Self {
            shared,
            active: false,
            params: SlotMixParams::default(),
            state: Box::new(EffectState::new(EffectType::Null)),
            out_target: OutTarget::Main,
            wet: new_lines(WET_CHANNELS),
        }
    }

    /// Picks up the activation flag. Returns true when it flipped.
    pub fn sync_active(&mut self) -> bool {
        let active = self.shared.active.load(Ordering::Acquire);
        std::mem::replace(&mut self.active, active) != active
    }

    /// Consumes a pending update, swapping in a new effect state if one came
    /// with it. The replaced state goes back to the app thread as an event;
    /// with the ring full it rides back on the recycled update node instead.
    pub fn apply_update(
        &mut self,
        device: &DeviceInfo,
        wet_params: &MixParams,
        events: &mut EventSender,
    ) -> SlotChange {
        let Some(mut node) = self.shared.update.take() else {
            return SlotChange::default();
        };
        let props = &node.props;
        let target = props.target.map(SlotId::index);
        let target_changed = target != self.params.target;

        let mut params = SlotMixParams {
            gain: props.gain,
            aux_send_auto: props.aux_send_auto,
            target,
            effect_type: props.effect.effect_type(),
            ..SlotMixParams::default()
        };
        if let Some(reverb) = props.effect.reverb() {
            params.room_rolloff = reverb.room_rolloff_factor;
            params.decay_time = reverb.decay_time;
            params.decay_lf_ratio = reverb.decay_lf_ratio;
            params.decay_hf_ratio = reverb.decay_hf_ratio;
            params.decay_hf_limit = reverb.decay_hf_limit;
            params.air_absorption_gain_hf = reverb.air_absorption_gain_hf;
        }
        self.params = params;

        if let Some(state) = node.state.take() {
            let old = std::mem::replace(&mut self.state, state);
            if let Err(Event::ReleaseEffectState(old)) = events.send(Event::ReleaseEffectState(old)) {
                node.state = Some(old);
            }
        }

        let slot = SlotParams {
            gain: node.props.gain,
            wet_channels: self.wet.len(),
        };
        let target = match self.params.target {
            Some(_) => EffectTarget {
                main: wet_params,
                real_out: None,
            },
            None => EffectTarget {
                main: &device.dry,
                real_out: Some(&device.real_out),
            },
        };
        self.out_target = self.state.update(device, &slot, &node.props.effect, target);
        self.shared.update.recycle(node);

        SlotChange {
            updated: true,
            target_changed,
        }
    }

    pub fn out_target(&self) -> OutTarget {
        self.out_target
    }

    pub fn clear_wet(&mut self, samples_to_do: usize) {
        for line in self.wet.iter_mut() {
            line[..samples_to_do].fill(0.0);
        }
    }

    pub fn process(&mut self, samples_to_do: usize, output: &mut [FloatBufferLine]) {
        self.state.process(samples_to_do, &self.wet, output);
    }
}

/// Orders `order` so every slot comes before the slot it targets, with
/// device-bound slots last. `active` lists the slots to sort; `target_of`
/// gives each slot's target.
///
/// Returns false when the targets form a cycle. The slots caught in it (and
/// anything feeding them) are removed from `order`, so they are not
/// processed at all.
pub(crate) fn sort_slots(
    order: &mut Vec<usize>,
    active: impl Iterator<Item = usize>,
    target_of: impl Fn(usize) -> Option<usize>,
) -> bool {
    order.clear();
    order.extend(active);

    let mut split = partition(order, |s| target_of(s).is_some());
    let mut next_target = order.len();
    while split > 1 {
        if next_target == split {
            order.drain(..split);
            return false;
        }
        next_target -= 1;
        let target = order[next_target];
        split = partition(&mut order[..split], |s| target_of(s) != Some(target));
    }
    true
}

/// Moves the entries matching `pred` to the front, returning how many there
/// are.
fn partition(items: &mut [usize], pred: impl Fn(usize) -> bool) -> usize {
    let mut split = 0;
    for i in 0..items.len() {
        if pred(items[i]) {
            items.swap(split, i);
            split += 1;
        }
    }
    split
}

/// Mutable access to two distinct slots of `items`.
pub(crate) fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> Option<(&mut T, &mut T)> {
    if a == b || a >= items.len() || b >= items.len() {
        return None;
    }
    if a < b {
        let (lo, hi) = items.split_at_mut(b);
        Some((&mut lo[a], &mut hi[0]))
    } else {
        let (lo, hi) = items.split_at_mut(a);
        Some((&mut hi[0], &mut lo[b]))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::effects::ReverbProps;
    use crate::events::{event_queue, EVENT_ALL};

    fn position(order: &[usize], slot: usize) -> usize {
        order.iter().position(|&s| s == slot).unwrap()
    }

    #[test]
    fn chained_slots_precede_their_targets() {
        // 0 -> 2 -> 1 -> device, 3 -> 1, 4 -> device
        let targets = [Some(2), None, Some(1), Some(1), None];
        let mut order = Vec::new();
        assert!(sort_slots(&mut order, 0..targets.len(), |s| targets[s]));
        assert_eq!(order.len(), targets.len());
        for (slot, target) in targets.iter().enumerate() {
            if let Some(t) = target {
                assert!(
                    position(&order, slot) < position(&order, *t),
                    "{} must run before {} in {:?}",
                    slot,
                    t,
                    order
                );
            }
        }
        // Device-bound slots go last.
        assert!(order[3..].contains(&1) && order[3..].contains(&4));
    }

    #[test]
    fn long_chain_sorts_fully() {
        let targets: Vec<Option<usize>> = (0..8).map(|s| if s < 7 { Some(s + 1) } else { None }).collect();
        let mut order = Vec::new();
        assert!(sort_slots(&mut order, (0..8).rev(), |s| targets[s]));
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn cycles_are_dropped_from_the_order() {
        // 0 <-> 1 is a loop, 2 feeds it, 3 goes to the device.
        let targets = [Some(1), Some(0), Some(0), None];
        let mut order = Vec::new();
        assert!(!sort_slots(&mut order, 0..targets.len(), |s| targets[s]));
        assert_eq!(order, vec![3]);
    }

    #[test]
    fn pair_mut_rejects_aliasing() {
        let mut v = [1, 2, 3];
        assert!(pair_mut(&mut v, 1, 1).is_none());
        let (a, b) = pair_mut(&mut v, 2, 0).unwrap();
        std::mem::swap(a, b);
        assert_eq!(v, [3, 2, 1]);
    }

    fn renderer_with_queue(capacity: usize) -> (SlotRenderer, Arc<SlotShared>, EventSender, crate::events::EventReceiver) {
        let shared = Arc::new(SlotShared::new());
        let renderer = SlotRenderer::new(shared.clone());
        let (tx, rx) = event_queue(capacity, Arc::new(AtomicU32::new(EVENT_ALL)));
        (renderer, shared, tx, rx)
    }

    #[test]
    fn type_change_swaps_state_and_releases_the_old_one() {
        let device = Arc::new(DeviceInfo::for_tests(48000));
        let (mut renderer, shared, mut tx, mut rx) = renderer_with_queue(4);
        let wet = MixParams::acn_identity(WET_CHANNELS);

        let mut slot = EffectSlot::new(SlotId(0), device.clone(), shared.clone());
        renderer.sync_active();
        assert!(renderer.active);
        let mut reverb = ReverbProps::default();
        reverb.decay_time = 2.5;
        reverb.room_rolloff_factor = 0.5;
        slot.set_effect(EffectProps::Reverb(reverb)).unwrap();

        let change = renderer.apply_update(&device, &wet, &mut tx);
        assert!(change.updated);
        assert!(!change.target_changed);
        assert_eq!(renderer.params.effect_type, EffectType::Reverb);
        assert_eq!(renderer.params.decay_time, 2.5);
        assert_eq!(renderer.params.room_rolloff, 0.5);

        // Only the last publish before the mix counts, so one state came
        // over and the initial null state went back.
        tx.signal();
        assert!(rx.poll().is_empty());
        assert_eq!(tx.free_slots(), 4);
    }

    #[test]
    fn full_ring_keeps_the_old_state_off_the_mixer() {
        let device = Arc::new(DeviceInfo::for_tests(48000));
        let (mut renderer, shared, mut tx, _rx) = renderer_with_queue(1);
        let wet = MixParams::acn_identity(WET_CHANNELS);
        tx.send(Event::Warning(crate::events::WarningKind::EffectSlotCycle)).unwrap();

        let mut slot = EffectSlot::new(SlotId(0), device.clone(), shared);
        renderer.apply_update(&device, &wet, &mut tx);
        slot.set_effect(EffectProps::Echo(Default::default())).unwrap();
        let change = renderer.apply_update(&device, &wet, &mut tx);
        assert!(change.updated);
        assert_eq!(renderer.params.effect_type, EffectType::Echo);
        assert_eq!(tx.free_slots(), 0);
    }

    #[test]
    fn new_state_survives_later_setters_in_the_same_block() {
        let device = Arc::new(DeviceInfo::for_tests(48000));
        let (mut renderer, shared, mut tx, _rx) = renderer_with_queue(8);
        let wet = MixParams::acn_identity(WET_CHANNELS);
        let mut slot = EffectSlot::new(SlotId(0), device.clone(), shared);
        renderer.apply_update(&device, &wet, &mut tx);

        slot.set_effect(EffectProps::Echo(Default::default())).unwrap();
        slot.set_gain(0.5).unwrap();
        slot.set_aux_send_auto(false);
        slot.set_effect(EffectProps::Echo(Default::default())).unwrap();
        renderer.apply_update(&device, &wet, &mut tx);

        assert!(matches!(*renderer.state, EffectState::Echo(_)));
        assert_eq!(renderer.params.effect_type, EffectType::Echo);
        assert_eq!(renderer.params.gain, 0.5);
        assert!(!renderer.params.aux_send_auto);
    }

    #[test]
    fn newest_state_wins_over_an_unconsumed_one() {
        let device = Arc::new(DeviceInfo::for_tests(48000));
        let (mut renderer, shared, mut tx, _rx) = renderer_with_queue(8);
        let wet = MixParams::acn_identity(WET_CHANNELS);
        let mut slot = EffectSlot::new(SlotId(0), device.clone(), shared);
        renderer.apply_update(&device, &wet, &mut tx);

        slot.set_effect(EffectProps::Echo(Default::default())).unwrap();
        slot.set_target(Some(SlotId(2)));
        slot.set_effect(EffectProps::Chorus(Default::default())).unwrap();
        let change = renderer.apply_update(&device, &wet, &mut tx);

        assert!(change.target_changed);
        assert!(matches!(*renderer.state, EffectState::Chorus(_)));
        assert!(renderer.shared.update.take().is_none());
    }

    #[test]
    fn non_reverb_effects_clear_the_decay_params() {
        let device = Arc::new(DeviceInfo::for_tests(44100));
        let (mut renderer, shared, mut tx, _rx) = renderer_with_queue(8);
        let wet = MixParams::acn_identity(WET_CHANNELS);
        let mut slot = EffectSlot::new(SlotId(3), device.clone(), shared);
        slot.set_effect(EffectProps::Chorus(Default::default())).unwrap();
        slot.set_target(Some(SlotId(1)));
        let change = renderer.apply_update(&device, &wet, &mut tx);
        assert!(change.target_changed);
        assert_eq!(renderer.params.target, Some(1));
        assert_eq!(renderer.params.decay_time, 0.0);
        assert_eq!(renderer.params.air_absorption_gain_hf, 1.0);
    }

    #[test]
    fn gain_is_clamped_and_nan_rejected() {
        let device = Arc::new(DeviceInfo::for_tests(44100));
        let mut slot = EffectSlot::new(SlotId(0), device, Arc::new(SlotShared::new()));
        slot.set_gain(3.0).unwrap();
        assert_eq!(slot.props().gain, 1.0);
        assert!(matches!(slot.set_gain(f32::NAN), Err(MixerError::InvalidValue(_))));
    }
}
