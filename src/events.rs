//! Asynchronous notifications from the mixer to the application.
//!
//! The mixer pushes events into a single-producer ring and wakes the app
//! side; the app drains them with [`EventReceiver::poll`] or blocks on
//! [`EventReceiver::wait_timeout`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::sync::{Parker, Unparker};
use rtrb::{Consumer, Producer, PushError, RingBuffer};

use crate::effects::EffectState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WarningKind {
    /// A speaker delay exceeded the compensation line and was cut short.
    DistanceCompTruncated,
    /// Effect slots target each other in a loop; part of the graph is muted.
    EffectSlotCycle,
}

pub enum Event {
    SourceStateChange { id: u32, state: SourceState },
    BufferCompleted { id: u32, count: u32 },
    /// An effect state replaced on the mixer, handed back to be freed here.
    ReleaseEffectState(Box<EffectState>),
    Disconnected { message: String },
    Warning(WarningKind),
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::SourceStateChange { id, state } => f
                .debug_struct("SourceStateChange")
                .field("id", id)
                .field("state", state)
                .finish(),
            Event::BufferCompleted { id, count } => f
                .debug_struct("BufferCompleted")
                .field("id", id)
                .field("count", count)
                .finish(),
            Event::ReleaseEffectState(_) => f.write_str("ReleaseEffectState"),
            Event::Disconnected { message } => f
                .debug_struct("Disconnected")
                .field("message", message)
                .finish(),
            Event::Warning(kind) => f.debug_tuple("Warning").field(kind).finish(),
        }
    }
}

pub const EVENT_SOURCE_STATE: u32 = 1 << 0;
pub const EVENT_BUFFER_COMPLETED: u32 = 1 << 1;
pub const EVENT_DISCONNECTED: u32 = 1 << 2;
pub const EVENT_WARNING: u32 = 1 << 3;
pub const EVENT_ALL: u32 =
    EVENT_SOURCE_STATE | EVENT_BUFFER_COMPLETED | EVENT_DISCONNECTED | EVENT_WARNING;

impl Event {
    fn mask_bit(&self) -> Option<u32> {
        match self {
            Event::SourceStateChange { .. } => Some(EVENT_SOURCE_STATE),
            Event::BufferCompleted { .. } => Some(EVENT_BUFFER_COMPLETED),
            Event::Disconnected { .. } => Some(EVENT_DISCONNECTED),
            Event::Warning(_) => Some(EVENT_WARNING),
            Event::ReleaseEffectState(_) => None,
        }
    }
}

/// Mixer side of the queue.
pub struct EventSender {
    producer: Producer<Event>,
    unparker: Unparker,
    mask: Arc<AtomicU32>,
    pending_signal: bool,
}

/// App side of the queue.
pub struct EventReceiver {
    consumer: Consumer<Event>,
    parker: Parker,
}

/// Creates a queue holding up to `capacity` events. `mask` is shared with
/// the owning context so the app can enable and disable event kinds.
pub fn event_queue(capacity: usize, mask: Arc<AtomicU32>) -> (EventSender, EventReceiver) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    let parker = Parker::new();
    let unparker = parker.unparker().clone();
    (
        EventSender {
            producer,
            unparker,
            mask,
            pending_signal: false,
        },
        EventReceiver { consumer, parker },
    )
}

impl EventSender {
    pub fn is_enabled(&self, bit: u32) -> bool {
        self.mask.load(Ordering::Acquire) & bit != 0
    }

    /// Queues `event` unless its kind is masked off. A full ring hands the
    /// event back so the caller can pick a fallback.
    pub fn send(&mut self, event: Event) -> Result<(), Event> {
        if let Some(bit) = event.mask_bit() {
            if !self.is_enabled(bit) {
                return Ok(());
            }
        }
        match self.producer.push(event) {
            Ok(()) => {
                self.pending_signal = true;
                Ok(())
            }
            Err(PushError::Full(event)) => Err(event),
        }
    }

    /// Wakes the app side if anything was queued since the last signal.
    pub fn signal(&mut self) {
        if self.pending_signal {
            self.pending_signal = false;
            self.unparker.unpark();
        }
    }

    pub fn free_slots(&self) -> usize {
        self.producer.slots()
    }
}

impl EventReceiver {
    /// Drains every available event in FIFO order. Released effect states
    /// are dropped here, on the calling thread, and are not returned.
    pub fn poll(&mut self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.consumer.slots());
        while let Ok(event) = self.consumer.pop() {
            match event {
                Event::ReleaseEffectState(state) => drop(state),
                other => events.push(other),
            }
        }
        events
    }

    /// Blocks until the mixer signals new events or `timeout` elapses, then
    /// drains the queue.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Vec<Event> {
        if self.consumer.is_empty() {
            self.parker.park_timeout(timeout);
        }
        self.poll()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> (EventSender, EventReceiver, Arc<AtomicU32>) {
        let mask = Arc::new(AtomicU32::new(EVENT_ALL));
        let (tx, rx) = event_queue(capacity, mask.clone());
        (tx, rx, mask)
    }

    #[test]
    fn events_arrive_in_order() {
        let (mut tx, mut rx, _) = queue(8);
        for id in 0..5 {
            tx.send(Event::BufferCompleted { id, count: 1 }).unwrap();
        }
        tx.signal();
        let ids: Vec<u32> = rx
            .poll()
            .into_iter()
            .map(|e| match e {
                Event::BufferCompleted { id, .. } => id,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn full_ring_returns_the_event() {
        let (mut tx, _rx, _) = queue(1);
        tx.send(Event::Warning(WarningKind::EffectSlotCycle)).unwrap();
        let back = tx.send(Event::Warning(WarningKind::DistanceCompTruncated));
        assert!(matches!(
            back,
            Err(Event::Warning(WarningKind::DistanceCompTruncated))
        ));
    }

    #[test]
    fn masked_events_are_skipped() {
        let (mut tx, mut rx, mask) = queue(4);
        mask.store(EVENT_ALL & !EVENT_BUFFER_COMPLETED, Ordering::Release);
        tx.send(Event::BufferCompleted { id: 1, count: 1 }).unwrap();
        tx.send(Event::SourceStateChange {
            id: 1,
            state: SourceState::Stopped,
        })
        .unwrap();
        let events = rx.poll();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::SourceStateChange { .. }));
    }

    #[test]
    fn wait_returns_after_signal() {
        let (mut tx, mut rx, _) = queue(4);
        let handle = std::thread::spawn(move || {
            tx.send(Event::Disconnected {
                message: "gone".into(),
            })
            .unwrap();
            tx.signal();
        });
        let mut events = rx.wait_timeout(Duration::from_secs(5));
        handle.join().unwrap();
        if events.is_empty() {
            events = rx.poll();
        }
        assert!(matches!(events[..], [Event::Disconnected { .. }]));
    }
}
