//! Lock-free hand-off of property snapshots from the app thread to the mixer.
//!
//! The app publishes a boxed snapshot with a single atomic exchange. The mixer
//! takes whatever is pending at the start of a block and hands the box back
//! through a bounded free-list, so neither side allocates in steady state and
//! the mixer never frees memory.
//!
//! Each slot has one publisher, which reuses an unconsumed pending box in
//! place. A box is only allocated when nothing is pending and the free-list is
//! empty, so at most one other box (the one the mixer holds) exists and a
//! recycled box always fits.

use crossbeam::atomic::AtomicCell;
use crossbeam::queue::ArrayQueue;

/// Free-list capacity, above the two boxes one slot can have in flight.
const FREE_LIST_SIZE: usize = 8;

pub struct PropsSlot<T> {
    pending: AtomicCell<Option<Box<T>>>,
    free: ArrayQueue<Box<T>>,
}

impl<T: Send> PropsSlot<T> {
    pub fn new() -> Self {
        Self {
            pending: AtomicCell::new(None),
            free: ArrayQueue::new(FREE_LIST_SIZE),
        }
    }

    /// App side. Installs `value` as the pending update, replacing any update
    /// the mixer has not consumed yet.
    pub fn publish(&self, value: T) {
        self.publish_merged(value, |_, _| {});
    }

    /// App side. Like [`publish`](Self::publish), but an update the mixer has
    /// not consumed yet is first handed to `merge` together with the new
    /// value, so anything the new value must carry forward can be moved over.
    pub fn publish_merged(&self, mut value: T, merge: impl FnOnce(&mut T, &mut T)) {
        let mut node = match self.pending.take() {
            Some(mut stale) => {
                merge(&mut value, &mut stale);
                stale
            }
            None => match self.free.pop() {
                Some(node) => node,
                None => {
                    self.pending.store(Some(Box::new(value)));
                    return;
                }
            },
        };
        *node = value;
        self.pending.store(Some(node));
    }

    /// Mixer side. Takes the pending update, if any.
    pub fn take(&self) -> Option<Box<T>> {
        self.pending.take()
    }

    /// Mixer side. Returns a consumed node for reuse. The node's contents are
    /// overwritten (and dropped) by the next `publish` on the app thread.
    pub fn recycle(&self, node: Box<T>) {
        let pushed = self.free.push(node).is_ok();
        debug_assert!(pushed, "props free-list overflow");
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.free.len()
    }
}

impl<T: Send> Default for PropsSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_publish_wins() {
        let slot = PropsSlot::new();
        slot.publish(1u32);
        slot.publish(2u32);
        let node = slot.take().unwrap();
        assert_eq!(*node, 2);
        assert!(slot.take().is_none());
        slot.recycle(node);
    }

    #[test]
    fn stale_update_is_merged_into_the_next_one() {
        let slot = PropsSlot::new();
        slot.publish((1u32, Some(7u32)));
        slot.publish_merged((2u32, None), |new, stale| {
            if new.1.is_none() {
                new.1 = stale.1.take();
            }
        });
        let node = slot.take().unwrap();
        assert_eq!(*node, (2, Some(7)));
    }

    #[test]
    fn consumed_update_is_not_merged_again() {
        let slot = PropsSlot::new();
        slot.publish((1u32, Some(7u32)));
        let node = slot.take().unwrap();
        slot.recycle(node);
        let mut merged = false;
        slot.publish_merged((2u32, None), |_, _| merged = true);
        assert!(!merged);
        assert_eq!(*slot.take().unwrap(), (2, None));
    }

    #[test]
    fn free_list_never_overflows() {
        let slot = PropsSlot::new();
        let mut held = None;
        for i in 0..1000u32 {
            slot.publish(i);
            if i % 3 == 0 {
                slot.publish(i + 1);
            }
            if i % 2 == 0 {
                if let Some(node) = held.take() {
                    slot.recycle(node);
                }
                held = slot.take();
            }
            assert!(slot.free_len() <= 2, "{} boxes parked", slot.free_len());
        }
    }

    #[test]
    fn recycled_nodes_are_reused() {
        let slot = PropsSlot::new();
        slot.publish(vec![1.0f32; 4]);
        let node = slot.take().unwrap();
        let ptr = &*node as *const Vec<f32>;
        slot.recycle(node);
        slot.publish(vec![2.0f32; 4]);
        let node = slot.take().unwrap();
        assert_eq!(&*node as *const Vec<f32>, ptr);
        assert_eq!(node[0], 2.0);
    }
}
