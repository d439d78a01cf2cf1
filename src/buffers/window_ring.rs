use crate::seq_num::SeqNum;

/// Fixed-capacity ring of optional slots, indexed by sequence number modulo capacity.
///
/// The capacity must be a power of two (and at most 2^15) so that slots stay contiguous when
///  sequence numbers wrap around. Which slots are valid is the owner's business - the ring
///  itself does not track a window position.
pub struct WindowRing<T> {
    slots: Vec<Option<T>>,
    capacity: u16,
}

impl<T> WindowRing<T> {
    pub fn new(capacity: u16) -> WindowRing<T> {
        assert!(capacity.is_power_of_two(), "window capacity must be a power of two, was {}", capacity);

        let mut slots = Vec::with_capacity(capacity.into());
        slots.resize_with(capacity.into(), || None);
        WindowRing { slots, capacity }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn get(&self, seq: SeqNum) -> Option<&T> {
        self.slots[seq.slot(self.capacity)].as_ref()
    }

    pub fn get_mut(&mut self, seq: SeqNum) -> Option<&mut T> {
        self.slots[seq.slot(self.capacity)].as_mut()
    }

    pub fn is_occupied(&self, seq: SeqNum) -> bool {
        self.slots[seq.slot(self.capacity)].is_some()
    }

    /// Put a value into the slot for `seq`, returning what was there before
    pub fn insert(&mut self, seq: SeqNum, value: T) -> Option<T> {
        self.slots[seq.slot(self.capacity)].replace(value)
    }

    pub fn take(&mut self, seq: SeqNum) -> Option<T> {
        self.slots[seq.slot(self.capacity)].take()
    }

    /// Remove all values, handing each to `f`
    pub fn drain_all(&mut self, mut f: impl FnMut(T)) {
        for slot in self.slots.iter_mut() {
            if let Some(value) = slot.take() {
                f(value);
            }
        }
    }
}
