use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// Per-channel packet sequence number. Sequence numbers wrap around at `u16::MAX`, and all
///  comparisons are relative to a window start - there is no total order.
///
/// This is the single place for wrap-around arithmetic; window logic for both transmit and
///  receive side goes through [SeqNum::distance_from] and [SeqNum::in_window].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNum(u16);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    /// number of steps to get from `start` to `self`, going forward
    pub fn distance_from(&self, start: SeqNum) -> u16 {
        self.0.wrapping_sub(start.0)
    }

    /// true iff `self` is in `[start, start + len)` with wrap-around semantics
    pub fn in_window(&self, start: SeqNum, len: u16) -> bool {
        self.distance_from(start) < len
    }

    /// slot of this sequence number in a ring of the given capacity
    pub fn slot(&self, capacity: u16) -> usize {
        (self.0 % capacity) as usize
    }
}

impl Add<u16> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: u16) -> Self::Output {
        SeqNum(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u16> for SeqNum {
    fn add_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<SeqNum> for SeqNum {
    type Output = u16;

    fn sub(self, rhs: SeqNum) -> Self::Output {
        self.distance_from(rhs)
    }
}
