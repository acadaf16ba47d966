//! Observe sequence numbers and the freshness rule.
//!
//! Sequence numbers are 24-bit and wrap. Ordering uses serial-number
//! arithmetic: a value is newer when it lies less than half the space
//! ahead of the reference. Equal values are never newer, so redelivered
//! duplicates are dropped.

use std::fmt;

/// Width of the observe sequence space.
pub const SEQUENCE_BITS: u32 = 24;

/// Largest representable sequence number.
pub const SEQUENCE_MAX: u32 = (1 << SEQUENCE_BITS) - 1;

const HALF_SPACE: u32 = 1 << (SEQUENCE_BITS - 1);

/// A 24-bit observe sequence number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sequence(u32);

impl Sequence {
    /// Wrap a raw value into the 24-bit space.
    pub const fn new(raw: u32) -> Self {
        Self(raw & SEQUENCE_MAX)
    }

    /// Raw value.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// True if `self` is strictly newer than `last`.
    pub fn is_newer_than(self, last: Sequence) -> bool {
        let (v1, v2) = (last.0, self.0);
        (v1 < v2 && v2 - v1 < HALF_SPACE) || (v1 > v2 && v1 - v2 > HALF_SPACE)
    }

    /// The next sequence number, wrapping at 2^24.
    pub const fn next(self) -> Self {
        Self::new(self.0.wrapping_add(1))
    }
}

impl From<u32> for Sequence {
    fn from(raw: u32) -> Self {
        Self::new(raw)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence({})", self.0)
    }
}
