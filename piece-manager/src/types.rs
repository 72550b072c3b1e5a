use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// Identifies a sector. Unique per miner, issued by a `SectorIdentitySource`.
pub type SectorNumber = u64;

/// Identifies the storage deal a piece belongs to.
pub type DealId = u64;

/// A chain height. Logical time, not wall-clock.
pub type ChainEpoch = i64;

/// Miner actor id; scopes persisted state so several miners can share a
/// metadata directory.
pub type MinerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaddedBytesAmount(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnpaddedBytesAmount(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnpaddedByteIndex(pub u64);

impl From<PaddedBytesAmount> for u64 {
    fn from(n: PaddedBytesAmount) -> Self {
        n.0
    }
}

impl From<UnpaddedBytesAmount> for u64 {
    fn from(n: UnpaddedBytesAmount) -> Self {
        n.0
    }
}

impl From<UnpaddedByteIndex> for u64 {
    fn from(n: UnpaddedByteIndex) -> Self {
        n.0
    }
}

// Two bits of every 256 are lost to field-element padding. Split so the
// multiplication can't overflow.
impl From<PaddedBytesAmount> for UnpaddedBytesAmount {
    fn from(n: PaddedBytesAmount) -> Self {
        UnpaddedBytesAmount(n.0 / 128 * 127 + (n.0 % 128) * 127 / 128)
    }
}

impl From<UnpaddedBytesAmount> for UnpaddedByteIndex {
    fn from(n: UnpaddedBytesAmount) -> Self {
        UnpaddedByteIndex(n.0)
    }
}

impl Add for UnpaddedBytesAmount {
    type Output = UnpaddedBytesAmount;

    fn add(self, other: UnpaddedBytesAmount) -> UnpaddedBytesAmount {
        UnpaddedBytesAmount(self.0 + other.0)
    }
}

impl AddAssign for UnpaddedBytesAmount {
    fn add_assign(&mut self, other: UnpaddedBytesAmount) {
        self.0 += other.0;
    }
}

impl Sub for UnpaddedBytesAmount {
    type Output = UnpaddedBytesAmount;

    fn sub(self, other: UnpaddedBytesAmount) -> UnpaddedBytesAmount {
        UnpaddedBytesAmount(self.0 - other.0)
    }
}

impl Add<UnpaddedBytesAmount> for UnpaddedByteIndex {
    type Output = UnpaddedByteIndex;

    fn add(self, other: UnpaddedBytesAmount) -> UnpaddedByteIndex {
        UnpaddedByteIndex(self.0 + other.0)
    }
}

impl fmt::Display for UnpaddedBytesAmount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PaddedBytesAmount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
