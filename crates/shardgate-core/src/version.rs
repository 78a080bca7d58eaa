use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Identity of one incarnation of a sharded collection. A new epoch is minted
/// whenever a collection is dropped and recreated or its shard key is refined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch(Uuid);

impl Epoch {
    pub const UNSHARDED: Epoch = Epoch(Uuid::nil());
    pub const DROPPED: Epoch = Epoch(Uuid::from_u128(u128::MAX));

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic chunk version. Ordered by `(major, minor)` within one epoch and
/// incomparable across epochs, which is why only `PartialOrd` is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub epoch: Epoch,
    pub major: u32,
    pub minor: u32,
}

impl ChunkVersion {
    pub const UNSHARDED: ChunkVersion = ChunkVersion {
        epoch: Epoch::UNSHARDED,
        major: 0,
        minor: 0,
    };

    pub const DROPPED: ChunkVersion = ChunkVersion {
        epoch: Epoch::DROPPED,
        major: 0,
        minor: 0,
    };

    pub fn new(epoch: Epoch, major: u32, minor: u32) -> Self {
        Self {
            epoch,
            major,
            minor,
        }
    }

    /// `{epoch, 0, 0}`: the version of a shard that owns no chunks.
    pub fn zero(epoch: Epoch) -> Self {
        Self::new(epoch, 0, 0)
    }

    pub fn is_set(&self) -> bool {
        self.major > 0 || self.minor > 0
    }

    pub fn is_unsharded(&self) -> bool {
        *self == Self::UNSHARDED
    }

    pub fn same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch
    }

    pub fn inc_major(&self) -> Self {
        Self::new(self.epoch, self.major + 1, 0)
    }

    pub fn inc_minor(&self) -> Self {
        Self::new(self.epoch, self.major, self.minor + 1)
    }

    /// A shard accepts a request carrying `other` when both agree on epoch and
    /// major version; minor bumps (splits) do not change data placement.
    pub fn is_write_compatible_with(&self, other: &ChunkVersion) -> bool {
        self.same_epoch(other) && self.major == other.major
    }

    /// True only when both versions share an epoch and `self` sorts first.
    pub fn is_older_than(&self, other: &ChunkVersion) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Less))
    }

    pub fn with_epoch(&self, epoch: Epoch) -> Self {
        Self::new(epoch, self.major, self.minor)
    }
}

impl PartialOrd for ChunkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.epoch != other.epoch {
            return None;
        }
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_within_epoch_only() {
        let e1 = Epoch::generate();
        let e2 = Epoch::generate();
        let a = ChunkVersion::new(e1, 2, 0);
        let b = ChunkVersion::new(e1, 2, 3);
        let c = ChunkVersion::new(e1, 3, 0);
        assert!(a < b && b < c);
        assert!(a.is_older_than(&c));
        assert_eq!(a.partial_cmp(&ChunkVersion::new(e2, 1, 0)), None);
        assert!(!a.is_older_than(&ChunkVersion::new(e2, 9, 0)));
        assert!(a.is_write_compatible_with(&b));
        assert!(!a.is_write_compatible_with(&c));
    }

    #[test]
    fn sentinels_are_distinct() {
        assert_ne!(ChunkVersion::UNSHARDED, ChunkVersion::DROPPED);
        assert!(!ChunkVersion::UNSHARDED.is_set());
        assert_eq!(ChunkVersion::UNSHARDED.partial_cmp(&ChunkVersion::DROPPED), None);
        let v = ChunkVersion::new(Epoch::generate(), 4, 7);
        assert_eq!(v.inc_major().major, 5);
        assert_eq!(v.inc_major().minor, 0);
        assert_eq!(v.inc_minor().minor, 8);
    }
}
