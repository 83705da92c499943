//! Wait-group and join-group identifiers.

use core::fmt;

/// Group indices below this value are recycled through a bitmap; indices
/// at or above it are handed out once per boot.
pub const GROUP_FAST_INDICES: u32 = 256;

/// Group identifier: `{count, index}`.
///
/// `count` is a monotonic allocation counter and is never zero for an
/// allocated id, so two allocations that reuse the same index still compare
/// unequal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GroupId {
    count: u32,
    index: u32,
}

impl GroupId {
    pub const INVALID: GroupId = GroupId { count: 0, index: 0 };

    #[inline]
    pub const fn new(count: u32, index: u32) -> Self {
        Self { count, index }
    }

    #[inline]
    pub const fn count(self) -> u32 {
        self.count
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.count != 0
    }

    #[inline]
    pub const fn is_recyclable(self) -> bool {
        self.index < GROUP_FAST_INDICES
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            count: (raw >> 32) as u32,
            index: raw as u32,
        }
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        ((self.count as u64) << 32) | self.index as u64
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({}:{})", self.count, self.index)
    }
}
