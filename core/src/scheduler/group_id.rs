//! Allocation of wait-group and join-group identifiers.
//!
//! Indices below [`GROUP_FAST_INDICES`] are tracked in a bitmap and recycled
//! on release. Once those run out, indices are handed out from a monotonic
//! counter and never reused for the rest of the boot. The count half of
//! every id is itself monotonic, so a recycled index never recreates an old
//! id, and a fast index only goes back to the bitmap when the released id
//! is the one currently holding it.

use kestrel_abi::{GROUP_FAST_INDICES, GroupId};
use kestrel_lib::IrqMutex;

use crate::error::{SchedError, SchedResult};

const BITMAP_WORDS: usize = (GROUP_FAST_INDICES as usize).div_ceil(64);

struct GroupState {
    count: u32,
    bitmap: [u64; BITMAP_WORDS],
    /// Count half of the id holding each fast index.
    holders: [u32; GROUP_FAST_INDICES as usize],
    next_slow: u32,
}

pub struct GroupIdAllocator {
    state: IrqMutex<GroupState>,
}

impl GroupIdAllocator {
    pub const fn new() -> Self {
        Self {
            state: IrqMutex::new(GroupState {
                count: 0,
                bitmap: [0; BITMAP_WORDS],
                holders: [0; GROUP_FAST_INDICES as usize],
                next_slow: GROUP_FAST_INDICES,
            }),
        }
    }

    pub fn allocate(&self) -> SchedResult<GroupId> {
        let mut state = self.state.lock();

        let fast = state
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(w, word)| (w, word.trailing_ones()))
            .filter(|&(w, bit)| (w as u32) * 64 + bit < GROUP_FAST_INDICES);

        let index = match fast {
            Some((word, bit)) => {
                state.bitmap[word] |= 1 << bit;
                word as u32 * 64 + bit
            }
            None => {
                if state.next_slow == u32::MAX {
                    return Err(SchedError::GroupsExhausted);
                }
                let index = state.next_slow;
                state.next_slow += 1;
                index
            }
        };

        state.count = match state.count.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        let count = state.count;
        if let Some(holder) = state.holders.get_mut(index as usize) {
            *holder = count;
        }
        Ok(GroupId::new(count, index))
    }

    /// Returns a fast index to the bitmap. A stale id, whose index has since
    /// gone to a newer group, is rejected. Slow indices are retired; their
    /// release only reports success.
    pub fn release(&self, id: GroupId) -> bool {
        if !id.is_valid() {
            return false;
        }
        if !id.is_recyclable() {
            return true;
        }
        let mut state = self.state.lock();
        let (word, bit) = ((id.index() / 64) as usize, id.index() % 64);
        let mask = 1u64 << bit;
        let holder = id.index() as usize;
        if state.bitmap[word] & mask == 0 || state.holders[holder] != id.count() {
            return false;
        }
        state.bitmap[word] &= !mask;
        state.holders[holder] = 0;
        true
    }
}

impl Default for GroupIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
