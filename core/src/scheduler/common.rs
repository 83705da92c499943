//! State shared by every core: the wait list.
//!
//! Lock order is core → common. The wait list lock is a leaf: nothing else
//! is acquired while it is held.

use alloc::vec::Vec;

use kestrel_abi::{GroupId, TaskId};
use kestrel_lib::{IndexList, IrqMutex};

use super::task::{Residence, Task};
use super::task_pool::TaskPool;

/// Tag of the common wait list; outside every core's tag range.
pub(crate) const WAIT_LIST_TAG: u32 = 0xFFFF_0000;

pub struct CommonScheduler {
    wait: IrqMutex<IndexList>,
}

impl CommonScheduler {
    pub const fn new() -> Self {
        Self {
            wait: IrqMutex::new(IndexList::new(WAIT_LIST_TAG)),
        }
    }

    pub fn push(&self, pool: &TaskPool, task: &Task) -> bool {
        let mut wait = self.wait.lock();
        if !wait.push_back(pool, task.offset()) {
            return false;
        }
        task.set_residence(Residence::Waiting);
        true
    }

    pub fn remove(&self, pool: &TaskPool, task: &Task) -> bool {
        let mut wait = self.wait.lock();
        if !wait.remove(pool, task.offset()) {
            return false;
        }
        task.set_residence(Residence::Detached);
        true
    }

    pub fn contains(&self, pool: &TaskPool, task: &Task) -> bool {
        self.wait.lock().contains(pool, task.offset())
    }

    pub fn len(&self) -> usize {
        self.wait.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waiting tasks parked on `group`, oldest first.
    pub fn waiters_of(&self, pool: &TaskPool, group: GroupId) -> Vec<TaskId> {
        let wait = self.wait.lock();
        wait.iter(pool)
            .filter_map(|offset| pool.slot(offset))
            .filter(|task| task.wait_group() == group)
            .map(|task| task.id())
            .collect()
    }
}

impl Default for CommonScheduler {
    fn default() -> Self {
        Self::new()
    }
}
