//! Fixed-capacity task slot arena.
//!
//! A slot is free iff its id carries generation zero. Allocation stamps the
//! next generation so a freed-and-reused slot never answers to an old id.

use alloc::boxed::Box;
use alloc::vec::Vec;

use kestrel_abi::TaskId;
use kestrel_lib::{IrqMutex, Link, LinkArena};

use super::task::Task;
use crate::error::{SchedError, SchedResult};

struct PoolMeta {
    generation: u32,
    used: usize,
}

pub struct TaskPool {
    slots: Box<[Task]>,
    meta: IrqMutex<PoolMeta>,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<Task> = (0..capacity as u32).map(Task::new).collect();
        Self {
            slots: slots.into_boxed_slice(),
            meta: IrqMutex::new(PoolMeta {
                generation: 0,
                used: 0,
            }),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used(&self) -> usize {
        self.meta.lock().used
    }

    pub fn allocate(&self) -> SchedResult<TaskId> {
        let mut meta = self.meta.lock();
        if meta.used >= self.slots.len() {
            return Err(SchedError::PoolExhausted);
        }

        let (offset, slot) = self
            .slots
            .iter()
            .enumerate()
            .find(|(_, slot)| !slot.id().is_valid())
            .ok_or(SchedError::PoolExhausted)?;

        meta.generation = match meta.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        let id = TaskId::new(meta.generation, offset as u32);
        slot.reset(id);
        meta.used += 1;
        Ok(id)
    }

    /// Returns `false` for ids that do not name a live task.
    pub fn free(&self, id: TaskId) -> bool {
        let mut meta = self.meta.lock();
        let Some(slot) = self.get(id) else {
            return false;
        };
        slot.clear();
        meta.used = meta.used.saturating_sub(1);
        true
    }

    /// Resolves a live id; stale or out-of-range ids yield `None`.
    #[inline]
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        if !id.is_valid() {
            return None;
        }
        self.slots
            .get(id.offset() as usize)
            .filter(|slot| slot.id() == id)
    }

    #[inline]
    pub fn slot(&self, offset: u32) -> Option<&Task> {
        self.slots.get(offset as usize)
    }

    pub fn live(&self) -> impl Iterator<Item = &Task> {
        self.slots.iter().filter(|slot| slot.id().is_valid())
    }

    /// Arena view threading the parent/child links.
    #[inline]
    pub fn children_arena(&self) -> ChildArena<'_> {
        ChildArena(self)
    }
}

impl LinkArena for TaskPool {
    fn link(&self, index: u32) -> Option<&Link> {
        self.slot(index).map(|task| &task.sched_link)
    }
}

pub struct ChildArena<'a>(&'a TaskPool);

impl LinkArena for ChildArena<'_> {
    fn link(&self, index: u32) -> Option<&Link> {
        self.0.slot(index).map(|task| &task.child_link)
    }
}
