//! Intrusive doubly-linked lists over a fixed slot arena.
//!
//! Elements are slot indices; the `prev`/`next` links live inside the slots
//! themselves, so a list never allocates. Every link records the tag of the
//! list holding it, which makes membership checks O(1) and lets `remove`
//! refuse an element that sits in some other list.
//!
//! Links are atomics only so they can live in shared slots; all mutation is
//! serialized by whichever lock guards the owning list.

use core::sync::atomic::{AtomicU32, Ordering};

/// End-of-list marker.
pub const NIL: u32 = u32::MAX;

/// Owner tag of a link that sits in no list.
pub const UNLINKED: u32 = u32::MAX;

pub struct Link {
    prev: AtomicU32,
    next: AtomicU32,
    owner: AtomicU32,
}

impl Link {
    pub const fn new() -> Self {
        Self {
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
            owner: AtomicU32::new(UNLINKED),
        }
    }

    /// Tag of the list holding this element.
    #[inline]
    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::Relaxed) {
            UNLINKED => None,
            tag => Some(tag),
        }
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.owner().is_some()
    }

    fn prev(&self) -> u32 {
        self.prev.load(Ordering::Relaxed)
    }

    fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    fn set_prev(&self, index: u32) {
        self.prev.store(index, Ordering::Relaxed);
    }

    fn set_next(&self, index: u32) {
        self.next.store(index, Ordering::Relaxed);
    }

    fn attach(&self, tag: u32, prev: u32, next: u32) {
        self.prev.store(prev, Ordering::Relaxed);
        self.next.store(next, Ordering::Relaxed);
        self.owner.store(tag, Ordering::Relaxed);
    }

    fn detach(&self) {
        self.prev.store(NIL, Ordering::Relaxed);
        self.next.store(NIL, Ordering::Relaxed);
        self.owner.store(UNLINKED, Ordering::Relaxed);
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps slot indices to the link a list threads through.
pub trait LinkArena {
    fn link(&self, index: u32) -> Option<&Link>;
}

/// List head. Holds no elements itself, only the ends of the chain.
#[derive(Debug)]
pub struct IndexList {
    head: u32,
    tail: u32,
    len: u32,
    tag: u32,
}

impl IndexList {
    pub const fn new(tag: u32) -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
            tag,
        }
    }

    #[inline]
    pub fn tag(&self) -> u32 {
        self.tag
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn head(&self) -> Option<u32> {
        (self.head != NIL).then_some(self.head)
    }

    #[inline]
    pub fn contains<A: LinkArena + ?Sized>(&self, arena: &A, index: u32) -> bool {
        arena
            .link(index)
            .is_some_and(|link| link.owner() == Some(self.tag))
    }

    /// Fails if the element is already in a list.
    pub fn push_back<A: LinkArena + ?Sized>(&mut self, arena: &A, index: u32) -> bool {
        let Some(link) = arena.link(index) else {
            return false;
        };
        if link.is_linked() {
            return false;
        }

        link.attach(self.tag, self.tail, NIL);
        match arena.link(self.tail) {
            Some(tail) => tail.set_next(index),
            None => self.head = index,
        }
        self.tail = index;
        self.len += 1;
        true
    }

    pub fn push_front<A: LinkArena + ?Sized>(&mut self, arena: &A, index: u32) -> bool {
        let Some(link) = arena.link(index) else {
            return false;
        };
        if link.is_linked() {
            return false;
        }

        link.attach(self.tag, NIL, self.head);
        match arena.link(self.head) {
            Some(head) => head.set_prev(index),
            None => self.tail = index,
        }
        self.head = index;
        self.len += 1;
        true
    }

    pub fn pop_front<A: LinkArena + ?Sized>(&mut self, arena: &A) -> Option<u32> {
        let index = self.head()?;
        self.unlink(arena, index);
        Some(index)
    }

    /// Fails if the element is not in this list.
    pub fn remove<A: LinkArena + ?Sized>(&mut self, arena: &A, index: u32) -> bool {
        if !self.contains(arena, index) {
            return false;
        }
        self.unlink(arena, index);
        true
    }

    fn unlink<A: LinkArena + ?Sized>(&mut self, arena: &A, index: u32) {
        let Some(link) = arena.link(index) else {
            return;
        };
        let (prev, next) = (link.prev(), link.next());

        match arena.link(prev) {
            Some(p) => p.set_next(next),
            None => self.head = next,
        }
        match arena.link(next) {
            Some(n) => n.set_prev(prev),
            None => self.tail = prev,
        }

        link.detach();
        self.len = self.len.saturating_sub(1);
    }

    /// Unlinks every element.
    pub fn clear<A: LinkArena + ?Sized>(&mut self, arena: &A) {
        while self.pop_front(arena).is_some() {}
    }

    pub fn iter<'a, A: LinkArena + ?Sized>(&self, arena: &'a A) -> Iter<'a, A> {
        Iter {
            arena,
            cursor: self.head,
            remaining: self.len,
        }
    }
}

pub struct Iter<'a, A: LinkArena + ?Sized> {
    arena: &'a A,
    cursor: u32,
    remaining: u32,
}

impl<A: LinkArena + ?Sized> Iterator for Iter<'_, A> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.cursor;
        let link = self.arena.link(index)?;
        self.cursor = link.next();
        self.remaining -= 1;
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;

    struct Arena(Vec<Link>);

    impl Arena {
        fn new(n: usize) -> Self {
            Self((0..n).map(|_| Link::new()).collect())
        }
    }

    impl LinkArena for Arena {
        fn link(&self, index: u32) -> Option<&Link> {
            self.0.get(index as usize)
        }
    }

    fn collect(list: &IndexList, arena: &Arena) -> Vec<u32> {
        list.iter(arena).collect()
    }

    #[test]
    fn push_pop_keeps_fifo_order() {
        let arena = Arena::new(8);
        let mut list = IndexList::new(1);
        assert!(list.push_back(&arena, 3));
        assert!(list.push_back(&arena, 5));
        assert!(list.push_front(&arena, 1));
        assert_eq!(collect(&list, &arena), [1, 3, 5]);
        assert_eq!(list.pop_front(&arena), Some(1));
        assert_eq!(list.pop_front(&arena), Some(3));
        assert_eq!(list.pop_front(&arena), Some(5));
        assert_eq!(list.pop_front(&arena), None);
        assert!(list.is_empty());
    }

    #[test]
    fn element_lives_in_one_list_at_a_time() {
        let arena = Arena::new(4);
        let mut ready = IndexList::new(1);
        let mut wait = IndexList::new(2);

        assert!(ready.push_back(&arena, 2));
        assert!(!wait.push_back(&arena, 2));
        assert!(!wait.remove(&arena, 2));
        assert!(ready.contains(&arena, 2));

        assert!(ready.remove(&arena, 2));
        assert!(wait.push_back(&arena, 2));
        assert!(wait.contains(&arena, 2));
        assert!(!ready.contains(&arena, 2));
    }

    #[test]
    fn remove_from_middle_and_ends() {
        let arena = Arena::new(6);
        let mut list = IndexList::new(7);
        for i in 0..5 {
            list.push_back(&arena, i);
        }
        assert!(list.remove(&arena, 2));
        assert!(list.remove(&arena, 0));
        assert!(list.remove(&arena, 4));
        assert_eq!(collect(&list, &arena), [1, 3]);
        assert_eq!(list.len(), 2);

        list.clear(&arena);
        assert!(list.is_empty());
        assert!(!arena.0[1].is_linked());
        assert!(!list.push_back(&arena, 9));
    }
}
