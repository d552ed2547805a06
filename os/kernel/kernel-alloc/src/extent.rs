//! # Extent Arena
//!
//! Fixed pool of address-space extents for the vmalloc heap. Extents are
//! addressed by stable [`ExtentId`] handles and linked into doubly linked
//! [`ExtentList`]s through the arena, so no heap allocation is needed to track
//! them. Unused nodes are chained on an internal stack.

use core::iter::FusedIterator;

/// Number of extent nodes available to the vmalloc heap.
pub const EXTENT_CAPACITY: usize = 256;

/// Handle to a node in an [`ExtentArena`].
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ExtentId(u16);

impl ExtentId {
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExtentState {
    Unused,
    Free,
    Occupied,
}

/// An inclusive range of virtual addresses `[min, max]`.
#[derive(Copy, Clone, Debug)]
pub struct Extent {
    pub min: u32,
    pub max: u32,
    pub state: ExtentState,
    prev: Option<ExtentId>,
    next: Option<ExtentId>,
}

impl Extent {
    const UNUSED: Self = Self {
        min: 0,
        max: 0,
        state: ExtentState::Unused,
        prev: None,
        next: None,
    };

    /// Size in bytes. Extents never span the whole 32-bit space.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.max - self.min + 1
    }

    /// `true` if `other` starts right after `self`.
    #[inline]
    #[must_use]
    pub fn touches(&self, other: &Self) -> bool {
        self.max.checked_add(1) == Some(other.min)
    }
}

/// Head of a list threaded through an [`ExtentArena`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ExtentList {
    head: Option<ExtentId>,
    len: usize,
}

impl ExtentList {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    #[must_use]
    pub const fn head(&self) -> Option<ExtentId> {
        self.head
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct ExtentArena {
    nodes: [Extent; EXTENT_CAPACITY],
    unused: Option<ExtentId>,
    available: usize,
}

impl Default for ExtentArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentArena {
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = [Extent::UNUSED; EXTENT_CAPACITY];
        for (i, node) in nodes.iter_mut().enumerate().skip(1) {
            node.next = Some(ExtentId(i as u16 - 1));
        }
        Self {
            nodes,
            unused: Some(ExtentId(EXTENT_CAPACITY as u16 - 1)),
            available: EXTENT_CAPACITY,
        }
    }

    /// Unused nodes left.
    #[inline]
    #[must_use]
    pub const fn available(&self) -> usize {
        self.available
    }

    /// Take an unused node for `[min, max]`. It belongs to no list yet.
    pub fn alloc(&mut self, min: u32, max: u32, state: ExtentState) -> Option<ExtentId> {
        debug_assert!(min <= max);
        debug_assert_ne!(state, ExtentState::Unused);
        let id = self.unused?;
        self.unused = self.nodes[id.index()].next;
        self.available -= 1;
        self.nodes[id.index()] = Extent {
            min,
            max,
            state,
            prev: None,
            next: None,
        };
        Some(id)
    }

    /// Return a node that is no longer linked into any list.
    pub fn release(&mut self, id: ExtentId) {
        let node = &mut self.nodes[id.index()];
        assert_ne!(node.state, ExtentState::Unused, "extent {} released twice", id.0);
        *node = Extent {
            next: self.unused,
            ..Extent::UNUSED
        };
        self.unused = Some(id);
        self.available += 1;
    }

    /// Resolve a raw handle read back from memory.
    #[must_use]
    pub fn id(&self, raw: u32) -> Option<ExtentId> {
        let raw = u16::try_from(raw).ok()?;
        let id = ExtentId(raw);
        (id.index() < EXTENT_CAPACITY && self.nodes[id.index()].state != ExtentState::Unused)
            .then_some(id)
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: ExtentId) -> &Extent {
        &self.nodes[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: ExtentId) -> &mut Extent {
        &mut self.nodes[id.index()]
    }

    #[inline]
    #[must_use]
    pub fn next(&self, id: ExtentId) -> Option<ExtentId> {
        self.nodes[id.index()].next
    }

    #[inline]
    #[must_use]
    pub fn prev(&self, id: ExtentId) -> Option<ExtentId> {
        self.nodes[id.index()].prev
    }

    pub fn push_front(&mut self, list: &mut ExtentList, id: ExtentId) {
        let old = list.head;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = None;
            node.next = old;
        }
        if let Some(old) = old {
            self.nodes[old.index()].prev = Some(id);
        }
        list.head = Some(id);
        list.len += 1;
    }

    /// Link `id` directly in front of `at`.
    pub fn insert_before(&mut self, list: &mut ExtentList, at: ExtentId, id: ExtentId) {
        let prev = self.nodes[at.index()].prev;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = prev;
            node.next = Some(at);
        }
        self.nodes[at.index()].prev = Some(id);
        match prev {
            Some(prev) => self.nodes[prev.index()].next = Some(id),
            None => list.head = Some(id),
        }
        list.len += 1;
    }

    /// Link `id` directly after `at`.
    pub fn insert_after(&mut self, list: &mut ExtentList, at: ExtentId, id: ExtentId) {
        let next = self.nodes[at.index()].next;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = Some(at);
            node.next = next;
        }
        self.nodes[at.index()].next = Some(id);
        if let Some(next) = next {
            self.nodes[next.index()].prev = Some(id);
        }
        list.len += 1;
    }

    pub fn unlink(&mut self, list: &mut ExtentList, id: ExtentId) {
        let Extent { prev, next, .. } = self.nodes[id.index()];
        match prev {
            Some(prev) => self.nodes[prev.index()].next = next,
            None => {
                debug_assert_eq!(list.head, Some(id), "extent {} is not in this list", id.0);
                list.head = next;
            }
        }
        if let Some(next) = next {
            self.nodes[next.index()].prev = prev;
        }
        let node = &mut self.nodes[id.index()];
        node.prev = None;
        node.next = None;
        list.len -= 1;
    }

    /// Walk `list` from its head.
    #[must_use]
    pub const fn iter(&self, list: &ExtentList) -> ExtentIter<'_> {
        ExtentIter {
            arena: self,
            cursor: list.head,
        }
    }
}

pub struct ExtentIter<'a> {
    arena: &'a ExtentArena,
    cursor: Option<ExtentId>,
}

impl<'a> Iterator for ExtentIter<'a> {
    type Item = (ExtentId, &'a Extent);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let extent = self.arena.get(id);
        self.cursor = extent.next;
        Some((id, extent))
    }
}

impl FusedIterator for ExtentIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(arena: &ExtentArena, list: &ExtentList) -> Vec<(u32, u32)> {
        arena.iter(list).map(|(_, e)| (e.min, e.max)).collect()
    }

    #[test]
    fn nodes_are_recycled() {
        let mut arena = ExtentArena::new();
        let a = arena.alloc(0, 9, ExtentState::Free).expect("a");
        assert_eq!(arena.available(), EXTENT_CAPACITY - 1);
        arena.release(a);
        assert_eq!(arena.available(), EXTENT_CAPACITY);
        assert_eq!(arena.alloc(10, 19, ExtentState::Free), Some(a));
    }

    #[test]
    fn capacity_is_bounded() {
        let mut arena = ExtentArena::new();
        for i in 0..EXTENT_CAPACITY as u32 {
            assert!(arena.alloc(i, i, ExtentState::Occupied).is_some());
        }
        assert_eq!(arena.alloc(0, 0, ExtentState::Free), None);
        assert_eq!(arena.available(), 0);
    }

    #[test]
    fn list_operations_keep_links() {
        let mut arena = ExtentArena::new();
        let mut list = ExtentList::new();
        let b = arena.alloc(20, 29, ExtentState::Free).expect("b");
        arena.push_front(&mut list, b);
        let a = arena.alloc(10, 19, ExtentState::Free).expect("a");
        arena.insert_before(&mut list, b, a);
        let d = arena.alloc(40, 49, ExtentState::Free).expect("d");
        arena.insert_after(&mut list, b, d);
        let c = arena.alloc(30, 39, ExtentState::Free).expect("c");
        arena.insert_before(&mut list, d, c);

        assert_eq!(ranges(&arena, &list), [(10, 19), (20, 29), (30, 39), (40, 49)]);
        assert_eq!(list.len(), 4);
        assert_eq!(arena.prev(d), Some(c));

        arena.unlink(&mut list, b);
        arena.unlink(&mut list, a);
        arena.unlink(&mut list, d);
        assert_eq!(ranges(&arena, &list), [(30, 39)]);
        assert_eq!(arena.prev(c), None);
        assert_eq!(arena.next(c), None);
        assert_eq!(list.head(), Some(c));
    }

    #[test]
    fn raw_handles_are_validated() {
        let mut arena = ExtentArena::new();
        let a = arena.alloc(0, 9, ExtentState::Occupied).expect("a");
        assert_eq!(arena.id(u32::from(a.raw())), Some(a));
        assert_eq!(arena.id(EXTENT_CAPACITY as u32), None);
        assert_eq!(arena.id(0x1_0000), None);
        arena.release(a);
        assert_eq!(arena.id(u32::from(a.raw())), None);
    }

    #[test]
    fn touching_extents() {
        let low = Extent {
            min: 0xE000_0000,
            max: 0xE000_0FFF,
            ..Extent::UNUSED
        };
        let high = Extent {
            min: 0xE000_1000,
            max: 0xFFFF_FFFF,
            ..Extent::UNUSED
        };
        assert!(low.touches(&high));
        assert!(!high.touches(&low));
        assert_eq!(high.len(), 0x1FFF_F000);
    }
}
