//! Generation-indexed handles and slot pools
//!
//! Every GPU resource lives in a [`Pool`] slot and is referenced through a
//! typed [`Handle`]. A handle stores the slot index plus the generation the
//! slot had when the object was created. Destroying an object bumps the slot
//! generation, so stale handles stop resolving instead of aliasing whatever
//! object reuses the slot later.
//!
//! Slot indices are dense and start at 0, which lets the bindless descriptor
//! table use them directly as shader-visible array indices.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Typed `(index, generation)` reference into a [`Pool`]
///
/// Generation 0 never names a live slot, so `Handle::default()` is the
/// empty handle.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a handle from raw parts
    pub const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// The empty handle
    pub const fn empty() -> Self {
        Self::new(0, 0)
    }

    /// Slot index inside the owning pool
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot at creation time
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// True for the empty handle
    pub const fn is_empty(&self) -> bool {
        self.generation == 0
    }

    /// True for any non-empty handle (it may still be stale)
    pub const fn is_valid(&self) -> bool {
        !self.is_empty()
    }

    /// Pack into a single `u64` for interop (index in the low half)
    pub const fn as_u64(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_u64().hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

struct PoolEntry<T> {
    obj: Option<T>,
    generation: u32,
    next_free: Option<u32>,
}

/// Slot pool with a free list and per-slot generations
pub struct Pool<Tag, T> {
    entries: Vec<PoolEntry<T>>,
    free_head: Option<u32>,
    num_objects: u32,
    _marker: PhantomData<fn() -> Tag>,
}

impl<Tag, T> Pool<Tag, T> {
    /// Create an empty pool
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            num_objects: 0,
            _marker: PhantomData,
        }
    }

    /// Store an object, reusing the most recently freed slot if there is one
    pub fn create(&mut self, obj: T) -> Handle<Tag> {
        self.num_objects += 1;

        if let Some(index) = self.free_head {
            let entry = &mut self.entries[index as usize];
            self.free_head = entry.next_free.take();
            entry.obj = Some(obj);
            return Handle::new(index, entry.generation);
        }

        let index = self.entries.len() as u32;
        self.entries.push(PoolEntry {
            obj: Some(obj),
            generation: 1,
            next_free: None,
        });
        Handle::new(index, 1)
    }

    /// Remove the object behind `handle` and return it
    ///
    /// The slot generation is bumped immediately, so `handle` and all of its
    /// copies stop resolving. Empty and stale handles return `None`.
    pub fn destroy(&mut self, handle: Handle<Tag>) -> Option<T> {
        if handle.is_empty() {
            return None;
        }

        let entry = self.entries.get_mut(handle.index() as usize)?;
        if entry.generation != handle.generation() {
            return None;
        }
        let obj = entry.obj.take()?;

        entry.generation = entry.generation.wrapping_add(1);
        if entry.generation == 0 {
            entry.generation = 1;
        }
        entry.next_free = self.free_head;
        self.free_head = Some(handle.index());
        self.num_objects -= 1;

        Some(obj)
    }

    /// Resolve a handle
    pub fn get(&self, handle: Handle<Tag>) -> Option<&T> {
        if handle.is_empty() {
            return None;
        }
        let entry = self.entries.get(handle.index() as usize)?;
        if entry.generation != handle.generation() {
            return None;
        }
        entry.obj.as_ref()
    }

    /// Resolve a handle mutably
    pub fn get_mut(&mut self, handle: Handle<Tag>) -> Option<&mut T> {
        if handle.is_empty() {
            return None;
        }
        let entry = self.entries.get_mut(handle.index() as usize)?;
        if entry.generation != handle.generation() {
            return None;
        }
        entry.obj.as_mut()
    }

    /// Handle of the live object stored at `index`, if any
    pub fn handle_at(&self, index: u32) -> Option<Handle<Tag>> {
        let entry = self.entries.get(index as usize)?;
        entry.obj.as_ref().map(|_| Handle::new(index, entry.generation))
    }

    /// Number of live objects
    pub const fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Number of slots ever allocated, live or free
    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }

    /// Every slot in index order; free slots yield `None`
    pub fn slots(&self) -> impl Iterator<Item = Option<&T>> + '_ {
        self.entries.iter().map(|entry| entry.obj.as_ref())
    }

    /// Live objects with their handles
    pub fn iter(&self) -> impl Iterator<Item = (Handle<Tag>, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry
                .obj
                .as_ref()
                .map(|obj| (Handle::new(index as u32, entry.generation), obj))
        })
    }

    /// First live object matching `predicate`
    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<Handle<Tag>> {
        self.iter()
            .find(|(_, obj)| predicate(obj))
            .map(|(handle, _)| handle)
    }

    /// Take every live object out of the pool and forget all slots
    pub fn drain(&mut self) -> Vec<T> {
        self.free_head = None;
        self.num_objects = 0;
        self.entries.drain(..).filter_map(|entry| entry.obj).collect()
    }

    /// Drop every object and forget all slots
    pub fn clear(&mut self) {
        drop(self.drain());
    }
}

impl<Tag, T> Default for Pool<Tag, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum TestTag {}

    type TestPool = Pool<TestTag, &'static str>;

    #[test]
    fn test_empty_handle() {
        let handle: Handle<TestTag> = Handle::default();
        assert!(handle.is_empty());
        assert!(!handle.is_valid());

        let pool = TestPool::new();
        assert!(pool.get(handle).is_none());
    }

    #[test]
    fn test_create_and_get() {
        let mut pool = TestPool::new();
        let a = pool.create("a");
        let b = pool.create("b");

        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(a.generation(), 1);
        assert_eq!(pool.get(a), Some(&"a"));
        assert_eq!(pool.get(b), Some(&"b"));
        assert_eq!(pool.num_objects(), 2);
    }

    /// A destroyed handle must never alias the object that reuses its slot
    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut pool = TestPool::new();
        let old = pool.create("old");
        assert_eq!(pool.destroy(old), Some("old"));

        let new = pool.create("new");
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        assert!(pool.get(old).is_none());
        assert!(pool.destroy(old).is_none());
        assert_eq!(pool.get(new), Some(&"new"));
    }

    #[test]
    fn test_double_destroy_is_noop() {
        let mut pool = TestPool::new();
        let handle = pool.create("x");
        assert!(pool.destroy(handle).is_some());
        assert!(pool.destroy(handle).is_none());
        assert_eq!(pool.num_objects(), 0);
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut pool = TestPool::new();
        let a = pool.create("a");
        let b = pool.create("b");
        let _c = pool.create("c");

        pool.destroy(a);
        pool.destroy(b);

        assert_eq!(pool.create("d").index(), b.index());
        assert_eq!(pool.create("e").index(), a.index());
        assert_eq!(pool.slot_count(), 3);
    }

    #[test]
    fn test_slots_include_free_entries() {
        let mut pool = TestPool::new();
        let _a = pool.create("a");
        let b = pool.create("b");
        let _c = pool.create("c");
        pool.destroy(b);

        let slots: Vec<_> = pool.slots().collect();
        assert_eq!(slots, vec![Some(&"a"), None, Some(&"c")]);
        assert_eq!(pool.iter().count(), 2);
        assert!(pool.handle_at(1).is_none());
        assert!(pool.handle_at(2).is_some());
    }

    #[test]
    fn test_find_and_drain() {
        let mut pool = TestPool::new();
        pool.create("a");
        let b = pool.create("b");

        assert_eq!(pool.find(|obj| *obj == "b"), Some(b));
        assert_eq!(pool.find(|obj| *obj == "z"), None);

        let drained = pool.drain();
        assert_eq!(drained, vec!["a", "b"]);
        assert_eq!(pool.num_objects(), 0);
        assert_eq!(pool.slot_count(), 0);
        assert!(pool.get(b).is_none());
    }

    #[test]
    fn test_handle_packing() {
        let handle: Handle<TestTag> = Handle::new(7, 3);
        assert_eq!(handle.as_u64(), (3u64 << 32) | 7);
    }
}
