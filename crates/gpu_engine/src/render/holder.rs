//! RAII ownership of resource handles
//!
//! A [`Holder`] queues its handle for destruction when dropped. The context
//! drains that queue on every submit, so resources dropped mid-frame are
//! destroyed through the deferred task queue once the GPU is done with them.
//! Share a resource by wrapping its holder in an `Rc`.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::foundation::Handle;
use crate::render::api::handles::{ReleasedHandle, ResourceTag};

/// Handles whose holders were dropped
pub(crate) type ReleaseQueue = Rc<RefCell<Vec<ReleasedHandle>>>;

/// Unique owner of a handle
#[must_use = "dropping a Holder destroys the resource"]
pub struct Holder<T: ResourceTag> {
    handle: Handle<T>,
    queue: Weak<RefCell<Vec<ReleasedHandle>>>,
}

impl<T: ResourceTag> Holder<T> {
    pub(crate) fn new(handle: Handle<T>, queue: &ReleaseQueue) -> Self {
        Self {
            handle,
            queue: Rc::downgrade(queue),
        }
    }

    /// A holder that owns nothing
    pub fn empty() -> Self {
        Self {
            handle: Handle::empty(),
            queue: Weak::new(),
        }
    }

    /// The owned handle
    pub fn handle(&self) -> Handle<T> {
        self.handle
    }

    /// True when nothing is owned
    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    /// Give up ownership without destroying; the caller must destroy the handle
    pub fn release(mut self) -> Handle<T> {
        std::mem::take(&mut self.handle)
    }

    /// Destroy the owned resource now and become empty
    pub fn reset(&mut self) {
        let handle = std::mem::take(&mut self.handle);
        self.enqueue(handle);
    }

    fn enqueue(&self, handle: Handle<T>) {
        if handle.is_empty() {
            return;
        }
        // The context is gone and took its resources with it
        if let Some(queue) = self.queue.upgrade() {
            queue.borrow_mut().push(T::released(handle));
        }
    }
}

impl<T: ResourceTag> Drop for Holder<T> {
    fn drop(&mut self) {
        self.enqueue(self.handle);
    }
}

impl<T: ResourceTag> Default for Holder<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ResourceTag> fmt::Debug for Holder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Holder")
            .field("kind", &T::KIND)
            .field("handle", &self.handle)
            .finish()
    }
}

impl<T: ResourceTag> From<&Holder<T>> for Handle<T> {
    fn from(holder: &Holder<T>) -> Self {
        holder.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::handles::{BufferTag, TextureHandle, TextureTag};

    fn queue() -> ReleaseQueue {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn test_drop_enqueues_handle() {
        let queue = queue();
        let handle = TextureHandle::new(4, 1);
        drop(Holder::new(handle, &queue));
        assert_eq!(*queue.borrow(), vec![ReleasedHandle::Texture(handle)]);
    }

    #[test]
    fn test_release_skips_destruction() {
        let queue = queue();
        let holder = Holder::<BufferTag>::new(Handle::new(1, 1), &queue);
        let handle = holder.release();
        assert_eq!(handle, Handle::new(1, 1));
        assert!(queue.borrow().is_empty());
    }

    #[test]
    fn test_reset_enqueues_once() {
        let queue = queue();
        let mut holder = Holder::<TextureTag>::new(Handle::new(2, 3), &queue);
        holder.reset();
        assert!(holder.is_empty());
        drop(holder);
        assert_eq!(queue.borrow().len(), 1);
    }

    #[test]
    fn test_shared_holder_releases_on_last_drop() {
        let queue = queue();
        let shared = Rc::new(Holder::<TextureTag>::new(Handle::new(5, 1), &queue));
        let other = Rc::clone(&shared);
        drop(shared);
        assert!(queue.borrow().is_empty());
        drop(other);
        assert_eq!(queue.borrow().len(), 1);
    }

    #[test]
    fn test_holder_outliving_queue_is_harmless() {
        let queue = queue();
        let holder = Holder::<TextureTag>::new(Handle::new(0, 1), &queue);
        drop(queue);
        drop(holder);
    }

    #[test]
    fn test_empty_holder_enqueues_nothing() {
        let queue = queue();
        drop(Holder::<TextureTag>::empty());
        assert!(queue.borrow().is_empty());
    }
}
