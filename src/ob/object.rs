//! Object Header and Counted References
//!
//! Every executive object (process, thread, job) carries an
//! [`ObjectHeader`] whose pointer count governs its *logical* lifetime.
//! When the count reaches zero the object's delete routine runs: it unlinks
//! the object from global lists, folds accounting, and releases dependent
//! references. Memory lifetime is separate and owned by `Arc`.
//!
//! Two kinds of handle to an object exist:
//!
//! - [`ObjectRef<T>`]: a *counted* reference. Cloning increments the
//!   pointer count, dropping decrements it and runs the delete routine at
//!   zero.
//! - `Arc<PsObject<T>>`: an *uncounted* link, used inside list structures
//!   (active process list, job member lists, thread lists). These keep the
//!   memory alive but do not keep the object logically alive; the delete
//!   routine removes them.
//!
//! Enumeration walks uncounted links and upgrades them with
//! [`ObjectRef::try_reference`], which refuses objects whose count has
//! already hit zero. That is what makes it safe to hand a caller an object
//! plucked from a list that a concurrent deleter is tearing down.

use alloc::sync::Arc;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Header embedded in every executive object.
pub struct ObjectHeader {
    /// Logical reference count; delete routine runs when it reaches zero.
    pointer_count: AtomicUsize,
}

impl ObjectHeader {
    const fn new() -> Self {
        Self {
            pointer_count: AtomicUsize::new(1),
        }
    }

    /// Unconditionally add a reference. The caller must already hold one.
    #[inline]
    pub fn reference(&self) {
        let old = self.pointer_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old > 0);
    }

    /// Drop a reference. Returns `true` if this was the last one.
    #[inline]
    pub fn dereference(&self) -> bool {
        self.pointer_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Add a reference only if the object is still logically alive.
    pub fn try_reference(&self) -> bool {
        let mut current = self.pointer_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.pointer_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Current count; diagnostic only.
    #[inline]
    pub fn pointer_count(&self) -> usize {
        self.pointer_count.load(Ordering::Relaxed)
    }
}

/// Behavior an executive object type supplies.
pub trait ObjectBody: Sized + Send + Sync + 'static {
    /// Object-type name for log lines.
    const TYPE_NAME: &'static str;

    /// Runs when the pointer count reaches zero.
    ///
    /// Must unlink the object from any list holding uncounted `Arc` clones
    /// so the memory can be released, and drop dependent references. The
    /// count is zero on entry; `try_reference` already fails.
    fn delete(object: &Arc<PsObject<Self>>);
}

/// Header plus body; the unit the `Arc` allocates.
pub struct PsObject<T: ObjectBody> {
    header: ObjectHeader,
    body: T,
}

impl<T: ObjectBody> PsObject<T> {
    #[inline]
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    #[inline]
    pub fn body(&self) -> &T {
        &self.body
    }
}

impl<T: ObjectBody> Deref for PsObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.body
    }
}

/// Counted reference to an executive object.
pub struct ObjectRef<T: ObjectBody> {
    object: Arc<PsObject<T>>,
}

impl<T: ObjectBody> ObjectRef<T> {
    /// Create a new object with an initial count of one.
    pub fn new(body: T) -> Self {
        Self {
            object: Arc::new(PsObject {
                header: ObjectHeader::new(),
                body,
            }),
        }
    }

    /// The uncounted link for storing in lists.
    #[inline]
    pub fn object(&self) -> &Arc<PsObject<T>> {
        &self.object
    }

    /// Upgrade an uncounted link to a counted reference.
    ///
    /// Fails if the object's deletion has already begun.
    pub fn try_reference(object: &Arc<PsObject<T>>) -> Option<Self> {
        if object.header.try_reference() {
            Some(Self {
                object: Arc::clone(object),
            })
        } else {
            None
        }
    }

    /// Identity comparison against an uncounted link.
    #[inline]
    pub fn ptr_eq(&self, other: &Arc<PsObject<T>>) -> bool {
        Arc::ptr_eq(&self.object, other)
    }
}

impl<T: ObjectBody> Clone for ObjectRef<T> {
    fn clone(&self) -> Self {
        self.object.header.reference();
        Self {
            object: Arc::clone(&self.object),
        }
    }
}

impl<T: ObjectBody> Drop for ObjectRef<T> {
    fn drop(&mut self) {
        if self.object.header.dereference() {
            log::trace!("[OB] deleting {} object", T::TYPE_NAME);
            T::delete(&self.object);
        }
    }
}

impl<T: ObjectBody> Deref for ObjectRef<T> {
    type Target = PsObject<T>;

    fn deref(&self) -> &PsObject<T> {
        &self.object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicBool;

    static DELETED: AtomicBool = AtomicBool::new(false);

    struct Widget {
        value: u32,
    }

    impl ObjectBody for Widget {
        const TYPE_NAME: &'static str = "Widget";

        fn delete(_object: &Arc<PsObject<Self>>) {
            DELETED.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_delete_runs_at_zero() {
        DELETED.store(false, Ordering::SeqCst);
        let r = ObjectRef::new(Widget { value: 3 });
        let r2 = r.clone();
        assert_eq!(r.header().pointer_count(), 2);
        drop(r);
        assert!(!DELETED.load(Ordering::SeqCst));
        assert_eq!(r2.value, 3);
        drop(r2);
        assert!(DELETED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_try_reference_fails_after_delete() {
        let r = ObjectRef::new(Widget { value: 1 });
        let link = Arc::clone(r.object());

        let upgraded = ObjectRef::try_reference(&link).unwrap();
        drop(r);
        // One counted reference left; still alive
        assert_eq!(upgraded.header().pointer_count(), 1);
        drop(upgraded);

        // Count hit zero; the uncounted link can no longer be upgraded
        assert!(ObjectRef::try_reference(&link).is_none());
    }
}
