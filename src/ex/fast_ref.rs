//! Fast Reference Slot (EX_FAST_REF)
//!
//! A process references its primary token on nearly every access check, so
//! taking a lock per reference is too expensive. The fast reference slot
//! packs a pointer to a shared object together with a small cache of
//! pre-donated reference counts into a single atomic word:
//!
//! - Bits 3..: the `Arc<T>` pointer (requires 8-byte alignment)
//! - Bits 0..3: number of donated strong counts available for lock-free grab
//!
//! `fast_reference` hands out one donated count with a single CAS. When the
//! cache is exhausted the caller falls back to [`slow_reference`] under the
//! lock that also serializes [`swap`]; the slow path refills the cache.
//!
//! Replacing the object requires the owning lock held exclusively. The old
//! object must be dropped only after the lock has been released: releasing
//! the exclusive lock is the barrier that guarantees every slow-path
//! referencer has either finished against the old object or observes the
//! new one.

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Cached reference counts held in the low bits of the slot.
const MAX_CACHED: usize = 7;
const COUNT_MASK: usize = 0x7;
const PTR_MASK: usize = !COUNT_MASK;

/// Lock-free cached reference to a shared `Arc<T>`.
///
/// The slot always owns one strong count for the stored pointer in addition
/// to the donated cache, so the pointee stays alive for as long as the slot
/// holds it.
pub struct FastRef<T> {
    value: AtomicUsize,
    _marker: PhantomData<Arc<T>>,
}

// The slot hands out Arc<T> clones, so it needs the same bounds Arc does.
unsafe impl<T: Send + Sync> Send for FastRef<T> {}
unsafe impl<T: Send + Sync> Sync for FastRef<T> {}

impl<T> FastRef<T> {
    /// Install `object` with a full cache of donated counts.
    pub fn new(object: Arc<T>) -> Self {
        let packed = Self::pack(object);
        Self {
            value: AtomicUsize::new(packed),
            _marker: PhantomData,
        }
    }

    fn pack(object: Arc<T>) -> usize {
        assert!(core::mem::align_of::<T>() >= 8);
        let ptr = Arc::into_raw(object);
        debug_assert_eq!(ptr as usize & COUNT_MASK, 0);
        // Donate MAX_CACHED additional strong counts for lock-free handout.
        // The into_raw count above is the slot's own reference.
        unsafe {
            for _ in 0..MAX_CACHED {
                Arc::increment_strong_count(ptr);
            }
        }
        ptr as usize | MAX_CACHED
    }

    /// Take a reference without any lock.
    ///
    /// Returns `None` when the donated cache is exhausted; the caller then
    /// acquires the owning lock and uses [`slow_reference`](Self::slow_reference).
    pub fn fast_reference(&self) -> Option<Arc<T>> {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current & COUNT_MASK == 0 {
                return None;
            }
            match self.value.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let ptr = (current & PTR_MASK) as *const T;
                    // Ownership of one donated count transfers to this Arc.
                    return Some(unsafe { Arc::from_raw(ptr) });
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Take a reference while the owning lock is held (shared is enough).
    ///
    /// Also refills the donated cache so subsequent fast references succeed.
    ///
    /// # Safety contract
    ///
    /// The caller must hold the lock that serializes [`swap`](Self::swap);
    /// the stored pointer cannot change underneath us while it is held.
    pub fn slow_reference(&self) -> Arc<T> {
        let current = self.value.load(Ordering::Acquire);
        let ptr = (current & PTR_MASK) as *const T;
        let result = unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        };
        self.refill(ptr, current);
        result
    }

    /// Opportunistically top the cache back up to MAX_CACHED.
    fn refill(&self, ptr: *const T, mut current: usize) {
        loop {
            let cached = current & COUNT_MASK;
            if cached >= MAX_CACHED {
                return;
            }
            let add = MAX_CACHED - cached;
            unsafe {
                for _ in 0..add {
                    Arc::increment_strong_count(ptr);
                }
            }
            match self.value.compare_exchange(
                current,
                (current & PTR_MASK) | MAX_CACHED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => {
                    // A fast referencer raced us; give the extra counts back
                    // and retry against the observed state.
                    unsafe {
                        for _ in 0..add {
                            drop(Arc::from_raw(ptr));
                        }
                    }
                    current = observed;
                }
            }
        }
    }

    /// Replace the stored object, returning the old one.
    ///
    /// The caller must hold the owning lock exclusively, and must drop the
    /// returned `Arc` only after releasing that lock.
    pub fn swap(&self, object: Arc<T>) -> Arc<T> {
        let packed = Self::pack(object);
        let old = self.value.swap(packed, Ordering::AcqRel);
        let old_ptr = (old & PTR_MASK) as *const T;
        let cached = old & COUNT_MASK;
        unsafe {
            // Reclaim the undistributed donated counts, then take over the
            // slot's own count as the returned reference.
            for _ in 0..cached {
                drop(Arc::from_raw(old_ptr));
            }
            Arc::from_raw(old_ptr)
        }
    }

    /// Identity check against another reference, without taking one.
    pub fn ptr_eq(&self, other: &Arc<T>) -> bool {
        let current = self.value.load(Ordering::Acquire);
        (current & PTR_MASK) == Arc::as_ptr(other) as usize
    }
}

impl<T> Drop for FastRef<T> {
    fn drop(&mut self) {
        let current = *self.value.get_mut();
        let ptr = (current & PTR_MASK) as *const T;
        let cached = current & COUNT_MASK;
        unsafe {
            for _ in 0..cached {
                drop(Arc::from_raw(ptr));
            }
            drop(Arc::from_raw(ptr));
        }
    }
}
