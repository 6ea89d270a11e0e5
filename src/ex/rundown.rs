//! Rundown Protection (EX_RUNDOWN_REF)
//!
//! An object that is about to be torn down must stop new references from
//! being handed out while letting existing holders finish. Rundown
//! protection packs both concerns into one word:
//!
//! - Bit 0: rundown active; once set, `acquire` fails permanently
//! - Bits 1..: count of outstanding protected references
//!
//! Process and thread objects each embed one of these. Creation paths,
//! suspend/resume, context access and job admission all acquire it for the
//! duration of their access; termination runs the object down first so no
//! new work can start against a dying object.

use core::sync::atomic::{AtomicUsize, Ordering};

const RUNDOWN_ACTIVE: usize = 0x1;
const REF_INCREMENT: usize = 0x2;
const REF_MASK: usize = !RUNDOWN_ACTIVE;

/// Combined rundown flag and protected-reference count.
pub struct ExRundownRef {
    value: AtomicUsize,
}

impl ExRundownRef {
    /// New instance, rundown not started.
    pub const fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
        }
    }

    /// Acquire rundown protection.
    ///
    /// Returns `false` if rundown has begun. A `true` return must be paired
    /// with exactly one [`release`](Self::release).
    pub fn acquire(&self) -> bool {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            if current & RUNDOWN_ACTIVE != 0 {
                return false;
            }
            match self.value.compare_exchange_weak(
                current,
                current + REF_INCREMENT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release one protected reference.
    pub fn release(&self) {
        let old = self.value.fetch_sub(REF_INCREMENT, Ordering::Release);
        debug_assert!(old & REF_MASK != 0);
        // The waiter in wait_for_rundown spins on the count reaching zero;
        // nothing further to signal here.
    }

    /// Begin rundown and wait until every protected reference is released.
    ///
    /// On return all future `acquire` calls fail and no holder remains.
    pub fn wait_for_rundown(&self) {
        let old = self.value.fetch_or(RUNDOWN_ACTIVE, Ordering::AcqRel);
        if old & REF_MASK == 0 {
            return;
        }
        while self.value.load(Ordering::Acquire) & REF_MASK != 0 {
            core::hint::spin_loop();
        }
    }

    /// Begin rundown without waiting.
    ///
    /// Returns `true` if no references were outstanding (rundown is already
    /// complete); `false` if holders remain.
    pub fn try_rundown(&self) -> bool {
        let old = self.value.fetch_or(RUNDOWN_ACTIVE, Ordering::AcqRel);
        old & REF_MASK == 0
    }

    /// Whether rundown has begun.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.value.load(Ordering::Relaxed) & RUNDOWN_ACTIVE != 0
    }

    /// Outstanding protected references.
    #[inline]
    pub fn reference_count(&self) -> usize {
        (self.value.load(Ordering::Relaxed) & REF_MASK) >> 1
    }
}

impl Default for ExRundownRef {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII holder of one protected reference.
pub struct RundownGuard<'a> {
    rundown: &'a ExRundownRef,
}

impl<'a> RundownGuard<'a> {
    /// Acquire protection, or `None` if rundown has begun.
    pub fn try_new(rundown: &'a ExRundownRef) -> Option<Self> {
        if rundown.acquire() {
            Some(Self { rundown })
        } else {
            None
        }
    }
}

impl<'a> Drop for RundownGuard<'a> {
    fn drop(&mut self) {
        self.rundown.release();
    }
}
