//! Executive Thread Object
//!
//! A thread pins its owning process with a counted reference for its whole
//! lifetime, so a process never deletes out from under one of its threads.
//! Cross-thread state transitions (termination, impersonation) go through
//! an atomically updated flag word; suspension is a saturating counter
//! with a force-resume override used by the termination path.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, Once, RwLock};

use crate::ex::ExRundownRef;
use crate::ob::{ObjectBody, ObjectRef, PsObject};
use crate::ps::cid::ClientId;
use crate::ps::context::ThreadContext;
use crate::ps::process::ProcessRef;
use crate::se::{ImpersonationLevel, Token};

/// Suspension saturates here; further suspends fail.
pub const MAX_SUSPEND_COUNT: u32 = 127;

/// Cross-thread state flags
pub mod cross_thread_flags {
    /// Termination has been initiated (set exactly once)
    pub const TERMINATED: u32 = 0x001;
    /// Creation failed after linking; thread exits without running
    pub const DEAD_THREAD: u32 = 0x002;
    pub const HIDE_FROM_DEBUGGER: u32 = 0x004;
    /// Impersonation block holds an active token
    pub const IMPERSONATING: u32 = 0x008;
    pub const SYSTEM: u32 = 0x010;
    pub const HARD_ERRORS_DISABLED: u32 = 0x020;
    pub const BREAK_ON_TERMINATION: u32 = 0x040;
    pub const SKIP_CREATION_MSG: u32 = 0x080;
    pub const SKIP_TERMINATION_MSG: u32 = 0x100;
}

/// Thread access rights
pub mod thread_access {
    pub const TERMINATE: u32 = 0x0001;
    pub const SUSPEND_RESUME: u32 = 0x0002;
    pub const GET_CONTEXT: u32 = 0x0008;
    pub const SET_CONTEXT: u32 = 0x0010;
    pub const SET_INFORMATION: u32 = 0x0020;
    pub const QUERY_INFORMATION: u32 = 0x0040;
    pub const SET_THREAD_TOKEN: u32 = 0x0080;
    pub const IMPERSONATE: u32 = 0x0100;
    pub const ALL_ACCESS: u32 = 0x01FF;
}

/// Thread environment block, enough for stack bookkeeping.
pub struct Teb {
    pub stack_base: u64,
    pub stack_limit: u64,
}

/// Active impersonation state. The block holding it is allocated at most
/// once per thread; only the contents change across impersonations.
#[derive(Clone)]
pub struct ImpersonationInfo {
    pub token: Arc<Token>,
    pub level: ImpersonationLevel,
    pub copy_on_open: bool,
    pub effective_only: bool,
}

/// Executive thread object body.
pub struct Thread {
    unique_thread_id: AtomicU32,
    /// Counted reference; released when the thread object is destroyed
    pub process: ProcessRef,
    pub start_address: u64,
    pub create_time: u64,
    pub exit_time: AtomicU64,
    exit_status: AtomicI32,

    cross_thread_flags: AtomicU32,
    pub rundown: ExRundownRef,

    suspend_count: AtomicU32,
    alerted: AtomicBool,

    /// Initialize-once impersonation block; inner lock is the thread
    /// security lock
    pub(crate) impersonation: Once<RwLock<Option<ImpersonationInfo>>>,

    pub(crate) context: Mutex<ThreadContext>,
    pub(crate) teb: Mutex<Option<Teb>>,

    pub granted_access: AtomicU32,
    pub user_time: AtomicU64,
    pub kernel_time: AtomicU64,
}

pub type ThreadRef = ObjectRef<Thread>;
pub type ThreadObj = Arc<PsObject<Thread>>;

impl Thread {
    pub(crate) fn new(process: ProcessRef, start_address: u64, create_time: u64) -> Self {
        Self {
            unique_thread_id: AtomicU32::new(0),
            process,
            start_address,
            create_time,
            exit_time: AtomicU64::new(0),
            exit_status: AtomicI32::new(0),
            cross_thread_flags: AtomicU32::new(0),
            rundown: ExRundownRef::new(),
            suspend_count: AtomicU32::new(0),
            alerted: AtomicBool::new(false),
            impersonation: Once::new(),
            context: Mutex::new(ThreadContext::new()),
            teb: Mutex::new(None),
            granted_access: AtomicU32::new(0),
            user_time: AtomicU64::new(0),
            kernel_time: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    #[inline]
    pub fn unique_thread_id(&self) -> u32 {
        self.unique_thread_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_unique_thread_id(&self, id: u32) {
        self.unique_thread_id.store(id, Ordering::Release);
    }

    pub fn cid(&self) -> ClientId {
        ClientId {
            unique_process: self.process.unique_process_id(),
            unique_thread: self.unique_thread_id(),
        }
    }

    // ========================================================================
    // Cross-thread flags
    // ========================================================================

    #[inline]
    pub fn has_cross_flag(&self, flag: u32) -> bool {
        self.cross_thread_flags.load(Ordering::Acquire) & flag != 0
    }

    #[inline]
    pub fn set_cross_flag(&self, flag: u32) {
        self.cross_thread_flags.fetch_or(flag, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_cross_flag(&self, flag: u32) {
        self.cross_thread_flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Set a flag, returning whether it was already set. Termination uses
    /// this so only one caller runs the exit path.
    #[inline]
    pub fn test_set_cross_flag(&self, flag: u32) -> bool {
        self.cross_thread_flags.fetch_or(flag, Ordering::AcqRel) & flag != 0
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.has_cross_flag(cross_thread_flags::TERMINATED)
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        self.has_cross_flag(cross_thread_flags::SYSTEM)
    }

    pub fn is_impersonating(&self) -> bool {
        self.has_cross_flag(cross_thread_flags::IMPERSONATING)
    }

    // ========================================================================
    // Suspension
    // ========================================================================

    #[inline]
    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    /// Increment the suspend count. Returns the previous count, or `None`
    /// when saturated.
    pub(crate) fn increment_suspend_count(&self) -> Option<u32> {
        let mut current = self.suspend_count.load(Ordering::Acquire);
        loop {
            if current >= MAX_SUSPEND_COUNT {
                return None;
            }
            match self.suspend_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrement the suspend count if nonzero. Returns the previous count.
    pub(crate) fn decrement_suspend_count(&self) -> u32 {
        let mut current = self.suspend_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match self.suspend_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current,
                Err(observed) => current = observed,
            }
        }
    }

    /// Clear suspension entirely; termination must never be held up by a
    /// suspended thread. Returns the previous count.
    pub(crate) fn force_resume(&self) -> u32 {
        self.suspend_count.swap(0, Ordering::AcqRel)
    }

    // ========================================================================
    // Alerts
    // ========================================================================

    pub(crate) fn set_alerted(&self) {
        self.alerted.store(true, Ordering::Release);
    }

    /// Consume a pending alert.
    pub fn test_alert(&self) -> bool {
        self.alerted.swap(false, Ordering::AcqRel)
    }

    // ========================================================================
    // Exit bookkeeping
    // ========================================================================

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    pub(crate) fn set_exit_status(&self, status: i32) {
        self.exit_status.store(status, Ordering::Release);
    }
}

impl ObjectBody for Thread {
    const TYPE_NAME: &'static str = "Thread";

    fn delete(object: &ThreadObj) {
        let thread = object.body();
        log::trace!(
            "[PS] thread {}.{} delete",
            thread.process.unique_process_id(),
            thread.unique_thread_id()
        );
        let tid = thread.unique_thread_id();
        if tid != 0 {
            crate::ps::cid::ps_free_cid(tid);
        }
        // The counted process reference drops with the thread memory once
        // the last uncounted link is gone.
    }
}
