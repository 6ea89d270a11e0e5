//! Executive Process Object
//!
//! The process is the unit of address space, security context and job
//! membership. Lifetime is governed by the object header count (see
//! `ob::object`): the delete routine unlinks the process from the active
//! list and its job, and frees its client ID.
//!
//! # Locks
//!
//! - `process_lock`: guards the thread list and thread link/unlink
//!   transitions (the exclusive process lock of the creation path)
//! - `security_lock`: serializes primary-token replacement against the
//!   slow path of the fast-reference slot
//! - `rundown`: blocks out new cross-process work once teardown starts

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, RwLock};

use crate::ex::{ExRundownRef, FastRef};
use crate::mm::{AddressSpace, Section};
use crate::ob::{ObjectBody, ObjectRef, PsObject};
use crate::ps::thread::Thread;
use crate::se::Token;

/// Length of the cached image file name
pub const PS_IMAGE_NAME_LENGTH: usize = 16;

/// All processors the subsystem schedules on
pub const SYSTEM_AFFINITY_MASK: u64 = 0xFF;

/// Process state flags (atomically updated word)
pub mod process_flags {
    /// Creation has been reported to notify callbacks
    pub const CREATE_REPORTED: u32 = 0x0000_0001;
    /// Debug port not inherited by children
    pub const NO_DEBUG_INHERIT: u32 = 0x0000_0002;
    /// Normal exit processing has begun
    pub const PROCESS_EXITING: u32 = 0x0000_0004;
    /// Termination requested; new threads are refused
    pub const PROCESS_DELETE: u32 = 0x0000_0008;
    /// Process breaks away from its parent's job
    pub const BREAKAWAY: u32 = 0x0000_1000;
    /// System process (no user address space)
    pub const SYSTEM: u32 = 0x0000_2000;
    /// Address-space takeover was requested at creation
    /// Image mapped with large pages
    pub const LARGE_PAGES: u32 = 0x0001_0000;
    pub const OVERRIDE_ADDRESS_SPACE: u32 = 0x0002_0000;
    /// Address space exists and must be torn down
    pub const HAS_ADDRESS_SPACE: u32 = 0x0004_0000;
}

/// Per-process job bookkeeping flags
pub mod job_status_flags {
    /// Admission was rolled back; exit must not decrement active count
    pub const NOT_REALLY_ACTIVE: u32 = 0x01;
    /// Accounting already folded into the job
    pub const ACCOUNTING_FOLDED: u32 = 0x02;
    /// NewProcess message has been posted
    pub const NEW_PROCESS_REPORTED: u32 = 0x04;
    /// ExitProcess message has been posted
    pub const EXIT_PROCESS_REPORTED: u32 = 0x08;
    /// Commit changes are reported to the job
    pub const REPORT_COMMIT_CHANGES: u32 = 0x10;
    /// Final memory report delivered
    pub const LAST_REPORT_MEMORY: u32 = 0x20;
}

/// Process priority classes
pub mod priority_class {
    pub const UNKNOWN: u32 = 0;
    pub const IDLE: u32 = 1;
    pub const NORMAL: u32 = 2;
    pub const HIGH: u32 = 3;
    pub const REALTIME: u32 = 4;
    pub const BELOW_NORMAL: u32 = 5;
    pub const ABOVE_NORMAL: u32 = 6;

    /// Base priority a class maps to
    pub fn base_priority(class: u32) -> i32 {
        match class {
            IDLE => 4,
            BELOW_NORMAL => 6,
            NORMAL => 8,
            ABOVE_NORMAL => 10,
            HIGH => 13,
            REALTIME => 24,
            _ => 8,
        }
    }
}

/// Process access rights
pub mod process_access {
    pub const TERMINATE: u32 = 0x0001;
    pub const CREATE_THREAD: u32 = 0x0002;
    pub const VM_OPERATION: u32 = 0x0008;
    pub const VM_READ: u32 = 0x0010;
    pub const VM_WRITE: u32 = 0x0020;
    pub const QUERY_INFORMATION: u32 = 0x0400;
    pub const SET_INFORMATION: u32 = 0x0200;
    pub const SUSPEND_RESUME: u32 = 0x0800;
    pub const ALL_ACCESS: u32 = 0x1FFF;
}

/// Per-process I/O transfer counters.
#[derive(Default)]
pub struct IoCounters {
    pub read_operation_count: AtomicU64,
    pub write_operation_count: AtomicU64,
    pub other_operation_count: AtomicU64,
    pub read_transfer_count: AtomicU64,
    pub write_transfer_count: AtomicU64,
    pub other_transfer_count: AtomicU64,
}

/// Process environment block, the user-visible process header.
pub struct Peb {
    pub image_base_address: u64,
    pub session_id: u32,
    pub number_of_processors: u32,
}

/// Executive process object body.
pub struct Process {
    /// Assigned once during creation, before the process is published
    unique_process_id: AtomicU32,
    pub inherited_from_unique_process_id: u32,
    pub image_file_name: [u8; PS_IMAGE_NAME_LENGTH],
    pub session_id: u32,
    pub create_time: u64,
    pub exit_time: AtomicU64,
    exit_status: AtomicI32,

    flags: AtomicU32,
    job_status: AtomicU32,

    pub rundown: ExRundownRef,

    /// Guards the thread list and link/unlink transitions
    pub(crate) process_lock: RwLock<Vec<Arc<PsObject<Thread>>>>,
    pub(crate) active_threads: AtomicU32,

    /// Serializes primary-token replacement; shared holders may use the
    /// fast-ref slow path
    pub(crate) security_lock: RwLock<()>,
    pub(crate) primary_token: FastRef<Token>,

    /// Set-once job binding; the reference is counted and released by the
    /// delete routine
    pub(crate) job: Mutex<Option<ObjectRef<crate::ps::job::Job>>>,

    pub(crate) address_space: Mutex<Option<AddressSpace>>,
    pub(crate) section: Mutex<Option<Arc<Section>>>,
    pub(crate) peb: Mutex<Option<Peb>>,

    // Accounting
    pub user_time: AtomicU64,
    pub kernel_time: AtomicU64,
    pub page_fault_count: AtomicU64,
    pub commit_charge: AtomicU64,
    pub commit_charge_peak: AtomicU64,
    pub commit_charge_limit: AtomicU64,
    pub io_counters: IoCounters,

    // Scheduling parameters (stamped by job limits)
    pub priority_class: AtomicU32,
    pub base_priority: AtomicI32,
    pub affinity: AtomicU64,
    pub thread_quantum: AtomicU32,
    pub working_set_minimum: AtomicUsize,
    pub working_set_maximum: AtomicUsize,

    pub granted_access: AtomicU32,
}

pub type ProcessRef = ObjectRef<Process>;
pub type ProcessObj = Arc<PsObject<Process>>;

impl Process {
    pub(crate) fn new(
        image_name: &str,
        parent_pid: u32,
        session_id: u32,
        token: Arc<Token>,
        address_space: AddressSpace,
        section: Option<Arc<Section>>,
        create_time: u64,
    ) -> Self {
        let mut name = [0u8; PS_IMAGE_NAME_LENGTH];
        let bytes = image_name.as_bytes();
        let len = bytes.len().min(PS_IMAGE_NAME_LENGTH - 1);
        name[..len].copy_from_slice(&bytes[..len]);

        Self {
            unique_process_id: AtomicU32::new(0),
            inherited_from_unique_process_id: parent_pid,
            image_file_name: name,
            session_id,
            create_time,
            exit_time: AtomicU64::new(0),
            exit_status: AtomicI32::new(0),
            flags: AtomicU32::new(process_flags::HAS_ADDRESS_SPACE),
            job_status: AtomicU32::new(0),
            rundown: ExRundownRef::new(),
            process_lock: RwLock::new(Vec::new()),
            active_threads: AtomicU32::new(0),
            security_lock: RwLock::new(()),
            primary_token: FastRef::new(token),
            job: Mutex::new(None),
            address_space: Mutex::new(Some(address_space)),
            section: Mutex::new(section),
            peb: Mutex::new(None),
            user_time: AtomicU64::new(0),
            kernel_time: AtomicU64::new(0),
            page_fault_count: AtomicU64::new(0),
            commit_charge: AtomicU64::new(0),
            commit_charge_peak: AtomicU64::new(0),
            commit_charge_limit: AtomicU64::new(0),
            io_counters: IoCounters::default(),
            priority_class: AtomicU32::new(priority_class::NORMAL),
            base_priority: AtomicI32::new(priority_class::base_priority(priority_class::NORMAL)),
            affinity: AtomicU64::new(SYSTEM_AFFINITY_MASK),
            thread_quantum: AtomicU32::new(6),
            working_set_minimum: AtomicUsize::new(crate::mm::DEFAULT_WS_MINIMUM),
            working_set_maximum: AtomicUsize::new(crate::mm::DEFAULT_WS_MAXIMUM),
            granted_access: AtomicU32::new(0),
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    #[inline]
    pub fn unique_process_id(&self) -> u32 {
        self.unique_process_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_unique_process_id(&self, id: u32) {
        self.unique_process_id.store(id, Ordering::Release);
    }

    /// Image name without trailing NULs.
    pub fn image_name(&self) -> &[u8] {
        let end = self
            .image_file_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PS_IMAGE_NAME_LENGTH);
        &self.image_file_name[..end]
    }

    // ========================================================================
    // Flag words
    // ========================================================================

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    #[inline]
    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Set a flag, returning whether it was already set.
    #[inline]
    pub fn test_set_flag(&self, flag: u32) -> bool {
        self.flags.fetch_or(flag, Ordering::AcqRel) & flag != 0
    }

    #[inline]
    pub fn has_job_status(&self, flag: u32) -> bool {
        self.job_status.load(Ordering::Acquire) & flag != 0
    }

    #[inline]
    pub fn set_job_status(&self, flag: u32) {
        self.job_status.fetch_or(flag, Ordering::AcqRel);
    }

    /// Set a job-status flag, returning whether it was already set.
    #[inline]
    pub fn test_set_job_status(&self, flag: u32) -> bool {
        self.job_status.fetch_or(flag, Ordering::AcqRel) & flag != 0
    }

    // ========================================================================
    // Threads
    // ========================================================================

    #[inline]
    pub fn active_threads(&self) -> u32 {
        self.active_threads.load(Ordering::Acquire)
    }

    // ========================================================================
    // Job binding
    // ========================================================================

    /// Counted reference to the containing job, if any.
    pub fn job(&self) -> Option<ObjectRef<crate::ps::job::Job>> {
        self.job.lock().as_ref().cloned()
    }

    /// Uncounted check used on hot paths.
    pub fn in_job(&self) -> bool {
        self.job.lock().is_some()
    }

    /// One-way job binding; fails if a job is already bound.
    pub(crate) fn try_bind_job(&self, job: ObjectRef<crate::ps::job::Job>) -> Result<(), ()> {
        let mut slot = self.job.lock();
        if slot.is_some() {
            return Err(());
        }
        *slot = Some(job);
        Ok(())
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    pub(crate) fn set_exit_status(&self, status: i32) {
        self.exit_status.store(status, Ordering::Release);
    }

    /// Advance charged user time (100ns units). Drives job time limits.
    pub fn charge_user_time(&self, delta: u64) {
        self.user_time.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn charge_kernel_time(&self, delta: u64) {
        self.kernel_time.fetch_add(delta, Ordering::AcqRel);
    }

    /// Record commit growth, maintaining the peak.
    pub fn charge_commit(&self, bytes: u64) {
        let new = self.commit_charge.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let mut peak = self.commit_charge_peak.load(Ordering::Acquire);
        while new > peak {
            match self.commit_charge_peak.compare_exchange_weak(
                peak,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }
}

impl ObjectBody for Process {
    const TYPE_NAME: &'static str = "Process";

    fn delete(object: &ProcessObj) {
        let process = object.body();
        log::debug!(
            "[PS] process {} delete, image={:?}",
            process.unique_process_id(),
            core::str::from_utf8(process.image_name()).unwrap_or("?")
        );

        crate::ps::unlink_active_process(object);

        let pid = process.unique_process_id();
        if pid != 0 {
            crate::ps::cid::ps_free_cid(pid);
        }

        if let Some(job) = process.job.lock().take() {
            crate::ps::job::psp_remove_process_from_job(&job, object);
            // job reference released when `job` drops here
        }

        process.address_space.lock().take();
        process.clear_flag(process_flags::HAS_ADDRESS_SPACE);
    }
}
