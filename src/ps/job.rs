//! Job Objects
//!
//! A job groups processes and enforces collective limits: active process
//! count, per-process and per-job CPU time, working-set bounds, memory
//! caps, scheduling parameters, UI restrictions and token policy.
//! Lifecycle events are multiplexed onto an optional completion port.
//!
//! # Locks
//!
//! - `inner` (job lock): member list, counters, limits, accounting,
//!   completion port, security limits
//! - `memory` (job-limits lock): leaf lock for memory-usage tracking,
//!   taken with or without the job lock but never the other way around
//! - job-set links and member levels are guarded by the global job-list
//!   lock in `ps::mod`
//!
//! # Admission
//!
//! `psp_add_process_to_job` mirrors the original admission order: the
//! process is linked and counted first, then the active-process limit,
//! the signaled job-time event and close-done/kill-on-close are checked
//! in that order. A rejected process is stamped `NOT_REALLY_ACTIVE` and
//! `ACCOUNTING_FOLDED` so the exit path neither double-decrements nor
//! folds accounting for a process that was never truly admitted.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::{Mutex, RwLock};

use crate::io::{IoCompletionPort, JobMessage};
use crate::mm;
use crate::ob::{ObjectBody, ObjectRef, PsObject};
use crate::ps::process::{
    job_status_flags, priority_class, Process, ProcessObj, ProcessRef, SYSTEM_AFFINITY_MASK,
};
use crate::se::{JobTokenFilter, Luid, Token, TokenType};
use crate::status::{NtStatus, PsResult};

// ============================================================================
// Flags and constants
// ============================================================================

bitflags! {
    /// Limits a job can impose on its members.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JobLimitFlags: u32 {
        const WORKINGSET                 = 0x0001;
        const PROCESS_TIME               = 0x0002;
        const JOB_TIME                   = 0x0004;
        const ACTIVE_PROCESS             = 0x0008;
        const AFFINITY                   = 0x0010;
        const PRIORITY_CLASS             = 0x0020;
        const PRESERVE_JOB_TIME          = 0x0040;
        const SCHEDULING_CLASS           = 0x0080;
        const PROCESS_MEMORY             = 0x0100;
        const JOB_MEMORY                 = 0x0200;
        const DIE_ON_UNHANDLED_EXCEPTION = 0x0400;
        const BREAKAWAY_OK               = 0x0800;
        const SILENT_BREAKAWAY_OK        = 0x1000;
        const KILL_ON_JOB_CLOSE          = 0x2000;
    }
}

/// Flags settable through the basic limit class
pub const JOB_BASIC_LIMIT_VALID_FLAGS: u32 = 0x00FF;
/// Flags settable through the extended limit class
pub const JOB_EXTENDED_LIMIT_VALID_FLAGS: u32 = 0x3FFF;

bitflags! {
    /// Token policy a job imposes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JobSecurityLimitFlags: u32 {
        const NO_ADMIN         = 0x1;
        const RESTRICTED_TOKEN = 0x2;
        const ONLY_TOKEN       = 0x4;
        const FILTER_TOKENS    = 0x8;
    }
}

bitflags! {
    /// User-interface restrictions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UiRestrictions: u32 {
        const HANDLES          = 0x01;
        const READ_CLIPBOARD   = 0x02;
        const WRITE_CLIPBOARD  = 0x04;
        const SYSTEM_PARAMETERS = 0x08;
        const DISPLAY_SETTINGS = 0x10;
        const GLOBAL_ATOMS     = 0x20;
        const DESKTOP          = 0x40;
        const EXIT_WINDOWS     = 0x80;
    }
}

/// Job object state flags
pub mod job_flags {
    /// Last external handle has been closed
    pub const CLOSE_DONE: u32 = 0x1;
}

/// What happens when the per-job time limit is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfJobTimeAction {
    /// Kill every member (default)
    TerminateAtEndOfJob,
    /// Post to the completion port and keep running
    PostAtEndOfJob,
}

impl EndOfJobTimeAction {
    pub fn from_u32(value: u32) -> PsResult<Self> {
        match value {
            0 => Ok(Self::TerminateAtEndOfJob),
            1 => Ok(Self::PostAtEndOfJob),
            _ => Err(NtStatus::InvalidParameter),
        }
    }
}

/// Scheduling-class ceiling; values above five need a privilege.
pub const JOB_MAX_SCHEDULING_CLASS: u32 = 9;
const PRIVILEGED_SCHEDULING_CLASS: u32 = 5;

/// 100ns units in one second
pub const ONE_SECOND_100NS: u64 = 10_000_000;
/// Cadence the host should drive [`ps_enforce_execution_time_limits`] at
/// (seven tenths of a second)
pub const JOB_TIME_LIMITS_PERIOD_100NS: u64 = 7_000_000;

// ============================================================================
// Information structures
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobIoCounters {
    pub read_operation_count: u64,
    pub write_operation_count: u64,
    pub other_operation_count: u64,
    pub read_transfer_count: u64,
    pub write_transfer_count: u64,
    pub other_transfer_count: u64,
}

impl JobIoCounters {
    pub const fn new() -> Self {
        Self {
            read_operation_count: 0,
            write_operation_count: 0,
            other_operation_count: 0,
            read_transfer_count: 0,
            write_transfer_count: 0,
            other_transfer_count: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobBasicLimitInformation {
    pub per_process_user_time_limit: u64,
    pub per_job_user_time_limit: u64,
    pub limit_flags: u32,
    pub minimum_working_set_size: usize,
    pub maximum_working_set_size: usize,
    pub active_process_limit: u32,
    pub affinity: u64,
    pub priority_class: u32,
    pub scheduling_class: u32,
}

impl JobBasicLimitInformation {
    pub const fn new() -> Self {
        Self {
            per_process_user_time_limit: 0,
            per_job_user_time_limit: 0,
            limit_flags: 0,
            minimum_working_set_size: 0,
            maximum_working_set_size: 0,
            active_process_limit: 0,
            affinity: 0,
            priority_class: 0,
            scheduling_class: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobExtendedLimitInformation {
    pub basic: JobBasicLimitInformation,
    pub io_info: JobIoCounters,
    pub process_memory_limit: usize,
    pub job_memory_limit: usize,
    pub peak_process_memory_used: usize,
    pub peak_job_memory_used: usize,
}

impl JobExtendedLimitInformation {
    pub const fn new() -> Self {
        Self {
            basic: JobBasicLimitInformation::new(),
            io_info: JobIoCounters::new(),
            process_memory_limit: 0,
            job_memory_limit: 0,
            peak_process_memory_used: 0,
            peak_job_memory_used: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobBasicAccountingInformation {
    pub total_user_time: u64,
    pub total_kernel_time: u64,
    pub this_period_total_user_time: u64,
    pub this_period_total_kernel_time: u64,
    pub total_page_fault_count: u64,
    pub total_processes: u32,
    pub active_processes: u32,
    pub total_terminated_processes: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobBasicAndIoAccountingInformation {
    pub basic: JobBasicAccountingInformation,
    pub io_info: JobIoCounters,
}

/// Member PID snapshot. `number_of_assigned_processes` exceeding the list
/// length means the caller's buffer could not hold every entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobBasicProcessIdList {
    pub number_of_assigned_processes: u32,
    pub process_id_list: Vec<u32>,
}

/// Security-limit set input.
pub struct JobSecurityLimitInformation {
    pub security_limit_flags: JobSecurityLimitFlags,
    pub job_token: Option<Arc<Token>>,
    pub sids_to_disable: Vec<crate::se::Sid>,
    pub privileges_to_delete: Vec<Luid>,
    pub restricted_sids: Vec<crate::se::Sid>,
}

/// Information classes, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobObjectInformationClass {
    BasicAccounting = 1,
    BasicLimit = 2,
    BasicProcessIdList = 3,
    BasicUiRestrictions = 4,
    SecurityLimit = 5,
    EndOfJobTime = 6,
    AssociateCompletionPort = 7,
    BasicAndIoAccounting = 8,
    ExtendedLimit = 9,
    JobSet = 10,
}

enum LengthRule {
    Exact(usize),
    Minimum(usize),
}

/// Byte-length requirement per class, matching the original's table.
fn job_info_length(class: JobObjectInformationClass) -> LengthRule {
    use core::mem::size_of;
    match class {
        JobObjectInformationClass::BasicAccounting => {
            LengthRule::Exact(size_of::<JobBasicAccountingInformation>())
        }
        JobObjectInformationClass::BasicLimit => {
            LengthRule::Exact(size_of::<JobBasicLimitInformation>())
        }
        JobObjectInformationClass::BasicProcessIdList => LengthRule::Minimum(16),
        JobObjectInformationClass::BasicUiRestrictions => LengthRule::Exact(4),
        JobObjectInformationClass::SecurityLimit => LengthRule::Minimum(16),
        JobObjectInformationClass::EndOfJobTime => LengthRule::Exact(4),
        JobObjectInformationClass::AssociateCompletionPort => LengthRule::Exact(16),
        JobObjectInformationClass::BasicAndIoAccounting => {
            LengthRule::Exact(size_of::<JobBasicAndIoAccountingInformation>())
        }
        JobObjectInformationClass::ExtendedLimit => {
            LengthRule::Exact(size_of::<JobExtendedLimitInformation>())
        }
        JobObjectInformationClass::JobSet => LengthRule::Exact(4),
    }
}

fn check_length(class: JobObjectInformationClass, length: usize) -> PsResult<()> {
    match job_info_length(class) {
        LengthRule::Exact(required) if length != required => Err(NtStatus::InfoLengthMismatch),
        LengthRule::Minimum(required) if length < required => Err(NtStatus::InfoLengthMismatch),
        _ => Ok(()),
    }
}

/// Query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobObjectInfo {
    BasicAccounting(JobBasicAccountingInformation),
    BasicLimit(JobBasicLimitInformation),
    BasicProcessIdList(JobBasicProcessIdList),
    BasicUiRestrictions(u32),
    SecurityLimit(u32),
    BasicAndIoAccounting(JobBasicAndIoAccountingInformation),
    ExtendedLimit(JobExtendedLimitInformation),
    EndOfJobTime(u32),
    JobSet(u32),
}

/// Set inputs.
pub enum JobObjectSetInfo {
    BasicLimit(JobBasicLimitInformation),
    ExtendedLimit(JobExtendedLimitInformation),
    BasicUiRestrictions(u32),
    SecurityLimit(JobSecurityLimitInformation),
    EndOfJobTime(u32),
    AssociateCompletionPort(usize, Arc<IoCompletionPort>),
}

impl JobObjectSetInfo {
    fn class(&self) -> JobObjectInformationClass {
        match self {
            JobObjectSetInfo::BasicLimit(_) => JobObjectInformationClass::BasicLimit,
            JobObjectSetInfo::ExtendedLimit(_) => JobObjectInformationClass::ExtendedLimit,
            JobObjectSetInfo::BasicUiRestrictions(_) => {
                JobObjectInformationClass::BasicUiRestrictions
            }
            JobObjectSetInfo::SecurityLimit(_) => JobObjectInformationClass::SecurityLimit,
            JobObjectSetInfo::EndOfJobTime(_) => JobObjectInformationClass::EndOfJobTime,
            JobObjectSetInfo::AssociateCompletionPort(_, _) => {
                JobObjectInformationClass::AssociateCompletionPort
            }
        }
    }
}

// ============================================================================
// The job object
// ============================================================================

pub(crate) struct JobInner {
    pub processes: Vec<ProcessObj>,
    pub total_processes: u32,
    pub active_processes: u32,
    pub total_terminated_processes: u32,

    pub limit_flags: JobLimitFlags,
    pub per_process_user_time_limit: u64,
    pub per_job_user_time_limit: u64,
    pub minimum_working_set_size: usize,
    pub maximum_working_set_size: usize,
    pub active_process_limit: u32,
    pub affinity: u64,
    pub priority_class: u32,
    pub scheduling_class: u32,

    pub total_user_time: u64,
    pub total_kernel_time: u64,
    pub this_period_total_user_time: u64,
    pub this_period_total_kernel_time: u64,
    pub total_page_fault_count: u64,
    pub io: JobIoCounters,

    pub completion_port: Option<Arc<IoCompletionPort>>,
    pub completion_key: usize,

    pub security_limit_flags: JobSecurityLimitFlags,
    pub token: Option<Arc<Token>>,
    pub filter: Option<Arc<JobTokenFilter>>,

    pub ui_restrictions: UiRestrictions,
    pub end_of_job_time_action: EndOfJobTimeAction,
}

impl JobInner {
    fn new() -> Self {
        Self {
            processes: Vec::new(),
            total_processes: 0,
            active_processes: 0,
            total_terminated_processes: 0,
            limit_flags: JobLimitFlags::empty(),
            per_process_user_time_limit: 0,
            per_job_user_time_limit: 0,
            minimum_working_set_size: 0,
            maximum_working_set_size: 0,
            active_process_limit: 0,
            affinity: 0,
            priority_class: 0,
            scheduling_class: 0,
            total_user_time: 0,
            total_kernel_time: 0,
            this_period_total_user_time: 0,
            this_period_total_kernel_time: 0,
            total_page_fault_count: 0,
            io: JobIoCounters::new(),
            completion_port: None,
            completion_key: 0,
            security_limit_flags: JobSecurityLimitFlags::empty(),
            token: None,
            filter: None,
            ui_restrictions: UiRestrictions::empty(),
            end_of_job_time_action: EndOfJobTimeAction::TerminateAtEndOfJob,
        }
    }

    fn post(&self, message: JobMessage, process_id: u32) {
        if let Some(port) = &self.completion_port {
            // A failed post is the port's problem; lifecycle goes on.
            let _ = port.post(self.completion_key, message, process_id);
        }
    }
}

/// Memory-usage tracking behind the leaf limits lock.
pub(crate) struct JobMemoryState {
    pub process_memory_limit: usize,
    pub job_memory_limit: usize,
    pub current_memory_used: usize,
    pub peak_job_memory_used: usize,
    pub peak_process_memory_used: usize,
}

static NEXT_JOB_ID: AtomicU32 = AtomicU32::new(1);

/// Job object body.
pub struct Job {
    pub job_id: u32,
    pub session_id: u32,
    flags: AtomicU32,
    /// Latched when the per-job time limit fires
    pub(crate) time_limit_event: AtomicBool,
    pub(crate) inner: RwLock<JobInner>,
    pub(crate) memory: Mutex<JobMemoryState>,

    // Job-set state; guarded by the global job-list lock
    pub(crate) member_level: AtomicU32,
    pub(crate) set_next: Mutex<Option<JobObj>>,
    /// Set creation left an extra reference on this job; released by the
    /// previous set member's deletion
    pub(crate) set_pinned: AtomicBool,
}

pub type JobRef = ObjectRef<Job>;
pub type JobObj = Arc<PsObject<Job>>;

impl Job {
    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    #[inline]
    fn test_set_flag(&self, flag: u32) -> bool {
        self.flags.fetch_or(flag, Ordering::AcqRel) & flag != 0
    }

    pub fn member_level(&self) -> u32 {
        self.member_level.load(Ordering::Acquire)
    }

    /// Whether the job time-limit event has fired.
    pub fn time_limit_signaled(&self) -> bool {
        self.time_limit_event.load(Ordering::Acquire)
    }
}

impl ObjectBody for Job {
    const TYPE_NAME: &'static str = "Job";

    fn delete(object: &JobObj) {
        // Deleting a set member releases the pin on the next member, which
        // may cascade; iterate instead of recursing through drops.
        let mut next = psp_job_delete_body(object);
        while let Some(candidate) = next {
            if !candidate.set_pinned.swap(false, Ordering::AcqRel) {
                break;
            }
            if candidate.header().dereference() {
                next = psp_job_delete_body(&candidate);
            } else {
                break;
            }
        }
    }
}

/// Tear down one job: limits cleared, port dropped, unlinked from the job
/// list and its set circle. Returns the next set member, whose pin the
/// caller releases.
fn psp_job_delete_body(object: &JobObj) -> Option<JobObj> {
    let job = object.body();
    log::debug!("[PS] job {} delete", job.job_id);

    {
        let mut inner = job.inner.write();
        inner.limit_flags = JobLimitFlags::empty();
        inner.completion_port = None;
        debug_assert!(inner.processes.is_empty());
    }

    let mut list = crate::ps::job_list().write();
    if let Some(pos) = list.iter().position(|j| Arc::ptr_eq(j, object)) {
        list.swap_remove(pos);
    }

    // Unlink from the set circle while still holding the job-list lock.
    let next = object.set_next.lock().take();
    let next = match next {
        Some(next) if !Arc::ptr_eq(&next, object) => {
            // Find our predecessor around the circle and splice.
            let mut prev = Arc::clone(&next);
            loop {
                let after = {
                    let guard = prev.set_next.lock();
                    guard.as_ref().map(Arc::clone)
                };
                match after {
                    Some(after) if Arc::ptr_eq(&after, object) => {
                        let alone = Arc::ptr_eq(&prev, &next);
                        *prev.set_next.lock() = if alone {
                            Some(Arc::clone(&prev))
                        } else {
                            Some(Arc::clone(&next))
                        };
                        break;
                    }
                    Some(after) => prev = after,
                    None => break,
                }
            }
            Some(next)
        }
        _ => None,
    };
    job.member_level.store(0, Ordering::Release);
    next
}

/// Create an empty job in the given session and publish it.
pub fn ps_create_job(session_id: u32) -> PsResult<JobRef> {
    let job = ObjectRef::new(Job {
        job_id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
        session_id,
        flags: AtomicU32::new(0),
        time_limit_event: AtomicBool::new(false),
        inner: RwLock::new(JobInner::new()),
        memory: Mutex::new(JobMemoryState {
            process_memory_limit: 0,
            job_memory_limit: 0,
            current_memory_used: 0,
            peak_job_memory_used: 0,
            peak_process_memory_used: 0,
        }),
        member_level: AtomicU32::new(0),
        set_next: Mutex::new(None),
        set_pinned: AtomicBool::new(false),
    });
    crate::ps::job_list().write().push(Arc::clone(job.object()));
    log::debug!("[PS] job {} created, session {}", job.job_id, session_id);
    Ok(job)
}

/// Last external handle closed: latch CLOSE_DONE and, for kill-on-close
/// jobs, take every member down.
pub fn ps_close_job(job: &JobRef) {
    if job.test_set_flag(job_flags::CLOSE_DONE) {
        return;
    }
    let kill = job
        .inner
        .read()
        .limit_flags
        .contains(JobLimitFlags::KILL_ON_JOB_CLOSE);
    if kill {
        psp_terminate_all_processes_in_job(job, crate::ps::terminate::EXIT_STATUS_JOB_TERMINATED);
    }
}

// ============================================================================
// Admission and removal
// ============================================================================

/// Assign a process to a job after creation time.
pub fn nt_assign_process_to_job_object(job: &JobRef, process: &ProcessRef) -> PsResult<()> {
    if process.in_job() {
        return Err(NtStatus::AccessDenied);
    }
    if process.session_id != job.session_id {
        return Err(NtStatus::AccessDenied);
    }
    if !process.rundown.acquire() {
        return Err(NtStatus::ProcessIsTerminating);
    }

    let result = (|| {
        if process.try_bind_job(job.clone()).is_err() {
            return Err(NtStatus::AccessDenied);
        }
        // The binding is irrevocable once the member is linked: a rejected
        // process stays on the job's list (stamped inactive) until its own
        // deletion unlinks it.
        match psp_add_process_to_job(job, process) {
            Ok(()) => {
                psp_job_report_new_process(job, process);
                Ok(())
            }
            Err(status) => Err(status),
        }
    })();

    // The exit path waits on the process rundown, so termination must not
    // run while this assignment still holds it.
    process.rundown.release();

    if result == Err(NtStatus::QuotaExceeded) {
        // Quota rejection cannot be unwound: the process is taken down but
        // stays bound to the job until deletion.
        let _ = crate::ps::terminate::psp_terminate_process(
            process,
            crate::ps::terminate::EXIT_STATUS_QUOTA_EXCEEDED,
        );
        job.inner.write().total_terminated_processes += 1;
    }
    result
}

/// Link a process into a job and run the admission checks.
///
/// The caller must already have bound `process.job`. On rejection the
/// member link is removed, the active count rolled back, and the process
/// stamped so later exit processing ignores it.
pub(crate) fn psp_add_process_to_job(job: &JobRef, process: &ProcessRef) -> PsResult<()> {
    let mut inner = job.inner.write();
    inner.processes.push(Arc::clone(process.object()));
    inner.total_processes += 1;
    inner.active_processes += 1;

    let mut failure = None;
    if inner.limit_flags.contains(JobLimitFlags::ACTIVE_PROCESS)
        && inner.active_processes > inner.active_process_limit
    {
        log::debug!(
            "[PS] job {}: process {} rejected by active-process limit",
            job.job_id,
            process.unique_process_id()
        );
        inner.post(JobMessage::ActiveProcessLimit, 0);
        failure = Some(NtStatus::QuotaExceeded);
    } else if inner.limit_flags.contains(JobLimitFlags::JOB_TIME) && job.time_limit_signaled() {
        failure = Some(NtStatus::QuotaExceeded);
    } else if job.has_flag(job_flags::CLOSE_DONE)
        && inner.limit_flags.contains(JobLimitFlags::KILL_ON_JOB_CLOSE)
    {
        failure = Some(NtStatus::InvalidParameter);
    }

    if let Some(status) = failure {
        // The rejected member stays on the process list; only the active
        // count rolls back. Stamping keeps exit processing from
        // double-decrementing or folding its accounting, and the final
        // unlink happens at process deletion like any other member.
        process.set_job_status(
            job_status_flags::NOT_REALLY_ACTIVE | job_status_flags::ACCOUNTING_FOLDED,
        );
        inner.active_processes -= 1;
        return Err(status);
    }

    psp_apply_job_limits_to_process(&inner, process);
    let ws = inner
        .limit_flags
        .contains(JobLimitFlags::WORKINGSET)
        .then(|| (inner.minimum_working_set_size, inner.maximum_working_set_size));
    drop(inner);

    // Working-set push and memory enlistment happen outside the job lock.
    if let Some((min, max)) = ws {
        if mm::adjust_working_set(min, max).is_ok() {
            process.working_set_minimum.store(min, Ordering::Release);
            process.working_set_maximum.store(max, Ordering::Release);
        }
    }
    if let Err(status) = psp_job_charge_memory(job, process) {
        let mut inner = job.inner.write();
        process.set_job_status(
            job_status_flags::NOT_REALLY_ACTIVE | job_status_flags::ACCOUNTING_FOLDED,
        );
        inner.active_processes -= 1;
        return Err(status);
    }
    Ok(())
}

/// Stamp a job's scheduling limits onto one member.
pub(crate) fn psp_apply_job_limits_to_process(inner: &JobInner, process: &Process) {
    if inner.limit_flags.contains(JobLimitFlags::AFFINITY) {
        process.affinity.store(inner.affinity, Ordering::Release);
    }
    if inner.limit_flags.contains(JobLimitFlags::PRIORITY_CLASS) {
        process
            .priority_class
            .store(inner.priority_class, Ordering::Release);
        process.base_priority.store(
            priority_class::base_priority(inner.priority_class),
            Ordering::Release,
        );
    }
    if inner.limit_flags.contains(JobLimitFlags::SCHEDULING_CLASS) {
        process
            .thread_quantum
            .store(quantum_for_scheduling_class(inner.scheduling_class), Ordering::Release);
    }
}

fn quantum_for_scheduling_class(class: u32) -> u32 {
    // Two ticks per class step, one-based
    (class + 1) * 2
}

fn psp_job_charge_memory(job: &Job, process: &Process) -> PsResult<()> {
    let mut memory = job.memory.lock();
    let commit = process.commit_charge.load(Ordering::Acquire) as usize;
    if memory.job_memory_limit != 0
        && memory.current_memory_used + commit > memory.job_memory_limit
    {
        return Err(NtStatus::QuotaExceeded);
    }
    memory.current_memory_used += commit;
    if memory.current_memory_used > memory.peak_job_memory_used {
        memory.peak_job_memory_used = memory.current_memory_used;
    }
    if memory.process_memory_limit != 0 {
        process
            .commit_charge_limit
            .store(memory.process_memory_limit as u64, Ordering::Release);
    }
    process.set_job_status(job_status_flags::REPORT_COMMIT_CHANGES);
    Ok(())
}

fn psp_job_uncharge_memory(job: &Job, process: &Process) {
    if !process.has_job_status(job_status_flags::REPORT_COMMIT_CHANGES) {
        return;
    }
    if process.test_set_job_status(job_status_flags::LAST_REPORT_MEMORY) {
        return;
    }
    let mut memory = job.memory.lock();
    let commit = process.commit_charge.load(Ordering::Acquire) as usize;
    memory.current_memory_used = memory.current_memory_used.saturating_sub(commit);
}

/// Fold a member's accounting into the job exactly once.
fn psp_fold_process_accounting(inner: &mut JobInner, process: &Process) {
    if process.test_set_job_status(job_status_flags::ACCOUNTING_FOLDED) {
        return;
    }
    let user = process.user_time.load(Ordering::Acquire);
    let kernel = process.kernel_time.load(Ordering::Acquire);
    inner.total_user_time += user;
    inner.total_kernel_time += kernel;
    inner.this_period_total_user_time += user;
    inner.this_period_total_kernel_time += kernel;
    inner.total_page_fault_count += process.page_fault_count.load(Ordering::Acquire);
    inner.io.read_operation_count += process
        .io_counters
        .read_operation_count
        .load(Ordering::Acquire);
    inner.io.write_operation_count += process
        .io_counters
        .write_operation_count
        .load(Ordering::Acquire);
    inner.io.other_operation_count += process
        .io_counters
        .other_operation_count
        .load(Ordering::Acquire);
    inner.io.read_transfer_count += process
        .io_counters
        .read_transfer_count
        .load(Ordering::Acquire);
    inner.io.write_transfer_count += process
        .io_counters
        .write_transfer_count
        .load(Ordering::Acquire);
    inner.io.other_transfer_count += process
        .io_counters
        .other_transfer_count
        .load(Ordering::Acquire);
}

fn psp_fold_peak_memory(job: &Job, process: &Process) {
    let mut memory = job.memory.lock();
    let peak = process.commit_charge_peak.load(Ordering::Acquire) as usize;
    if peak > memory.peak_process_memory_used {
        memory.peak_process_memory_used = peak;
    }
}

/// Exit-time job processing: decrement the active count exactly once,
/// post exit messages, fold accounting.
pub(crate) fn psp_exit_process_from_job(job: &Job, process: &Process) {
    let mut inner = job.inner.write();

    if !process.test_set_job_status(job_status_flags::NOT_REALLY_ACTIVE) {
        inner.active_processes -= 1;
        if inner.active_processes == 0 {
            inner.post(JobMessage::ActiveProcessZero, 0);
        }
    }

    if inner.completion_port.is_some()
        && process.unique_process_id() != 0
        && process.has_job_status(job_status_flags::NEW_PROCESS_REPORTED)
        && !process.test_set_job_status(job_status_flags::EXIT_PROCESS_REPORTED)
    {
        let message = if process.exit_status() < 0 {
            JobMessage::AbnormalExitProcess
        } else {
            JobMessage::ExitProcess
        };
        inner.post(message, process.unique_process_id());
    }

    psp_fold_process_accounting(&mut inner, process);
    drop(inner);
    psp_fold_peak_memory(job, process);
    psp_job_uncharge_memory(job, process);
}

/// Final unlink, run by the process delete routine.
pub(crate) fn psp_remove_process_from_job(job: &Job, process: &ProcessObj) {
    let mut inner = job.inner.write();
    if let Some(pos) = inner.processes.iter().position(|p| Arc::ptr_eq(p, process)) {
        inner.processes.swap_remove(pos);
    }
    if !process.test_set_job_status(job_status_flags::NOT_REALLY_ACTIVE) {
        inner.active_processes -= 1;
    }
    psp_fold_process_accounting(&mut inner, process);
    drop(inner);
    psp_job_uncharge_memory(job, process);
}

/// Post the NewProcess message if the job has a port and the process has
/// not been reported yet. Safe to call from multiple places; the flag
/// makes it single-shot.
pub(crate) fn psp_job_report_new_process(job: &Job, process: &Process) {
    let inner = job.inner.read();
    if inner.completion_port.is_some()
        && process.unique_process_id() != 0
        && !process.test_set_job_status(job_status_flags::NEW_PROCESS_REPORTED)
    {
        inner.post(JobMessage::NewProcess, process.unique_process_id());
    }
}

/// Is `process` inside `job` (or inside any job when `job` is `None`)?
pub fn nt_is_process_in_job(process: &ProcessRef, job: Option<&JobRef>) -> PsResult<bool> {
    match job {
        None => Ok(process.in_job()),
        Some(job) => match process.job() {
            Some(bound) => Ok(bound.ptr_eq(job.object())),
            None => Ok(false),
        },
    }
}

// ============================================================================
// Termination
// ============================================================================

/// Kill every member. The job lock is dropped around each termination and
/// the walk restarts, since termination re-enters exit processing.
pub(crate) fn psp_terminate_all_processes_in_job(job: &JobRef, exit_status: i32) {
    loop {
        let victim = {
            let inner = job.inner.read();
            inner
                .processes
                .iter()
                .filter(|p| {
                    p.unique_process_id() != 0
                        && !p.has_job_status(job_status_flags::NOT_REALLY_ACTIVE)
                })
                .find_map(ObjectRef::try_reference)
        };
        let Some(victim) = victim else { break };
        if crate::ps::terminate::psp_terminate_process(&victim, exit_status).is_ok() {
            job.inner.write().total_terminated_processes += 1;
        }
    }
}

/// Terminate every process in the job with the given status.
pub fn nt_terminate_job_object(job: &JobRef, exit_status: i32) -> PsResult<()> {
    log::debug!("[PS] terminating job {}", job.job_id);
    psp_terminate_all_processes_in_job(job, exit_status);
    Ok(())
}

// ============================================================================
// Time-limit enforcement
// ============================================================================

/// One enforcement sweep over every job carrying time limits.
///
/// The host drives this on a [`JOB_TIME_LIMITS_PERIOD_100NS`] cadence.
/// Per-process overruns terminate the offender; per-job overruns follow
/// the job's end-of-job-time action.
pub fn ps_enforce_execution_time_limits() {
    let jobs: Vec<JobRef> = {
        let list = crate::ps::job_list().read();
        list.iter().filter_map(ObjectRef::try_reference).collect()
    };

    for job in jobs {
        let (process_victims, job_over, action) = {
            let inner = job.inner.read();
            if !inner
                .limit_flags
                .intersects(JobLimitFlags::JOB_TIME | JobLimitFlags::PROCESS_TIME)
            {
                continue;
            }

            let mut victims = Vec::new();
            let mut live_user_time = 0u64;
            for member in &inner.processes {
                if !member.has_job_status(job_status_flags::ACCOUNTING_FOLDED) {
                    live_user_time += member.user_time.load(Ordering::Acquire);
                }
                if inner.limit_flags.contains(JobLimitFlags::PROCESS_TIME)
                    && member.unique_process_id() != 0
                    && !member.has_job_status(job_status_flags::NOT_REALLY_ACTIVE)
                    && member.user_time.load(Ordering::Acquire)
                        >= inner.per_process_user_time_limit
                {
                    if let Some(victim) = ObjectRef::try_reference(member) {
                        victims.push(victim);
                    }
                }
            }

            let job_over = inner.limit_flags.contains(JobLimitFlags::JOB_TIME)
                && inner.total_user_time + live_user_time >= inner.per_job_user_time_limit;
            (victims, job_over, inner.end_of_job_time_action)
        };

        for victim in process_victims {
            log::debug!(
                "[PS] job {}: process {} exceeded per-process time limit",
                job.job_id,
                victim.unique_process_id()
            );
            {
                let mut inner = job.inner.write();
                if !victim.test_set_job_status(job_status_flags::NOT_REALLY_ACTIVE) {
                    inner.active_processes -= 1;
                }
                inner.post(JobMessage::EndOfProcessTime, victim.unique_process_id());
                psp_fold_process_accounting(&mut inner, &victim);
                inner.total_terminated_processes += 1;
            }
            let _ = crate::ps::terminate::psp_terminate_process(
                &victim,
                crate::ps::terminate::EXIT_STATUS_QUOTA_EXCEEDED,
            );
        }

        if job_over {
            job.time_limit_event.store(true, Ordering::Release);
            match action {
                EndOfJobTimeAction::TerminateAtEndOfJob => {
                    log::debug!("[PS] job {}: job time limit, terminating", job.job_id);
                    psp_terminate_all_processes_in_job(
                        &job,
                        crate::ps::terminate::EXIT_STATUS_QUOTA_EXCEEDED,
                    );
                    let inner = job.inner.read();
                    if inner.active_processes == 0 {
                        inner.post(JobMessage::EndOfJobTime, 0);
                    }
                }
                EndOfJobTimeAction::PostAtEndOfJob => {
                    let mut inner = job.inner.write();
                    let posted = match &inner.completion_port {
                        Some(port) => port
                            .post(inner.completion_key, JobMessage::EndOfJobTime, 0)
                            .is_ok(),
                        None => false,
                    };
                    if posted {
                        // Keep running; the limit is disarmed until reset.
                        inner.limit_flags.remove(JobLimitFlags::JOB_TIME);
                        inner.per_job_user_time_limit = 0;
                        job.time_limit_event.store(false, Ordering::Release);
                    } else {
                        drop(inner);
                        psp_terminate_all_processes_in_job(
                            &job,
                            crate::ps::terminate::EXIT_STATUS_QUOTA_EXCEEDED,
                        );
                    }
                }
            }
        }
    }
}

// ============================================================================
// Query
// ============================================================================

fn accounting_snapshot(inner: &JobInner) -> JobBasicAccountingInformation {
    let mut info = JobBasicAccountingInformation {
        total_user_time: inner.total_user_time,
        total_kernel_time: inner.total_kernel_time,
        this_period_total_user_time: inner.this_period_total_user_time,
        this_period_total_kernel_time: inner.this_period_total_kernel_time,
        total_page_fault_count: inner.total_page_fault_count,
        total_processes: inner.total_processes,
        active_processes: inner.active_processes,
        total_terminated_processes: inner.total_terminated_processes,
    };
    // Live members have not folded yet; add their running totals.
    for member in &inner.processes {
        if member.has_job_status(job_status_flags::ACCOUNTING_FOLDED) {
            continue;
        }
        let user = member.user_time.load(Ordering::Acquire);
        let kernel = member.kernel_time.load(Ordering::Acquire);
        info.total_user_time += user;
        info.total_kernel_time += kernel;
        info.this_period_total_user_time += user;
        info.this_period_total_kernel_time += kernel;
        info.total_page_fault_count += member.page_fault_count.load(Ordering::Acquire);
    }
    info
}

fn live_io_snapshot(inner: &JobInner) -> JobIoCounters {
    let mut io = inner.io;
    for member in &inner.processes {
        if member.has_job_status(job_status_flags::ACCOUNTING_FOLDED) {
            continue;
        }
        io.read_operation_count += member
            .io_counters
            .read_operation_count
            .load(Ordering::Acquire);
        io.write_operation_count += member
            .io_counters
            .write_operation_count
            .load(Ordering::Acquire);
        io.other_operation_count += member
            .io_counters
            .other_operation_count
            .load(Ordering::Acquire);
        io.read_transfer_count += member
            .io_counters
            .read_transfer_count
            .load(Ordering::Acquire);
        io.write_transfer_count += member
            .io_counters
            .write_transfer_count
            .load(Ordering::Acquire);
        io.other_transfer_count += member
            .io_counters
            .other_transfer_count
            .load(Ordering::Acquire);
    }
    io
}

fn basic_limit_snapshot(inner: &JobInner) -> JobBasicLimitInformation {
    JobBasicLimitInformation {
        per_process_user_time_limit: inner.per_process_user_time_limit,
        per_job_user_time_limit: inner.per_job_user_time_limit,
        limit_flags: inner.limit_flags.bits(),
        minimum_working_set_size: inner.minimum_working_set_size,
        maximum_working_set_size: inner.maximum_working_set_size,
        active_process_limit: inner.active_process_limit,
        affinity: inner.affinity,
        priority_class: inner.priority_class,
        scheduling_class: inner.scheduling_class,
    }
}

/// Query one information class.
///
/// `buffer_length` models the caller's output buffer and is validated
/// against the per-class requirement. The returned `usize` is the number
/// of bytes the full result needs.
pub fn nt_query_information_job_object(
    job: &JobRef,
    class: JobObjectInformationClass,
    buffer_length: usize,
) -> PsResult<(JobObjectInfo, usize)> {
    check_length(class, buffer_length)?;

    match class {
        JobObjectInformationClass::BasicAccounting => {
            let inner = job.inner.read();
            Ok((
                JobObjectInfo::BasicAccounting(accounting_snapshot(&inner)),
                core::mem::size_of::<JobBasicAccountingInformation>(),
            ))
        }
        JobObjectInformationClass::BasicAndIoAccounting => {
            let inner = job.inner.read();
            Ok((
                JobObjectInfo::BasicAndIoAccounting(JobBasicAndIoAccountingInformation {
                    basic: accounting_snapshot(&inner),
                    io_info: live_io_snapshot(&inner),
                }),
                core::mem::size_of::<JobBasicAndIoAccountingInformation>(),
            ))
        }
        JobObjectInformationClass::BasicLimit => {
            let inner = job.inner.read();
            Ok((
                JobObjectInfo::BasicLimit(basic_limit_snapshot(&inner)),
                core::mem::size_of::<JobBasicLimitInformation>(),
            ))
        }
        JobObjectInformationClass::ExtendedLimit => {
            let inner = job.inner.read();
            let memory = job.memory.lock();
            Ok((
                JobObjectInfo::ExtendedLimit(JobExtendedLimitInformation {
                    basic: basic_limit_snapshot(&inner),
                    io_info: live_io_snapshot(&inner),
                    process_memory_limit: memory.process_memory_limit,
                    job_memory_limit: memory.job_memory_limit,
                    peak_process_memory_used: memory.peak_process_memory_used,
                    peak_job_memory_used: memory.peak_job_memory_used,
                }),
                core::mem::size_of::<JobExtendedLimitInformation>(),
            ))
        }
        JobObjectInformationClass::BasicProcessIdList => {
            let inner = job.inner.read();
            let capacity = (buffer_length - 8) / core::mem::size_of::<usize>();
            let pids: Vec<u32> = inner
                .processes
                .iter()
                .map(|p| p.unique_process_id())
                .filter(|&pid| pid != 0)
                .collect();
            let assigned = pids.len() as u32;
            let listed: Vec<u32> = pids.into_iter().take(capacity).collect();
            let required = 8 + assigned as usize * core::mem::size_of::<usize>();
            Ok((
                JobObjectInfo::BasicProcessIdList(JobBasicProcessIdList {
                    number_of_assigned_processes: assigned,
                    process_id_list: listed,
                }),
                required,
            ))
        }
        JobObjectInformationClass::BasicUiRestrictions => {
            let inner = job.inner.read();
            Ok((
                JobObjectInfo::BasicUiRestrictions(inner.ui_restrictions.bits()),
                4,
            ))
        }
        JobObjectInformationClass::SecurityLimit => {
            let inner = job.inner.read();
            Ok((
                JobObjectInfo::SecurityLimit(inner.security_limit_flags.bits()),
                16,
            ))
        }
        JobObjectInformationClass::JobSet => {
            Ok((JobObjectInfo::JobSet(job.member_level()), 4))
        }
        JobObjectInformationClass::EndOfJobTime => {
            let inner = job.inner.read();
            let action = match inner.end_of_job_time_action {
                EndOfJobTimeAction::TerminateAtEndOfJob => 0,
                EndOfJobTimeAction::PostAtEndOfJob => 1,
            };
            Ok((JobObjectInfo::EndOfJobTime(action), 4))
        }
        JobObjectInformationClass::AssociateCompletionPort => Err(NtStatus::InvalidInfoClass),
    }
}

// ============================================================================
// Set
// ============================================================================

/// Set one information class. `information_length` models the caller's
/// input buffer; `caller` is the token privilege checks run against.
pub fn nt_set_information_job_object(
    job: &JobRef,
    info: JobObjectSetInfo,
    information_length: usize,
    caller: &Arc<Token>,
) -> PsResult<()> {
    check_length(info.class(), information_length)?;

    match info {
        JobObjectSetInfo::BasicLimit(basic) => psp_set_job_limits(job, &basic, None, caller),
        JobObjectSetInfo::ExtendedLimit(extended) => {
            psp_set_job_limits(job, &extended.basic, Some(&extended), caller)
        }
        JobObjectSetInfo::BasicUiRestrictions(bits) => {
            let restrictions =
                UiRestrictions::from_bits(bits).ok_or(NtStatus::InvalidParameter)?;
            job.inner.write().ui_restrictions = restrictions;
            Ok(())
        }
        JobObjectSetInfo::EndOfJobTime(action) => {
            let action = EndOfJobTimeAction::from_u32(action)?;
            job.inner.write().end_of_job_time_action = action;
            Ok(())
        }
        JobObjectSetInfo::AssociateCompletionPort(key, port) => {
            psp_associate_completion_port(job, key, port)
        }
        JobObjectSetInfo::SecurityLimit(security) => {
            psp_set_job_security_limits(job, security, caller)
        }
    }
}

fn psp_set_job_limits(
    job: &JobRef,
    basic: &JobBasicLimitInformation,
    extended: Option<&JobExtendedLimitInformation>,
    caller: &Arc<Token>,
) -> PsResult<()> {
    let valid_mask = if extended.is_some() {
        JOB_EXTENDED_LIMIT_VALID_FLAGS
    } else {
        JOB_BASIC_LIMIT_VALID_FLAGS
    };
    if basic.limit_flags & !valid_mask != 0 {
        return Err(NtStatus::InvalidParameter);
    }
    let flags =
        JobLimitFlags::from_bits(basic.limit_flags).ok_or(NtStatus::InvalidParameter)?;
    if flags.contains(JobLimitFlags::JOB_TIME | JobLimitFlags::PRESERVE_JOB_TIME) {
        return Err(NtStatus::InvalidParameter);
    }

    // Validate everything against a local copy before mutating the job.
    if flags.contains(JobLimitFlags::WORKINGSET) {
        mm::adjust_working_set(
            basic.minimum_working_set_size,
            basic.maximum_working_set_size,
        )?;
    }
    if flags.contains(JobLimitFlags::PROCESS_TIME) && basic.per_process_user_time_limit == 0 {
        return Err(NtStatus::InvalidParameter);
    }
    if flags.contains(JobLimitFlags::JOB_TIME) && basic.per_job_user_time_limit == 0 {
        return Err(NtStatus::InvalidParameter);
    }
    if flags.contains(JobLimitFlags::AFFINITY)
        && (basic.affinity == 0 || basic.affinity & !SYSTEM_AFFINITY_MASK != 0)
    {
        return Err(NtStatus::InvalidParameter);
    }
    if flags.contains(JobLimitFlags::PRIORITY_CLASS) {
        if basic.priority_class == priority_class::UNKNOWN
            || basic.priority_class > priority_class::ABOVE_NORMAL
        {
            return Err(NtStatus::InvalidParameter);
        }
        let needs_privilege = basic.priority_class == priority_class::HIGH
            || basic.priority_class == priority_class::REALTIME;
        if needs_privilege && !caller.has_privilege(Luid::SE_INCREASE_BASE_PRIORITY) {
            return Err(NtStatus::PrivilegeNotHeld);
        }
    }
    if flags.contains(JobLimitFlags::SCHEDULING_CLASS) {
        if basic.scheduling_class > JOB_MAX_SCHEDULING_CLASS {
            return Err(NtStatus::InvalidParameter);
        }
        if basic.scheduling_class > PRIVILEGED_SCHEDULING_CLASS
            && !caller.has_privilege(Luid::SE_INCREASE_BASE_PRIORITY)
        {
            return Err(NtStatus::PrivilegeNotHeld);
        }
    }
    if let Some(ext) = extended {
        if flags.contains(JobLimitFlags::PROCESS_MEMORY)
            && ext.process_memory_limit < mm::PAGE_SIZE
        {
            return Err(NtStatus::InvalidParameter);
        }
        if flags.contains(JobLimitFlags::JOB_MEMORY) && ext.job_memory_limit < mm::PAGE_SIZE {
            return Err(NtStatus::InvalidParameter);
        }
    }

    let members: Vec<ProcessRef>;
    let ws;
    {
        let mut inner = job.inner.write();
        let had_job_time = inner.limit_flags.contains(JobLimitFlags::JOB_TIME);
        let old_job_limit = inner.per_job_user_time_limit;

        // The limit set is replaced wholesale; unset flags zero their values.
        let mut new_flags = flags;
        inner.per_process_user_time_limit = if flags.contains(JobLimitFlags::PROCESS_TIME) {
            basic.per_process_user_time_limit
        } else {
            0
        };
        inner.minimum_working_set_size = if flags.contains(JobLimitFlags::WORKINGSET) {
            basic.minimum_working_set_size
        } else {
            0
        };
        inner.maximum_working_set_size = if flags.contains(JobLimitFlags::WORKINGSET) {
            basic.maximum_working_set_size
        } else {
            0
        };
        inner.active_process_limit = if flags.contains(JobLimitFlags::ACTIVE_PROCESS) {
            basic.active_process_limit
        } else {
            0
        };
        inner.affinity = if flags.contains(JobLimitFlags::AFFINITY) {
            basic.affinity
        } else {
            0
        };
        inner.priority_class = if flags.contains(JobLimitFlags::PRIORITY_CLASS) {
            basic.priority_class
        } else {
            0
        };
        inner.scheduling_class = if flags.contains(JobLimitFlags::SCHEDULING_CLASS) {
            basic.scheduling_class
        } else {
            0
        };

        if flags.contains(JobLimitFlags::JOB_TIME) {
            // A new period starts: reset period accounting and rearm.
            inner.per_job_user_time_limit = basic.per_job_user_time_limit;
            inner.this_period_total_user_time = 0;
            inner.this_period_total_kernel_time = 0;
            job.time_limit_event.store(false, Ordering::Release);
        } else if flags.contains(JobLimitFlags::PRESERVE_JOB_TIME) {
            // Keep the existing limit and period accounting untouched.
            new_flags.remove(JobLimitFlags::PRESERVE_JOB_TIME);
            if had_job_time {
                new_flags.insert(JobLimitFlags::JOB_TIME);
                inner.per_job_user_time_limit = old_job_limit;
            }
        } else {
            inner.per_job_user_time_limit = 0;
        }
        inner.limit_flags = new_flags;

        if let Some(ext) = extended {
            let mut memory = job.memory.lock();
            memory.process_memory_limit = if flags.contains(JobLimitFlags::PROCESS_MEMORY) {
                ext.process_memory_limit
            } else {
                0
            };
            memory.job_memory_limit = if flags.contains(JobLimitFlags::JOB_MEMORY) {
                ext.job_memory_limit
            } else {
                0
            };
        }

        for member in &inner.processes {
            psp_apply_job_limits_to_process(&inner, member);
        }

        ws = inner
            .limit_flags
            .contains(JobLimitFlags::WORKINGSET)
            .then(|| (inner.minimum_working_set_size, inner.maximum_working_set_size));
        members = if ws.is_some() {
            inner
                .processes
                .iter()
                .filter_map(ObjectRef::try_reference)
                .collect()
        } else {
            Vec::new()
        };
    }

    // Working-set pushes run against each member outside the job lock.
    if let Some((min, max)) = ws {
        for member in members {
            if mm::adjust_working_set(min, max).is_ok() {
                member.working_set_minimum.store(min, Ordering::Release);
                member.working_set_maximum.store(max, Ordering::Release);
            }
        }
    }
    Ok(())
}

fn psp_associate_completion_port(
    job: &JobRef,
    key: usize,
    port: Arc<IoCompletionPort>,
) -> PsResult<()> {
    let members: Vec<ProcessRef>;
    {
        let mut inner = job.inner.write();
        if job.has_flag(job_flags::CLOSE_DONE) || inner.completion_port.is_some() {
            return Err(NtStatus::InvalidParameter);
        }
        inner.completion_key = key;
        inner.completion_port = Some(port);
        members = inner
            .processes
            .iter()
            .filter(|p| p.unique_process_id() != 0)
            .filter_map(ObjectRef::try_reference)
            .collect();
    }
    // Report members that predate the association.
    for member in members {
        psp_job_report_new_process(job, &member);
    }
    Ok(())
}

fn psp_set_job_security_limits(
    job: &JobRef,
    info: JobSecurityLimitInformation,
    caller: &Arc<Token>,
) -> PsResult<()> {
    let flags = info.security_limit_flags;
    if flags.contains(JobSecurityLimitFlags::ONLY_TOKEN | JobSecurityLimitFlags::FILTER_TOKENS) {
        return Err(NtStatus::InvalidParameter);
    }

    let mut inner = job.inner.write();
    // Security limits only ratchet; clearing a set flag is refused.
    if !flags.contains(inner.security_limit_flags) {
        return Err(NtStatus::InvalidParameter);
    }
    let new_bits = flags.difference(inner.security_limit_flags);

    if new_bits.contains(JobSecurityLimitFlags::ONLY_TOKEN) {
        let token = info.job_token.as_ref().ok_or(NtStatus::InvalidParameter)?;
        if token.token_type != TokenType::Primary {
            return Err(NtStatus::BadTokenType);
        }
        if inner.token.is_some() {
            return Err(NtStatus::InvalidParameter);
        }
        if !caller.has_privilege(Luid::SE_ASSIGN_PRIMARY_TOKEN) && !token.is_child_of(caller) {
            return Err(NtStatus::PrivilegeNotHeld);
        }
        if flags.contains(JobSecurityLimitFlags::NO_ADMIN) && token.is_admin() {
            return Err(NtStatus::AccessDenied);
        }
        inner.token = Some(Arc::clone(token));
    }

    if new_bits.contains(JobSecurityLimitFlags::FILTER_TOKENS) {
        if inner.filter.is_some() {
            return Err(NtStatus::InvalidParameter);
        }
        let filter = JobTokenFilter::capture(
            info.sids_to_disable,
            info.privileges_to_delete,
            info.restricted_sids,
        )?;
        inner.filter = Some(filter);
    }

    if new_bits.contains(JobSecurityLimitFlags::NO_ADMIN) {
        if let Some(token) = &inner.token {
            if token.is_admin() {
                return Err(NtStatus::AccessDenied);
            }
        }
    }

    inner.security_limit_flags = flags;
    Ok(())
}

// ============================================================================
// Job sets
// ============================================================================

/// One entry of a job-set creation request.
pub struct JobSetArrayEntry {
    pub job: JobRef,
    pub member_level: u32,
    pub flags: u32,
}

/// Build a job set: members keep strictly increasing nonzero levels and
/// are linked into a circle. Every non-head member is pinned with an
/// extra reference that unwinds through the deletion chain.
pub fn nt_create_job_set(entries: &[JobSetArrayEntry]) -> PsResult<()> {
    if entries.len() < 2 {
        return Err(NtStatus::InvalidParameter);
    }
    let mut min_level = 0u32;
    for entry in entries {
        if entry.flags != 0 {
            return Err(NtStatus::InvalidParameter);
        }
        if entry.member_level <= min_level {
            return Err(NtStatus::InvalidParameter);
        }
        min_level = entry.member_level;
    }

    let _list = crate::ps::job_list().write();

    // A job already in a set (or listed twice) has a nonzero level.
    let mut staged = 0;
    for entry in entries {
        if entry.job.member_level.load(Ordering::Acquire) != 0 {
            for unwound in &entries[..staged] {
                unwound.job.member_level.store(0, Ordering::Release);
            }
            return Err(NtStatus::InvalidParameter);
        }
        entry
            .job
            .member_level
            .store(entry.member_level, Ordering::Release);
        staged += 1;
    }

    // Circular singly-linked chain through the head.
    for (i, entry) in entries.iter().enumerate() {
        let next = &entries[(i + 1) % entries.len()].job;
        *entry.job.set_next.lock() = Some(Arc::clone(next.object()));
    }

    // Pin every non-head member; the head's deletion releases the first
    // pin and the rest cascade.
    for entry in &entries[1..] {
        entry.job.object().header().reference();
        entry.job.set_pinned.store(true, Ordering::Release);
    }

    log::debug!(
        "[PS] job set created: head={} members={}",
        entries[0].job.job_id,
        entries.len()
    );
    Ok(())
}

/// Resolve which job of the parent's set a child should join.
///
/// Level zero means "the parent's own job". Otherwise the parent must be
/// a set member at or below the requested level, and the set must contain
/// a job at exactly that level.
pub(crate) fn psp_get_job_from_set(parent_job: &JobRef, member_level: u32) -> PsResult<JobRef> {
    if member_level == 0 {
        return Ok(parent_job.clone());
    }
    let parent_level = parent_job.member_level();
    if parent_level == 0 || parent_level > member_level {
        return Err(NtStatus::AccessDenied);
    }

    let _list = crate::ps::job_list().read();
    let mut current = Arc::clone(parent_job.object());
    loop {
        if current.member_level.load(Ordering::Acquire) == member_level {
            return ObjectRef::try_reference(&current).ok_or(NtStatus::AccessDenied);
        }
        let next = {
            let guard = current.set_next.lock();
            guard.as_ref().map(Arc::clone)
        };
        match next {
            Some(next) if !Arc::ptr_eq(&next, parent_job.object()) => current = next,
            _ => return Err(NtStatus::AccessDenied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps::create::ps_create_system_process;
    use crate::ps::terminate::EXIT_STATUS_QUOTA_EXCEEDED;

    fn system_caller() -> Arc<Token> {
        Token::system()
    }

    fn job_with_port() -> (JobRef, Arc<IoCompletionPort>) {
        let job = ps_create_job(0).unwrap();
        let port = Arc::new(IoCompletionPort::new());
        nt_set_information_job_object(
            &job,
            JobObjectSetInfo::AssociateCompletionPort(0x99, Arc::clone(&port)),
            16,
            &system_caller(),
        )
        .unwrap();
        (job, port)
    }

    fn set_basic_limits(job: &JobRef, info: JobBasicLimitInformation) -> PsResult<()> {
        nt_set_information_job_object(
            job,
            JobObjectSetInfo::BasicLimit(info),
            core::mem::size_of::<JobBasicLimitInformation>(),
            &system_caller(),
        )
    }

    #[test]
    fn test_active_process_limit_rejection() {
        let (job, port) = job_with_port();
        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::ACTIVE_PROCESS.bits();
        limits.active_process_limit = 1;
        set_basic_limits(&job, limits).unwrap();

        let first = ps_create_system_process("jobap1.exe").unwrap();
        let second = ps_create_system_process("jobap2.exe").unwrap();

        nt_assign_process_to_job_object(&job, &first).unwrap();
        assert_eq!(
            nt_assign_process_to_job_object(&job, &second),
            Err(NtStatus::QuotaExceeded)
        );

        // Rejected member is stamped, terminated, and never counted active
        assert!(second.has_job_status(job_status_flags::NOT_REALLY_ACTIVE));
        assert!(second.has_job_status(job_status_flags::ACCOUNTING_FOLDED));
        assert!(second.has_flag(crate::ps::process::process_flags::PROCESS_DELETE));
        {
            let inner = job.inner.read();
            assert_eq!(inner.active_processes, 1);
            assert_eq!(inner.total_processes, 2);
            assert_eq!(inner.total_terminated_processes, 1);
            // Both members stay on the process list; rejection only rolls
            // back the active count
            assert!(inner.processes.iter().any(|p| first.ptr_eq(p)));
            assert!(inner.processes.iter().any(|p| second.ptr_eq(p)));
        }
        // The member walk still reaches the rejected process
        let mut walked = alloc::vec::Vec::new();
        let mut cursor = None;
        while let Some(next) = crate::ps::enumerate::ps_get_next_job_process(&job, cursor.as_ref())
        {
            walked.push(next.unique_process_id());
            cursor = Some(next);
        }
        assert!(walked.contains(&second.unique_process_id()));
        let packets = port.drain();
        assert!(packets
            .iter()
            .any(|p| p.message == JobMessage::ActiveProcessLimit));
    }

    #[test]
    fn test_double_assignment_denied() {
        let job_a = ps_create_job(0).unwrap();
        let job_b = ps_create_job(0).unwrap();
        let process = ps_create_system_process("jobdouble.exe").unwrap();

        nt_assign_process_to_job_object(&job_a, &process).unwrap();
        assert_eq!(
            nt_assign_process_to_job_object(&job_b, &process),
            Err(NtStatus::AccessDenied)
        );
        assert_eq!(nt_is_process_in_job(&process, Some(&job_a)), Ok(true));
        assert_eq!(nt_is_process_in_job(&process, Some(&job_b)), Ok(false));
        assert_eq!(nt_is_process_in_job(&process, None), Ok(true));
    }

    #[test]
    fn test_limit_merge_and_round_trip() {
        let job = ps_create_job(0).unwrap();
        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags =
            (JobLimitFlags::PROCESS_TIME | JobLimitFlags::AFFINITY).bits();
        limits.per_process_user_time_limit = 5 * ONE_SECOND_100NS;
        limits.affinity = 0x3;
        set_basic_limits(&job, limits).unwrap();

        // Replacing the limit set clears everything not named this time.
        let mut second = JobBasicLimitInformation::new();
        second.limit_flags = JobLimitFlags::ACTIVE_PROCESS.bits();
        second.active_process_limit = 4;
        set_basic_limits(&job, second).unwrap();

        let (info, required) = nt_query_information_job_object(
            &job,
            JobObjectInformationClass::BasicLimit,
            core::mem::size_of::<JobBasicLimitInformation>(),
        )
        .unwrap();
        assert_eq!(required, core::mem::size_of::<JobBasicLimitInformation>());
        match info {
            JobObjectInfo::BasicLimit(basic) => {
                assert_eq!(basic.limit_flags, JobLimitFlags::ACTIVE_PROCESS.bits());
                assert_eq!(basic.active_process_limit, 4);
                assert_eq!(basic.per_process_user_time_limit, 0);
                assert_eq!(basic.affinity, 0);
            }
            other => panic!("wrong class {:?}", other),
        }
    }

    #[test]
    fn test_limit_validation_failures() {
        let job = ps_create_job(0).unwrap();

        let mut bad = JobBasicLimitInformation::new();
        bad.limit_flags = JobLimitFlags::AFFINITY.bits();
        bad.affinity = 0;
        assert_eq!(set_basic_limits(&job, bad), Err(NtStatus::InvalidParameter));

        let mut bad = JobBasicLimitInformation::new();
        bad.limit_flags = JobLimitFlags::WORKINGSET.bits();
        bad.minimum_working_set_size = 8 * mm::PAGE_SIZE;
        bad.maximum_working_set_size = mm::PAGE_SIZE;
        assert_eq!(set_basic_limits(&job, bad), Err(NtStatus::InvalidParameter));

        let mut bad = JobBasicLimitInformation::new();
        bad.limit_flags =
            (JobLimitFlags::JOB_TIME | JobLimitFlags::PRESERVE_JOB_TIME).bits();
        bad.per_job_user_time_limit = ONE_SECOND_100NS;
        assert_eq!(set_basic_limits(&job, bad), Err(NtStatus::InvalidParameter));

        // Extended-only flag through the basic class
        let mut bad = JobBasicLimitInformation::new();
        bad.limit_flags = JobLimitFlags::JOB_MEMORY.bits();
        assert_eq!(set_basic_limits(&job, bad), Err(NtStatus::InvalidParameter));

        // Wrong buffer length
        let mut ok = JobBasicLimitInformation::new();
        ok.limit_flags = JobLimitFlags::ACTIVE_PROCESS.bits();
        ok.active_process_limit = 1;
        assert_eq!(
            nt_set_information_job_object(
                &job,
                JobObjectSetInfo::BasicLimit(ok),
                7,
                &system_caller()
            ),
            Err(NtStatus::InfoLengthMismatch)
        );
    }

    #[test]
    fn test_priority_class_needs_privilege() {
        let job = ps_create_job(0).unwrap();
        let unprivileged = Token::new_primary(
            crate::se::Sid(2001),
            0x55,
            alloc::vec![],
            alloc::vec![],
            crate::se::TokenSource::new(*b"TestUser", 9),
        );

        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::PRIORITY_CLASS.bits();
        limits.priority_class = priority_class::HIGH;
        assert_eq!(
            nt_set_information_job_object(
                &job,
                JobObjectSetInfo::BasicLimit(limits),
                core::mem::size_of::<JobBasicLimitInformation>(),
                &unprivileged
            ),
            Err(NtStatus::PrivilegeNotHeld)
        );

        // Below-normal needs nothing special
        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::PRIORITY_CLASS.bits();
        limits.priority_class = priority_class::BELOW_NORMAL;
        nt_set_information_job_object(
            &job,
            JobObjectSetInfo::BasicLimit(limits),
            core::mem::size_of::<JobBasicLimitInformation>(),
            &unprivileged,
        )
        .unwrap();
    }

    #[test]
    fn test_preserve_job_time_keeps_limit() {
        let job = ps_create_job(0).unwrap();
        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::JOB_TIME.bits();
        limits.per_job_user_time_limit = 9 * ONE_SECOND_100NS;
        set_basic_limits(&job, limits).unwrap();

        let mut update = JobBasicLimitInformation::new();
        update.limit_flags =
            (JobLimitFlags::PRESERVE_JOB_TIME | JobLimitFlags::ACTIVE_PROCESS).bits();
        update.active_process_limit = 2;
        set_basic_limits(&job, update).unwrap();

        let inner = job.inner.read();
        assert!(inner.limit_flags.contains(JobLimitFlags::JOB_TIME));
        assert!(!inner.limit_flags.contains(JobLimitFlags::PRESERVE_JOB_TIME));
        assert_eq!(inner.per_job_user_time_limit, 9 * ONE_SECOND_100NS);
        assert_eq!(inner.active_process_limit, 2);
    }

    #[test]
    fn test_completion_port_set_once_and_retroactive_report() {
        let job = ps_create_job(0).unwrap();
        let early = ps_create_system_process("jobport1.exe").unwrap();
        nt_assign_process_to_job_object(&job, &early).unwrap();

        let port = Arc::new(IoCompletionPort::new());
        nt_set_information_job_object(
            &job,
            JobObjectSetInfo::AssociateCompletionPort(7, Arc::clone(&port)),
            16,
            &system_caller(),
        )
        .unwrap();

        // The member that predates the association is reported now
        let packets = port.drain();
        assert!(packets.iter().any(|p| {
            p.message == JobMessage::NewProcess && p.process_id == early.unique_process_id()
        }));

        let again = Arc::new(IoCompletionPort::new());
        assert_eq!(
            nt_set_information_job_object(
                &job,
                JobObjectSetInfo::AssociateCompletionPort(8, again),
                16,
                &system_caller()
            ),
            Err(NtStatus::InvalidParameter)
        );
    }

    #[test]
    fn test_security_limits_monotonic() {
        let job = ps_create_job(0).unwrap();
        let caller = system_caller();

        let set = |flags: JobSecurityLimitFlags, token: Option<Arc<Token>>| {
            nt_set_information_job_object(
                &job,
                JobObjectSetInfo::SecurityLimit(JobSecurityLimitInformation {
                    security_limit_flags: flags,
                    job_token: token,
                    sids_to_disable: Vec::new(),
                    privileges_to_delete: Vec::new(),
                    restricted_sids: Vec::new(),
                }),
                32,
                &caller,
            )
        };

        set(JobSecurityLimitFlags::NO_ADMIN, None).unwrap();
        // Dropping NO_ADMIN again is refused
        assert_eq!(
            set(JobSecurityLimitFlags::RESTRICTED_TOKEN, None),
            Err(NtStatus::InvalidParameter)
        );
        set(
            JobSecurityLimitFlags::NO_ADMIN | JobSecurityLimitFlags::RESTRICTED_TOKEN,
            None,
        )
        .unwrap();

        // ONLY_TOKEN with an admin token violates NO_ADMIN
        assert_eq!(
            set(
                JobSecurityLimitFlags::NO_ADMIN
                    | JobSecurityLimitFlags::RESTRICTED_TOKEN
                    | JobSecurityLimitFlags::ONLY_TOKEN,
                Some(Token::system())
            ),
            Err(NtStatus::AccessDenied)
        );

        // ONLY_TOKEN and FILTER_TOKENS are mutually exclusive
        assert_eq!(
            set(
                JobSecurityLimitFlags::ONLY_TOKEN | JobSecurityLimitFlags::FILTER_TOKENS,
                None
            ),
            Err(NtStatus::InvalidParameter)
        );
    }

    #[test]
    fn test_accounting_fold_is_idempotent() {
        let (job, port) = job_with_port();
        let process = ps_create_system_process("jobacct.exe").unwrap();
        nt_assign_process_to_job_object(&job, &process).unwrap();
        process.charge_user_time(1000);
        process.charge_kernel_time(500);

        psp_exit_process_from_job(&job, &process);
        psp_exit_process_from_job(&job, &process);

        let inner = job.inner.read();
        assert_eq!(inner.total_user_time, 1000);
        assert_eq!(inner.total_kernel_time, 500);
        assert_eq!(inner.active_processes, 0);
        drop(inner);

        let packets = port.drain();
        assert_eq!(
            packets
                .iter()
                .filter(|p| p.message == JobMessage::ActiveProcessZero)
                .count(),
            1
        );
        assert_eq!(
            packets
                .iter()
                .filter(|p| p.message == JobMessage::ExitProcess)
                .count(),
            1
        );
    }

    #[test]
    fn test_job_time_limit_terminates() {
        let (job, port) = job_with_port();
        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::JOB_TIME.bits();
        limits.per_job_user_time_limit = 2 * ONE_SECOND_100NS;
        set_basic_limits(&job, limits).unwrap();

        let process = ps_create_system_process("jobtime.exe").unwrap();
        nt_assign_process_to_job_object(&job, &process).unwrap();

        process.charge_user_time(ONE_SECOND_100NS);
        ps_enforce_execution_time_limits();
        assert!(!job.time_limit_signaled());

        process.charge_user_time(2 * ONE_SECOND_100NS);
        ps_enforce_execution_time_limits();
        assert!(job.time_limit_signaled());
        assert!(process.has_job_status(job_status_flags::NOT_REALLY_ACTIVE));
        assert_eq!(process.exit_status(), EXIT_STATUS_QUOTA_EXCEEDED);

        // A dead job cannot accept new members while its event is latched
        let late = ps_create_system_process("joblate.exe").unwrap();
        assert_eq!(
            nt_assign_process_to_job_object(&job, &late),
            Err(NtStatus::QuotaExceeded)
        );

        let packets = port.drain();
        assert!(packets.iter().any(|p| p.message == JobMessage::EndOfJobTime));
    }

    #[test]
    fn test_post_at_end_of_job_time_disarms() {
        let (job, port) = job_with_port();
        nt_set_information_job_object(
            &job,
            JobObjectSetInfo::EndOfJobTime(1),
            4,
            &system_caller(),
        )
        .unwrap();
        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::JOB_TIME.bits();
        limits.per_job_user_time_limit = ONE_SECOND_100NS;
        set_basic_limits(&job, limits).unwrap();

        let process = ps_create_system_process("jobpost.exe").unwrap();
        nt_assign_process_to_job_object(&job, &process).unwrap();
        process.charge_user_time(2 * ONE_SECOND_100NS);

        ps_enforce_execution_time_limits();

        // The member keeps running and the limit is disarmed
        assert!(!process.has_flag(crate::ps::process::process_flags::PROCESS_DELETE));
        assert!(!job.inner.read().limit_flags.contains(JobLimitFlags::JOB_TIME));
        assert!(!job.time_limit_signaled());
        let packets = port.drain();
        assert!(packets.iter().any(|p| p.message == JobMessage::EndOfJobTime));

        // Disarmed means the next sweep is a no-op
        ps_enforce_execution_time_limits();
        assert!(!process.has_flag(crate::ps::process::process_flags::PROCESS_DELETE));
    }

    #[test]
    fn test_post_at_end_of_job_time_falls_back_to_terminate() {
        let (job, port) = job_with_port();
        nt_set_information_job_object(
            &job,
            JobObjectSetInfo::EndOfJobTime(1),
            4,
            &system_caller(),
        )
        .unwrap();
        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::JOB_TIME.bits();
        limits.per_job_user_time_limit = ONE_SECOND_100NS;
        set_basic_limits(&job, limits).unwrap();

        let process = ps_create_system_process("jobpost2.exe").unwrap();
        nt_assign_process_to_job_object(&job, &process).unwrap();

        port.fail_next_post();
        process.charge_user_time(2 * ONE_SECOND_100NS);
        ps_enforce_execution_time_limits();

        // Undeliverable notification degrades to termination
        assert!(process.has_flag(crate::ps::process::process_flags::PROCESS_DELETE));
        assert!(job.time_limit_signaled());
    }

    #[test]
    fn test_per_process_time_limit() {
        let (job, port) = job_with_port();
        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::PROCESS_TIME.bits();
        limits.per_process_user_time_limit = ONE_SECOND_100NS;
        set_basic_limits(&job, limits).unwrap();

        let offender = ps_create_system_process("jobptime.exe").unwrap();
        nt_assign_process_to_job_object(&job, &offender).unwrap();
        offender.charge_user_time(3 * ONE_SECOND_100NS);

        ps_enforce_execution_time_limits();

        assert!(offender.has_job_status(job_status_flags::NOT_REALLY_ACTIVE));
        let inner = job.inner.read();
        assert_eq!(inner.active_processes, 0);
        assert_eq!(inner.total_terminated_processes, 1);
        // Folded exactly once despite termination re-entering exit
        assert_eq!(inner.total_user_time, 3 * ONE_SECOND_100NS);
        drop(inner);

        let packets = port.drain();
        assert!(packets
            .iter()
            .any(|p| p.message == JobMessage::EndOfProcessTime
                && p.process_id == offender.unique_process_id()));
    }

    #[test]
    fn test_kill_on_job_close() {
        let job = ps_create_job(0).unwrap();
        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::KILL_ON_JOB_CLOSE.bits();
        set_basic_limits(&job, limits).unwrap();

        let process = ps_create_system_process("jobkill.exe").unwrap();
        nt_assign_process_to_job_object(&job, &process).unwrap();

        ps_close_job(&job);
        assert!(process.has_flag(crate::ps::process::process_flags::PROCESS_DELETE));

        // Admission after close is refused outright
        let late = ps_create_system_process("jobkill2.exe").unwrap();
        assert_eq!(
            nt_assign_process_to_job_object(&job, &late),
            Err(NtStatus::InvalidParameter)
        );
    }

    #[test]
    fn test_process_id_list_query() {
        let job = ps_create_job(0).unwrap();
        let a = ps_create_system_process("jobpidl1.exe").unwrap();
        let b = ps_create_system_process("jobpidl2.exe").unwrap();
        nt_assign_process_to_job_object(&job, &a).unwrap();
        nt_assign_process_to_job_object(&job, &b).unwrap();

        // Room for only one entry
        let (info, _required) = nt_query_information_job_object(
            &job,
            JobObjectInformationClass::BasicProcessIdList,
            16,
        )
        .unwrap();
        match info {
            JobObjectInfo::BasicProcessIdList(list) => {
                assert_eq!(list.number_of_assigned_processes, 2);
                assert_eq!(list.process_id_list.len(), 1);
            }
            other => panic!("wrong class {:?}", other),
        }

        assert_eq!(
            nt_query_information_job_object(
                &job,
                JobObjectInformationClass::BasicProcessIdList,
                8
            )
            .err(),
            Some(NtStatus::InfoLengthMismatch)
        );
    }

    #[test]
    fn test_job_set_validation_and_resolution() {
        let head = ps_create_job(0).unwrap();
        let mid = ps_create_job(0).unwrap();
        let tail = ps_create_job(0).unwrap();

        // Levels must strictly increase
        let bad = [
            JobSetArrayEntry { job: head.clone(), member_level: 2, flags: 0 },
            JobSetArrayEntry { job: mid.clone(), member_level: 1, flags: 0 },
        ];
        assert_eq!(nt_create_job_set(&bad), Err(NtStatus::InvalidParameter));

        // Entry flags must be zero
        let bad = [
            JobSetArrayEntry { job: head.clone(), member_level: 1, flags: 1 },
            JobSetArrayEntry { job: mid.clone(), member_level: 2, flags: 0 },
        ];
        assert_eq!(nt_create_job_set(&bad), Err(NtStatus::InvalidParameter));

        let entries = [
            JobSetArrayEntry { job: head.clone(), member_level: 1, flags: 0 },
            JobSetArrayEntry { job: mid.clone(), member_level: 2, flags: 0 },
            JobSetArrayEntry { job: tail.clone(), member_level: 3, flags: 0 },
        ];
        nt_create_job_set(&entries).unwrap();
        assert_eq!(head.member_level(), 1);
        assert_eq!(tail.member_level(), 3);

        // A member cannot join a second set
        let other = ps_create_job(0).unwrap();
        let bad = [
            JobSetArrayEntry { job: other.clone(), member_level: 1, flags: 0 },
            JobSetArrayEntry { job: mid.clone(), member_level: 2, flags: 0 },
        ];
        assert_eq!(nt_create_job_set(&bad), Err(NtStatus::InvalidParameter));
        // Failed creation unwinds the staged level
        assert_eq!(other.member_level(), 0);

        // Resolution walks the circle for an exact level match
        let resolved = psp_get_job_from_set(&head, 3).unwrap();
        assert!(resolved.ptr_eq(tail.object()));
        assert_eq!(
            psp_get_job_from_set(&head, 5).err(),
            Some(NtStatus::AccessDenied)
        );
        // A parent above the requested level is refused
        assert_eq!(
            psp_get_job_from_set(&tail, 2).err(),
            Some(NtStatus::AccessDenied)
        );
        // Level zero resolves to the parent's own job
        let same = psp_get_job_from_set(&mid, 0).unwrap();
        assert!(same.ptr_eq(mid.object()));
    }

    #[test]
    fn test_query_length_table() {
        let job = ps_create_job(0).unwrap();
        assert_eq!(
            nt_query_information_job_object(
                &job,
                JobObjectInformationClass::BasicAccounting,
                1
            )
            .err(),
            Some(NtStatus::InfoLengthMismatch)
        );
        let (info, _) = nt_query_information_job_object(
            &job,
            JobObjectInformationClass::BasicAccounting,
            core::mem::size_of::<JobBasicAccountingInformation>(),
        )
        .unwrap();
        match info {
            JobObjectInfo::BasicAccounting(acct) => {
                assert_eq!(acct.total_processes, 0);
                assert_eq!(acct.active_processes, 0);
            }
            other => panic!("wrong class {:?}", other),
        }
    }
}
