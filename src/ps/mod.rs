//! Process Structure (ps)
//!
//! Process and thread lifecycle: creation, termination, suspension,
//! security state, job objects, enumeration and lifecycle callbacks.
//! Object lifetime is managed by the `ob` layer; this module owns the
//! global active-process and job lists.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Once, RwLock};

pub mod cid;
pub mod context;
pub mod create;
pub mod enumerate;
pub mod job;
pub mod notify;
pub mod process;
pub mod security;
pub mod suspend;
pub mod terminate;
pub mod thread;

pub use cid::{ps_lookup_process_by_id, ps_lookup_thread_by_id, ClientId};
pub use context::{ps_get_context_thread, ps_set_context_thread, ContextFlags, ThreadContext};
pub use create::{
    ps_create_system_process, ps_create_system_thread, ps_create_user_process,
    ps_create_user_process_with_token, ps_create_user_thread,
};
pub use enumerate::{
    ps_for_each_process, ps_get_next_job, ps_get_next_job_process, ps_get_next_process,
    ps_get_next_process_thread,
};
pub use job::{
    nt_assign_process_to_job_object, nt_create_job_set, nt_is_process_in_job,
    nt_query_information_job_object, nt_set_information_job_object, nt_terminate_job_object,
    ps_close_job, ps_create_job, ps_enforce_execution_time_limits, Job, JobRef,
};
pub use notify::{
    ps_set_create_process_notify_routine, ps_set_create_thread_notify_routine,
    ps_set_load_image_notify_routine,
};
pub use process::{Process, ProcessRef};
pub use security::{
    ps_assign_primary_token, ps_disable_impersonation, ps_impersonate_client,
    ps_reference_effective_token, ps_reference_impersonation_token, ps_reference_primary_token,
    ps_restore_impersonation, ps_revert_to_self,
};
pub use suspend::{
    nt_alert_resume_thread, nt_alert_thread, nt_test_alert, ps_resume_process, ps_resume_thread,
    ps_suspend_process, ps_suspend_thread, ps_suspend_thread_self,
};
pub use terminate::{nt_terminate_process, nt_terminate_thread, ps_exit_thread};
pub use thread::{Thread, ThreadRef};

use crate::status::PsResult;
use process::ProcessObj;

// ============================================================================
// Global lists
// ============================================================================

// Links here are uncounted; the delete routines unlink themselves.
static ACTIVE_PROCESS_LIST: RwLock<Vec<ProcessObj>> = RwLock::new(Vec::new());
static JOB_LIST: RwLock<Vec<job::JobObj>> = RwLock::new(Vec::new());

pub(crate) fn active_process_list() -> &'static RwLock<Vec<ProcessObj>> {
    &ACTIVE_PROCESS_LIST
}

pub(crate) fn job_list() -> &'static RwLock<Vec<job::JobObj>> {
    &JOB_LIST
}

pub(crate) fn unlink_active_process(process: &ProcessObj) {
    let mut list = ACTIVE_PROCESS_LIST.write();
    if let Some(pos) = list.iter().position(|p| Arc::ptr_eq(p, process)) {
        list.swap_remove(pos);
    }
}

// ============================================================================
// Time
// ============================================================================

// Monotonic creation/exit stamp, 100ns-shaped but driven by events rather
// than a clock.
static TIMESTAMP: AtomicU64 = AtomicU64::new(1);

pub(crate) fn timestamp() -> u64 {
    TIMESTAMP.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Initialization
// ============================================================================

static SYSTEM_PROCESS: Once<ProcessRef> = Once::new();

/// Bring up the subsystem: creates the initial system process. Safe to
/// call more than once.
pub fn init() -> PsResult<()> {
    if SYSTEM_PROCESS.get().is_some() {
        return Ok(());
    }
    let process = create::ps_create_system_process("System")?;
    let process = SYSTEM_PROCESS.call_once(|| process);
    log::info!(
        "[PS] process subsystem initialized, system pid {}",
        process.unique_process_id()
    );
    Ok(())
}

/// The initial system process, once [`init`] has run.
pub fn ps_initial_system_process() -> Option<&'static ProcessRef> {
    SYSTEM_PROCESS.get()
}
