//! Thread and Process Termination
//!
//! Termination is funneled through a test-and-set of the TERMINATED
//! cross-thread flag, so exactly one caller runs a thread's exit path.
//! A suspended thread is force-resumed first; a held thread could never
//! reach its exit processing.
//!
//! The last exiting thread runs process exit: the process rundown is
//! waited out, job accounting folds, callbacks fire, and the address
//! space goes away. `nt_terminate_process` releases the process rundown
//! before touching any thread, because the last-thread path waits on that
//! same rundown.

use alloc::vec::Vec;

use crate::ob::ObjectRef;
use crate::ps::notify;
use crate::ps::process::{process_flags, ProcessRef};
use crate::ps::thread::{cross_thread_flags, ThreadRef};
use crate::status::{NtStatus, PsResult};

/// Exit status stamped on processes killed by quota enforcement
pub const EXIT_STATUS_QUOTA_EXCEEDED: i32 = 0xC000_0044_u32 as i32;
/// Exit status stamped on members of a torn-down job
pub const EXIT_STATUS_JOB_TERMINATED: i32 = 0xC000_02D9_u32 as i32;

/// Terminate one thread. Idempotent: only the first caller for a given
/// thread performs exit processing.
pub(crate) fn psp_terminate_thread_by_pointer(thread: &ThreadRef, exit_status: i32) {
    if thread.test_set_cross_flag(cross_thread_flags::TERMINATED) {
        return;
    }
    // A suspended thread must be released or it never exits.
    thread.force_resume();
    psp_exit_thread(thread, exit_status);
}

/// A thread exiting of its own accord.
pub fn ps_exit_thread(thread: &ThreadRef, exit_status: i32) {
    psp_terminate_thread_by_pointer(thread, exit_status);
}

/// Terminate a thread on behalf of another caller.
pub fn nt_terminate_thread(thread: &ThreadRef, exit_status: i32) -> PsResult<()> {
    if thread.is_terminated() {
        return Err(NtStatus::ThreadIsTerminating);
    }
    psp_terminate_thread_by_pointer(thread, exit_status);
    Ok(())
}

/// Thread exit processing. Runs exactly once per thread.
fn psp_exit_thread(thread: &ThreadRef, exit_status: i32) {
    let process = &thread.process;
    let pid = process.unique_process_id();
    let tid = thread.unique_thread_id();
    log::trace!("[PS] thread {}.{} exiting, status {:#x}", pid, tid, exit_status);

    thread.set_exit_status(exit_status);
    // Flush out in-flight cross-thread work (context access, suspends).
    thread.rundown.wait_for_rundown();

    if !thread.has_cross_flag(cross_thread_flags::SKIP_TERMINATION_MSG) {
        notify::notify_thread(pid, tid, false);
    }

    thread
        .exit_time
        .store(crate::ps::timestamp(), core::sync::atomic::Ordering::Release);

    // Unlink; the last linked thread out the door runs process exit.
    let last = {
        let mut threads = process.process_lock.write();
        match threads.iter().position(|t| thread.ptr_eq(t)) {
            Some(pos) => {
                threads.swap_remove(pos);
                let previous = process
                    .active_threads
                    .fetch_sub(1, core::sync::atomic::Ordering::AcqRel);
                previous == 1
            }
            None => false,
        }
    };

    if last {
        psp_exit_process(process, exit_status);
    }
}

/// Process exit processing. Runs exactly once per process.
pub(crate) fn psp_exit_process(process: &ProcessRef, exit_status: i32) {
    if process.test_set_flag(process_flags::PROCESS_EXITING) {
        return;
    }
    let pid = process.unique_process_id();
    log::debug!("[PS] process {} exiting, status {:#x}", pid, exit_status);

    process.set_exit_status(exit_status);
    // No new cross-process references past this point.
    process.rundown.wait_for_rundown();

    process
        .exit_time
        .store(crate::ps::timestamp(), core::sync::atomic::Ordering::Release);

    if let Some(job) = process.job() {
        crate::ps::job::psp_exit_process_from_job(&job, process);
    }

    if process.has_flag(process_flags::CREATE_REPORTED) {
        notify::notify_process(process.inherited_from_unique_process_id, pid, false);
    }

    // The address space goes now; the object sticks around for queries
    // until the last reference drops.
    process.address_space.lock().take();
    process.section.lock().take();
    process.clear_flag(process_flags::HAS_ADDRESS_SPACE);
}

fn snapshot_threads(process: &ProcessRef) -> Vec<ThreadRef> {
    let threads = process.process_lock.read();
    threads.iter().filter_map(ObjectRef::try_reference).collect()
}

/// Terminate a process and all of its threads. Used by the job paths,
/// which must succeed even for a process that never had threads.
pub(crate) fn psp_terminate_process(process: &ProcessRef, exit_status: i32) -> PsResult<()> {
    process.set_flag(process_flags::PROCESS_DELETE);
    let threads = snapshot_threads(process);
    if threads.is_empty() {
        psp_exit_process(process, exit_status);
        return Ok(());
    }
    for thread in threads {
        psp_terminate_thread_by_pointer(&thread, exit_status);
    }
    Ok(())
}

/// Terminate a process on behalf of another caller.
///
/// The process rundown is held only long enough to stamp PROCESS_DELETE
/// and snapshot the thread list; it is released before any thread is
/// terminated because the last-thread exit path waits on it.
pub fn nt_terminate_process(process: &ProcessRef, exit_status: i32) -> PsResult<()> {
    if !process.rundown.acquire() {
        return Err(NtStatus::ProcessIsTerminating);
    }
    process.set_flag(process_flags::PROCESS_DELETE);
    let threads = snapshot_threads(process);
    process.rundown.release();

    if threads.is_empty() {
        return Err(NtStatus::NothingToTerminate);
    }
    for thread in threads {
        psp_terminate_thread_by_pointer(&thread, exit_status);
    }
    Ok(())
}
