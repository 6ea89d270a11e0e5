//! Thread Suspend/Resume and Alerts
//!
//! Suspension is reference counted per thread, saturating at
//! [`MAX_SUSPEND_COUNT`](crate::ps::thread::MAX_SUSPEND_COUNT). A thread
//! that begins termination while being suspended is force-resumed so it
//! can run its exit path; the suspender sees `ThreadIsTerminating`.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::ob::ObjectRef;
use crate::ps::process::ProcessRef;
use crate::ps::thread::ThreadRef;
use crate::status::{NtStatus, PsResult};

/// Suspend a thread. Returns the previous suspend count.
pub fn ps_suspend_thread(thread: &ThreadRef) -> PsResult<u32> {
    if !thread.rundown.acquire() {
        return Err(NtStatus::ThreadIsTerminating);
    }
    let result = match thread.increment_suspend_count() {
        None => Err(NtStatus::SuspendCountExceeded),
        Some(previous) => {
            // The termination path may have raced in between the rundown
            // check and the increment; it must never find the thread held.
            if thread.is_terminated() {
                thread.force_resume();
                Err(NtStatus::ThreadIsTerminating)
            } else {
                Ok(previous)
            }
        }
    };
    thread.rundown.release();
    result
}

/// Self-suspension skips the rundown check: a thread running its own code
/// is by definition not run down yet.
pub fn ps_suspend_thread_self(thread: &ThreadRef) -> PsResult<u32> {
    thread
        .increment_suspend_count()
        .ok_or(NtStatus::SuspendCountExceeded)
}

/// Resume a thread. Returns the previous suspend count; zero means the
/// thread was not suspended.
pub fn ps_resume_thread(thread: &ThreadRef) -> u32 {
    thread.decrement_suspend_count()
}

fn snapshot_threads(process: &ProcessRef) -> Vec<ThreadRef> {
    let list = process.process_lock.read();
    list.iter().filter_map(ObjectRef::try_reference).collect()
}

/// Suspend every thread of a process. Threads already terminating are
/// skipped rather than failing the whole operation.
pub fn ps_suspend_process(process: &ProcessRef) -> PsResult<()> {
    if !process.rundown.acquire() {
        return Err(NtStatus::ProcessIsTerminating);
    }
    for thread in snapshot_threads(process) {
        let _ = ps_suspend_thread(&thread);
    }
    process.rundown.release();
    Ok(())
}

/// Resume every thread of a process.
pub fn ps_resume_process(process: &ProcessRef) -> PsResult<()> {
    if !process.rundown.acquire() {
        return Err(NtStatus::ProcessIsTerminating);
    }
    for thread in snapshot_threads(process) {
        ps_resume_thread(&thread);
    }
    process.rundown.release();
    Ok(())
}

/// Post an alert to a thread.
pub fn nt_alert_thread(thread: &ThreadRef) -> PsResult<()> {
    if !thread.rundown.acquire() {
        return Err(NtStatus::ThreadIsTerminating);
    }
    thread.set_alerted();
    thread.rundown.release();
    Ok(())
}

/// Alert a thread and release one suspension, the classic wake pairing.
/// Returns the previous suspend count.
pub fn nt_alert_resume_thread(thread: &ThreadRef) -> PsResult<u32> {
    if !thread.rundown.acquire() {
        return Err(NtStatus::ThreadIsTerminating);
    }
    thread.set_alerted();
    let previous = thread.decrement_suspend_count();
    thread.rundown.release();
    Ok(previous)
}

/// Consume the calling thread's pending alert, if any.
pub fn nt_test_alert(thread: &ThreadRef) -> bool {
    thread.test_alert()
}
