//! Process, Thread and Job Enumeration
//!
//! Cursor-style walks over the active process list, a process's thread
//! list, the job list and a job's member list. The cursor is the
//! previously returned reference; entries that are mid-deletion fail the
//! safe-reference attempt and are skipped, so a walk never resurrects a
//! dying object. A cursor whose entry has been unlinked restarts the walk
//! from the head.

use crate::ob::ObjectRef;
use crate::ps::job::JobRef;
use crate::ps::process::ProcessRef;
use crate::ps::thread::ThreadRef;

/// Next process after `previous` on the active list, or the first process
/// when `previous` is `None`.
pub fn ps_get_next_process(previous: Option<&ProcessRef>) -> Option<ProcessRef> {
    let list = crate::ps::active_process_list().read();
    let start = match previous {
        Some(prev) => list
            .iter()
            .position(|p| prev.ptr_eq(p))
            .map(|pos| pos + 1)
            .unwrap_or(0),
        None => 0,
    };
    list[start..].iter().find_map(ObjectRef::try_reference)
}

/// Next thread of `process` after `previous`.
pub fn ps_get_next_process_thread(
    process: &ProcessRef,
    previous: Option<&ThreadRef>,
) -> Option<ThreadRef> {
    let list = process.process_lock.read();
    let start = match previous {
        Some(prev) => list
            .iter()
            .position(|t| prev.ptr_eq(t))
            .map(|pos| pos + 1)
            .unwrap_or(0),
        None => 0,
    };
    list[start..].iter().find_map(ObjectRef::try_reference)
}

/// Next job after `previous` on the job list.
pub fn ps_get_next_job(previous: Option<&JobRef>) -> Option<JobRef> {
    let list = crate::ps::job_list().read();
    let start = match previous {
        Some(prev) => list
            .iter()
            .position(|j| prev.ptr_eq(j))
            .map(|pos| pos + 1)
            .unwrap_or(0),
        None => 0,
    };
    list[start..].iter().find_map(ObjectRef::try_reference)
}

/// Next member of `job` after `previous`.
pub fn ps_get_next_job_process(
    job: &JobRef,
    previous: Option<&ProcessRef>,
) -> Option<ProcessRef> {
    let inner = job.inner.read();
    let start = match previous {
        Some(prev) => inner
            .processes
            .iter()
            .position(|p| prev.ptr_eq(p))
            .map(|pos| pos + 1)
            .unwrap_or(0),
        None => 0,
    };
    inner.processes[start..]
        .iter()
        .find_map(ObjectRef::try_reference)
}

/// Run `f` over every live process. The list lock is not held across
/// calls, so `f` may take process locks of its own.
pub fn ps_for_each_process<F: FnMut(&ProcessRef)>(mut f: F) {
    let mut cursor: Option<ProcessRef> = None;
    loop {
        let next = ps_get_next_process(cursor.as_ref());
        match next {
            Some(process) => {
                f(&process);
                cursor = Some(process);
            }
            None => break,
        }
    }
}
