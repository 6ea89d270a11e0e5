//! Process and Thread Creation
//!
//! Creation is staged: identity (token, session) and job placement are
//! resolved first, then the object is built, given a client ID, admitted
//! to its job, and finally published on the active list. A failure at any
//! stage simply drops the half-built object; its delete routine undoes
//! whatever had been wired up.
//!
//! Threads link into their process under the exclusive process lock,
//! where PROCESS_DELETE is honored. A termination that races in after
//! linking is caught afterwards and the new thread is taken down the
//! normal way.

use alloc::sync::Arc;

use crate::mm::{AddressSpace, Section};
use crate::ob::ObjectRef;
use crate::ps::cid::{ps_allocate_cid, CidEntry};
use crate::ps::job::{psp_get_job_from_set, JobLimitFlags, JobRef, JobSecurityLimitFlags};
use crate::ps::notify;
use crate::ps::process::{
    priority_class, process_access, process_flags, Peb, Process, ProcessRef,
};
use crate::ps::security::ps_reference_primary_token;
use crate::ps::thread::{cross_thread_flags, thread_access, Teb, Thread, ThreadRef};
use crate::se::{se_filter_token, Luid, Token};
use crate::status::{NtStatus, PsResult};

/// Process creation flags
pub mod create_process_flags {
    /// Detach from the parent's job (the job must allow it)
    pub const BREAKAWAY: u32 = 0x1;
    /// Children do not inherit the debug port
    pub const NO_DEBUG_INHERIT: u32 = 0x2;
    pub const INHERIT_HANDLES: u32 = 0x4;
    pub const OVERRIDE_ADDRESS_SPACE: u32 = 0x8;
    /// Back the image with large pages where the mapping allows it
    pub const LARGE_PAGES: u32 = 0x10;
    pub const ALL: u32 = 0x1F;
}

/// Create a system process: system token, kernel address space, no PEB.
pub fn ps_create_system_process(image_name: &str) -> PsResult<ProcessRef> {
    psp_create_process(image_name, None, None, 0, 0, None, true)
}

/// Create a user process as a child of `parent`.
///
/// `job_member_level` selects a deeper member of the parent's job set;
/// zero keeps the child in the parent's own job.
pub fn ps_create_user_process(
    image_name: &str,
    parent: &ProcessRef,
    section: Option<Arc<Section>>,
    flags: u32,
    job_member_level: u32,
) -> PsResult<ProcessRef> {
    if flags & !create_process_flags::ALL != 0 {
        return Err(NtStatus::InvalidParameter);
    }
    psp_create_process(
        image_name,
        Some(parent),
        section,
        flags,
        job_member_level,
        None,
        false,
    )
}

/// Create a user process running under an explicit token.
pub fn ps_create_user_process_with_token(
    image_name: &str,
    parent: &ProcessRef,
    section: Option<Arc<Section>>,
    token: Arc<Token>,
) -> PsResult<ProcessRef> {
    psp_create_process(image_name, Some(parent), section, 0, 0, Some(token), false)
}

fn psp_create_process(
    image_name: &str,
    parent: Option<&ProcessRef>,
    section: Option<Arc<Section>>,
    flags: u32,
    job_member_level: u32,
    token_override: Option<Arc<Token>>,
    system: bool,
) -> PsResult<ProcessRef> {
    // The parent must not run down while we inherit from it.
    if let Some(parent) = parent {
        if !parent.rundown.acquire() {
            return Err(NtStatus::ProcessIsTerminating);
        }
    }
    let result = psp_create_process_guarded(
        image_name,
        parent,
        section,
        flags,
        job_member_level,
        token_override,
        system,
    );
    if let Some(parent) = parent {
        parent.rundown.release();
    }
    result
}

fn psp_create_process_guarded(
    image_name: &str,
    parent: Option<&ProcessRef>,
    section: Option<Arc<Section>>,
    flags: u32,
    job_member_level: u32,
    token_override: Option<Arc<Token>>,
    system: bool,
) -> PsResult<ProcessRef> {
    let parent_pid = parent.map(|p| p.unique_process_id()).unwrap_or(0);
    let session_id = parent.map(|p| p.session_id).unwrap_or(0);

    let mut token = match token_override {
        Some(token) => token,
        None => match parent {
            Some(parent) => ps_reference_primary_token(parent).duplicate_primary(),
            None => Token::system(),
        },
    };

    // Job placement and the token policy it carries.
    let mut job: Option<JobRef> = None;
    if let Some(parent) = parent {
        if let Some(parent_job) = parent.job() {
            let limit_flags = parent_job.inner.read().limit_flags;
            if flags & create_process_flags::BREAKAWAY != 0 {
                if !limit_flags.contains(JobLimitFlags::BREAKAWAY_OK) {
                    return Err(NtStatus::AccessDenied);
                }
            } else if limit_flags.contains(JobLimitFlags::SILENT_BREAKAWAY_OK) {
                // All children detach without asking.
            } else {
                let target = psp_get_job_from_set(&parent_job, job_member_level)?;
                let (security_flags, job_token, filter) = {
                    let inner = target.inner.read();
                    (
                        inner.security_limit_flags,
                        inner.token.clone(),
                        inner.filter.clone(),
                    )
                };
                if security_flags.contains(JobSecurityLimitFlags::ONLY_TOKEN) {
                    if let Some(job_token) = job_token {
                        token = job_token.duplicate_primary();
                    }
                } else if security_flags.contains(JobSecurityLimitFlags::FILTER_TOKENS) {
                    if let Some(filter) = filter {
                        token = se_filter_token(&token, &filter)?;
                    }
                }
                job = Some(target);
            }
        }
    }

    let address_space = if system {
        AddressSpace::for_system()?
    } else if let Some(section) = &section {
        AddressSpace::from_section(section)?
    } else if let Some(parent) = parent {
        let base = parent
            .address_space
            .lock()
            .as_ref()
            .map(|space| space.directory_base)
            .ok_or(NtStatus::ProcessIsTerminating)?;
        AddressSpace::cloned_from(base)?
    } else {
        AddressSpace::for_system()?
    };

    let process = ObjectRef::new(Process::new(
        image_name,
        parent_pid,
        session_id,
        token,
        address_space,
        section.clone(),
        crate::ps::timestamp(),
    ));
    if system {
        process.set_flag(process_flags::SYSTEM);
    }
    if flags & create_process_flags::BREAKAWAY != 0 {
        process.set_flag(process_flags::BREAKAWAY);
    }
    if flags & create_process_flags::NO_DEBUG_INHERIT != 0 {
        process.set_flag(process_flags::NO_DEBUG_INHERIT);
    }
    if flags & create_process_flags::OVERRIDE_ADDRESS_SPACE != 0 {
        process.set_flag(process_flags::OVERRIDE_ADDRESS_SPACE);
    }
    if flags & create_process_flags::LARGE_PAGES != 0 {
        process.set_flag(process_flags::LARGE_PAGES);
    }

    let pid = ps_allocate_cid(CidEntry::Process(Arc::clone(process.object())))?;
    process.set_unique_process_id(pid);

    if let Some(job) = &job {
        // A fresh process has no binding; this cannot fail.
        let _ = process.try_bind_job(job.clone());
        // On rejection the binding stays: dropping the half-built process
        // runs its delete routine, which unwinds the job side.
        crate::ps::job::psp_add_process_to_job(job, &process)?;
    }

    if !system {
        *process.peb.lock() = Some(Peb {
            image_base_address: section.as_ref().map(|s| s.base).unwrap_or(0),
            session_id,
            number_of_processors: 1,
        });
    }

    if let Some(parent) = parent {
        let class = parent.priority_class.load(core::sync::atomic::Ordering::Acquire);
        if class != priority_class::NORMAL {
            process
                .priority_class
                .store(class, core::sync::atomic::Ordering::Release);
            process.base_priority.store(
                priority_class::base_priority(class),
                core::sync::atomic::Ordering::Release,
            );
        }
    }
    process
        .granted_access
        .store(process_access::ALL_ACCESS, core::sync::atomic::Ordering::Release);

    crate::ps::active_process_list()
        .write()
        .push(Arc::clone(process.object()));

    if section.is_some() {
        notify::notify_image(process.image_name(), pid);
    }

    log::debug!(
        "[PS] created process {} ({}), parent {}",
        pid,
        image_name,
        parent_pid
    );
    Ok(process)
}

/// Create a system thread (no TEB, exempt from user bookkeeping).
pub fn ps_create_system_thread(
    process: &ProcessRef,
    start_address: u64,
    create_suspended: bool,
) -> PsResult<ThreadRef> {
    psp_create_thread(process, start_address, create_suspended, true)
}

/// Create a user thread in `process` on behalf of `caller`.
///
/// The initial system process is off limits to unprivileged callers.
pub fn ps_create_user_thread(
    process: &ProcessRef,
    start_address: u64,
    create_suspended: bool,
    caller: &Arc<Token>,
) -> PsResult<ThreadRef> {
    if let Some(system) = crate::ps::ps_initial_system_process() {
        if system.ptr_eq(process.object()) && !caller.has_privilege(Luid::SE_TCB) {
            return Err(NtStatus::AccessDenied);
        }
    }
    psp_create_thread(process, start_address, create_suspended, false)
}

fn psp_create_thread(
    process: &ProcessRef,
    start_address: u64,
    create_suspended: bool,
    system: bool,
) -> PsResult<ThreadRef> {
    let thread = ObjectRef::new(Thread::new(
        process.clone(),
        start_address,
        crate::ps::timestamp(),
    ));
    let tid = match ps_allocate_cid(CidEntry::Thread(Arc::clone(thread.object()))) {
        Ok(tid) => tid,
        Err(status) => {
            thread.set_cross_flag(
                cross_thread_flags::DEAD_THREAD | cross_thread_flags::SKIP_TERMINATION_MSG,
            );
            return Err(status);
        }
    };
    thread.set_unique_thread_id(tid);
    if system {
        thread.set_cross_flag(cross_thread_flags::SYSTEM);
    }

    if !process.rundown.acquire() {
        thread.set_cross_flag(
            cross_thread_flags::DEAD_THREAD | cross_thread_flags::SKIP_TERMINATION_MSG,
        );
        return Err(NtStatus::ProcessIsTerminating);
    }

    let first = {
        let mut threads = process.process_lock.write();
        if process.has_flag(process_flags::PROCESS_DELETE) {
            drop(threads);
            process.rundown.release();
            thread.set_cross_flag(
                cross_thread_flags::DEAD_THREAD | cross_thread_flags::SKIP_TERMINATION_MSG,
            );
            return Err(NtStatus::ProcessIsTerminating);
        }
        threads.push(Arc::clone(thread.object()));
        process
            .active_threads
            .fetch_add(1, core::sync::atomic::Ordering::AcqRel)
            == 0
    };

    if !system {
        // Synthetic user stack region, one slot per thread id.
        let stack_base = 0x0000_7FFF_0000_0000u64 - (tid as u64) * 0x2_0000;
        *thread.teb.lock() = Some(Teb {
            stack_base,
            stack_limit: stack_base - 0x1_0000,
        });
    }
    thread
        .granted_access
        .store(thread_access::ALL_ACCESS, core::sync::atomic::Ordering::Release);

    if create_suspended {
        let _ = thread.increment_suspend_count();
    }

    let pid = process.unique_process_id();
    if first && !process.test_set_flag(process_flags::CREATE_REPORTED) {
        notify::notify_process(process.inherited_from_unique_process_id, pid, true);
        if let Some(job) = process.job() {
            crate::ps::job::psp_job_report_new_process(&job, process);
        }
    }
    notify::notify_thread(pid, tid, true);

    // A termination that began after the linked-list check may have
    // snapshotted the list before this thread went in; finish its work.
    if process.has_flag(process_flags::PROCESS_DELETE) {
        process.rundown.release();
        crate::ps::terminate::psp_terminate_thread_by_pointer(&thread, process.exit_status());
        return Err(NtStatus::ProcessIsTerminating);
    }

    process.rundown.release();
    log::trace!("[PS] created thread {}.{}", pid, tid);
    Ok(thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps::cid::ps_lookup_process_by_id;
    use crate::ps::job::{
        nt_assign_process_to_job_object, nt_set_information_job_object, ps_create_job,
        JobBasicLimitInformation, JobObjectSetInfo, JobSecurityLimitInformation,
        JobSetArrayEntry, nt_create_job_set,
    };
    use crate::se::{Sid, TokenSource};
    use alloc::vec::Vec;

    #[test]
    fn test_system_process_identity() {
        let process = ps_create_system_process("createsys.exe").unwrap();
        let pid = process.unique_process_id();
        assert_ne!(pid, 0);
        assert_eq!(pid % 4, 0);
        assert!(process.has_flag(process_flags::SYSTEM));
        assert!(process.peb.lock().is_none());

        let found = ps_lookup_process_by_id(pid).unwrap();
        assert!(found.ptr_eq(process.object()));
    }

    #[test]
    fn test_child_inherits_identity() {
        let parent = ps_create_system_process("createpar.exe").unwrap();
        let child = ps_create_user_process("createchild.exe", &parent, None, 0, 0).unwrap();

        assert_eq!(
            child.inherited_from_unique_process_id,
            parent.unique_process_id()
        );
        assert_eq!(child.session_id, parent.session_id);

        let parent_token = ps_reference_primary_token(&parent);
        let child_token = ps_reference_primary_token(&child);
        assert!(child_token.is_child_of(&parent_token));
        assert!(child.peb.lock().is_some());
    }

    #[test]
    fn test_child_joins_parent_job() {
        let job = ps_create_job(0).unwrap();
        let parent = ps_create_system_process("createjob.exe").unwrap();
        nt_assign_process_to_job_object(&job, &parent).unwrap();

        let child = ps_create_user_process("createjobc.exe", &parent, None, 0, 0).unwrap();
        assert!(child.in_job());
        let inner = job.inner.read();
        assert_eq!(inner.active_processes, 2);
        assert_eq!(inner.total_processes, 2);
        drop(inner);
        drop(child);
    }

    #[test]
    fn test_breakaway_rules() {
        let job = ps_create_job(0).unwrap();
        let parent = ps_create_system_process("createbrk.exe").unwrap();
        nt_assign_process_to_job_object(&job, &parent).unwrap();

        // Breakaway denied until the job allows it
        assert_eq!(
            ps_create_user_process(
                "createbrkc.exe",
                &parent,
                None,
                create_process_flags::BREAKAWAY,
                0
            )
            .err(),
            Some(NtStatus::AccessDenied)
        );

        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::BREAKAWAY_OK.bits();
        nt_set_information_job_object(
            &job,
            JobObjectSetInfo::BasicLimit(limits),
            core::mem::size_of::<JobBasicLimitInformation>(),
            &Token::system(),
        )
        .unwrap();

        let free = ps_create_user_process(
            "createbrkc.exe",
            &parent,
            None,
            create_process_flags::BREAKAWAY,
            0,
        )
        .unwrap();
        assert!(!free.in_job());
        assert!(free.has_flag(process_flags::BREAKAWAY));
    }

    #[test]
    fn test_silent_breakaway() {
        let job = ps_create_job(0).unwrap();
        let mut limits = JobBasicLimitInformation::new();
        limits.limit_flags = JobLimitFlags::SILENT_BREAKAWAY_OK.bits();
        nt_set_information_job_object(
            &job,
            JobObjectSetInfo::BasicLimit(limits),
            core::mem::size_of::<JobBasicLimitInformation>(),
            &Token::system(),
        )
        .unwrap();

        let parent = ps_create_system_process("createsil.exe").unwrap();
        nt_assign_process_to_job_object(&job, &parent).unwrap();

        let child = ps_create_user_process("createsilc.exe", &parent, None, 0, 0).unwrap();
        assert!(!child.in_job());
        assert_eq!(job.inner.read().active_processes, 1);
    }

    #[test]
    fn test_job_set_member_level_creation() {
        let outer = ps_create_job(0).unwrap();
        let inner_job = ps_create_job(0).unwrap();
        let entries = [
            JobSetArrayEntry {
                job: outer.clone(),
                member_level: 1,
                flags: 0,
            },
            JobSetArrayEntry {
                job: inner_job.clone(),
                member_level: 2,
                flags: 0,
            },
        ];
        nt_create_job_set(&entries).unwrap();

        let parent = ps_create_system_process("createset.exe").unwrap();
        nt_assign_process_to_job_object(&outer, &parent).unwrap();

        let child = ps_create_user_process("createsetc.exe", &parent, None, 0, 2).unwrap();
        let bound = child.job().unwrap();
        assert!(bound.ptr_eq(inner_job.object()));
        assert_eq!(inner_job.inner.read().active_processes, 1);

        // A level with no member refuses the creation
        assert_eq!(
            ps_create_user_process("createsetd.exe", &parent, None, 0, 7).err(),
            Some(NtStatus::AccessDenied)
        );
    }

    #[test]
    fn test_only_token_substitution() {
        let job = ps_create_job(0).unwrap();
        let job_identity = Token::new_primary(
            Sid(4100),
            0xAB,
            alloc::vec![],
            alloc::vec![],
            TokenSource::new(*b"JobIdent", 1),
        );
        nt_set_information_job_object(
            &job,
            JobObjectSetInfo::SecurityLimit(JobSecurityLimitInformation {
                security_limit_flags: JobSecurityLimitFlags::ONLY_TOKEN,
                job_token: Some(Arc::clone(&job_identity)),
                sids_to_disable: Vec::new(),
                privileges_to_delete: Vec::new(),
                restricted_sids: Vec::new(),
            }),
            32,
            &Token::system(),
        )
        .unwrap();

        let parent = ps_create_system_process("createtok.exe").unwrap();
        nt_assign_process_to_job_object(&job, &parent).unwrap();

        let child = ps_create_user_process("createtokc.exe", &parent, None, 0, 0).unwrap();
        let token = ps_reference_primary_token(&child);
        assert_eq!(token.user, Sid(4100));
        assert!(token.is_child_of(&job_identity));
    }

    #[test]
    fn test_filter_tokens_substitution() {
        let job = ps_create_job(0).unwrap();
        nt_set_information_job_object(
            &job,
            JobObjectSetInfo::SecurityLimit(JobSecurityLimitInformation {
                security_limit_flags: JobSecurityLimitFlags::FILTER_TOKENS,
                job_token: None,
                sids_to_disable: alloc::vec![Sid::ADMINISTRATORS],
                privileges_to_delete: Vec::new(),
                restricted_sids: alloc::vec![Sid::RESTRICTED],
            }),
            32,
            &Token::system(),
        )
        .unwrap();

        let parent = ps_create_system_process("createflt.exe").unwrap();
        nt_assign_process_to_job_object(&job, &parent).unwrap();

        let child = ps_create_user_process("createfltc.exe", &parent, None, 0, 0).unwrap();
        let token = ps_reference_primary_token(&child);
        assert!(!token.is_admin());
        assert!(token.is_restricted());
    }

    #[test]
    fn test_create_suspended_thread() {
        let process = ps_create_system_process("createsusp.exe").unwrap();
        let thread = ps_create_system_thread(&process, 0x1000, true).unwrap();
        assert_eq!(thread.suspend_count(), 1);
        assert_eq!(process.active_threads(), 1);
        assert_eq!(thread.unique_thread_id() % 4, 0);
    }

    #[test]
    fn test_user_thread_gets_teb() {
        let parent = ps_create_system_process("createteb.exe").unwrap();
        let child = ps_create_user_process("createtebc.exe", &parent, None, 0, 0).unwrap();
        let thread = ps_create_user_thread(&child, 0x5000, false, &Token::system()).unwrap();

        let teb = thread.teb.lock();
        let teb = teb.as_ref().unwrap();
        assert!(teb.stack_base > teb.stack_limit);
    }

    #[test]
    fn test_large_pages_flag_accepted() {
        let parent = ps_create_system_process("createlp.exe").unwrap();
        let child = ps_create_user_process(
            "createlpc.exe",
            &parent,
            None,
            create_process_flags::LARGE_PAGES,
            0,
        )
        .unwrap();
        assert!(child.has_flag(process_flags::LARGE_PAGES));

        // Unknown bits above the defined set are still refused
        assert_eq!(
            ps_create_user_process("createlpd.exe", &parent, None, 0x20, 0).err(),
            Some(NtStatus::InvalidParameter)
        );
    }

    #[test]
    fn test_system_process_thread_needs_privilege() {
        crate::ps::init().unwrap();
        let system = crate::ps::ps_initial_system_process().unwrap();

        let unprivileged = Token::new_primary(
            Sid(4200),
            0xAC,
            alloc::vec![],
            alloc::vec![],
            TokenSource::new(*b"UserInit", 2),
        );
        assert_eq!(
            ps_create_user_thread(system, 0x7000, false, &unprivileged).err(),
            Some(NtStatus::AccessDenied)
        );

        // A TCB holder may, and any other process is open to everyone
        let thread = ps_create_user_thread(system, 0x7000, false, &Token::system()).unwrap();
        assert!(!thread.is_terminated());
        let other = ps_create_system_process("createtcb.exe").unwrap();
        ps_create_user_thread(&other, 0x7000, false, &unprivileged).unwrap();
    }

    #[test]
    fn test_image_section_process() {
        let section = Section::new(0x40_0000, 0x10000);
        let parent = ps_create_system_process("createimg.exe").unwrap();
        let child =
            ps_create_user_process("createimgc.exe", &parent, Some(Arc::clone(&section)), 0, 0)
                .unwrap();

        let peb = child.peb.lock();
        assert_eq!(peb.as_ref().unwrap().image_base_address, 0x40_0000);
    }
}
