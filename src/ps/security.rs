//! Process and Thread Security State
//!
//! The primary token sits in a fast-reference slot: readers usually take
//! a cached reference without touching the process security lock, and the
//! writer swaps the token under the exclusive lock so no reader can be
//! left mid-flight on the old value. The old token is dropped only after
//! the lock is released.
//!
//! Impersonation state lives in a block allocated at most once per
//! thread; the block's contents are replaced on each impersonation and
//! cleared by revert.

use alloc::sync::Arc;
use spin::RwLock;

use crate::ps::process::ProcessRef;
use crate::ps::thread::{cross_thread_flags, ImpersonationInfo, ThreadRef};
use crate::se::{
    se_copy_client_token, se_filter_token, se_token_can_impersonate, ImpersonationLevel, Luid,
    Token, TokenType,
};
use crate::ps::job::JobSecurityLimitFlags;
use crate::status::{NtStatus, PsResult};

/// Take a counted reference to the process primary token.
pub fn ps_reference_primary_token(process: &ProcessRef) -> Arc<Token> {
    if let Some(token) = process.primary_token.fast_reference() {
        return token;
    }
    // Cache exhausted: refill under the shared security lock, which
    // excludes a concurrent swap.
    let _guard = process.security_lock.read();
    process.primary_token.slow_reference()
}

/// Snapshot a thread's impersonation state, if active.
pub fn ps_reference_impersonation_token(thread: &ThreadRef) -> Option<ImpersonationInfo> {
    if !thread.is_impersonating() {
        return None;
    }
    let block = thread.impersonation.get()?;
    block.read().clone()
}

/// The token access checks run against: the impersonation token while
/// impersonating, the primary token otherwise.
pub fn ps_reference_effective_token(
    thread: &ThreadRef,
) -> (Arc<Token>, TokenType, Option<ImpersonationLevel>) {
    if let Some(info) = ps_reference_impersonation_token(thread) {
        return (info.token, TokenType::Impersonation, Some(info.level));
    }
    (
        ps_reference_primary_token(&thread.process),
        TokenType::Primary,
        None,
    )
}

/// Policy a job imposes on an incoming primary token: a restricting or
/// filtering job only accepts restricted tokens, and NO_ADMIN refuses
/// administrators outright.
fn check_job_token_policy(process: &ProcessRef, token: &Token) -> PsResult<()> {
    let Some(job) = process.job() else {
        return Ok(());
    };
    let flags = job.inner.read().security_limit_flags;
    if flags.contains(JobSecurityLimitFlags::NO_ADMIN) && token.is_admin() {
        return Err(NtStatus::AccessDenied);
    }
    if flags
        .intersects(JobSecurityLimitFlags::RESTRICTED_TOKEN | JobSecurityLimitFlags::FILTER_TOKENS)
        && !token.is_restricted()
    {
        return Err(NtStatus::AccessDenied);
    }
    Ok(())
}

/// Replace the process primary token.
///
/// `caller` must either hold the assign-primary privilege or be the
/// parent of the incoming token. A job's token policy binds here too.
pub fn ps_assign_primary_token(
    process: &ProcessRef,
    token: Arc<Token>,
    caller: &Arc<Token>,
) -> PsResult<()> {
    if token.token_type != TokenType::Primary {
        return Err(NtStatus::BadTokenType);
    }
    if !caller.has_privilege(Luid::SE_ASSIGN_PRIMARY_TOKEN) && !token.is_child_of(caller) {
        return Err(NtStatus::PrivilegeNotHeld);
    }
    check_job_token_policy(process, &token)?;

    let old = {
        let _guard = process.security_lock.write();
        process.primary_token.swap(token)
    };
    // Dropping the old token outside the lock keeps its (possibly deep)
    // teardown off the security lock.
    drop(old);
    Ok(())
}

/// Impersonate a client token on `thread`, or revert when `token` is
/// `None`.
///
/// A client token the process is not entitled to impersonate is not
/// refused; it is downgraded to an identification-level copy, matching
/// the original's quiet degradation.
pub fn ps_impersonate_client(
    thread: &ThreadRef,
    token: Option<&Arc<Token>>,
    copy_on_open: bool,
    effective_only: bool,
    level: ImpersonationLevel,
) -> PsResult<()> {
    let Some(token) = token else {
        ps_revert_to_self(thread);
        return Ok(());
    };

    let process = &thread.process;
    let process_token = ps_reference_primary_token(process);

    let (token, level, effective_only) =
        if se_token_can_impersonate(&process_token, token, level) {
            (Arc::clone(token), level, effective_only)
        } else {
            let downgraded = se_copy_client_token(token, ImpersonationLevel::Identification);
            (downgraded, ImpersonationLevel::Identification, true)
        };

    // Job token policy. A restricting job refuses unrestricted clients; a
    // filtering job instead impersonates its own filtered copy of the
    // client.
    let token = match process.job() {
        Some(job) => {
            let (flags, filter) = {
                let inner = job.inner.read();
                (inner.security_limit_flags, inner.filter.clone())
            };
            if flags.contains(JobSecurityLimitFlags::NO_ADMIN) && token.is_admin() {
                return Err(NtStatus::AccessDenied);
            }
            if flags.contains(JobSecurityLimitFlags::RESTRICTED_TOKEN) && !token.is_restricted() {
                return Err(NtStatus::AccessDenied);
            }
            match filter {
                Some(filter) if flags.contains(JobSecurityLimitFlags::FILTER_TOKENS) => {
                    let filtered = se_filter_token(&token, &filter)?;
                    se_copy_client_token(&filtered, level)
                }
                _ => token,
            }
        }
        None => token,
    };

    let block = thread.impersonation.call_once(|| RwLock::new(None));
    let old = {
        let mut state = block.write();
        thread.set_cross_flag(cross_thread_flags::IMPERSONATING);
        state.replace(ImpersonationInfo {
            token,
            level,
            copy_on_open,
            effective_only,
        })
    };
    drop(old);
    Ok(())
}

/// Take a thread out of impersonation temporarily, handing back the
/// displaced state for [`ps_restore_impersonation`]. Returns `None` when
/// the thread was not impersonating.
pub fn ps_disable_impersonation(thread: &ThreadRef) -> Option<ImpersonationInfo> {
    if !thread.is_impersonating() {
        return None;
    }
    let block = thread.impersonation.get()?;
    let mut state = block.write();
    let saved = state.take();
    if saved.is_some() {
        thread.clear_cross_flag(cross_thread_flags::IMPERSONATING);
    }
    saved
}

/// Reinstall impersonation state saved by [`ps_disable_impersonation`].
/// A `None` saved state leaves the thread on its primary token.
pub fn ps_restore_impersonation(thread: &ThreadRef, saved: Option<ImpersonationInfo>) {
    let Some(saved) = saved else {
        return;
    };
    let block = thread.impersonation.call_once(|| RwLock::new(None));
    let old = {
        let mut state = block.write();
        thread.set_cross_flag(cross_thread_flags::IMPERSONATING);
        state.replace(saved)
    };
    drop(old);
}

/// End impersonation; the thread runs on its primary token again.
pub fn ps_revert_to_self(thread: &ThreadRef) {
    let Some(block) = thread.impersonation.get() else {
        return;
    };
    let old = {
        let mut state = block.write();
        thread.clear_cross_flag(cross_thread_flags::IMPERSONATING);
        state.take()
    };
    drop(old);
}
