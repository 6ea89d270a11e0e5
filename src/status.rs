//! Status Codes
//!
//! Failure codes surfaced by the process manager. Every fallible operation
//! returns [`PsResult`] and callers propagate with `?`.

/// Operation status for the process manager.
///
/// Modeled after the NTSTATUS values the subsystem actually raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtStatus {
    /// Allocation or table-slot exhaustion
    InsufficientResources,
    /// Target process has begun teardown; rundown protection refused
    ProcessIsTerminating,
    /// Target thread has begun teardown
    ThreadIsTerminating,
    /// A caller-supplied value failed validation
    InvalidParameter,
    /// Referenced object is not valid for the operation
    InvalidHandle,
    /// Policy (job security limits, breakaway, impersonation) denied access
    AccessDenied,
    /// Caller lacks a required privilege
    PrivilegeNotHeld,
    /// Information buffer length does not match the class requirement
    InfoLengthMismatch,
    /// Output was truncated; the full result needs a larger buffer
    BufferOverflow,
    /// A job limit (active processes, time, memory) was exceeded
    QuotaExceeded,
    /// Thread suspend count is saturated
    SuspendCountExceeded,
    /// Token is the wrong type for the operation
    BadTokenType,
    /// Requested impersonation level is not expressible
    BadImpersonationLevel,
    /// The process is not a member of the given job
    ProcessNotInJob,
    /// Unknown information class
    InvalidInfoClass,
    /// The process has no threads left to act on
    NothingToTerminate,
}

/// Result alias used throughout the subsystem.
pub type PsResult<T> = Result<T, NtStatus>;

impl NtStatus {
    /// Printable name, used in log lines.
    pub fn name(self) -> &'static str {
        match self {
            NtStatus::InsufficientResources => "INSUFFICIENT_RESOURCES",
            NtStatus::ProcessIsTerminating => "PROCESS_IS_TERMINATING",
            NtStatus::ThreadIsTerminating => "THREAD_IS_TERMINATING",
            NtStatus::InvalidParameter => "INVALID_PARAMETER",
            NtStatus::InvalidHandle => "INVALID_HANDLE",
            NtStatus::AccessDenied => "ACCESS_DENIED",
            NtStatus::PrivilegeNotHeld => "PRIVILEGE_NOT_HELD",
            NtStatus::InfoLengthMismatch => "INFO_LENGTH_MISMATCH",
            NtStatus::BufferOverflow => "BUFFER_OVERFLOW",
            NtStatus::QuotaExceeded => "QUOTA_EXCEEDED",
            NtStatus::SuspendCountExceeded => "SUSPEND_COUNT_EXCEEDED",
            NtStatus::BadTokenType => "BAD_TOKEN_TYPE",
            NtStatus::BadImpersonationLevel => "BAD_IMPERSONATION_LEVEL",
            NtStatus::ProcessNotInJob => "PROCESS_NOT_IN_JOB",
            NtStatus::InvalidInfoClass => "INVALID_INFO_CLASS",
            NtStatus::NothingToTerminate => "NOTHING_TO_TERMINATE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(NtStatus::QuotaExceeded.name(), "QUOTA_EXCEEDED");
        assert_eq!(
            NtStatus::ProcessIsTerminating.name(),
            "PROCESS_IS_TERMINATING"
        );
    }

    #[test]
    fn test_result_propagation() {
        fn inner() -> PsResult<u32> {
            Err(NtStatus::AccessDenied)
        }
        fn outer() -> PsResult<u32> {
            let v = inner()?;
            Ok(v + 1)
        }
        assert_eq!(outer(), Err(NtStatus::AccessDenied));
    }
}
