//! psmgr: an executive-style process management subsystem.
//!
//! Processes, threads, job objects and token plumbing in the NT mold:
//! counted object lifetimes with delete routines, rundown protection for
//! cross-object work, jobs with collective limits and completion-port
//! messaging, and a fast-reference slot for the primary-token hot path.
//!
//! The crate is `no_std` + `alloc`; the host supplies scheduling and real
//! time, and drives [`ps::ps_enforce_execution_time_limits`] periodically.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ex;
pub mod io;
pub mod mm;
pub mod ob;
pub mod ps;
pub mod se;
pub mod status;

pub use status::{NtStatus, PsResult};
