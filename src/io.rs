//! I/O Completion Port Facade
//!
//! Jobs multiplex lifecycle notifications onto an associated completion
//! port. Only the queueing surface matters to the process manager; the
//! full port machinery (waiters, concurrency throttling) lives elsewhere.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use spin::Mutex;

use crate::status::{NtStatus, PsResult};

/// Job lifecycle messages, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMessage {
    EndOfJobTime = 1,
    EndOfProcessTime = 2,
    ActiveProcessLimit = 3,
    ActiveProcessZero = 4,
    NewProcess = 6,
    ExitProcess = 7,
    AbnormalExitProcess = 8,
    ProcessMemoryLimit = 9,
    JobMemoryLimit = 10,
}

/// One queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionPacket {
    /// Completion key the job was associated with
    pub key: usize,
    pub message: JobMessage,
    /// Subject process id, zero for job-scoped messages
    pub process_id: u32,
}

/// Minimal completion port: a guarded packet queue.
pub struct IoCompletionPort {
    queue: Mutex<VecDeque<CompletionPacket>>,
    #[cfg(test)]
    fail_next_post: core::sync::atomic::AtomicBool,
}

impl IoCompletionPort {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            #[cfg(test)]
            fail_next_post: core::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Queue a packet. Fails when the port cannot take the packet, in
    /// which case the caller falls back to its degraded behavior.
    pub fn post(&self, key: usize, message: JobMessage, process_id: u32) -> PsResult<()> {
        #[cfg(test)]
        if self
            .fail_next_post
            .swap(false, core::sync::atomic::Ordering::AcqRel)
        {
            return Err(NtStatus::InsufficientResources);
        }
        self.queue.lock().push_back(CompletionPacket {
            key,
            message,
            process_id,
        });
        Ok(())
    }

    /// Remove and return everything queued so far.
    pub fn drain(&self) -> Vec<CompletionPacket> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Make the next post fail, to exercise degraded paths.
    #[cfg(test)]
    pub fn fail_next_post(&self) {
        self.fail_next_post
            .store(true, core::sync::atomic::Ordering::Release);
    }
}

impl Default for IoCompletionPort {
    fn default() -> Self {
        Self::new()
    }
}
