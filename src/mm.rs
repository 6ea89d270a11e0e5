//! Memory Manager Facade
//!
//! The process manager needs a small slice of Mm behavior: address-space
//! construction during process creation and working-set parameter pushes
//! when job limits change. Paging itself is out of scope here.

use alloc::sync::Arc;

use crate::status::{NtStatus, PsResult};

/// Page size used for memory-limit granularity checks.
pub const PAGE_SIZE: usize = 4096;

/// Default working-set bounds for new processes, in bytes.
pub const DEFAULT_WS_MINIMUM: usize = 50 * PAGE_SIZE;
pub const DEFAULT_WS_MAXIMUM: usize = 345 * PAGE_SIZE;

/// Mapped image section a process can be created from.
pub struct Section {
    pub base: u64,
    pub size: usize,
}

impl Section {
    pub fn new(base: u64, size: usize) -> Arc<Self> {
        Arc::new(Self { base, size })
    }
}

/// How a process address space was constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceSource {
    System,
    Section,
    ClonedFromParent,
}

/// Per-process address space handle.
pub struct AddressSpace {
    pub source: AddressSpaceSource,
    pub directory_base: u64,
}

static NEXT_DIRECTORY: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0x1000);

fn next_directory_base() -> u64 {
    NEXT_DIRECTORY.fetch_add(0x1000, core::sync::atomic::Ordering::Relaxed)
}

impl AddressSpace {
    /// Address space for a system process (shared kernel mappings only).
    pub fn for_system() -> PsResult<Self> {
        Ok(Self {
            source: AddressSpaceSource::System,
            directory_base: next_directory_base(),
        })
    }

    /// Address space initialized from a mapped image section.
    pub fn from_section(section: &Section) -> PsResult<Self> {
        if section.size == 0 {
            return Err(NtStatus::InvalidParameter);
        }
        Ok(Self {
            source: AddressSpaceSource::Section,
            directory_base: next_directory_base(),
        })
    }

    /// Fork-style clone of the parent's address space.
    pub fn cloned_from(_parent_directory_base: u64) -> PsResult<Self> {
        Ok(Self {
            source: AddressSpaceSource::ClonedFromParent,
            directory_base: next_directory_base(),
        })
    }
}

/// Validate and accept new working-set bounds for a process.
///
/// Bounds are byte counts; the minimum must fit inside the maximum and
/// both must be page-aligned multiples.
pub fn adjust_working_set(minimum: usize, maximum: usize) -> PsResult<()> {
    if minimum == 0 || maximum == 0 || minimum > maximum {
        return Err(NtStatus::InvalidParameter);
    }
    if minimum % PAGE_SIZE != 0 || maximum % PAGE_SIZE != 0 {
        return Err(NtStatus::InvalidParameter);
    }
    Ok(())
}
