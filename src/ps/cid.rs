//! Client ID Table
//!
//! Process and thread IDs come out of one table, so a PID is never also a
//! live TID. IDs are multiples of four and never zero. The table holds
//! uncounted links; lookups upgrade with a safe reference, so an ID whose
//! object is mid-deletion simply fails to resolve.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::ob::{ObjectRef, PsObject};
use crate::ps::process::Process;
use crate::ps::thread::Thread;
use crate::status::{NtStatus, PsResult};

/// Process/thread ID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientId {
    pub unique_process: u32,
    pub unique_thread: u32,
}

/// Hard cap on simultaneously live IDs.
pub const CID_TABLE_LIMIT: usize = 4096;

pub(crate) enum CidEntry {
    Process(Arc<PsObject<Process>>),
    Thread(Arc<PsObject<Thread>>),
}

struct CidTable {
    entries: Vec<Option<CidEntry>>,
    free_slots: Vec<usize>,
}

impl CidTable {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_slots: Vec::new(),
        }
    }
}

static CID_TABLE: Mutex<CidTable> = Mutex::new(CidTable::new());

fn slot_to_id(slot: usize) -> u32 {
    ((slot + 1) * 4) as u32
}

fn id_to_slot(id: u32) -> Option<usize> {
    if id == 0 || id % 4 != 0 {
        return None;
    }
    Some((id / 4) as usize - 1)
}

pub(crate) fn ps_allocate_cid(entry: CidEntry) -> PsResult<u32> {
    let mut table = CID_TABLE.lock();
    let slot = if let Some(slot) = table.free_slots.pop() {
        table.entries[slot] = Some(entry);
        slot
    } else {
        if table.entries.len() >= CID_TABLE_LIMIT {
            return Err(NtStatus::InsufficientResources);
        }
        table.entries.push(Some(entry));
        table.entries.len() - 1
    };
    Ok(slot_to_id(slot))
}

pub(crate) fn ps_free_cid(id: u32) {
    let Some(slot) = id_to_slot(id) else {
        return;
    };
    let mut table = CID_TABLE.lock();
    if slot < table.entries.len() && table.entries[slot].is_some() {
        table.entries[slot] = None;
        table.free_slots.push(slot);
    }
}

/// Resolve a PID to a counted process reference.
pub fn ps_lookup_process_by_id(id: u32) -> PsResult<ObjectRef<Process>> {
    let table = CID_TABLE.lock();
    let slot = id_to_slot(id).ok_or(NtStatus::InvalidHandle)?;
    match table.entries.get(slot) {
        Some(Some(CidEntry::Process(arc))) => {
            ObjectRef::try_reference(arc).ok_or(NtStatus::InvalidHandle)
        }
        _ => Err(NtStatus::InvalidHandle),
    }
}

/// Resolve a TID to a counted thread reference.
pub fn ps_lookup_thread_by_id(id: u32) -> PsResult<ObjectRef<Thread>> {
    let table = CID_TABLE.lock();
    let slot = id_to_slot(id).ok_or(NtStatus::InvalidHandle)?;
    match table.entries.get(slot) {
        Some(Some(CidEntry::Thread(arc))) => {
            ObjectRef::try_reference(arc).ok_or(NtStatus::InvalidHandle)
        }
        _ => Err(NtStatus::InvalidHandle),
    }
}
