//! Creation/Deletion Notify Callbacks
//!
//! Drivers register callbacks that fire on process creation and exit,
//! thread creation and exit, and image load. Each registry is a fixed
//! table of slots; a slot tracks how many invocations are in flight so
//! removal can drain them before the slot is handed back. A callback is
//! therefore never torn down while a broadcast is still running it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::status::{NtStatus, PsResult};

/// (parent pid, pid, created)
pub type CreateProcessNotifyRoutine = dyn Fn(u32, u32, bool) + Send + Sync;
/// (pid, tid, created)
pub type CreateThreadNotifyRoutine = dyn Fn(u32, u32, bool) + Send + Sync;
/// (image name, pid)
pub type LoadImageNotifyRoutine = dyn Fn(&[u8], u32) + Send + Sync;

pub const MAX_PROCESS_NOTIFY: usize = 8;
pub const MAX_THREAD_NOTIFY: usize = 8;
pub const MAX_IMAGE_NOTIFY: usize = 8;

struct NotifySlot<T: ?Sized> {
    routine: Mutex<Option<Arc<T>>>,
    in_flight: AtomicUsize,
}

impl<T: ?Sized> NotifySlot<T> {
    /// Claim the slot if empty.
    fn try_install(&self, routine: &Arc<T>) -> bool {
        let mut slot = self.routine.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::clone(routine));
        true
    }

    /// Remove if this slot holds `routine`; drains in-flight invocations
    /// before returning so the caller may free associated state.
    fn try_remove(&self, routine: &Arc<T>) -> bool {
        {
            let mut slot = self.routine.lock();
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, routine) => {
                    *slot = None;
                }
                _ => return false,
            }
        }
        while self.in_flight.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
        true
    }

    /// Snapshot for invocation. The in-flight count is raised under the
    /// slot lock, so a remover that saw the slot emptied also sees every
    /// invocation that will ever use the old value.
    fn begin_invoke(&self) -> Option<InvokeGuard<'_, T>> {
        let slot = self.routine.lock();
        let routine = slot.as_ref()?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(InvokeGuard {
            routine: Arc::clone(routine),
            in_flight: &self.in_flight,
        })
    }
}

struct InvokeGuard<'a, T: ?Sized> {
    routine: Arc<T>,
    in_flight: &'a AtomicUsize,
}

impl<'a, T: ?Sized> Drop for InvokeGuard<'a, T> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

macro_rules! notify_table {
    ($name:ident, $ty:ty, $max:expr) => {{
        const SLOT: NotifySlot<$ty> = NotifySlot {
            routine: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
        };
        static $name: [NotifySlot<$ty>; $max] = [SLOT; $max];
        &$name
    }};
}

fn process_table() -> &'static [NotifySlot<CreateProcessNotifyRoutine>; MAX_PROCESS_NOTIFY] {
    notify_table!(TABLE, CreateProcessNotifyRoutine, MAX_PROCESS_NOTIFY)
}

fn thread_table() -> &'static [NotifySlot<CreateThreadNotifyRoutine>; MAX_THREAD_NOTIFY] {
    notify_table!(TABLE, CreateThreadNotifyRoutine, MAX_THREAD_NOTIFY)
}

fn image_table() -> &'static [NotifySlot<LoadImageNotifyRoutine>; MAX_IMAGE_NOTIFY] {
    notify_table!(TABLE, LoadImageNotifyRoutine, MAX_IMAGE_NOTIFY)
}

fn set_routine<T: ?Sized>(
    table: &[NotifySlot<T>],
    routine: Arc<T>,
    remove: bool,
) -> PsResult<()> {
    if remove {
        for slot in table {
            if slot.try_remove(&routine) {
                return Ok(());
            }
        }
        Err(NtStatus::InvalidParameter)
    } else {
        for slot in table {
            if slot.try_install(&routine) {
                return Ok(());
            }
        }
        Err(NtStatus::InsufficientResources)
    }
}

/// Register or remove a process-lifecycle callback.
pub fn ps_set_create_process_notify_routine(
    routine: Arc<CreateProcessNotifyRoutine>,
    remove: bool,
) -> PsResult<()> {
    set_routine(process_table(), routine, remove)
}

/// Register or remove a thread-lifecycle callback.
pub fn ps_set_create_thread_notify_routine(
    routine: Arc<CreateThreadNotifyRoutine>,
    remove: bool,
) -> PsResult<()> {
    set_routine(thread_table(), routine, remove)
}

/// Register or remove an image-load callback.
pub fn ps_set_load_image_notify_routine(
    routine: Arc<LoadImageNotifyRoutine>,
    remove: bool,
) -> PsResult<()> {
    set_routine(image_table(), routine, remove)
}

pub(crate) fn notify_process(parent_pid: u32, pid: u32, created: bool) {
    for slot in process_table() {
        if let Some(guard) = slot.begin_invoke() {
            (guard.routine)(parent_pid, pid, created);
        }
    }
}

pub(crate) fn notify_thread(pid: u32, tid: u32, created: bool) {
    for slot in thread_table() {
        if let Some(guard) = slot.begin_invoke() {
            (guard.routine)(pid, tid, created);
        }
    }
}

pub(crate) fn notify_image(image_name: &[u8], pid: u32) {
    for slot in image_table() {
        if let Some(guard) = slot.begin_invoke() {
            (guard.routine)(image_name, pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_register_invoke_remove() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        // Pid sentinel is not a multiple of four, so broadcasts from
        // concurrently running creation tests never match it.
        const SENTINEL: u32 = 0xFEED_BEE7;
        let cb: Arc<CreateProcessNotifyRoutine> = Arc::new(move |_parent, pid, created| {
            if created && pid == SENTINEL {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });

        ps_set_create_process_notify_routine(Arc::clone(&cb), false).unwrap();
        notify_process(4, SENTINEL, true);
        notify_process(4, SENTINEL, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        ps_set_create_process_notify_routine(Arc::clone(&cb), true).unwrap();
        notify_process(4, SENTINEL, true);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_unregistered_fails() {
        let cb: Arc<CreateThreadNotifyRoutine> = Arc::new(|_, _, _| {});
        assert_eq!(
            ps_set_create_thread_notify_routine(cb, true),
            Err(NtStatus::InvalidParameter)
        );
    }

    #[test]
    fn test_table_fills_up() {
        let mut installed = Vec::new();
        let mut overflowed = false;
        for _ in 0..=MAX_IMAGE_NOTIFY {
            let cb: Arc<LoadImageNotifyRoutine> = Arc::new(|_, _| {});
            match ps_set_load_image_notify_routine(Arc::clone(&cb), false) {
                Ok(()) => installed.push(cb),
                Err(NtStatus::InsufficientResources) => {
                    overflowed = true;
                    break;
                }
                Err(other) => panic!("unexpected status {:?}", other),
            }
        }
        assert!(overflowed || installed.len() == MAX_IMAGE_NOTIFY);
        for cb in installed {
            ps_set_load_image_notify_routine(cb, true).unwrap();
        }
    }
}
