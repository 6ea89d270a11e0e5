//! Thread Context Access
//!
//! Get/set of a thread's register state, grouped by context flags so a
//! caller copies only what it asked for. The register set here is
//! symbolic (named portable fields) rather than any particular CPU's
//! layout; the scheduler owns the real frames.

use bitflags::bitflags;

use crate::ps::thread::ThreadRef;
use crate::status::{NtStatus, PsResult};

bitflags! {
    /// Which register groups a get/set touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        const CONTROL            = 0x01;
        const INTEGER            = 0x02;
        const FLOATING_POINT     = 0x04;
        const SEGMENTS           = 0x08;
        const DEBUG_REGISTERS    = 0x10;
        const EXCEPTION_REPORTING = 0x20;
        const FULL = Self::CONTROL.bits() | Self::INTEGER.bits() | Self::FLOATING_POINT.bits();
    }
}

/// Portable thread register state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    pub context_flags: ContextFlags,
    // CONTROL
    pub program_counter: u64,
    pub stack_pointer: u64,
    pub frame_pointer: u64,
    pub processor_flags: u64,
    // INTEGER
    pub integer_registers: [u64; 16],
    // FLOATING_POINT
    pub float_registers: [u64; 16],
    // SEGMENTS
    pub segment_registers: [u16; 6],
    // DEBUG_REGISTERS
    pub debug_registers: [u64; 8],
    // EXCEPTION_REPORTING
    pub hardware_exception: u32,
}

impl ThreadContext {
    pub const fn new() -> Self {
        Self {
            context_flags: ContextFlags::empty(),
            program_counter: 0,
            stack_pointer: 0,
            frame_pointer: 0,
            processor_flags: 0,
            integer_registers: [0; 16],
            float_registers: [0; 16],
            segment_registers: [0; 6],
            debug_registers: [0; 8],
            hardware_exception: 0,
        }
    }

    /// Copy the groups selected by `flags` from `source` into self.
    fn assign_groups(&mut self, source: &ThreadContext, flags: ContextFlags) {
        if flags.contains(ContextFlags::CONTROL) {
            self.program_counter = source.program_counter;
            self.stack_pointer = source.stack_pointer;
            self.frame_pointer = source.frame_pointer;
            self.processor_flags = source.processor_flags;
        }
        if flags.contains(ContextFlags::INTEGER) {
            self.integer_registers = source.integer_registers;
        }
        if flags.contains(ContextFlags::FLOATING_POINT) {
            self.float_registers = source.float_registers;
        }
        if flags.contains(ContextFlags::SEGMENTS) {
            self.segment_registers = source.segment_registers;
        }
        if flags.contains(ContextFlags::DEBUG_REGISTERS) {
            self.debug_registers = source.debug_registers;
        }
        if flags.contains(ContextFlags::EXCEPTION_REPORTING) {
            self.hardware_exception = source.hardware_exception;
        }
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the groups selected by `context.context_flags` into `context`.
///
/// Fails once the thread has started running down.
pub fn ps_get_context_thread(thread: &ThreadRef, context: &mut ThreadContext) -> PsResult<()> {
    if !thread.rundown.acquire() {
        return Err(NtStatus::ThreadIsTerminating);
    }
    let flags = context.context_flags;
    {
        let stored = thread.context.lock();
        context.assign_groups(&stored, flags);
    }
    thread.rundown.release();
    Ok(())
}

/// Write the groups selected by `context.context_flags` into the thread.
pub fn ps_set_context_thread(thread: &ThreadRef, context: &ThreadContext) -> PsResult<()> {
    if !thread.rundown.acquire() {
        return Err(NtStatus::ThreadIsTerminating);
    }
    {
        let mut stored = thread.context.lock();
        let flags = context.context_flags;
        stored.assign_groups(context, flags);
    }
    thread.rundown.release();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps::create::{ps_create_system_process, ps_create_system_thread};

    #[test]
    fn test_set_get_selected_groups() {
        let process = ps_create_system_process("ctx.exe").unwrap();
        let thread = ps_create_system_thread(&process, 0x4000, false).unwrap();

        let mut ctx = ThreadContext::new();
        ctx.context_flags = ContextFlags::CONTROL | ContextFlags::INTEGER;
        ctx.program_counter = 0xDEAD;
        ctx.stack_pointer = 0xBEEF;
        ctx.integer_registers[3] = 77;
        ctx.debug_registers[0] = 0x55; // not selected, must not be written
        ps_set_context_thread(&thread, &ctx).unwrap();

        let mut out = ThreadContext::new();
        out.context_flags = ContextFlags::FULL | ContextFlags::DEBUG_REGISTERS;
        ps_get_context_thread(&thread, &mut out).unwrap();
        assert_eq!(out.program_counter, 0xDEAD);
        assert_eq!(out.stack_pointer, 0xBEEF);
        assert_eq!(out.integer_registers[3], 77);
        assert_eq!(out.debug_registers[0], 0);
    }

    #[test]
    fn test_context_fails_after_rundown() {
        let process = ps_create_system_process("ctx2.exe").unwrap();
        let thread = ps_create_system_thread(&process, 0x4000, false).unwrap();

        thread.rundown.wait_for_rundown();
        let mut ctx = ThreadContext::new();
        ctx.context_flags = ContextFlags::CONTROL;
        assert_eq!(
            ps_get_context_thread(&thread, &mut ctx),
            Err(NtStatus::ThreadIsTerminating)
        );
        assert_eq!(
            ps_set_context_thread(&thread, &ctx),
            Err(NtStatus::ThreadIsTerminating)
        );
    }
}
