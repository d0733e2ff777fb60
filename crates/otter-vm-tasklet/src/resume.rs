//! Tasklet resume
//!
//! Resume is the reverse of capture: a frame's bytes are copied back onto
//! a live stack at `future_sp`, the return address and resume value are
//! patched in, and an architecture trampoline reloads the callee-saved
//! registers and jumps to the saved instruction pointer.
//!
//! The work is split in two. [`prepare`] runs under the registry lock and
//! takes the tasklet out of its chain; [`splice`] runs outside it and
//! writes to the destination stack.

use crate::error::{TaskletResult, invariant_violation};
use crate::frame::{MinGeneration, RegRestore, RegRestoreList, TaskletReturnType};
use crate::registry::TaskletStore;
use crate::reloc::ByRefAdjustment;
use crate::tasklet::{Tasklet, TaskletId};

/// Scratch block shared with the resume trampoline
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreLocals {
    /// Value loaded into the integer return register
    pub integer_register: usize,
    /// Instruction pointer to jump to
    pub restore_ip: usize,
    future_sp: usize,
    return_address: usize,
}

impl RestoreLocals {
    /// Locals for a frame landing at `future_sp` and returning to
    /// `return_address`
    pub fn new(future_sp: usize, return_address: usize) -> Self {
        Self {
            integer_register: 0,
            restore_ip: 0,
            future_sp,
            return_address,
        }
    }

    /// Stack pointer the restored frame will run on
    pub fn future_sp(&self) -> usize {
        self.future_sp
    }

    /// Return address written into the restored frame
    pub fn return_address(&self) -> usize {
        self.return_address
    }
}

/// Value handed to a resumed frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeValue {
    /// Object reference result
    pub object: usize,
    /// Integer result, or the return buffer address for by-reference returns
    pub integer: usize,
}

impl ResumeValue {
    /// Primitive result
    pub fn integer(value: usize) -> Self {
        Self {
            object: 0,
            integer: value,
        }
    }

    /// Object reference result
    pub fn object(object: usize) -> Self {
        Self { object, integer: 0 }
    }

    /// Result already written to a caller-owned buffer
    pub fn by_reference(buffer: usize) -> Self {
        Self::integer(buffer)
    }

    fn for_return(&self, return_type: TaskletReturnType) -> usize {
        match return_type {
            TaskletReturnType::ObjectReference => self.object,
            TaskletReturnType::Integer | TaskletReturnType::ByReference => self.integer,
        }
    }
}

/// Architecture-specific control transfer into a restored frame
///
/// # Safety
/// Implementations switch to `locals.future_sp()`, reload every register
/// named in `registers` from its offset off that stack pointer, load
/// `locals.integer_register` into the return register and jump to
/// `locals.restore_ip`. They never return.
pub unsafe trait ResumeTrampoline {
    /// Transfer control
    ///
    /// # Safety
    /// The restored frame must already be on the stack at
    /// `locals.future_sp()`.
    unsafe fn transfer(&self, registers: &[RegRestore], locals: &RestoreLocals) -> !;
}

/// Relocate interior pointers for the move to `future_sp` and take the
/// tasklet out of its chain.
pub(crate) fn prepare(
    store: &mut TaskletStore,
    id: TaskletId,
    future_sp: usize,
) -> TaskletResult<Tasklet> {
    let head = store.chain_head(id)?;
    let members = store.chain_members(head.tasklet())?;

    let tasklet = store.arena.get_mut(id)?;
    let destination = future_sp.wrapping_add(tasklet.info.unrecorded_data_size as usize);
    let adjustment = ByRefAdjustment::new(
        tasklet.stack_data.base_address(),
        destination,
        tasklet.stack_data.len(),
    );
    for slot in &tasklet.info.byref_offsets {
        let offset = tasklet.info.buffer_offset(slot.offset)?;
        tasklet.stack_data.relocate_word(offset, &adjustment)?;
    }
    let mut any_byrefs = tasklet.info.has_byrefs();

    // Callers still frozen may point into the frame about to go live
    let mut cursor = tasklet.next_in_stack;
    while let Some(outer) = cursor {
        let outer = store.arena.get_mut(outer)?;
        for slot in &outer.info.byref_offsets {
            let offset = outer.info.buffer_offset(slot.offset)?;
            outer.stack_data.relocate_word(offset, &adjustment)?;
        }
        any_byrefs |= outer.info.has_byrefs();
        cursor = outer.next_in_stack;
    }

    if any_byrefs {
        for member in members {
            store.arena.get_mut(member)?.min_generation = MinGeneration::ACTIVE;
        }
    }

    store.detach(id)
}

/// Copy a prepared tasklet onto the stack and fill in the trampoline
/// locals. Returns the registers the trampoline must reload.
///
/// # Safety
/// `locals.future_sp()` must point at writable stack memory with room for
/// the tasklet's `stack_requirement` bytes, not overlapping any live frame.
pub(crate) unsafe fn splice(mut tasklet: Tasklet, value: ResumeValue, locals: &mut RestoreLocals) -> RegRestoreList {
    let info = &tasklet.info;
    let future_sp = locals.future_sp;
    let destination = future_sp.wrapping_add(info.unrecorded_data_size as usize);

    // SAFETY: caller guarantees the destination range is writable; the
    // source is the tasklet's own heap buffer.
    unsafe {
        std::ptr::copy_nonoverlapping(
            tasklet.stack_data.as_ptr(),
            destination as *mut u8,
            tasklet.stack_data.len(),
        );
        ((future_sp + info.return_address_offset as usize) as *mut usize)
            .write_unaligned(locals.return_address);
    }

    locals.restore_ip = tasklet.restore_ip;
    locals.integer_register = value.for_return(tasklet.return_type);

    let registers = std::mem::take(&mut tasklet.info.registers_to_restore);
    if !registers.last().is_some_and(|last| last.reg.is_terminator()) {
        invariant_violation("register restore list lacks a terminator");
    }
    registers
}
