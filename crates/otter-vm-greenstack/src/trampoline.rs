//! Stack-switch trampolines
//!
//! The only code that actually moves the stack pointer. Everything else in
//! this crate is portable bookkeeping.

/// Calls a function on a different stack
///
/// # Safety
/// Implementations must switch the stack pointer to `stack`, call
/// `entry(arg)` with the platform C ABI, restore the original stack
/// pointer and return the callee's result. Before switching, the original
/// stack pointer is stored to `saved_sp`.
pub unsafe trait StackTrampoline {
    /// Run `entry(arg)` with the stack pointer at `stack`
    ///
    /// # Safety
    /// `stack` must be 16-byte aligned and top a writable region large
    /// enough for `entry`; `saved_sp` must be valid for a write.
    unsafe fn call_on_stack(
        &self,
        stack: usize,
        entry: extern "C" fn(usize) -> usize,
        arg: usize,
        saved_sp: *mut usize,
    ) -> usize;
}

/// x86-64 System V trampoline
#[cfg(all(target_arch = "x86_64", unix))]
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeTrampoline;

// SAFETY: r12 is callee-saved, so it carries the old stack pointer across
// the call and back.
#[cfg(all(target_arch = "x86_64", unix))]
unsafe impl StackTrampoline for NativeTrampoline {
    unsafe fn call_on_stack(
        &self,
        stack: usize,
        entry: extern "C" fn(usize) -> usize,
        arg: usize,
        saved_sp: *mut usize,
    ) -> usize {
        let result: usize;
        // SAFETY: guaranteed by caller
        unsafe {
            core::arch::asm!(
                "mov r12, rsp",
                "mov [{saved}], rsp",
                "mov rsp, {stack}",
                "call {entry}",
                "mov rsp, r12",
                stack = in(reg) stack,
                entry = in(reg) entry,
                saved = in(reg) saved_sp,
                in("rdi") arg,
                out("r12") _,
                lateout("rax") result,
                clobber_abi("C"),
            );
        }
        result
    }
}
