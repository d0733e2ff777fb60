//! Stack walker collaborator interface
//!
//! The capture engine does not unwind stacks itself. A host-provided
//! [`StackWalker`] visits frames innermost first and exposes each one
//! through [`FrameView`]: its stack pointers, saved register locations,
//! return-type shape and live GC references.

use crate::frame::RestoreReg;

/// Caller-supplied marker identifying where capture starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackMark(pub usize);

/// What the walker should do after a frame callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    /// Visit the caller frame next
    Continue,
    /// Stop walking
    Abort,
}

/// Classification of a frame with respect to suspension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// A suspendable method frame
    Interesting,
    /// A dispatch thunk or resumption stub that ends the suspendable run
    Boundary,
    /// A runtime transition frame that is not a managed method
    Unexpected,
}

/// Return-type shape as reported by signature introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    /// Returned through a hidden return-buffer argument
    ReturnBuffer,
    /// Primitive, pointer-sized or type-descriptor value in a register
    Primitive,
    /// Object reference in a register
    ObjectReference,
    /// Register-sized value type that contains GC pointers
    ValueTypeWithPointers,
    /// Floating point or vector value
    FloatingPoint,
}

/// Where a callee-saved register lives for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSlots {
    /// Address holding the register's value as seen by the caller
    pub caller_location: usize,
    /// Address holding the register's value in the current context
    pub current_location: usize,
    /// The register's current value (low `width` bytes are meaningful)
    pub current_value: u128,
}

impl RegisterSlots {
    /// This frame saved the register in its own stack memory
    pub fn saved_by_frame(&self) -> bool {
        self.caller_location != self.current_location
    }
}

/// One live GC reference reported for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRefReport {
    /// Address of the slot (stack memory or a register context slot)
    pub location: usize,
    /// Interior pointer rather than an object reference
    pub interior: bool,
    /// Referent must not move
    pub pinned: bool,
}

/// A frame visited by the walker
pub trait FrameView {
    /// Suspension classification
    fn class(&self) -> FrameClass;

    /// Frame contains the caller-supplied start marker
    fn contains_mark(&self, mark: StackMark) -> bool;

    /// Current stack pointer
    fn sp(&self) -> usize;

    /// Caller's stack pointer
    fn caller_sp(&self) -> usize;

    /// Bytes of stack arguments the method receives
    fn arg_stack_size(&self) -> u32;

    /// Instruction pointer within the method
    fn control_pc(&self) -> usize;

    /// Address of the slot holding the return address into the caller
    fn return_address_location(&self) -> usize;

    /// Saved locations for a callee-saved register, if the platform has it
    fn register_slots(&self, reg: RestoreReg) -> Option<RegisterSlots>;

    /// Signature classification of the method's return type
    fn return_shape(&self) -> ReturnShape;

    /// Report every live GC reference in the frame
    fn enumerate_gc_refs(&self, report: &mut dyn FnMut(GcRefReport));
}

/// Host stack walker
///
/// # Safety
/// For the duration of [`StackWalker::walk_frames`], every address a
/// frame reports (its `[sp, caller_sp + arg_stack_size)` range plus any
/// register slot) must be valid for reads, and the stack must not be
/// mutated by another thread.
pub unsafe trait StackWalker {
    /// Visit frames innermost first, starting near `mark`
    fn walk_frames(&self, mark: StackMark, visit: &mut dyn FnMut(&dyn FrameView) -> WalkAction);
}
