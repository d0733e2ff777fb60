//! # Otter VM Tasklets
//!
//! Stack-copying continuations with generational GC integration.
//!
//! ## Design
//!
//! - **Capture**: a suspendable run of frames is copied, frame by frame,
//!   into heap buffers (tasklets). Interior pointers between the frames are
//!   rewritten to follow the copies.
//! - **Registry**: chain heads are linked into a lock-protected ring owned
//!   by a [`TaskletRuntime`]; the collector scans it for roots.
//! - **Aging**: each tasklet tracks the youngest generation it may
//!   reference, so minor collections skip chains that cannot point into
//!   the nursery.
//! - **Resume**: a tasklet is copied back onto a live stack, its interior
//!   pointers relocated, and control handed to an architecture trampoline.
//!
//! Corruption is never recovered from. Invariant violations are logged and
//! panic; the release profile aborts on panic.

#![warn(clippy::all)]
#![warn(missing_docs)]

mod abi;
mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod gc;
mod registry;
pub mod reloc;
pub mod resume;
mod runtime;
pub mod tasklet;
pub mod walker;

pub use abi::classify_return;
pub use capture::CapturedChain;
pub use config::TaskletConfig;
pub use error::{TaskletError, TaskletResult};
pub use frame::{
    ByRefSlot, MinGeneration, RegRestore, RegRestoreList, RestoreReg, StackData, StackDataInfo,
    TaskletReturnType,
};
pub use gc::{GcRootSlot, GenerationQuery, RootKind};
pub use reloc::ByRefAdjustment;
pub use resume::{RestoreLocals, ResumeTrampoline, ResumeValue};
pub use runtime::{NoGcScope, TaskletRuntime, TaskletStats};
pub use tasklet::{ChainHandle, Tasklet, TaskletArena, TaskletId};
pub use walker::{
    FrameClass, FrameView, GcRefReport, RegisterSlots, ReturnShape, StackMark, StackWalker,
    WalkAction,
};
