//! # Otter VM Green Stacks
//!
//! Segmented stacks for green threads.
//!
//! ## Design
//!
//! - **Segments**: a green thread's stack is a list of zeroed heap
//!   segments, each with a red zone below its limit. Growing moves a
//!   cursor forward, reusing an existing segment when it is large enough.
//! - **Transitions**: a thread can enter a green thread on a fresh segment
//!   and, from inside it, briefly run code back on its OS stack.
//! - **Failure**: allocation failure and bookkeeping underflow abort.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod segment;
pub mod thread;
pub mod trampoline;

pub use config::GreenStackConfig;
pub use error::{GreenStackError, GreenStackResult};
pub use segment::{GreenThreadStackList, StackRange, StackSegment, align_down};
pub use thread::{
    GreenThreadState, OsStackSnapshot, StackRequest, StackSwitch, allocate_more_stack_helper,
    free_stack_list, is_green_thread, release_segment, transition_to_green_thread,
    transition_to_os_thread, with_green_thread,
};
#[cfg(all(target_arch = "x86_64", unix))]
pub use trampoline::NativeTrampoline;
pub use trampoline::StackTrampoline;
