//! Per-thread green stack state
//!
//! Each OS thread can host one green thread at a time. Its state lives in
//! a thread local and is reached through [`with_green_thread`]; nothing
//! here is shared between OS threads.
//!
//! Stack growth is driven from a small assembly stub that spills the
//! caller's stack range and calls [`allocate_more_stack_helper`]. The
//! fixed offsets below describe that stub's frame (Windows x64 layout).

use crate::config::GreenStackConfig;
use crate::error::{GreenStackError, GreenStackResult, fatal};
use crate::segment::{GreenThreadStackList, STACK_ALIGN, StackRange, align_down};
use crate::trampoline::StackTrampoline;
use std::cell::RefCell;

/// Distance from the helper's stack pointer to its return address
pub const OFFSET_TO_RETURN_ADDRESS: usize = 8;
/// Windows x64 home area for register arguments
pub const SHADOW_STORE_SIZE: usize = 0x20;
/// Frame size of the more-stack stub
pub const MORE_STACK_FRAME_SIZE: usize = 0xe8;
/// Distance from the helper's stack pointer to the caller's stack arguments
pub const STACK_ARGS_OFFSET: usize =
    OFFSET_TO_RETURN_ADDRESS + 2 * SHADOW_STORE_SIZE + 3 * std::mem::size_of::<usize>();
/// The stub spills the caller's range here (below the helper's sp)
pub const OLD_RANGE_OFFSET: usize = 0x20;
/// The helper publishes the new range here (below the helper's sp)
pub const NEW_RANGE_OFFSET: usize = 0x10;

/// Decoded stack request from the more-stack stub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackRequest {
    /// Continue on a fresh green segment
    Grow {
        /// Stack argument bytes to carry over
        arg_bytes: usize,
    },
    /// Continue on the thread's OS stack
    OsStack {
        /// Stack argument bytes to carry over
        arg_bytes: usize,
    },
}

impl StackRequest {
    /// Decode the stub's argument; `-(n + 1)` asks for the OS stack
    pub fn decode(argument_stack_size: i32) -> Self {
        if argument_stack_size < 0 {
            StackRequest::OsStack {
                arg_bytes: (-(argument_stack_size + 1)) as usize,
            }
        } else {
            StackRequest::Grow {
                arg_bytes: argument_stack_size as usize,
            }
        }
    }

    /// Stack argument bytes to carry over
    pub fn arg_bytes(&self) -> usize {
        match *self {
            StackRequest::Grow { arg_bytes } | StackRequest::OsStack { arg_bytes } => arg_bytes,
        }
    }
}

/// Where the thread left its OS stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsStackSnapshot {
    /// OS stack bounds
    pub range: StackRange,
    /// Lowest address in use on the OS stack
    pub current: usize,
}

/// Outcome of a stack request: where execution continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSwitch {
    /// New stack pointer
    pub stack_pointer: usize,
    /// Bounds of the stack now in use
    pub range: StackRange,
    /// Caller's stack arguments
    pub args_from: usize,
    /// Destination of the stack arguments (above the shadow store)
    pub args_to: usize,
    /// Bytes of stack arguments
    pub arg_bytes: usize,
}

impl StackSwitch {
    /// Copy the caller's stack arguments to the new stack
    ///
    /// # Safety
    /// Both argument windows must be valid for `arg_bytes` bytes.
    pub unsafe fn copy_arguments(&self) {
        // SAFETY: guaranteed by caller; the windows lie on different stacks
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.args_from as *const u8,
                self.args_to as *mut u8,
                self.arg_bytes,
            );
        }
    }
}

/// State of the green thread hosted by one OS thread
#[derive(Debug)]
pub struct GreenThreadState {
    config: GreenStackConfig,
    segments: GreenThreadStackList,
    os_stack: Option<OsStackSnapshot>,
    in_green_thread: bool,
    on_os_stack: bool,
}

impl GreenThreadState {
    /// Fresh state with no segments
    pub fn new(config: GreenStackConfig) -> Self {
        Self {
            config,
            segments: GreenThreadStackList::new(),
            os_stack: None,
            in_green_thread: false,
            on_os_stack: false,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &GreenStackConfig {
        &self.config
    }

    /// Segment list
    pub fn segments(&self) -> &GreenThreadStackList {
        &self.segments
    }

    /// OS stack snapshot, once taken
    pub fn os_stack(&self) -> Option<OsStackSnapshot> {
        self.os_stack
    }

    /// Running on a green stack
    pub fn in_green_thread(&self) -> bool {
        self.in_green_thread
    }

    /// Temporarily back on the OS stack from inside a green thread
    pub fn on_os_stack(&self) -> bool {
        self.on_os_stack
    }

    /// Serve a stack request from the more-stack stub.
    ///
    /// `helper_sp` is the stub's stack pointer and `caller_range` the range
    /// it spilled. The first growth also snapshots the OS stack.
    pub fn allocate_more_stack(
        &mut self,
        request: StackRequest,
        helper_sp: usize,
        caller_range: StackRange,
    ) -> GreenStackResult<StackSwitch> {
        let arg_bytes = request.arg_bytes();
        let (stack_pointer, range) = match request {
            StackRequest::OsStack { .. } => {
                let os = self.os_stack.ok_or(GreenStackError::NoOsStack)?;
                let sp = os
                    .current
                    .checked_sub(MORE_STACK_FRAME_SIZE + SHADOW_STORE_SIZE + std::mem::size_of::<usize>() + arg_bytes)
                    .ok_or(GreenStackError::NoOsStack)?;
                (align_down(sp, STACK_ALIGN), os.range)
            }
            StackRequest::Grow { .. } => {
                let first = self.segments.current().is_none();
                let size = self.segment_size_for(arg_bytes, first);
                let segment = self.segments.advance(size, self.config.red_zone_size)?;
                let range = segment.range();
                if first {
                    self.os_stack = Some(OsStackSnapshot {
                        range: caller_range,
                        current: helper_sp + MORE_STACK_FRAME_SIZE,
                    });
                }
                let sp = align_down(range.base - (arg_bytes + SHADOW_STORE_SIZE), STACK_ALIGN);
                (sp, range)
            }
        };

        tracing::trace!(
            target: "otter::green",
            ?request,
            sp = format_args!("{stack_pointer:#x}"),
            "stack switch"
        );
        Ok(StackSwitch {
            stack_pointer,
            range,
            args_from: helper_sp + STACK_ARGS_OFFSET,
            args_to: stack_pointer + SHADOW_STORE_SIZE,
            arg_bytes,
        })
    }

    fn segment_size_for(&self, arg_bytes: usize, first: bool) -> usize {
        let floor = if first {
            self.config.initial_segment_size
        } else {
            self.config.min_segment_size
        };
        floor.max(arg_bytes + SHADOW_STORE_SIZE + STACK_ALIGN)
    }

    /// A frame that grew the stack returned; step back one segment.
    ///
    /// Only meaningful on a green stack; elsewhere it does nothing.
    pub fn release_segment(&mut self) -> GreenStackResult<()> {
        if !self.in_green_thread {
            return Ok(());
        }
        self.segments.retreat().map(|_| ())
    }

    /// Free the whole segment list of a green thread that has finished.
    ///
    /// Returns the number of segments freed. Fails while the list is
    /// still the running stack.
    pub fn free_stack_list(&mut self) -> GreenStackResult<usize> {
        if self.in_green_thread || self.on_os_stack {
            return Err(GreenStackError::StackInUse);
        }
        let freed = self.segments.len();
        self.segments.clear();
        self.os_stack = None;
        tracing::trace!(target: "otter::green", segments = freed, "freed green stack list");
        Ok(freed)
    }

    /// Drop all state, including an abandoned green thread's segments
    pub fn reset(&mut self) {
        self.in_green_thread = false;
        self.on_os_stack = false;
        self.segments.clear();
        self.os_stack = None;
    }
}

thread_local! {
    static GREEN_THREAD: RefCell<GreenThreadState> = RefCell::new(GreenThreadState::new(GreenStackConfig::from_env()));
}

/// Run `f` with this OS thread's green thread state.
///
/// Must not be re-entered from within `f`.
pub fn with_green_thread<R>(f: impl FnOnce(&mut GreenThreadState) -> R) -> R {
    GREEN_THREAD.with(|state| f(&mut state.borrow_mut()))
}

/// Whether the current thread is executing on a green stack
pub fn is_green_thread() -> bool {
    with_green_thread(|state| state.in_green_thread)
}

/// Entry point for the more-stack stub.
///
/// Reads the caller's range from `stack_pointer - 0x20`, publishes the new
/// range at `stack_pointer - 0x10`, copies the caller's stack arguments
/// and returns the new stack pointer. Any failure aborts.
///
/// # Safety
/// `stack_pointer` must be the stub's stack pointer, with the stub frame
/// laid out as described by the offset constants in this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn allocate_more_stack_helper(argument_stack_size: i32, stack_pointer: *mut u8) -> usize {
    let helper_sp = stack_pointer as usize;
    // SAFETY: the stub spilled a StackRange at this slot
    let caller_range = unsafe { ((helper_sp - OLD_RANGE_OFFSET) as *const StackRange).read_unaligned() };
    let request = StackRequest::decode(argument_stack_size);

    let switch = with_green_thread(|state| state.allocate_more_stack(request, helper_sp, caller_range))
        .unwrap_or_else(|err| fatal(err));

    // SAFETY: the new range slot belongs to the stub frame; the argument
    // windows are the caller's outgoing area and the fresh stack.
    unsafe {
        ((helper_sp - NEW_RANGE_OFFSET) as *mut StackRange).write_unaligned(switch.range);
        switch.copy_arguments();
    }
    switch.stack_pointer
}

/// Stub epilogue: a grown frame returned. Underflow aborts.
pub fn release_segment() {
    with_green_thread(|state| state.release_segment()).unwrap_or_else(|err| fatal(err));
}

/// Free this thread's green stack segments once its green thread is done
pub fn free_stack_list() -> GreenStackResult<usize> {
    with_green_thread(|state| state.free_stack_list())
}

/// Argument block handed to the first frame on the new stack
#[repr(C)]
struct TransitionFrame {
    function: extern "C" fn(usize) -> usize,
    param: usize,
    saved_sp: usize,
}

extern "C" fn first_frame_in_green_thread(frame: usize) -> usize {
    // SAFETY: `frame` is the TransitionFrame owned by transition_to_green_thread
    let frame = unsafe { &*(frame as *const TransitionFrame) };
    with_green_thread(|state| {
        // The OS stack limit is unknown on this path
        state.os_stack = Some(OsStackSnapshot {
            range: StackRange {
                limit: 0,
                base: frame.saved_sp,
            },
            current: frame.saved_sp,
        });
    });
    (frame.function)(frame.param)
}

extern "C" fn first_frame_in_os_thread(frame: usize) -> usize {
    // SAFETY: `frame` is the TransitionFrame owned by transition_to_os_thread
    let frame = unsafe { &*(frame as *const TransitionFrame) };
    (frame.function)(frame.param)
}

/// Run `function(param)` as a green thread on a fresh segmented stack.
///
/// Returns once the function returns; the thread's segments are freed.
///
/// # Safety
/// The trampoline must perform a correct stack switch for this platform.
pub unsafe fn transition_to_green_thread(
    function: extern "C" fn(usize) -> usize,
    param: usize,
    trampoline: &dyn StackTrampoline,
) -> GreenStackResult<usize> {
    let stack = with_green_thread(|state| {
        if state.in_green_thread || state.segments.current().is_some() {
            return Err(GreenStackError::AlreadyInGreenThread);
        }
        let size = state.segment_size_for(0, true);
        let red_zone = state.config.red_zone_size;
        let base = state.segments.advance(size, red_zone)?.range().base;
        state.in_green_thread = true;
        Ok(align_down(base, STACK_ALIGN))
    })?;
    tracing::debug!(target: "otter::green", stack = format_args!("{stack:#x}"), "entering green thread");

    let mut frame = TransitionFrame {
        function,
        param,
        saved_sp: 0,
    };
    let frame_ptr = &mut frame as *mut TransitionFrame;
    // SAFETY: forwarded from the caller; `frame` outlives the call
    let result = unsafe {
        trampoline.call_on_stack(
            stack,
            first_frame_in_green_thread,
            frame_ptr as usize,
            std::ptr::addr_of_mut!((*frame_ptr).saved_sp),
        )
    };

    let freed = with_green_thread(|state| {
        state.in_green_thread = false;
        state.free_stack_list()
    })
    .unwrap_or_else(|err| fatal(err));
    tracing::debug!(target: "otter::green", segments = freed, "left green thread");
    Ok(result)
}

/// From inside a green thread, run `function(param)` on the OS stack.
///
/// # Safety
/// The trampoline must perform a correct stack switch for this platform.
pub unsafe fn transition_to_os_thread(
    function: extern "C" fn(usize) -> usize,
    param: usize,
    trampoline: &dyn StackTrampoline,
) -> GreenStackResult<usize> {
    let (stack, was_on_os_stack) = with_green_thread(|state| {
        if !state.in_green_thread {
            return Err(GreenStackError::NotInGreenThread);
        }
        let os = state.os_stack.ok_or(GreenStackError::NoOsStack)?;
        let gap = MORE_STACK_FRAME_SIZE + SHADOW_STORE_SIZE + std::mem::size_of::<usize>();
        let stack = os.current.checked_sub(gap).ok_or(GreenStackError::NoOsStack)?;
        state.in_green_thread = false;
        let was_on_os_stack = std::mem::replace(&mut state.on_os_stack, true);
        Ok((align_down(stack, STACK_ALIGN), was_on_os_stack))
    })?;

    let mut frame = TransitionFrame {
        function,
        param,
        saved_sp: 0,
    };
    let frame_ptr = &mut frame as *mut TransitionFrame;
    // SAFETY: forwarded from the caller; `frame` outlives the call
    let result = unsafe {
        trampoline.call_on_stack(
            stack,
            first_frame_in_os_thread,
            frame_ptr as usize,
            std::ptr::addr_of_mut!((*frame_ptr).saved_sp),
        )
    };

    with_green_thread(|state| {
        state.on_os_stack = was_on_os_stack;
        state.in_green_thread = true;
    });
    Ok(result)
}
