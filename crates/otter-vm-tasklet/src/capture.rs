//! Tasklet capture
//!
//! Freezes a run of suspendable frames into a tasklet chain. The walker
//! visits frames innermost first; once the frame holding the start marker
//! is reached every interesting frame is copied into its own buffer,
//! until a boundary frame (dispatch thunk or resumption stub) ends the
//! run.
//!
//! Interior pointers need care. A pointer into a frame that was already
//! copied (a callee) is rewritten right away. A pointer into the current
//! frame or one of its callers is queued as pending and rewritten as soon
//! as its target frame has been copied. Anything still pending when the
//! run ends points outside the captured range.

use crate::abi::classify_return;
use crate::config::TaskletConfig;
use crate::error::{OrFatal, TaskletError, invariant_violation};
use crate::frame::{ByRefSlot, RegRestore, RestoreReg, StackData, StackDataInfo};
use crate::registry::TaskletStore;
use crate::reloc::ByRefAdjustment;
use crate::tasklet::{ChainHandle, Tasklet, TaskletId};
use crate::walker::{
    FrameClass, FrameView, GcRefReport, RegisterSlots, StackMark, StackWalker, WalkAction,
};
use smallvec::SmallVec;

/// Result of a successful capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedChain {
    /// Innermost captured frame (resumed first)
    pub innermost: TaskletId,
    /// Outermost captured frame, the chain head
    pub head: ChainHandle,
    /// Number of frames captured
    pub frames: usize,
}

/// Interior pointer slot waiting for its target frame to be copied
#[derive(Debug, Clone, Copy)]
struct PendingByRef {
    frame: usize,
    buffer_offset: usize,
}

struct CapturedFrame {
    tasklet: Tasklet,
    adjustment: ByRefAdjustment,
}

struct CaptureState<'a> {
    config: &'a TaskletConfig,
    mark: StackMark,
    stack_limit: usize,
    started: bool,
    frames: Vec<CapturedFrame>,
    pending: SmallVec<[PendingByRef; 8]>,
}

impl CaptureState<'_> {
    fn visit(&mut self, frame: &dyn FrameView) -> WalkAction {
        if !self.started {
            if frame.class() != FrameClass::Interesting || !frame.contains_mark(self.mark) {
                return WalkAction::Continue;
            }
            self.started = true;
        } else {
            match frame.class() {
                FrameClass::Interesting => {}
                FrameClass::Boundary => {
                    self.finish();
                    return WalkAction::Abort;
                }
                FrameClass::Unexpected => invariant_violation(format_args!(
                    "non-method frame at sp={:#x} inside a suspendable run",
                    frame.sp()
                )),
            }
        }

        self.capture_frame(frame);
        WalkAction::Continue
    }

    /// The run ended: nothing may still point at uncaptured stack.
    fn finish(&self) {
        if !self.pending.is_empty() {
            // Methods returning through a caller-owned buffer leave a byref
            // into the boundary frame; the resume side has no way to
            // re-target it.
            invariant_violation(format_args!(
                "{} interior pointer(s) target stack outside the captured frames",
                self.pending.len()
            ));
        }
    }

    fn capture_frame(&mut self, frame: &dyn FrameView) {
        let sp = frame.sp();
        let arg_bytes = frame.arg_stack_size().max(self.config.min_outgoing_arg_area);
        let caller_sp = frame.caller_sp();
        let end = caller_sp.checked_add(arg_bytes as usize);
        let size = match end.and_then(|end| end.checked_sub(sp)) {
            Some(size) if caller_sp >= sp && u32::try_from(size).is_ok() => size,
            _ => invariant_violation(TaskletError::InvalidFrameExtent {
                sp,
                end: end.unwrap_or(usize::MAX),
            }),
        };

        // SAFETY: the StackWalker contract guarantees the frame's
        // [sp, caller_sp + args) range is readable during the walk.
        let mut data = unsafe { StackData::copy_from(sp as *const u8, size) };
        let adjustment = ByRefAdjustment::new(sp, data.base_address(), size);

        let mut info = StackDataInfo {
            stack_requirement: (caller_sp - sp) as u32 + arg_bytes,
            unrecorded_data_size: 0,
            stack_data_size: size as u32,
            return_address_offset: frame_offset(sp, frame.return_address_location()),
            arg_stack_size: arg_bytes,
            ..Default::default()
        };

        // Registers this frame saved are reloaded on resume; the copy holds
        // their current value rather than the caller's.
        let mut registers: SmallVec<[(RestoreReg, RegisterSlots, Option<u32>); 8]> = SmallVec::new();
        let mut has_frame_pointer = false;
        for reg in RestoreReg::CALLEE_SAVED {
            let Some(slots) = frame.register_slots(reg) else {
                continue;
            };
            if !slots.saved_by_frame() {
                registers.push((reg, slots, None));
                continue;
            }
            if reg == RestoreReg::Rbp {
                has_frame_pointer = true;
            }
            let offset = frame_offset(sp, slots.caller_location);
            info.registers_to_restore.push(RegRestore { reg, offset });
            let value = slots.current_value.to_le_bytes();
            data.write_bytes(info.buffer_offset(offset).or_fatal(), &value[..reg.width()])
                .or_fatal();
            registers.push((reg, slots, Some(offset)));
        }
        info.registers_to_restore.push(RegRestore {
            reg: if has_frame_pointer {
                RestoreReg::ReturnRegisters
            } else {
                RestoreReg::ReturnRegistersNoFrame
            },
            offset: 0,
        });

        let mut reports: SmallVec<[GcRefReport; 16]> = SmallVec::new();
        frame.enumerate_gc_refs(&mut |report| reports.push(report));
        // A saved frame pointer points into the frame itself
        for (reg, slots, saved) in &registers {
            if *reg == RestoreReg::Rbp && saved.is_some() {
                reports.push(GcRefReport {
                    location: slots.caller_location,
                    interior: true,
                    pinned: false,
                });
            }
        }

        let frame_index = self.frames.len();
        for report in reports {
            if report.pinned && !report.interior {
                invariant_violation(format_args!(
                    "pinned object reference at {:#x} is not interior",
                    report.location
                ));
            }

            let offset = match registers
                .iter()
                .find(|(_, slots, _)| slots.current_location == report.location)
            {
                Some((_, _, Some(offset))) => *offset,
                Some((reg, _, None)) => invariant_violation(format_args!(
                    "live reference in {reg:?}, which the frame at sp={sp:#x} did not save"
                )),
                None => frame_offset(sp, report.location),
            };

            if !report.interior {
                info.object_ref_offsets.push(offset);
                continue;
            }

            let buffer_offset = info.buffer_offset(offset).or_fatal();
            let target = data.read_word(buffer_offset).or_fatal();
            if target >= sp && target < self.stack_limit {
                self.pending.push(PendingByRef {
                    frame: frame_index,
                    buffer_offset,
                });
            } else if let Some(moved) = self
                .frames
                .iter()
                .find_map(|callee| callee.adjustment.relocate(target))
            {
                data.write_word(buffer_offset, moved).or_fatal();
            }
            info.byref_offsets.push(ByRefSlot {
                offset,
                pinned: report.pinned,
            });
        }

        let return_type = classify_return(frame.return_shape()).or_fatal();

        tracing::trace!(
            target: "otter::tasklet",
            sp = format_args!("{sp:#x}"),
            size,
            object_refs = info.object_ref_offsets.len(),
            byrefs = info.byref_offsets.len(),
            registers = info.registers_to_restore.len() - 1,
            "captured frame"
        );

        self.frames.push(CapturedFrame {
            tasklet: Tasklet::new(data, info, frame.control_pc(), return_type),
            adjustment,
        });

        let frames = &mut self.frames;
        self.pending.retain(|pending| {
            let relocated = frames[pending.frame]
                .tasklet
                .stack_data
                .relocate_word(pending.buffer_offset, &adjustment)
                .or_fatal();
            !relocated
        });
    }
}

/// Offset of `addr` from the frame's stack pointer
fn frame_offset(sp: usize, addr: usize) -> u32 {
    addr.checked_sub(sp)
        .and_then(|offset| u32::try_from(offset).ok())
        .unwrap_or_else(|| {
            invariant_violation(format_args!(
                "address {addr:#x} lies below the frame at sp={sp:#x}"
            ))
        })
}

/// Walk the stack and copy every frame of the suspendable run, innermost
/// first.
pub(crate) fn capture_frames(
    walker: &dyn StackWalker,
    mark: StackMark,
    stack_limit: usize,
    config: &TaskletConfig,
) -> Vec<Tasklet> {
    let mut state = CaptureState {
        config,
        mark,
        stack_limit,
        started: false,
        frames: Vec::new(),
        pending: SmallVec::new(),
    };
    walker.walk_frames(mark, &mut |frame| state.visit(frame));
    // The walker may also run out of frames without meeting a boundary
    state.finish();
    state.frames.into_iter().map(|frame| frame.tasklet).collect()
}

/// Move captured tasklets into the arena and link them into a chain
pub(crate) fn install(store: &mut TaskletStore, tasklets: Vec<Tasklet>) -> Option<CapturedChain> {
    let ids: Vec<TaskletId> = tasklets
        .into_iter()
        .map(|tasklet| store.arena.insert(tasklet))
        .collect();
    for pair in ids.windows(2) {
        store.arena.get_mut(pair[0]).or_fatal().next_in_stack = Some(pair[1]);
        store.arena.get_mut(pair[1]).or_fatal().prev_in_stack = Some(pair[0]);
    }
    Some(CapturedChain {
        innermost: *ids.first()?,
        head: ChainHandle::new(*ids.last()?),
        frames: ids.len(),
    })
}
