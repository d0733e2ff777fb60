//! Capture engine tests
//!
//! Frames are laid out over a synthetic stack and walked by a scripted
//! walker, so every byte the engine copies is known up front.

mod common;

use common::{SyntheticStack, TestFrame, TestWalker, WORD, contiguous_frames, test_config};
use otter_vm_tasklet::{
    ByRefSlot, RegRestore, RegisterSlots, RestoreReg, ReturnShape, RootKind, StackMark,
    TaskletReturnType, TaskletRuntime,
};

#[test]
fn test_three_frame_scenario() {
    let mut stack = SyntheticStack::new(64);
    stack.fill_pattern(1);
    let base = stack.base();
    let mut frames = contiguous_frames(&stack, &[64, 80, 80]);

    let middle_sp = frames[1].sp;
    stack.write(middle_sp + 24, 0xdead_0000);
    stack.write(middle_sp + 40, base + 16);
    frames[1] = frames[1].clone().with_object_ref(24).with_byref(40, true);

    let runtime = TaskletRuntime::new(test_config());
    let chain = runtime
        .capture_tasklets(&TestWalker { frames }, StackMark(base), stack.limit())
        .expect("marked frame is on the stack");
    assert_eq!(chain.frames, 3);
    runtime.register_tasklet(chain.head);

    let members = runtime.chain_members(chain.head).unwrap();
    assert_eq!(members.len(), 3);
    assert_eq!(members[2], chain.innermost);
    let middle = members[1];

    let mut reported = Vec::new();
    runtime.iterate_tasklets_for_gc(0, &mut |slot| {
        if slot.tasklet == middle {
            reported.push((slot.offset, slot.kind));
        }
    });
    assert_eq!(
        reported,
        vec![(24, RootKind::Precise), (40, RootKind::Interior { pinned: true })]
    );

    let innermost_buffer = runtime
        .with_tasklet(chain.innermost, |t| t.stack_data().base_address())
        .unwrap();
    let (object, interior, byrefs) = runtime
        .with_tasklet(middle, |t| {
            (
                t.stack_data().read_word(24).unwrap(),
                t.stack_data().read_word(40).unwrap(),
                t.info().byref_offsets.clone(),
            )
        })
        .unwrap();
    assert_eq!(object, 0xdead_0000);
    assert_eq!(interior, innermost_buffer + 16);
    assert_eq!(byrefs, vec![ByRefSlot { offset: 40, pinned: true }]);
    assert_eq!(byrefs[0].encoded(), -41);
    assert_eq!(ByRefSlot::from_encoded(byrefs[0].encoded()), byrefs[0]);
}

#[test]
fn test_byrefs_into_callers_and_self_are_relocated() {
    let mut stack = SyntheticStack::new(64);
    let base = stack.base();
    let mut frames = contiguous_frames(&stack, &[48, 64]);

    // Innermost frame points into its caller; the caller points into itself
    let caller_sp = frames[1].sp;
    stack.write(base + 8, caller_sp + 16);
    stack.write(caller_sp, caller_sp + 32);
    frames[0] = frames[0].clone().with_byref(8, false);
    frames[1] = frames[1].clone().with_byref(0, false);

    let runtime = TaskletRuntime::new(test_config());
    let chain = runtime
        .capture_tasklets(&TestWalker { frames }, StackMark(base), stack.limit())
        .unwrap();

    let caller_buffer = runtime
        .with_tasklet(chain.head.tasklet(), |t| t.stack_data().base_address())
        .unwrap();
    let inner_value = runtime
        .with_tasklet(chain.innermost, |t| t.stack_data().read_word(8).unwrap())
        .unwrap();
    let caller_value = runtime
        .with_tasklet(chain.head.tasklet(), |t| t.stack_data().read_word(0).unwrap())
        .unwrap();
    assert_eq!(inner_value, caller_buffer + 16);
    assert_eq!(caller_value, caller_buffer + 32);
}

#[test]
fn test_frame_metadata() {
    let mut stack = SyntheticStack::new(32);
    stack.fill_pattern(7);
    let base = stack.base();
    let mut frames = contiguous_frames(&stack, &[64, 96]);
    frames[1] = frames[1].clone().returning(ReturnShape::ReturnBuffer);

    let runtime = TaskletRuntime::new(test_config());
    let chain = runtime
        .capture_tasklets(&TestWalker { frames }, StackMark(base + 8), stack.limit())
        .unwrap();
    assert!(!runtime.is_registered(chain.head).unwrap());

    runtime
        .with_tasklet(chain.innermost, |t| {
            assert_eq!(t.restore_ip(), 0x4000);
            assert_eq!(t.return_type(), TaskletReturnType::Integer);
            assert_eq!(t.info().stack_data_size, 64);
            assert_eq!(t.info().stack_requirement, 64);
            assert_eq!(t.info().return_address_offset, 56);
            assert_eq!(t.info().unrecorded_data_size, 0);
            assert_eq!(t.stack_data().as_bytes(), &bytes_of(&stack.words()[..8])[..]);
            assert_eq!(t.next_in_stack(), Some(chain.head.tasklet()));
            assert!(!t.is_chain_head());
        })
        .unwrap();
    runtime
        .with_tasklet(chain.head.tasklet(), |t| {
            assert_eq!(t.restore_ip(), 0x4010);
            assert_eq!(t.return_type(), TaskletReturnType::ByReference);
            assert_eq!(t.info().return_address_offset, 88);
            assert_eq!(t.prev_in_stack(), Some(chain.innermost));
            assert!(t.is_chain_head());
        })
        .unwrap();
}

#[test]
fn test_outgoing_argument_area_is_captured() {
    let stack = SyntheticStack::new(32);
    let base = stack.base();
    let mut frames = contiguous_frames(&stack, &[64, 64]);
    frames[0].arg_stack_size = 16;

    let mut config = test_config();
    config.min_outgoing_arg_area = 32;
    let runtime = TaskletRuntime::new(config);
    let chain = runtime
        .capture_tasklets(&TestWalker { frames }, StackMark(base), stack.limit())
        .unwrap();

    runtime
        .with_tasklet(chain.innermost, |t| {
            assert_eq!(t.info().arg_stack_size, 32);
            assert_eq!(t.info().stack_data_size, 96);
            assert_eq!(t.info().stack_requirement, 96);
        })
        .unwrap();
}

#[test]
fn test_saved_registers_are_recorded() {
    let stack = SyntheticStack::new(16);
    let base = stack.base();
    let context = [0usize; 4];
    let ctx = context.as_ptr() as usize;

    let mut frames = contiguous_frames(&stack, &[64]);
    frames[0] = frames[0]
        .clone()
        .with_register(
            RestoreReg::Rbx,
            RegisterSlots {
                caller_location: base + 8,
                current_location: ctx,
                current_value: 0x1111,
            },
        )
        .with_register(
            RestoreReg::Rbp,
            RegisterSlots {
                caller_location: base + 16,
                current_location: ctx + WORD,
                current_value: (base + 32) as u128,
            },
        )
        .with_register(
            RestoreReg::Rdi,
            RegisterSlots {
                caller_location: ctx + 2 * WORD,
                current_location: ctx + 2 * WORD,
                current_value: 0x3333,
            },
        );

    let runtime = TaskletRuntime::new(test_config());
    let chain = runtime
        .capture_tasklets(&TestWalker { frames }, StackMark(base), stack.limit())
        .unwrap();

    runtime
        .with_tasklet(chain.innermost, |t| {
            assert_eq!(
                t.info().registers_to_restore.as_slice(),
                &[
                    RegRestore { reg: RestoreReg::Rbx, offset: 8 },
                    RegRestore { reg: RestoreReg::Rbp, offset: 16 },
                    RegRestore { reg: RestoreReg::ReturnRegisters, offset: 0 },
                ]
            );
            let buffer = t.stack_data().base_address();
            assert_eq!(t.stack_data().read_word(8).unwrap(), 0x1111);
            // Saved frame pointer follows the copy
            assert_eq!(t.stack_data().read_word(16).unwrap(), buffer + 32);
            assert_eq!(
                t.info().byref_offsets,
                vec![ByRefSlot { offset: 16, pinned: false }]
            );
        })
        .unwrap();
}

#[test]
fn test_frameless_method_with_xmm_register() {
    let stack = SyntheticStack::new(16);
    let base = stack.base();
    let context = [0u128; 2];
    let value: u128 = 0x0123_4567_89ab_cdef_fedc_ba98_7654_3210;

    let mut frames = contiguous_frames(&stack, &[64]);
    frames[0] = frames[0].clone().with_register(
        RestoreReg::Xmm6,
        RegisterSlots {
            caller_location: base + 16,
            current_location: context.as_ptr() as usize,
            current_value: value,
        },
    );

    let runtime = TaskletRuntime::new(test_config());
    let chain = runtime
        .capture_tasklets(&TestWalker { frames }, StackMark(base), stack.limit())
        .unwrap();

    runtime
        .with_tasklet(chain.innermost, |t| {
            let registers = &t.info().registers_to_restore;
            assert_eq!(registers.len(), 2);
            assert_eq!(registers[0], RegRestore { reg: RestoreReg::Xmm6, offset: 16 });
            assert_eq!(registers[1].reg, RestoreReg::ReturnRegistersNoFrame);
            assert_eq!(&t.stack_data().as_bytes()[16..32], &value.to_le_bytes()[..]);
            assert!(t.info().byref_offsets.is_empty());
        })
        .unwrap();
}

#[test]
fn test_reference_in_saved_register_uses_save_slot() {
    let mut stack = SyntheticStack::new(16);
    let base = stack.base();
    let context = [0usize; 2];
    let ctx = context.as_ptr() as usize;
    stack.write(base + 24, 0x5555);

    let mut frames = contiguous_frames(&stack, &[64]);
    frames[0] = frames[0]
        .clone()
        .with_register(
            RestoreReg::R12,
            RegisterSlots {
                caller_location: base + 24,
                current_location: ctx,
                current_value: 0xbeef_0000,
            },
        )
        .with_ref_at(ctx, false);

    let runtime = TaskletRuntime::new(test_config());
    let chain = runtime
        .capture_tasklets(&TestWalker { frames }, StackMark(base), stack.limit())
        .unwrap();
    runtime
        .with_tasklet(chain.innermost, |t| {
            assert_eq!(t.info().object_ref_offsets, vec![24]);
            assert_eq!(t.stack_data().read_word(24).unwrap(), 0xbeef_0000);
        })
        .unwrap();
}

#[test]
fn test_frames_before_mark_are_skipped() {
    let stack = SyntheticStack::new(64);
    let frames = contiguous_frames(&stack, &[32, 64, 64]);
    let mark = StackMark(frames[1].sp + 8);

    let runtime = TaskletRuntime::new(test_config());
    let chain = runtime
        .capture_tasklets(&TestWalker { frames }, mark, stack.limit())
        .unwrap();
    assert_eq!(chain.frames, 2);
    assert_eq!(runtime.stats().frames_captured, 2);
    assert_eq!(runtime.stats().retained_bytes, 128);
}

#[test]
fn test_missing_mark_captures_nothing() {
    let stack = SyntheticStack::new(16);
    let frames = contiguous_frames(&stack, &[64]);

    let runtime = TaskletRuntime::new(test_config());
    let chain = runtime.capture_tasklets(&TestWalker { frames }, StackMark(stack.limit() + 64), stack.limit());
    assert!(chain.is_none());
    assert_eq!(runtime.stats().live_tasklets, 0);
}

#[test]
#[should_panic(expected = "outside the captured frames")]
fn test_byref_into_boundary_frame_is_fatal() {
    let mut stack = SyntheticStack::new(64);
    let base = stack.base();
    let mut frames = contiguous_frames(&stack, &[64, 64]);
    // Points past the last captured frame, into the boundary frame
    stack.write(base + 8, base + 200);
    frames[0] = frames[0].clone().with_byref(8, false);

    let runtime = TaskletRuntime::new(test_config());
    runtime.capture_tasklets(&TestWalker { frames }, StackMark(base), stack.limit());
}

#[test]
#[should_panic(expected = "non-method frame")]
fn test_unexpected_frame_is_fatal() {
    let stack = SyntheticStack::new(64);
    let base = stack.base();
    let mut frames = contiguous_frames(&stack, &[64, 64]);
    let sp = frames[1].sp;
    frames[1] = TestFrame::unexpected(sp, sp + 64);

    let runtime = TaskletRuntime::new(test_config());
    runtime.capture_tasklets(&TestWalker { frames }, StackMark(base), stack.limit());
}

#[test]
#[should_panic(expected = "unsupported return type")]
fn test_floating_point_return_is_fatal() {
    let stack = SyntheticStack::new(16);
    let base = stack.base();
    let mut frames = contiguous_frames(&stack, &[64]);
    frames[0] = frames[0].clone().returning(ReturnShape::FloatingPoint);

    let runtime = TaskletRuntime::new(test_config());
    runtime.capture_tasklets(&TestWalker { frames }, StackMark(base), stack.limit());
}

#[test]
#[should_panic(expected = "did not save")]
fn test_reference_in_unsaved_register_is_fatal() {
    let stack = SyntheticStack::new(16);
    let base = stack.base();
    let context = [0usize; 2];
    let ctx = context.as_ptr() as usize;
    let mut frames = contiguous_frames(&stack, &[64]);
    frames[0] = frames[0]
        .clone()
        .with_register(
            RestoreReg::Rsi,
            RegisterSlots {
                caller_location: ctx,
                current_location: ctx,
                current_value: 0,
            },
        )
        .with_ref_at(ctx, false);

    let runtime = TaskletRuntime::new(test_config());
    runtime.capture_tasklets(&TestWalker { frames }, StackMark(base), stack.limit());
}

fn bytes_of(words: &[usize]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_ne_bytes()).collect()
}
