//! Synthetic stacks and walkers shared by the integration tests

#![allow(dead_code)]

use otter_vm_tasklet::{
    FrameClass, FrameView, GcRefReport, GenerationQuery, RegisterSlots, RestoreReg, ReturnShape,
    StackMark, StackWalker, TaskletConfig, WalkAction,
};
use std::collections::HashMap;

pub const WORD: usize = std::mem::size_of::<usize>();

/// Word-aligned block of memory standing in for a thread stack
pub struct SyntheticStack {
    words: Box<[usize]>,
}

impl SyntheticStack {
    pub fn new(words: usize) -> Self {
        Self {
            words: vec![0usize; words].into_boxed_slice(),
        }
    }

    /// Lowest address
    pub fn base(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// One past the highest address
    pub fn limit(&self) -> usize {
        self.base() + self.words.len() * WORD
    }

    fn index(&self, addr: usize) -> usize {
        assert!(addr >= self.base() && addr < self.limit(), "{addr:#x} is off the stack");
        assert_eq!((addr - self.base()) % WORD, 0);
        (addr - self.base()) / WORD
    }

    pub fn read(&self, addr: usize) -> usize {
        self.words[self.index(addr)]
    }

    pub fn write(&mut self, addr: usize, value: usize) {
        let index = self.index(addr);
        self.words[index] = value;
    }

    /// Fill every word with a recognizable pattern
    pub fn fill_pattern(&mut self, seed: usize) {
        for (i, word) in self.words.iter_mut().enumerate() {
            *word = seed.wrapping_mul(0x100).wrapping_add(i);
        }
    }

    pub fn words(&self) -> &[usize] {
        &self.words
    }
}

/// A frame described by hand
#[derive(Debug, Clone)]
pub struct TestFrame {
    pub class: FrameClass,
    pub sp: usize,
    pub caller_sp: usize,
    pub arg_stack_size: u32,
    pub control_pc: usize,
    pub return_shape: ReturnShape,
    pub registers: Vec<(RestoreReg, RegisterSlots)>,
    pub refs: Vec<GcRefReport>,
}

impl TestFrame {
    pub fn method(sp: usize, caller_sp: usize, control_pc: usize) -> Self {
        Self {
            class: FrameClass::Interesting,
            sp,
            caller_sp,
            arg_stack_size: 0,
            control_pc,
            return_shape: ReturnShape::Primitive,
            registers: Vec::new(),
            refs: Vec::new(),
        }
    }

    pub fn boundary(sp: usize, caller_sp: usize) -> Self {
        Self {
            class: FrameClass::Boundary,
            ..Self::method(sp, caller_sp, 0)
        }
    }

    pub fn unexpected(sp: usize, caller_sp: usize) -> Self {
        Self {
            class: FrameClass::Unexpected,
            ..Self::method(sp, caller_sp, 0)
        }
    }

    /// Object reference at `offset` from sp
    pub fn with_object_ref(mut self, offset: usize) -> Self {
        self.refs.push(GcRefReport {
            location: self.sp + offset,
            interior: false,
            pinned: false,
        });
        self
    }

    /// Interior pointer at `offset` from sp
    pub fn with_byref(mut self, offset: usize, pinned: bool) -> Self {
        self.refs.push(GcRefReport {
            location: self.sp + offset,
            interior: true,
            pinned,
        });
        self
    }

    /// Reference living at an arbitrary location (e.g. a register slot)
    pub fn with_ref_at(mut self, location: usize, interior: bool) -> Self {
        self.refs.push(GcRefReport {
            location,
            interior,
            pinned: false,
        });
        self
    }

    pub fn with_register(mut self, reg: RestoreReg, slots: RegisterSlots) -> Self {
        self.registers.push((reg, slots));
        self
    }

    pub fn returning(mut self, shape: ReturnShape) -> Self {
        self.return_shape = shape;
        self
    }

    /// Offset of the return-address slot from sp
    pub fn return_address_offset(&self) -> usize {
        self.caller_sp - WORD - self.sp
    }
}

impl FrameView for TestFrame {
    fn class(&self) -> FrameClass {
        self.class
    }

    fn contains_mark(&self, mark: StackMark) -> bool {
        mark.0 >= self.sp && mark.0 < self.caller_sp
    }

    fn sp(&self) -> usize {
        self.sp
    }

    fn caller_sp(&self) -> usize {
        self.caller_sp
    }

    fn arg_stack_size(&self) -> u32 {
        self.arg_stack_size
    }

    fn control_pc(&self) -> usize {
        self.control_pc
    }

    fn return_address_location(&self) -> usize {
        self.caller_sp - WORD
    }

    fn register_slots(&self, reg: RestoreReg) -> Option<RegisterSlots> {
        self.registers
            .iter()
            .find(|(candidate, _)| *candidate == reg)
            .map(|(_, slots)| *slots)
    }

    fn return_shape(&self) -> ReturnShape {
        self.return_shape
    }

    fn enumerate_gc_refs(&self, report: &mut dyn FnMut(GcRefReport)) {
        for r in &self.refs {
            report(*r);
        }
    }
}

/// Walker over a fixed list of frames, innermost first
pub struct TestWalker {
    pub frames: Vec<TestFrame>,
}

// SAFETY: every test frame lies inside a SyntheticStack that outlives the
// walk.
unsafe impl StackWalker for TestWalker {
    fn walk_frames(&self, _mark: StackMark, visit: &mut dyn FnMut(&dyn FrameView) -> WalkAction) {
        for frame in &self.frames {
            if visit(frame) == WalkAction::Abort {
                break;
            }
        }
    }
}

/// Lay out `sizes.len()` contiguous method frames from the stack base,
/// innermost first, followed by a boundary frame.
pub fn contiguous_frames(stack: &SyntheticStack, sizes: &[usize]) -> Vec<TestFrame> {
    let mut frames = Vec::new();
    let mut sp = stack.base();
    for (i, size) in sizes.iter().enumerate() {
        frames.push(TestFrame::method(sp, sp + size, 0x4000 + i * 0x10));
        sp += size;
    }
    frames.push(TestFrame::boundary(sp, stack.limit()));
    frames
}

/// Generation oracle backed by a table
#[derive(Default)]
pub struct FakeHeap {
    generations: HashMap<usize, i32>,
    default: i32,
}

impl FakeHeap {
    pub fn new(default: i32) -> Self {
        Self {
            generations: HashMap::new(),
            default,
        }
    }

    pub fn place(&mut self, object: usize, generation: i32) {
        self.generations.insert(object, generation);
    }
}

impl GenerationQuery for FakeHeap {
    fn which_generation(&self, addr: usize) -> i32 {
        self.generations.get(&addr).copied().unwrap_or(self.default)
    }
}

/// Configuration without the Windows outgoing-argument area, so frame
/// extents are exactly [sp, caller_sp)
pub fn test_config() -> TaskletConfig {
    TaskletConfig {
        aging_enabled: true,
        min_outgoing_arg_area: 0,
    }
}
