//! Frozen frame representation
//!
//! A captured frame is a copy of the frame's stack bytes ([`StackData`])
//! plus the metadata needed to report its GC roots and splice it back
//! onto a live stack ([`StackDataInfo`]).
//!
//! Offsets recorded in [`StackDataInfo`] are relative to the frame's
//! logical stack pointer. The buffer itself starts
//! `unrecorded_data_size` bytes above that point.

use crate::error::{TaskletError, TaskletResult};
use crate::reloc::ByRefAdjustment;
use smallvec::SmallVec;

const WORD: usize = std::mem::size_of::<usize>();

/// Owned, word-aligned copy of a frame's stack memory
pub struct StackData {
    words: Box<[usize]>,
    len: usize,
}

impl StackData {
    /// Zero-filled buffer of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0usize; len.div_ceil(WORD)].into_boxed_slice(),
            len,
        }
    }

    /// Copy `len` bytes starting at `src`
    ///
    /// # Safety
    /// `src` must be valid for reads of `len` bytes.
    pub unsafe fn copy_from(src: *const u8, len: usize) -> Self {
        let mut data = Self::zeroed(len);
        // SAFETY: caller guarantees `src` is readable; the destination was
        // just allocated with room for `len` bytes and cannot overlap.
        unsafe { std::ptr::copy_nonoverlapping(src, data.as_mut_ptr(), len) };
        data
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the buffer holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the first byte
    pub fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr().cast()
    }

    /// Mutable pointer to the first byte
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }

    /// Address of the first byte
    pub fn base_address(&self) -> usize {
        self.as_ptr() as usize
    }

    /// The captured bytes
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `words` owns at least `len` initialized bytes
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// The captured bytes, mutably
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        // SAFETY: `words` owns at least `len` initialized bytes
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }

    fn check(&self, offset: usize, width: usize) -> TaskletResult<()> {
        match offset.checked_add(width) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(TaskletError::OffsetOutOfBounds {
                offset,
                width,
                len: self.len,
            }),
        }
    }

    /// Read the word stored at a byte offset
    pub fn read_word(&self, offset: usize) -> TaskletResult<usize> {
        self.check(offset, WORD)?;
        let mut raw = [0u8; WORD];
        raw.copy_from_slice(&self.as_bytes()[offset..offset + WORD]);
        Ok(usize::from_ne_bytes(raw))
    }

    /// Store a word at a byte offset
    pub fn write_word(&mut self, offset: usize, value: usize) -> TaskletResult<()> {
        self.write_bytes(offset, &value.to_ne_bytes())
    }

    /// Store raw bytes at a byte offset
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> TaskletResult<()> {
        self.check(offset, bytes.len())?;
        self.as_bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Address of the word slot at a byte offset
    pub fn slot_ptr(&mut self, offset: usize) -> TaskletResult<*mut usize> {
        self.check(offset, WORD)?;
        // SAFETY: bounds checked above
        Ok(unsafe { self.as_mut_ptr().add(offset) }.cast())
    }

    /// Relocate the pointer stored at `offset` if `adjustment` covers it
    pub fn relocate_word(&mut self, offset: usize, adjustment: &ByRefAdjustment) -> TaskletResult<bool> {
        let value = self.read_word(offset)?;
        match adjustment.relocate(value) {
            Some(moved) => {
                self.write_word(offset, moved)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for StackData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackData")
            .field("base", &format_args!("{:#x}", self.base_address()))
            .field("len", &self.len)
            .finish()
    }
}

/// Registers the resume trampoline may reload (x64 callee-saved set)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreReg {
    /// rbx
    Rbx,
    /// rbp, the frame pointer when one is set up
    Rbp,
    /// rdi (callee-saved on Windows x64)
    Rdi,
    /// rsi (callee-saved on Windows x64)
    Rsi,
    /// r12
    R12,
    /// r13
    R13,
    /// r14
    R14,
    /// r15
    R15,
    /// xmm6, full 16 bytes
    Xmm6,
    /// xmm7
    Xmm7,
    /// xmm8
    Xmm8,
    /// xmm9
    Xmm9,
    /// xmm10
    Xmm10,
    /// xmm11
    Xmm11,
    /// xmm12
    Xmm12,
    /// xmm13
    Xmm13,
    /// xmm14
    Xmm14,
    /// xmm15
    Xmm15,
    /// End of list; the frame uses Rbp as a frame pointer
    ReturnRegisters,
    /// End of list; the frame has no frame pointer
    ReturnRegistersNoFrame,
}

impl RestoreReg {
    /// Callee-saved registers in the order they are probed during capture
    pub const CALLEE_SAVED: [RestoreReg; 18] = [
        RestoreReg::Rbx,
        RestoreReg::Rbp,
        RestoreReg::Rdi,
        RestoreReg::Rsi,
        RestoreReg::R12,
        RestoreReg::R13,
        RestoreReg::R14,
        RestoreReg::R15,
        RestoreReg::Xmm6,
        RestoreReg::Xmm7,
        RestoreReg::Xmm8,
        RestoreReg::Xmm9,
        RestoreReg::Xmm10,
        RestoreReg::Xmm11,
        RestoreReg::Xmm12,
        RestoreReg::Xmm13,
        RestoreReg::Xmm14,
        RestoreReg::Xmm15,
    ];

    /// Size of the saved register in bytes
    pub fn width(self) -> usize {
        match self {
            RestoreReg::Xmm6
            | RestoreReg::Xmm7
            | RestoreReg::Xmm8
            | RestoreReg::Xmm9
            | RestoreReg::Xmm10
            | RestoreReg::Xmm11
            | RestoreReg::Xmm12
            | RestoreReg::Xmm13
            | RestoreReg::Xmm14
            | RestoreReg::Xmm15 => 16,
            _ => WORD,
        }
    }

    /// Whether this tag ends a restore list
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            RestoreReg::ReturnRegisters | RestoreReg::ReturnRegistersNoFrame
        )
    }
}

/// One register the trampoline reloads, and where its value lives
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegRestore {
    /// Register tag
    pub reg: RestoreReg,
    /// Offset from the frame's logical stack pointer
    pub offset: u32,
}

/// Register restore list, always terminated by a `ReturnRegisters*` entry
pub type RegRestoreList = SmallVec<[RegRestore; 8]>;

/// Recorded interior pointer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByRefSlot {
    /// Offset from the frame's logical stack pointer
    pub offset: u32,
    /// Referent must not move while referenced
    pub pinned: bool,
}

impl ByRefSlot {
    /// Signed encoding where a negative value marks a pinned slot.
    ///
    /// Pinned slots are stored as `!offset`, so offset 0 keeps its flag.
    pub fn encoded(&self) -> i32 {
        let offset = self.offset as i32;
        if self.pinned { !offset } else { offset }
    }

    /// Inverse of [`ByRefSlot::encoded`]
    pub fn from_encoded(encoded: i32) -> Self {
        if encoded < 0 {
            Self {
                offset: (!encoded) as u32,
                pinned: true,
            }
        } else {
            Self {
                offset: encoded as u32,
                pinned: false,
            }
        }
    }
}

/// How the resume value is delivered to the frame
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskletReturnType {
    /// Primitive or pointer-sized value in the integer return register
    Integer,
    /// Object reference in the integer return register
    ObjectReference,
    /// Address of a caller-owned return buffer
    ByReference,
}

/// Conservative lower bound on the generation of everything a tasklet
/// references. `-1` marks an active frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MinGeneration(i32);

impl MinGeneration {
    /// Frame is part of a live, mutating stack
    pub const ACTIVE: MinGeneration = MinGeneration(-1);
    /// Nursery
    pub const YOUNGEST: MinGeneration = MinGeneration(0);

    /// Wrap a raw generation number
    pub const fn new(generation: i32) -> Self {
        Self(generation)
    }

    /// Raw generation number
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Active sentinel
    pub const fn is_active(self) -> bool {
        self.0 < 0
    }

    /// One collection older, capped at `max_generation`. Active stays active.
    pub fn aged(self, max_generation: i32) -> Self {
        if self.is_active() {
            return self;
        }
        Self((self.0 + 1).min(max_generation))
    }
}

/// Per-frame metadata describing a [`StackData`] buffer
#[derive(Debug, Clone, Default)]
pub struct StackDataInfo {
    /// Stack space the frame needs once restored
    pub stack_requirement: u32,
    /// Bytes between the logical stack pointer and the buffer start
    pub unrecorded_data_size: u32,
    /// Bytes held by the buffer
    pub stack_data_size: u32,
    /// Offset of the return-address slot
    pub return_address_offset: u32,
    /// Outgoing argument bytes included at the end of the frame
    pub arg_stack_size: u32,
    /// Precise object reference slots
    pub object_ref_offsets: Vec<u32>,
    /// Interior pointer slots
    pub byref_offsets: Vec<ByRefSlot>,
    /// Callee-saved registers to reload on resume
    pub registers_to_restore: RegRestoreList,
}

impl StackDataInfo {
    /// Translate a logical-SP offset into a buffer offset
    pub fn buffer_offset(&self, logical_offset: u32) -> TaskletResult<usize> {
        logical_offset
            .checked_sub(self.unrecorded_data_size)
            .map(|offset| offset as usize)
            .ok_or(TaskletError::OffsetOutOfBounds {
                offset: logical_offset as usize,
                width: WORD,
                len: self.stack_data_size as usize,
            })
    }

    /// Frame holds interior pointers
    pub fn has_byrefs(&self) -> bool {
        !self.byref_offsets.is_empty()
    }
}
