//! Stack segments
//!
//! A green thread's stack is a list of heap-allocated segments, oldest
//! first, with a cursor on the segment currently in use. Segments are
//! never freed while the thread lives; stepping back leaves the newer
//! ones in place for reuse.
//!
//! ```text
//!  allocation start                                  allocation end
//!  | red zone |               usable stack                       |
//!             ^ limit                                            ^ base
//! ```
//! Stacks grow down from `base` toward `limit`.

use crate::error::{GreenStackError, GreenStackResult};
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::NonNull;

/// Stack alignment required at call sites
pub const STACK_ALIGN: usize = 16;

/// Bounds of a stack, as read by the runtime's stack probes
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackRange {
    /// Lowest usable address
    pub limit: usize,
    /// One past the highest usable address
    pub base: usize,
}

impl StackRange {
    /// Whether `addr` lies within the range
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.limit && addr < self.base
    }

    /// Usable bytes
    pub fn len(&self) -> usize {
        self.base - self.limit
    }

    /// True for an empty range
    pub fn is_empty(&self) -> bool {
        self.base == self.limit
    }
}

/// Round `addr` down to a multiple of `align` (a power of two)
#[inline]
pub fn align_down(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

/// One zero-filled stack segment
pub struct StackSegment {
    ptr: NonNull<u8>,
    layout: Layout,
    range: StackRange,
}

impl StackSegment {
    /// Allocate `size` usable bytes above a `red_zone` guard area.
    ///
    /// Out-of-memory aborts the process.
    pub fn new(size: usize, red_zone: usize) -> GreenStackResult<Self> {
        let invalid = GreenStackError::InvalidSegmentSize { size, red_zone };
        if size == 0 {
            return Err(invalid);
        }
        let total = size.checked_add(red_zone).ok_or_else(|| invalid.clone())?;
        let layout = Layout::from_size_align(total, STACK_ALIGN).map_err(|_| invalid)?;

        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };

        let start = ptr.as_ptr() as usize;
        let range = StackRange {
            limit: start + red_zone,
            base: start + total,
        };
        tracing::trace!(
            target: "otter::green",
            size,
            red_zone,
            base = format_args!("{:#x}", range.base),
            "allocated stack segment"
        );
        Ok(Self { ptr, layout, range })
    }

    /// Usable bounds
    pub fn range(&self) -> StackRange {
        self.range
    }

    /// Usable bytes
    pub fn size(&self) -> usize {
        self.range.len()
    }

    /// Red zone bytes
    pub fn red_zone(&self) -> usize {
        self.range.limit - self.ptr.as_ptr() as usize
    }
}

impl Drop for StackSegment {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for StackSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackSegment")
            .field("limit", &format_args!("{:#x}", self.range.limit))
            .field("base", &format_args!("{:#x}", self.range.base))
            .finish()
    }
}

/// Segments of one green thread, oldest first
#[derive(Debug, Default)]
pub struct GreenThreadStackList {
    segments: Vec<StackSegment>,
    current: Option<usize>,
    allocated: u64,
}

impl GreenThreadStackList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Segment in use, if any
    pub fn current(&self) -> Option<&StackSegment> {
        self.current.map(|index| &self.segments[index])
    }

    /// Index of the segment in use
    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Segments held, including ones past the cursor
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// No segments held
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments allocated over the list's lifetime
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Move the cursor to a segment with at least `size` usable bytes.
    ///
    /// The segment after the cursor is reused when it is large enough;
    /// otherwise a new one is inserted right after the cursor.
    pub fn advance(&mut self, size: usize, red_zone: usize) -> GreenStackResult<&StackSegment> {
        let next = self.current.map_or(0, |index| index + 1);
        let reusable = self.segments.get(next).is_some_and(|segment| segment.size() >= size);
        if !reusable {
            self.segments.insert(next, StackSegment::new(size, red_zone)?);
            self.allocated += 1;
        }
        self.current = Some(next);
        Ok(&self.segments[next])
    }

    /// Step the cursor back to the previous segment
    pub fn retreat(&mut self) -> GreenStackResult<&StackSegment> {
        match self.current {
            Some(index) if index > 0 => {
                self.current = Some(index - 1);
                Ok(&self.segments[index - 1])
            }
            _ => Err(GreenStackError::SegmentUnderflow),
        }
    }

    /// Free every segment
    pub fn clear(&mut self) {
        self.segments.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_layout() {
        let segment = StackSegment::new(0x2000, 0x1000).unwrap();
        let range = segment.range();
        assert_eq!(range.len(), 0x2000);
        assert_eq!(segment.red_zone(), 0x1000);
        assert_eq!(range.base % STACK_ALIGN, 0);
        assert!(range.contains(range.base - 8));
        assert!(!range.contains(range.base));
        // Zero filled
        let bytes = unsafe { std::slice::from_raw_parts(range.limit as *const u8, range.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_invalid_segment_size() {
        assert_eq!(
            StackSegment::new(0, 0x1000).unwrap_err(),
            GreenStackError::InvalidSegmentSize { size: 0, red_zone: 0x1000 }
        );
        assert!(StackSegment::new(usize::MAX, 1).is_err());
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0x1017, 16), 0x1010);
        assert_eq!(align_down(0x1010, 16), 0x1010);
    }

    #[test]
    fn test_advance_reuses_large_enough_segment() {
        let mut list = GreenThreadStackList::new();
        let first = list.advance(0x4000, 0x1000).unwrap().range();
        let second = list.advance(0x2000, 0x1000).unwrap().range();
        assert_eq!(list.allocated(), 2);

        list.retreat().unwrap();
        assert_eq!(list.current().unwrap().range(), first);
        assert_eq!(list.advance(0x1000, 0x1000).unwrap().range(), second);
        assert_eq!(list.allocated(), 2);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_advance_inserts_when_next_is_too_small() {
        let mut list = GreenThreadStackList::new();
        list.advance(0x2000, 0x1000).unwrap();
        let small = list.advance(0x2000, 0x1000).unwrap().range();
        list.retreat().unwrap();

        let large = list.advance(0x8000, 0x1000).unwrap().range();
        assert_ne!(large, small);
        assert_eq!(list.current_index(), Some(1));
        assert_eq!(list.len(), 3);
        // The small segment is still there, after the new one
        list.advance(0x1000, 0x1000).unwrap();
        assert_eq!(list.current().unwrap().range(), small);
    }

    #[test]
    fn test_retreat_underflow() {
        let mut list = GreenThreadStackList::new();
        assert_eq!(list.retreat().unwrap_err(), GreenStackError::SegmentUnderflow);
        list.advance(0x2000, 0).unwrap();
        assert_eq!(list.retreat().unwrap_err(), GreenStackError::SegmentUnderflow);
    }
}
