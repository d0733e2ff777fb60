//! Interior pointer relocation
//!
//! Whenever a region of stack memory is copied elsewhere, every interior
//! pointer into that region has to follow it. A [`ByRefAdjustment`]
//! describes one such move: the old range and the distance to the new
//! base.

/// A pending move of `[old_base, old_base + size)` to a new base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByRefAdjustment {
    old_base: usize,
    size: usize,
    delta: usize,
}

impl ByRefAdjustment {
    /// Describe moving `size` bytes from `old_base` to `new_base`
    pub fn new(old_base: usize, new_base: usize, size: usize) -> Self {
        Self {
            old_base,
            size,
            delta: new_base.wrapping_sub(old_base),
        }
    }

    /// Start of the old range
    pub fn old_base(&self) -> usize {
        self.old_base
    }

    /// Start of the new range
    pub fn new_base(&self) -> usize {
        self.old_base.wrapping_add(self.delta)
    }

    /// Length of the moved range
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `addr` lies in the old range
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.old_base && addr - self.old_base < self.size
    }

    /// Relocated value of `addr`, or `None` when it lies outside the old range
    #[inline]
    pub fn relocate(&self, addr: usize) -> Option<usize> {
        self.contains(addr).then(|| addr.wrapping_add(self.delta))
    }

    /// Rewrite the pointer stored at `slot` if it targets the old range.
    ///
    /// Returns true if the slot was rewritten.
    ///
    /// # Safety
    /// `slot` must be valid for an unaligned read and write of one word.
    pub unsafe fn reloc_at(&self, slot: *mut usize) -> bool {
        // SAFETY: caller guarantees the slot is readable and writable
        unsafe {
            let value = slot.read_unaligned();
            match self.relocate(value) {
                Some(moved) => {
                    slot.write_unaligned(moved);
                    true
                }
                None => false,
            }
        }
    }
}
