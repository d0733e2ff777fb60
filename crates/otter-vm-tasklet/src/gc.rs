//! Collector integration
//!
//! Suspended chains are GC roots. To keep minor collections cheap each
//! tasklet carries a conservative floor on the generation of everything
//! it references ([`MinGeneration`]); a chain whose head floor is above
//! the condemned generation can be skipped entirely.
//!
//! The floor is raised after every collection ([`age`]) and lowered
//! again when the heap reports a younger referent ([`rejuvenate`]). The
//! head always holds the minimum over its chain.

use crate::error::OrFatal;
use crate::frame::MinGeneration;
use crate::registry::TaskletStore;
use crate::tasklet::TaskletId;

/// Heap query used to rejuvenate tasklets
pub trait GenerationQuery {
    /// Generation currently holding the object at (or containing) `addr`
    fn which_generation(&self, addr: usize) -> i32;
}

/// How a reported root slot must be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// Precise object reference
    Precise,
    /// Interior pointer
    Interior {
        /// Referent must not move
        pinned: bool,
    },
}

/// A root slot inside a captured buffer.
///
/// The slot pointer stays valid until the tasklet is resumed or deleted;
/// the collector may update it in place.
#[derive(Debug, Clone, Copy)]
pub struct GcRootSlot {
    /// Owning tasklet
    pub tasklet: TaskletId,
    /// Offset from the frame's logical stack pointer
    pub offset: u32,
    /// The word in the tasklet's buffer
    pub slot: *mut usize,
    /// Slot kind
    pub kind: RootKind,
}

impl GcRootSlot {
    /// Referent must not move
    pub fn is_pinned(&self) -> bool {
        matches!(self.kind, RootKind::Interior { pinned: true })
    }

    /// Current slot value
    ///
    /// # Safety
    /// The owning tasklet must not have been resumed or deleted.
    pub unsafe fn read(&self) -> usize {
        // SAFETY: guaranteed by caller
        unsafe { self.slot.read() }
    }

    /// Overwrite the slot (e.g. after the referent moved)
    ///
    /// # Safety
    /// The owning tasklet must not have been resumed or deleted.
    pub unsafe fn write(&self, value: usize) {
        // SAFETY: guaranteed by caller
        unsafe { self.slot.write(value) }
    }
}

/// Report every root slot of every chain that could hold references into
/// `condemned`. Returns the number of slots reported.
pub(crate) fn iterate_for_gc(
    store: &mut TaskletStore,
    condemned: i32,
    promote: &mut dyn FnMut(GcRootSlot),
) -> usize {
    let mut reported = 0;
    for head in store.heads() {
        if store.arena.get(head).or_fatal().min_generation.get() > condemned {
            continue;
        }
        for id in store.chain_members(head).or_fatal() {
            let tasklet = store.arena.get_mut(id).or_fatal();
            if tasklet.min_generation.get() > condemned {
                continue;
            }
            for &offset in &tasklet.info.object_ref_offsets {
                let buffer_offset = tasklet.info.buffer_offset(offset).or_fatal();
                promote(GcRootSlot {
                    tasklet: id,
                    offset,
                    slot: tasklet.stack_data.slot_ptr(buffer_offset).or_fatal(),
                    kind: RootKind::Precise,
                });
                reported += 1;
            }
            for byref in &tasklet.info.byref_offsets {
                let buffer_offset = tasklet.info.buffer_offset(byref.offset).or_fatal();
                promote(GcRootSlot {
                    tasklet: id,
                    offset: byref.offset,
                    slot: tasklet.stack_data.slot_ptr(buffer_offset).or_fatal(),
                    kind: RootKind::Interior {
                        pinned: byref.pinned,
                    },
                });
                reported += 1;
            }
        }
    }
    reported
}

/// After a collection of `condemned`, survivors are one generation older.
/// Returns the number of chains aged.
pub(crate) fn age(store: &mut TaskletStore, condemned: i32, max_generation: i32) -> usize {
    let mut aged = 0;
    for head in store.heads() {
        let floor = store.arena.get(head).or_fatal().min_generation;
        if floor.is_active() || floor.get() > condemned {
            continue;
        }
        for id in store.chain_members(head).or_fatal() {
            let tasklet = store.arena.get_mut(id).or_fatal();
            tasklet.min_generation = tasklet.min_generation.aged(max_generation);
        }
        aged += 1;
    }
    aged
}

/// Before a collection of `condemned`, pull tasklet floors down to the
/// youngest generation any referent actually lives in.
/// Returns the number of tasklets whose floor dropped.
pub(crate) fn rejuvenate(
    store: &mut TaskletStore,
    condemned: i32,
    max_generation: i32,
    heap: &dyn GenerationQuery,
) -> usize {
    let mut lowered = 0;
    for head in store.heads() {
        let floor = store.arena.get(head).or_fatal().min_generation;
        if floor.get() <= 0 || floor.get() > condemned {
            continue;
        }

        let mut chain_floor = floor;
        for id in store.chain_members(head).or_fatal() {
            let tasklet = store.arena.get_mut(id).or_fatal();
            if tasklet.min_generation.is_active() {
                continue;
            }
            let mut youngest = tasklet.min_generation;

            let object_refs = tasklet.info.object_ref_offsets.iter().copied();
            let byrefs = tasklet.info.byref_offsets.iter().map(|slot| slot.offset);
            for offset in object_refs.chain(byrefs) {
                if youngest == MinGeneration::YOUNGEST {
                    break;
                }
                let buffer_offset = tasklet.info.buffer_offset(offset).or_fatal();
                let referent = tasklet.stack_data.read_word(buffer_offset).or_fatal();
                if referent == 0 {
                    continue;
                }
                let generation = MinGeneration::new(heap.which_generation(referent).clamp(0, max_generation));
                youngest = youngest.min(generation);
            }

            if youngest < tasklet.min_generation {
                tasklet.min_generation = youngest;
                lowered += 1;
            }
            chain_floor = chain_floor.min(youngest);
        }

        let head = store.arena.get_mut(head).or_fatal();
        if chain_floor < head.min_generation {
            head.min_generation = chain_floor;
        }
    }
    lowered
}
