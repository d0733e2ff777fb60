//! Tasklets and the arena that owns them
//!
//! A tasklet is one captured frame. Tasklets of one suspended call stack
//! form a chain, innermost frame first: `next_in_stack` points toward the
//! caller, `prev_in_stack` toward the callee. The outermost tasklet (no
//! `next_in_stack`) is the chain head, and only heads are linked into the
//! registry's live list.
//!
//! All links are arena handles rather than pointers, so a consumed or
//! deleted tasklet can never be reached through a dangling link: its
//! handle's generation no longer matches.

use crate::error::{TaskletError, TaskletResult};
use crate::frame::{MinGeneration, StackData, StackDataInfo, TaskletReturnType};

/// Stable handle to a tasklet in a [`TaskletArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskletId {
    index: u32,
    generation: u32,
}

impl TaskletId {
    /// Slot index (for diagnostics)
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Handle to the head of a chain.
///
/// Only chain handles can be registered, which keeps interior and tail
/// tasklets out of the live list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainHandle(TaskletId);

impl ChainHandle {
    pub(crate) fn new(head: TaskletId) -> Self {
        Self(head)
    }

    /// The head tasklet
    pub fn tasklet(&self) -> TaskletId {
        self.0
    }
}

/// A node in the live list ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LiveLink {
    Sentinel,
    Tasklet(TaskletId),
}

/// Registry links, populated only on registered chain heads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LiveLinks {
    pub(crate) next: LiveLink,
    pub(crate) prev: LiveLink,
}

/// One captured stack frame plus chain linkage
#[derive(Debug)]
pub struct Tasklet {
    pub(crate) stack_data: StackData,
    pub(crate) info: StackDataInfo,
    pub(crate) restore_ip: usize,
    pub(crate) return_type: TaskletReturnType,
    pub(crate) min_generation: MinGeneration,
    pub(crate) next_in_stack: Option<TaskletId>,
    pub(crate) prev_in_stack: Option<TaskletId>,
    pub(crate) live: Option<LiveLinks>,
}

impl Tasklet {
    pub(crate) fn new(
        stack_data: StackData,
        info: StackDataInfo,
        restore_ip: usize,
        return_type: TaskletReturnType,
    ) -> Self {
        Self {
            stack_data,
            info,
            restore_ip,
            return_type,
            min_generation: MinGeneration::YOUNGEST,
            next_in_stack: None,
            prev_in_stack: None,
            live: None,
        }
    }

    /// Copy of the frame's stack bytes
    pub fn stack_data(&self) -> &StackData {
        &self.stack_data
    }

    /// Metadata describing the buffer
    pub fn info(&self) -> &StackDataInfo {
        &self.info
    }

    /// Instruction pointer to resume at
    pub fn restore_ip(&self) -> usize {
        self.restore_ip
    }

    /// How the resume value is delivered
    pub fn return_type(&self) -> TaskletReturnType {
        self.return_type
    }

    /// Current generational floor
    pub fn min_generation(&self) -> MinGeneration {
        self.min_generation
    }

    /// Caller-side neighbour
    pub fn next_in_stack(&self) -> Option<TaskletId> {
        self.next_in_stack
    }

    /// Callee-side neighbour
    pub fn prev_in_stack(&self) -> Option<TaskletId> {
        self.prev_in_stack
    }

    /// Outermost tasklet of its chain
    pub fn is_chain_head(&self) -> bool {
        self.next_in_stack.is_none()
    }

    /// Linked into the live list
    pub fn is_registered(&self) -> bool {
        self.live.is_some()
    }

    /// Address of the frame's logical stack pointer inside the copy
    pub fn logical_sp(&self) -> usize {
        self.stack_data
            .base_address()
            .wrapping_sub(self.info.unrecorded_data_size as usize)
    }
}

enum Slot {
    Occupied { generation: u32, tasklet: Tasklet },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Generational arena of tasklets
#[derive(Default)]
pub struct TaskletArena {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    len: usize,
}

impl TaskletArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Live tasklets
    pub fn len(&self) -> usize {
        self.len
    }

    /// No live tasklets
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a tasklet and hand out its handle
    pub fn insert(&mut self, tasklet: Tasklet) -> TaskletId {
        self.len += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let (generation, next_free) = match slot {
                Slot::Vacant {
                    generation,
                    next_free,
                } => (*generation, *next_free),
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            self.free_head = next_free;
            *slot = Slot::Occupied {
                generation,
                tasklet,
            };
            return TaskletId { index, generation };
        }

        let index = u32::try_from(self.slots.len()).unwrap_or_else(|_| {
            crate::error::invariant_violation("tasklet arena exhausted the u32 index space")
        });
        self.slots.push(Slot::Occupied {
            generation: 0,
            tasklet,
        });
        TaskletId {
            index,
            generation: 0,
        }
    }

    /// Look up a live tasklet
    pub fn get(&self, id: TaskletId) -> TaskletResult<&Tasklet> {
        match self.slots.get(id.index as usize) {
            Some(Slot::Occupied {
                generation,
                tasklet,
            }) if *generation == id.generation => Ok(tasklet),
            _ => Err(TaskletError::StaleTasklet(id)),
        }
    }

    /// Look up a live tasklet mutably
    pub fn get_mut(&mut self, id: TaskletId) -> TaskletResult<&mut Tasklet> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot::Occupied {
                generation,
                tasklet,
            }) if *generation == id.generation => Ok(tasklet),
            _ => Err(TaskletError::StaleTasklet(id)),
        }
    }

    /// Take a tasklet out of the arena, invalidating its handle
    pub fn remove(&mut self, id: TaskletId) -> TaskletResult<Tasklet> {
        self.get(id)?;
        let slot = std::mem::replace(
            &mut self.slots[id.index as usize],
            Slot::Vacant {
                generation: id.generation.wrapping_add(1),
                next_free: self.free_head,
            },
        );
        self.free_head = Some(id.index);
        self.len -= 1;
        match slot {
            Slot::Occupied { tasklet, .. } => Ok(tasklet),
            Slot::Vacant { .. } => unreachable!("slot checked occupied above"),
        }
    }

    /// Iterate over every live tasklet
    pub fn iter(&self) -> impl Iterator<Item = (TaskletId, &Tasklet)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied {
                    generation,
                    tasklet,
                } => Some((
                    TaskletId {
                        index: index as u32,
                        generation: *generation,
                    },
                    tasklet,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}
