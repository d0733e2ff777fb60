//! Tasklet registry
//!
//! Registered chain heads form a circular doubly linked list anchored by
//! a sentinel. The list exists only so the collector can enumerate
//! suspended chains; it is always accessed with the runtime's registry
//! lock held (see [`crate::TaskletRuntime`]).

use crate::error::{OrFatal, TaskletError, TaskletResult};
use crate::frame::MinGeneration;
use crate::tasklet::{ChainHandle, LiveLink, LiveLinks, Tasklet, TaskletArena, TaskletId};

/// Arena plus live list; the state guarded by the registry lock
pub(crate) struct TaskletStore {
    pub(crate) arena: TaskletArena,
    sentinel: LiveLinks,
    registered: usize,
}

impl TaskletStore {
    pub(crate) fn new() -> Self {
        Self {
            arena: TaskletArena::new(),
            sentinel: LiveLinks {
                next: LiveLink::Sentinel,
                prev: LiveLink::Sentinel,
            },
            registered: 0,
        }
    }

    /// Number of registered chains
    pub(crate) fn registered_len(&self) -> usize {
        self.registered
    }

    fn links(&self, link: LiveLink) -> TaskletResult<LiveLinks> {
        match link {
            LiveLink::Sentinel => Ok(self.sentinel),
            LiveLink::Tasklet(id) => self.arena.get(id)?.live.ok_or_else(|| {
                TaskletError::CorruptRegistry(format!("{id:?} is linked but carries no live links"))
            }),
        }
    }

    fn links_mut(&mut self, link: LiveLink) -> TaskletResult<&mut LiveLinks> {
        match link {
            LiveLink::Sentinel => Ok(&mut self.sentinel),
            LiveLink::Tasklet(id) => self.arena.get_mut(id)?.live.as_mut().ok_or_else(|| {
                TaskletError::CorruptRegistry(format!("{id:?} is linked but carries no live links"))
            }),
        }
    }

    /// Splice a chain head in right after the sentinel
    pub(crate) fn register(&mut self, handle: ChainHandle) -> TaskletResult<()> {
        let id = handle.tasklet();
        let tasklet = self.arena.get(id)?;
        if !tasklet.is_chain_head() {
            return Err(TaskletError::NotChainHead(id));
        }
        if tasklet.is_registered() {
            return Err(TaskletError::AlreadyRegistered(id));
        }

        let first = self.sentinel.next;
        self.arena.get_mut(id)?.live = Some(LiveLinks {
            next: first,
            prev: LiveLink::Sentinel,
        });
        self.links_mut(first)?.prev = LiveLink::Tasklet(id);
        self.sentinel.next = LiveLink::Tasklet(id);
        self.registered += 1;
        Ok(())
    }

    /// Splice a chain head out of the ring
    pub(crate) fn unregister(&mut self, id: TaskletId) -> TaskletResult<()> {
        let links = self
            .arena
            .get(id)?
            .live
            .ok_or(TaskletError::NotRegistered(id))?;
        self.links_mut(links.prev)?.next = links.next;
        self.links_mut(links.next)?.prev = links.prev;
        self.arena.get_mut(id)?.live = None;
        self.registered -= 1;
        Ok(())
    }

    /// Put `new_head` in the ring position held by `old_head`
    fn replace_registered(&mut self, old_head: TaskletId, new_head: TaskletId) -> TaskletResult<()> {
        let links = self
            .arena
            .get_mut(old_head)?
            .live
            .take()
            .ok_or(TaskletError::NotRegistered(old_head))?;
        self.arena.get_mut(new_head)?.live = Some(links);
        self.links_mut(links.prev)?.next = LiveLink::Tasklet(new_head);
        self.links_mut(links.next)?.prev = LiveLink::Tasklet(new_head);
        Ok(())
    }

    /// Registered heads, most recently registered first
    pub(crate) fn heads(&self) -> Vec<TaskletId> {
        let mut heads = Vec::with_capacity(self.registered);
        let mut cursor = self.sentinel.next;
        while let LiveLink::Tasklet(id) = cursor {
            heads.push(id);
            cursor = self.links(cursor).or_fatal().next;
        }
        heads
    }

    /// Follow caller links up to the chain head
    pub(crate) fn chain_head(&self, id: TaskletId) -> TaskletResult<ChainHandle> {
        let mut cursor = id;
        while let Some(next) = self.arena.get(cursor)?.next_in_stack {
            cursor = next;
        }
        Ok(ChainHandle::new(cursor))
    }

    /// Members of a chain, head first, innermost last
    pub(crate) fn chain_members(&self, head: TaskletId) -> TaskletResult<Vec<TaskletId>> {
        let mut members = Vec::new();
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            members.push(id);
            cursor = self.arena.get(id)?.prev_in_stack;
        }
        Ok(members)
    }

    /// Unlink a tasklet from its chain and the registry, and take it out
    /// of the arena.
    ///
    /// Removing a head whose chain still has callee-side members makes the
    /// next member in line the head: it takes over the ring slot, if any,
    /// and its floor drops to the chain minimum.
    pub(crate) fn detach(&mut self, id: TaskletId) -> TaskletResult<Tasklet> {
        let (next, prev, registered) = {
            let tasklet = self.arena.get(id)?;
            (
                tasklet.next_in_stack,
                tasklet.prev_in_stack,
                tasklet.is_registered(),
            )
        };

        if let Some(next) = next {
            self.arena.get_mut(next)?.prev_in_stack = prev;
        }
        if let Some(prev) = prev {
            self.arena.get_mut(prev)?.next_in_stack = next;
        }
        if let (None, Some(new_head)) = (next, prev) {
            // The new head must bound every member it now stands for
            let floor = self.chain_floor(new_head)?;
            let head = self.arena.get_mut(new_head)?;
            head.min_generation = head.min_generation.min(floor);
        }
        if registered {
            match (next, prev) {
                (None, Some(prev)) => self.replace_registered(id, prev)?,
                _ => self.unregister(id)?,
            }
        }
        self.arena.remove(id)
    }

    /// Lowest generation floor over a chain; an active member wins
    pub(crate) fn chain_floor(&self, head: TaskletId) -> TaskletResult<MinGeneration> {
        let mut floor = self.arena.get(head)?.min_generation;
        let mut cursor = self.arena.get(head)?.prev_in_stack;
        while let Some(id) = cursor {
            let tasklet = self.arena.get(id)?;
            floor = floor.min(tasklet.min_generation);
            cursor = tasklet.prev_in_stack;
        }
        Ok(floor)
    }

    /// Check ring linkage in both directions
    pub(crate) fn verify(&self) -> TaskletResult<()> {
        let corrupt = |msg: String| Err(TaskletError::CorruptRegistry(msg));

        let mut forward = 0usize;
        let mut prev = LiveLink::Sentinel;
        let mut cursor = self.sentinel.next;
        while let LiveLink::Tasklet(id) = cursor {
            let links = self.links(cursor)?;
            if links.prev != prev {
                return corrupt(format!("{id:?} has a broken back link"));
            }
            if !self.arena.get(id)?.is_chain_head() {
                return corrupt(format!("{id:?} is registered but is not a chain head"));
            }
            forward += 1;
            if forward > self.registered {
                return corrupt(format!("forward walk exceeds {} heads", self.registered));
            }
            prev = cursor;
            cursor = links.next;
        }
        if self.sentinel.prev != prev {
            return corrupt("sentinel back link does not close the ring".to_string());
        }

        let mut backward = 0usize;
        let mut cursor = self.sentinel.prev;
        while let LiveLink::Tasklet(_) = cursor {
            backward += 1;
            if backward > self.registered {
                return corrupt(format!("backward walk exceeds {} heads", self.registered));
            }
            cursor = self.links(cursor)?.prev;
        }

        if forward != self.registered || backward != self.registered {
            return corrupt(format!(
                "walked {forward} forward and {backward} backward, expected {}",
                self.registered
            ));
        }
        let flagged = self.arena.iter().filter(|(_, t)| t.is_registered()).count();
        if flagged != self.registered {
            return corrupt(format!("{flagged} tasklets carry live links, expected {}", self.registered));
        }
        Ok(())
    }
}
