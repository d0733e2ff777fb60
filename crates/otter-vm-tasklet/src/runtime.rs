//! Tasklet runtime service
//!
//! [`TaskletRuntime`] owns the tasklet arena and the registry behind a
//! single lock. Capture, resume, deletion and the collector entry points
//! all go through it, so independent runtimes never share state.

use crate::capture::{self, CapturedChain};
use crate::config::TaskletConfig;
use crate::error::{OrFatal, TaskletResult};
use crate::frame::RegRestoreList;
use crate::gc::{self, GcRootSlot, GenerationQuery};
use crate::registry::TaskletStore;
use crate::resume::{self, RestoreLocals, ResumeTrampoline, ResumeValue};
use crate::tasklet::{ChainHandle, Tasklet, TaskletId};
use crate::walker::{StackMark, StackWalker};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of runtime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskletStats {
    /// Chains currently in the registry
    pub registered_chains: usize,
    /// Tasklets alive in the arena
    pub live_tasklets: usize,
    /// Bytes held by live tasklet buffers
    pub retained_bytes: usize,
    /// Frames captured since creation
    pub frames_captured: u64,
    /// Frames restored since creation
    pub frames_restored: u64,
    /// Tasklets deleted without being resumed
    pub tasklets_deleted: u64,
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_restored: AtomicU64,
    tasklets_deleted: AtomicU64,
}

/// Marks a region in which the collector must not run
///
/// Capture reads raw stack memory that holds unreported references; a
/// collection in the middle would move objects under it.
pub struct NoGcScope<'a> {
    depth: &'a AtomicUsize,
}

impl<'a> NoGcScope<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::AcqRel);
        Self { depth }
    }
}

impl Drop for NoGcScope<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owner of all suspended tasklet chains
pub struct TaskletRuntime {
    config: TaskletConfig,
    store: Mutex<TaskletStore>,
    no_gc_depth: AtomicUsize,
    counters: Counters,
}

impl Default for TaskletRuntime {
    fn default() -> Self {
        Self::new(TaskletConfig::default())
    }
}

impl TaskletRuntime {
    /// Create a runtime with the given configuration
    pub fn new(config: TaskletConfig) -> Self {
        Self {
            config,
            store: Mutex::new(TaskletStore::new()),
            no_gc_depth: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &TaskletConfig {
        &self.config
    }

    /// Enter a region in which collections are forbidden
    pub fn no_gc_scope(&self) -> NoGcScope<'_> {
        NoGcScope::enter(&self.no_gc_depth)
    }

    fn assert_gc_allowed(&self) {
        debug_assert_eq!(
            self.no_gc_depth.load(Ordering::Acquire),
            0,
            "collector entered while a tasklet capture is in flight"
        );
    }

    /// Freeze the frames from `mark` up to the next boundary frame.
    ///
    /// Returns `None` if the walk never reached the marked frame. The
    /// returned chain is not registered yet.
    pub fn capture_tasklets(
        &self,
        walker: &dyn StackWalker,
        mark: StackMark,
        stack_limit: usize,
    ) -> Option<CapturedChain> {
        let tasklets = {
            let _no_gc = self.no_gc_scope();
            capture::capture_frames(walker, mark, stack_limit, &self.config)
        };
        let chain = capture::install(&mut self.store.lock(), tasklets)?;
        self.counters
            .frames_captured
            .fetch_add(chain.frames as u64, Ordering::Relaxed);
        tracing::debug!(
            target: "otter::tasklet",
            frames = chain.frames,
            head = ?chain.head.tasklet(),
            "captured tasklet chain"
        );
        Some(chain)
    }

    /// Make a chain visible to the collector
    pub fn register_tasklet(&self, chain: ChainHandle) {
        self.store.lock().register(chain).or_fatal();
    }

    /// Hide a chain from the collector
    pub fn unregister_tasklet(&self, chain: ChainHandle) {
        self.store.lock().unregister(chain.tasklet()).or_fatal();
    }

    /// Head of the chain containing `id`
    pub fn chain_head(&self, id: TaskletId) -> TaskletResult<ChainHandle> {
        self.store.lock().chain_head(id)
    }

    /// Members of a chain, head first
    pub fn chain_members(&self, chain: ChainHandle) -> TaskletResult<Vec<TaskletId>> {
        self.store.lock().chain_members(chain.tasklet())
    }

    /// Whether a chain is linked into the registry
    pub fn is_registered(&self, chain: ChainHandle) -> TaskletResult<bool> {
        Ok(self.store.lock().arena.get(chain.tasklet())?.is_registered())
    }

    /// Inspect a tasklet under the registry lock
    pub fn with_tasklet<R>(&self, id: TaskletId, f: impl FnOnce(&Tasklet) -> R) -> TaskletResult<R> {
        let store = self.store.lock();
        Ok(f(store.arena.get(id)?))
    }

    /// Free one tasklet without resuming it, splicing its chain
    pub fn delete_tasklet(&self, id: TaskletId) {
        let tasklet = self.store.lock().detach(id).or_fatal();
        self.counters.tasklets_deleted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            target: "otter::tasklet",
            ?id,
            bytes = tasklet.stack_data.len(),
            "deleted tasklet"
        );
    }

    /// Abandon a whole chain. Returns the number of tasklets freed.
    pub fn delete_chain(&self, chain: ChainHandle) -> usize {
        let freed = {
            let mut store = self.store.lock();
            let members = store.chain_members(chain.tasklet()).or_fatal();
            // Innermost first so the head, and its registration, goes last
            for &id in members.iter().rev() {
                store.detach(id).or_fatal();
            }
            members.len()
        };
        self.counters
            .tasklets_deleted
            .fetch_add(freed as u64, Ordering::Relaxed);
        tracing::debug!(target: "otter::tasklet", tasklets = freed, "deleted tasklet chain");
        freed
    }

    /// Splice a tasklet onto the stack at `locals.future_sp()`.
    ///
    /// The tasklet is consumed; consuming a chain head unregisters the
    /// chain. Returns the registers the trampoline must reload.
    ///
    /// # Safety
    /// `locals.future_sp()` must point at writable stack memory with room
    /// for the tasklet's `stack_requirement`, not overlapping a live frame.
    pub unsafe fn platform_independent_restore(
        &self,
        id: TaskletId,
        value: ResumeValue,
        locals: &mut RestoreLocals,
    ) -> RegRestoreList {
        let tasklet = resume::prepare(&mut self.store.lock(), id, locals.future_sp()).or_fatal();
        tracing::trace!(
            target: "otter::tasklet",
            ?id,
            future_sp = format_args!("{:#x}", locals.future_sp()),
            bytes = tasklet.stack_data.len(),
            "restoring tasklet"
        );
        self.counters.frames_restored.fetch_add(1, Ordering::Relaxed);
        // SAFETY: forwarded from the caller
        unsafe { resume::splice(tasklet, value, locals) }
    }

    /// Restore a tasklet and jump into it
    ///
    /// # Safety
    /// As for [`TaskletRuntime::platform_independent_restore`]; in addition
    /// the trampoline must be correct for the frame's architecture.
    pub unsafe fn resume_tasklet(
        &self,
        id: TaskletId,
        value: ResumeValue,
        future_sp: usize,
        return_address: usize,
        trampoline: &dyn ResumeTrampoline,
    ) -> ! {
        let mut locals = RestoreLocals::new(future_sp, return_address);
        // SAFETY: forwarded from the caller
        unsafe {
            let registers = self.platform_independent_restore(id, value, &mut locals);
            trampoline.transfer(&registers, &locals)
        }
    }

    /// Report root slots of every chain that may reference `condemned`
    pub fn iterate_tasklets_for_gc(&self, condemned: i32, promote: &mut dyn FnMut(GcRootSlot)) -> usize {
        self.assert_gc_allowed();
        let reported = gc::iterate_for_gc(&mut self.store.lock(), condemned, promote);
        tracing::debug!(target: "otter::tasklet", condemned, slots = reported, "reported tasklet roots");
        reported
    }

    /// Raise generation floors after a collection of `condemned`
    pub fn age_tasklets(&self, condemned: i32, max_generation: i32) {
        if !self.config.aging_enabled {
            return;
        }
        self.assert_gc_allowed();
        let aged = gc::age(&mut self.store.lock(), condemned, max_generation);
        tracing::debug!(target: "otter::tasklet", condemned, chains = aged, "aged tasklet chains");
    }

    /// Lower generation floors to match where referents actually live
    pub fn rejuvenate_tasklets(&self, condemned: i32, max_generation: i32, heap: &dyn GenerationQuery) {
        if !self.config.aging_enabled {
            return;
        }
        self.assert_gc_allowed();
        let lowered = gc::rejuvenate(&mut self.store.lock(), condemned, max_generation, heap);
        tracing::debug!(target: "otter::tasklet", condemned, tasklets = lowered, "rejuvenated tasklets");
    }

    /// Check the registry ring for corruption
    pub fn verify_registry(&self) -> TaskletResult<()> {
        self.store.lock().verify()
    }

    /// Current counters
    pub fn stats(&self) -> TaskletStats {
        let store = self.store.lock();
        TaskletStats {
            registered_chains: store.registered_len(),
            live_tasklets: store.arena.len(),
            retained_bytes: store.arena.iter().map(|(_, t)| t.stack_data.len()).sum(),
            frames_captured: self.counters.frames_captured.load(Ordering::Relaxed),
            frames_restored: self.counters.frames_restored.load(Ordering::Relaxed),
            tasklets_deleted: self.counters.tasklets_deleted.load(Ordering::Relaxed),
        }
    }
}
