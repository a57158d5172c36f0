use std::{
    fmt,
    sync::atomic::{AtomicU32, AtomicUsize},
    thread::ThreadId,
};

use atomic::{Atomic, Ordering};
use parking_lot::{Mutex, RwLock};

use crate::{
    irt::{IndirectReferenceTable, SegmentState},
    reference::RefKind,
    state::{ThreadFlags, ThreadState, CHECKPOINT_REQUEST, SUSPEND_REQUEST},
};

/// Closure executed by a thread on itself at its next checkpoint.
pub type CheckpointTask = Box<dyn FnOnce(&ThreadEntry) + Send>;

/// Registry entry of an attached thread.
///
/// Everything except the suspend count, the flag bank and the checkpoint queue
/// is only ever written by the thread the entry belongs to. The coordinator
/// reads the state word to learn whether the thread may be touching the heap.
pub struct ThreadEntry {
    id: ThreadId,
    name: String,
    state: Atomic<ThreadState>,
    suspend_count: AtomicU32,
    flags: ThreadFlags,
    guard_depth: AtomicUsize,
    checkpoint_tasks: Mutex<Vec<CheckpointTask>>,
    locals: RwLock<IndirectReferenceTable>,
    /// Bottom of the current local reference segment.
    local_cookie: AtomicU32,
}

impl ThreadEntry {
    pub(crate) fn new(name: String, local_capacity: usize, suspend_count: u32) -> Self {
        let flags = ThreadFlags::new();
        flags.set_cond(SUSPEND_REQUEST, suspend_count > 0);
        Self {
            id: std::thread::current().id(),
            name,
            state: Atomic::new(ThreadState::Native),
            suspend_count: AtomicU32::new(suspend_count),
            flags,
            guard_depth: AtomicUsize::new(0),
            checkpoint_tasks: Mutex::new(Vec::new()),
            locals: RwLock::new(IndirectReferenceTable::new(RefKind::Local, local_capacity, true)),
            local_cookie: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true when called from the thread this entry belongs to.
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.id
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_state(&self, state: ThreadState) {
        let old = self.state.swap(state, Ordering::SeqCst);
        log::trace!(target: "jni-transition", "\"{}\" {} -> {}", self.name, old, state);
    }

    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::SeqCst)
    }

    pub fn flags(&self) -> &ThreadFlags {
        &self.flags
    }

    /// Number of live guards on this thread.
    pub fn guard_depth(&self) -> usize {
        self.guard_depth.load(Ordering::Relaxed)
    }

    pub(crate) fn push_guard(&self) -> usize {
        self.guard_depth.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn pop_guard(&self) {
        self.guard_depth.fetch_sub(1, Ordering::Relaxed);
    }

    /// Caller holds the registry monitor.
    pub(crate) fn add_suspend_request(&self) -> u32 {
        let count = self.suspend_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.flags.set(SUSPEND_REQUEST);
        count
    }

    /// Caller holds the registry monitor. Returns `None` if nothing was pending.
    pub(crate) fn remove_suspend_request(&self) -> Option<u32> {
        let count = self.suspend_count();
        if count == 0 {
            return None;
        }

        self.suspend_count.store(count - 1, Ordering::SeqCst);
        if count == 1 {
            self.flags.unset(SUSPEND_REQUEST);
        }

        Some(count - 1)
    }

    pub(crate) fn queue_checkpoint(&self, task: CheckpointTask) {
        let mut tasks = self.checkpoint_tasks.lock();
        tasks.push(task);
        self.flags.set(CHECKPOINT_REQUEST);
    }

    /// Runs the queued tasks in order. If one panics, the ones after it go
    /// back to the front of the queue.
    pub(crate) fn run_checkpoint_tasks(&self) -> usize {
        let tasks = {
            let mut tasks = self.checkpoint_tasks.lock();
            self.flags.unset(CHECKPOINT_REQUEST);
            std::mem::take(&mut *tasks)
        };

        let mut pending = PendingTasks {
            thread: self,
            tasks: tasks.into_iter(),
        };

        let mut count = 0;
        while let Some(task) = pending.tasks.next() {
            task(self);
            count += 1;
        }

        count
    }

    pub fn locals(&self) -> &RwLock<IndirectReferenceTable> {
        &self.locals
    }

    pub(crate) fn local_segment(&self) -> SegmentState {
        SegmentState {
            top_index: self.local_cookie.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_local_segment(&self, segment: SegmentState) {
        self.local_cookie.store(segment.top_index, Ordering::Relaxed);
    }
}

struct PendingTasks<'a> {
    thread: &'a ThreadEntry,
    tasks: std::vec::IntoIter<CheckpointTask>,
}

impl Drop for PendingTasks<'_> {
    fn drop(&mut self) {
        if self.tasks.as_slice().is_empty() {
            return;
        }

        let mut queue = self.thread.checkpoint_tasks.lock();
        let newer = std::mem::take(&mut *queue);
        queue.extend(self.tasks.by_ref());
        queue.extend(newer);
        self.thread.flags.set(CHECKPOINT_REQUEST);
    }
}

impl fmt::Debug for ThreadEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("suspend_count", &self.suspend_count())
            .field("flags", &self.flags)
            .field("guard_depth", &self.guard_depth())
            .finish()
    }
}
