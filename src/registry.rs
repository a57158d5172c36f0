use std::{
    cell::RefCell,
    sync::Arc,
    thread::ThreadId,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thread_local::ThreadLocal;

use crate::{
    config::Config,
    error::{fatal, Error, Result},
    monitor::Monitor,
    state::{ThreadState, CHECKPOINT_REQUEST, SUSPEND_REQUEST},
    thread::ThreadEntry,
};

pub(crate) struct Threads {
    pub(crate) list: Vec<Arc<ThreadEntry>>,
    /// Number of `suspend_all` pauses in progress. Threads attaching during a
    /// pause start with this many suspend requests.
    pub(crate) global_suspend_count: u32,
    /// Thread running the current `suspend_all` pause. It never holds a
    /// suspend request of its own pause, even if it attaches during it.
    pub(crate) coordinator: Option<ThreadId>,
}

/// Registry of attached threads.
///
/// The monitor guards the thread list and is the only place threads block:
/// suspended threads wait on it for their suspend count to drop to zero, and
/// coordinators wait on it for threads to leave Runnable.
pub struct ThreadRegistry {
    pub(crate) monitor: Monitor<Threads>,
    current: ThreadLocal<RefCell<Option<Arc<ThreadEntry>>>>,
    pub(crate) suspend_all_lock: Mutex<()>,
    local_capacity: usize,
    checkpoint_timeout: Option<Duration>,
    pub(crate) suspend_timeout: Duration,
}

impl ThreadRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            monitor: Monitor::new(Threads {
                list: Vec::new(),
                global_suspend_count: 0,
                coordinator: None,
            }),
            current: ThreadLocal::new(),
            suspend_all_lock: Mutex::new(()),
            local_capacity: config.local_capacity,
            checkpoint_timeout: config.checkpoint_timeout,
            suspend_timeout: config.suspend_timeout,
        }
    }

    /// Attaches the calling thread. The new entry starts in Native.
    pub fn attach_current(&self, name: Option<&str>) -> Result<Arc<ThreadEntry>> {
        let slot = self.current.get_or(|| RefCell::new(None));
        let mut slot = slot.borrow_mut();

        if let Some(entry) = slot.take() {
            if entry.is_current() {
                let name = entry.name().to_string();
                *slot = Some(entry);
                return Err(Error::AlreadyAttached(name));
            }

            // The OS reused the slot of a thread that exited without detaching.
            log::warn!(target: "jni", "discarding entry of exited thread \"{}\" that was never detached", entry.name());
            let mut threads = self.monitor.lock();
            threads.list.retain(|thread| !Arc::ptr_eq(thread, &entry));
            threads.notify_all();
        }

        let current = std::thread::current();
        let name = match name {
            Some(name) => name.to_string(),
            None => current
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", current.id())),
        };

        let mut threads = self.monitor.lock();
        let inherited = if threads.coordinator == Some(current.id()) {
            0
        } else {
            threads.global_suspend_count
        };
        let entry = Arc::new(ThreadEntry::new(name, self.local_capacity, inherited));
        threads.list.push(entry.clone());
        let count = threads.list.len();
        drop(threads);

        *slot = Some(entry.clone());
        log::debug!(target: "jni", "attached thread \"{}\" ({} attached)", entry.name(), count);
        Ok(entry)
    }

    /// Detaches the calling thread. It must be in Native with no live guard.
    pub fn detach_current(&self) -> Result<()> {
        let slot = self.current.get().ok_or(Error::NotAttached)?;
        let mut slot = slot.borrow_mut();
        let entry = match slot.as_ref() {
            Some(entry) if entry.is_current() => entry.clone(),
            _ => return Err(Error::NotAttached),
        };

        let state = entry.state();
        let guards = entry.guard_depth();
        if state != ThreadState::Native || guards != 0 {
            return Err(Error::InvalidState {
                thread: entry.name().to_string(),
                state,
                guards,
            });
        }

        *slot = None;
        let mut threads = self.monitor.lock();
        threads.list.retain(|thread| !Arc::ptr_eq(thread, &entry));
        let count = threads.list.len();
        threads.notify_all();
        drop(threads);

        log::debug!(target: "jni", "detached thread \"{}\" ({} attached)", entry.name(), count);
        Ok(())
    }

    /// Entry of the calling thread, if it is attached.
    pub fn current(&self) -> Option<Arc<ThreadEntry>> {
        let slot = self.current.get()?.borrow();
        slot.as_ref().filter(|entry| entry.is_current()).cloned()
    }

    /// Snapshot of all attached threads.
    pub fn threads(&self) -> Vec<Arc<ThreadEntry>> {
        self.monitor.lock().list.clone()
    }

    pub fn len(&self) -> usize {
        self.monitor.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Asks `thread` to suspend at its next checkpoint. A Native thread is
    /// unaffected until it tries to become Runnable.
    pub fn request_suspend(&self, thread: &ThreadEntry) {
        let _lock = self.monitor.lock();
        let count = thread.add_suspend_request();
        log::trace!(target: "safepoint", "suspend requested for \"{}\" (count {})", thread.name(), count);
    }

    pub fn release_suspend(&self, thread: &ThreadEntry) -> Result<()> {
        let lock = self.monitor.lock();
        match thread.remove_suspend_request() {
            Some(count) => {
                lock.notify_all();
                log::trace!(target: "safepoint", "suspend released for \"{}\" (count {})", thread.name(), count);
                Ok(())
            }
            None => Err(Error::SuspendCountUnderflow(thread.name().to_string())),
        }
    }

    /// Queues `task` to run on `thread` at its next checkpoint.
    pub fn request_checkpoint(
        &self,
        thread: &ThreadEntry,
        task: impl FnOnce(&ThreadEntry) + Send + 'static,
    ) {
        thread.queue_checkpoint(Box::new(task));
    }

    /// Cooperative checkpoint. Must be called by `thread` itself while it is
    /// Runnable. Runs queued checkpoint tasks, then blocks in Suspended for as
    /// long as a suspend request is pending.
    pub fn checkpoint_if_requested(&self, thread: &ThreadEntry) -> Result<()> {
        if !thread.is_current() {
            return Err(Error::NotOwner(thread.name().to_string()));
        }

        let state = thread.state();
        if state != ThreadState::Runnable {
            return Err(Error::NotRunnable(state));
        }

        self.checkpoint(thread);
        Ok(())
    }

    #[inline]
    pub(crate) fn checkpoint(&self, thread: &ThreadEntry) {
        loop {
            let flags = thread.flags().load();
            if flags == 0 {
                return;
            }

            if flags & CHECKPOINT_REQUEST != 0 {
                let count = thread.run_checkpoint_tasks();
                log::trace!(target: "safepoint", "\"{}\" ran {} checkpoint task(s)", thread.name(), count);
            }

            if flags & SUSPEND_REQUEST != 0 {
                self.block_until_released(thread);
            }
        }
    }

    #[cold]
    #[inline(never)]
    fn block_until_released(&self, thread: &ThreadEntry) {
        let mut lock = self.monitor.lock();
        if thread.suspend_count() == 0 {
            return;
        }

        thread.set_state(ThreadState::Suspended);
        lock.notify_all();
        log::debug!(target: "safepoint", "\"{}\" reached checkpoint, suspending", thread.name());

        let start = Instant::now();
        while thread.suspend_count() > 0 {
            match self.checkpoint_timeout {
                Some(timeout) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        fatal(format_args!(
                            "thread \"{}\" suspended for {} ms, suspected deadlock",
                            thread.name(),
                            elapsed.as_millis()
                        ));
                    }
                    lock.wait_timeout(timeout - elapsed);
                }
                None => lock.wait(),
            }
        }

        thread.set_state(ThreadState::Runnable);
        drop(lock);
        log::debug!(target: "safepoint", "\"{}\" resumed after {} ms", thread.name(), start.elapsed().as_millis());
    }

    /// Moves `thread` from its current state to `to`. Only Native <-> Runnable
    /// moves are allowed; entering Runnable always passes a checkpoint.
    pub(crate) fn transition(&self, thread: &ThreadEntry, to: ThreadState) -> Result<()> {
        let from = thread.state();
        match (from, to) {
            _ if from == to => Ok(()),
            (ThreadState::Native, ThreadState::Runnable) => {
                thread.set_state(ThreadState::Runnable);
                // a panicking checkpoint task must not leave the thread Runnable
                let undo = LeaveRunnable {
                    registry: self,
                    thread,
                };
                self.checkpoint(thread);
                std::mem::forget(undo);
                Ok(())
            }
            (ThreadState::Runnable, ThreadState::Native) => {
                thread.set_state(ThreadState::Native);
                if thread.flags().is_set(SUSPEND_REQUEST) {
                    // a coordinator may be waiting for this thread
                    self.monitor.lock().notify_all();
                }
                Ok(())
            }
            _ => Err(Error::InvalidTransition { from, to }),
        }
    }
}

/// Puts a thread back in Native when a checkpoint unwinds during the
/// Native -> Runnable transition.
struct LeaveRunnable<'a> {
    registry: &'a ThreadRegistry,
    thread: &'a ThreadEntry,
}

impl Drop for LeaveRunnable<'_> {
    fn drop(&mut self) {
        log::warn!(target: "jni", "checkpoint of \"{}\" unwound, returning it to Native", self.thread.name());
        self.thread.set_state(ThreadState::Native);
        self.registry.monitor.lock().notify_all();
    }
}
