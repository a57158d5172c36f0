//! Pausing threads at checkpoints.
//!
//! A pause never interrupts a thread. The coordinator raises suspend requests
//! and then waits until every thread it cares about is out of Runnable: either
//! parked at a checkpoint in Suspended, or in Native where it cannot touch the
//! heap and will park as soon as it tries to come back.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::MutexGuard;

use crate::{
    error::{fatal, Error, Result},
    registry::ThreadRegistry,
    state::ThreadState,
    thread::ThreadEntry,
};

/// All attached threads except the coordinator are paused while this value is
/// alive. Dropping it resumes them.
pub struct StopTheWorld<'r> {
    registry: &'r ThreadRegistry,
    cause: String,
    start: Instant,
    _exclusive: MutexGuard<'r, ()>,
}

impl<'r> StopTheWorld<'r> {
    pub fn registry(&self) -> &'r ThreadRegistry {
        self.registry
    }

    pub fn cause(&self) -> &str {
        &self.cause
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Threads held by this pause.
    pub fn threads(&self) -> Vec<Arc<ThreadEntry>> {
        self.registry
            .threads()
            .into_iter()
            .filter(|thread| !thread.is_current())
            .collect()
    }
}

impl Drop for StopTheWorld<'_> {
    fn drop(&mut self) {
        let mut threads = self.registry.monitor.lock();
        threads.global_suspend_count -= 1;
        threads.coordinator = None;
        for thread in threads.list.iter().filter(|thread| !thread.is_current()) {
            if thread.remove_suspend_request().is_none() {
                fatal(format_args!(
                    "thread \"{}\" lost its suspend request during \"{}\"",
                    thread.name(),
                    self.cause
                ));
            }
        }
        threads.notify_all();
        drop(threads);

        log::debug!(target: "safepoint", "resumed the world after \"{}\" ({} ms)", self.cause, self.start.elapsed().as_millis());
    }
}

/// One thread held at a checkpoint. Dropping it releases the thread.
pub struct SuspendedThread<'r> {
    registry: &'r ThreadRegistry,
    thread: Arc<ThreadEntry>,
}

impl SuspendedThread<'_> {
    pub fn thread(&self) -> &Arc<ThreadEntry> {
        &self.thread
    }
}

impl Drop for SuspendedThread<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.registry.release_suspend(&self.thread) {
            fatal(format_args!("cannot resume thread: {}", err));
        }
    }
}

impl ThreadRegistry {
    /// Pauses every attached thread other than the caller and returns once
    /// none of them is Runnable.
    ///
    /// Fails if the caller is itself attached and Runnable, since other
    /// coordinators would then wait for it forever.
    pub fn suspend_all(&self, cause: &str) -> Result<StopTheWorld<'_>> {
        self.ensure_not_runnable()?;

        let exclusive = self.suspend_all_lock.lock();
        let start = Instant::now();
        {
            let mut threads = self.monitor.lock();
            threads.global_suspend_count += 1;
            threads.coordinator = Some(std::thread::current().id());
            for thread in threads.list.iter().filter(|thread| !thread.is_current()) {
                thread.add_suspend_request();
            }
        }

        let count = self.wait_until_suspended(|thread| !thread.is_current());
        log::debug!(target: "safepoint", "stopped the world ({} thread(s)) for \"{}\" in {} ms", count, cause, start.elapsed().as_millis());

        Ok(StopTheWorld {
            registry: self,
            cause: cause.to_string(),
            start,
            _exclusive: exclusive,
        })
    }

    /// Pauses a single thread and returns once it is not Runnable.
    pub fn suspend_thread(&self, thread: &Arc<ThreadEntry>) -> Result<SuspendedThread<'_>> {
        if thread.is_current() {
            return Err(Error::InvalidTransition {
                from: thread.state(),
                to: ThreadState::Suspended,
            });
        }

        self.ensure_not_runnable()?;
        self.request_suspend(thread);
        self.wait_until_suspended(|other| std::ptr::eq(other, &**thread));

        Ok(SuspendedThread {
            registry: self,
            thread: thread.clone(),
        })
    }

    fn ensure_not_runnable(&self) -> Result<()> {
        if let Some(current) = self.current() {
            let state = current.state();
            if state == ThreadState::Runnable {
                return Err(Error::InvalidState {
                    thread: current.name().to_string(),
                    state,
                    guards: current.guard_depth(),
                });
            }
        }

        Ok(())
    }

    /// Blocks until no attached thread selected by `filter` is Runnable.
    /// Returns the number of selected threads.
    fn wait_until_suspended(&self, filter: impl Fn(&ThreadEntry) -> bool) -> usize {
        let mut lock = self.monitor.lock();
        loop {
            let running = lock
                .list
                .iter()
                .filter(|thread| filter(thread) && !thread.state().is_gc_safe())
                .count();
            if running == 0 {
                return lock.list.iter().filter(|thread| filter(thread)).count();
            }

            if lock.wait_timeout(self.suspend_timeout).timed_out() {
                let names = lock
                    .list
                    .iter()
                    .filter(|thread| filter(thread) && !thread.state().is_gc_safe())
                    .map(|thread| thread.name())
                    .collect::<Vec<_>>();
                log::warn!(target: "safepoint", "timed out waiting for {} thread(s) to suspend: {}", names.len(), names.join(", "));
            }
        }
    }
}
