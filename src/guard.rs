use std::{marker::PhantomData, sync::Arc};

use crate::{
    decode::Decoded,
    error::{fatal, Error, Result},
    irt::SegmentState,
    reference::{Handle, ObjectRef},
    runtime::Runtime,
    state::ThreadState,
    thread::ThreadEntry,
};

/// Scoped thread-state transition.
///
/// Entering records the thread's current state and moves it to the target
/// state. Dropping the guard moves it back, on every exit path including
/// unwinding. Guards on one thread must be dropped in reverse order of
/// creation; a violation aborts the process since the pause protocol can no
/// longer trust the thread's state.
///
/// A guard is neither `Send` nor `Sync`: it belongs to the thread that entered
/// it.
pub struct ThreadStateGuard<'rt> {
    runtime: &'rt Runtime,
    thread: Arc<ThreadEntry>,
    previous: ThreadState,
    target: ThreadState,
    depth: usize,
    force_copy: bool,
    marker: PhantomData<*mut u8>,
}

impl<'rt> ThreadStateGuard<'rt> {
    pub(crate) fn enter(
        runtime: &'rt Runtime,
        thread: Arc<ThreadEntry>,
        target: ThreadState,
    ) -> Result<Self> {
        if !thread.is_current() {
            return Err(Error::NotOwner(thread.name().to_string()));
        }

        let previous = thread.state();
        runtime.registry().transition(&thread, target)?;
        let depth = thread.push_guard();

        Ok(Self {
            runtime,
            thread,
            previous,
            target,
            depth,
            force_copy: runtime.force_copy_policy().is_force_copy_enabled(),
            marker: PhantomData,
        })
    }

    pub fn runtime(&self) -> &'rt Runtime {
        self.runtime
    }

    pub fn thread(&self) -> &Arc<ThreadEntry> {
        &self.thread
    }

    /// State restored when the guard is dropped.
    pub fn previous(&self) -> ThreadState {
        self.previous
    }

    pub fn target(&self) -> ThreadState {
        self.target
    }

    /// True if entering this guard did not change the thread's state.
    pub fn is_reentrant(&self) -> bool {
        self.previous == self.target
    }

    pub fn state(&self) -> ThreadState {
        self.thread.state()
    }

    pub fn ensure_runnable(&self) -> Result<()> {
        match self.thread.state() {
            ThreadState::Runnable => Ok(()),
            state => Err(Error::NotRunnable(state)),
        }
    }

    /// Whether data reachable from decoded references has to be copied out
    /// instead of viewed in place.
    #[inline]
    pub fn force_copy_required(&self) -> bool {
        self.force_copy
    }

    /// Overrides the force-copy setting for this guard only.
    pub fn set_force_copy(&mut self, force_copy: bool) {
        self.force_copy = force_copy;
    }

    /// Cooperative checkpoint. Does nothing unless the thread is Runnable.
    pub fn checkpoint(&mut self) {
        if self.thread.state() == ThreadState::Runnable {
            self.runtime.registry().checkpoint(&self.thread);
        }
    }

    /// Runs `f` under a guard nested in this one. The outer guard is borrowed
    /// for the whole call, so nothing decoded under it survives a nested
    /// Native scope.
    pub fn nested<R>(
        &mut self,
        target: ThreadState,
        f: impl FnOnce(&mut ThreadStateGuard<'rt>) -> R,
    ) -> Result<R> {
        let mut inner = Self::enter(self.runtime, self.thread.clone(), target)?;
        Ok(f(&mut inner))
    }

    /// Runs `f` in Native, for calls that may block. The thread passes a
    /// checkpoint on its way back.
    pub fn blocking<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let _native = match Self::enter(self.runtime, self.thread.clone(), ThreadState::Native) {
            Ok(guard) => guard,
            Err(err) => fatal(format_args!("cannot leave Runnable for a blocking call: {}", err)),
        };

        f()
    }

    /// Runs `f` in a fresh local reference frame. Local references created
    /// inside are released when the frame ends.
    pub fn with_local_frame<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let _frame = LocalFrame::push(self.thread.clone());
        f(self)
    }

    pub fn new_local_ref(&self, obj: ObjectRef) -> Result<Handle> {
        self.ensure_runnable()?;
        let segment = self.thread.local_segment();
        self.thread.locals().write().add(segment, obj)
    }

    pub fn delete_local_ref(&self, handle: Handle) -> bool {
        let segment = self.thread.local_segment();
        self.thread.locals().write().remove(segment, handle)
    }

    pub fn decode(&self, handle: Handle) -> Result<Decoded<'_>> {
        self.runtime.decode(self, handle)
    }

    pub fn decode_raw(&self, raw: usize) -> Result<Decoded<'_>> {
        self.runtime.decode_raw(self, raw)
    }
}

impl Drop for ThreadStateGuard<'_> {
    fn drop(&mut self) {
        let innermost = self.thread.guard_depth();
        if innermost != self.depth {
            fatal(format_args!(
                "thread state guard {} -> {} on \"{}\" exited out of order (depth {}, innermost {})",
                self.previous,
                self.target,
                self.thread.name(),
                self.depth,
                innermost
            ));
        }

        self.thread.pop_guard();
        if let Err(err) = self.runtime.registry().transition(&self.thread, self.previous) {
            fatal(format_args!(
                "cannot restore \"{}\" to {}: {}",
                self.thread.name(),
                self.previous,
                err
            ));
        }
    }
}

struct LocalFrame {
    thread: Arc<ThreadEntry>,
    saved: SegmentState,
}

impl LocalFrame {
    fn push(thread: Arc<ThreadEntry>) -> Self {
        let saved = thread.local_segment();
        let top = thread.locals().read().segment_state();
        thread.set_local_segment(top);
        Self { thread, saved }
    }
}

impl Drop for LocalFrame {
    fn drop(&mut self) {
        let bottom = self.thread.local_segment();
        self.thread.locals().write().set_segment_state(bottom);
        self.thread.set_local_segment(self.saved);
    }
}
