use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

/// State of a thread with respect to the managed heap.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ThreadState {
    /// Running native code. The thread touches no managed reference and the
    /// collector does not need its cooperation.
    Native = 0,
    /// Running managed code. The thread may read and write the managed heap
    /// and must honor pause requests at checkpoints.
    Runnable = 1,
    /// Parked at a checkpoint in response to a pause request.
    Suspended = 2,
}

impl ThreadState {
    pub const fn is_gc_safe(self) -> bool {
        !matches!(self, Self::Runnable)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Native => "Native",
            Self::Runnable => "Runnable",
            Self::Suspended => "Suspended",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// At least one suspend request is pending.
pub const SUSPEND_REQUEST: u32 = 1 << 0;
/// At least one checkpoint task is queued.
pub const CHECKPOINT_REQUEST: u32 = 1 << 1;

/// Flag bank consulted by a thread at every checkpoint.
///
/// The fast path of a checkpoint is a single load of this word: when it is zero
/// nothing is requested and the thread keeps running.
pub struct ThreadFlags(AtomicU32);

impl ThreadFlags {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.load() == 0
    }

    #[inline]
    pub fn is_set(&self, flag: u32) -> bool {
        self.load() & flag != 0
    }

    pub fn set(&self, flag: u32) {
        self.0.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn unset(&self, flag: u32) {
        self.0.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn set_cond(&self, flag: u32, c: bool) {
        if c {
            self.set(flag);
        } else {
            self.unset(flag);
        }
    }
}

impl Default for ThreadFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThreadFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.load();
        f.debug_struct("ThreadFlags")
            .field("suspend_request", &(flags & SUSPEND_REQUEST != 0))
            .field("checkpoint_request", &(flags & CHECKPOINT_REQUEST != 0))
            .finish()
    }
}
