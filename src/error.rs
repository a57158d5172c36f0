use thiserror::Error;

use crate::{
    reference::{Handle, RefKind},
    state::ThreadState,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("thread \"{0}\" is already attached")]
    AlreadyAttached(String),

    #[error("current thread is not attached")]
    NotAttached,

    #[error("thread \"{thread}\" is {state} with {guards} live guard(s), expected Native and none")]
    InvalidState {
        thread: String,
        state: ThreadState,
        guards: usize,
    },

    #[error("thread \"{0}\" has no pending suspend request to release")]
    SuspendCountUnderflow(String),

    #[error("thread \"{0}\" can only be checkpointed by itself")]
    NotOwner(String),

    #[error("invalid thread state transition {from} -> {to}")]
    InvalidTransition { from: ThreadState, to: ThreadState },

    #[error("reference used while thread is {0}, expected Runnable")]
    NotRunnable(ThreadState),

    #[error("weak global reference {0} has been cleared")]
    ClearedWeakReference(Handle),

    #[error("null reference")]
    NullReference,

    #[error("invalid reference {raw:#x}: {reason}")]
    InvalidReference { raw: usize, reason: &'static str },

    #[error("{kind} reference table overflow (max={max})")]
    TableOverflow { kind: RefKind, max: usize },

    #[error("guarded copy of {len} bytes corrupted: {reason}")]
    GuardedCopyCorrupted { len: usize, reason: &'static str },

    #[error("read-only copy of {0} bytes was modified by native code")]
    ModifiedReadOnlyCopy(usize),
}

impl Error {
    /// Returns false only for the errors a native caller is expected to branch
    /// on; everything else is a broken invariant.
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ClearedWeakReference(_) | Self::NullReference)
    }
}

/// Reports a broken invariant that must not be observable by the caller and
/// aborts the process.
#[cold]
#[inline(never)]
pub fn fatal(args: std::fmt::Arguments<'_>) -> ! {
    log::error!(target: "jni", "fatal: {}", args);
    eprintln!("fatal: {}", args);
    std::process::abort()
}

/// Aborts the current native call-in. Used when check-JNI is enabled.
#[cold]
#[inline(never)]
pub fn jni_abort(function: &str, error: &Error) -> ! {
    log::error!(target: "jni", "JNI DETECTED ERROR IN APPLICATION: {} in call to {}", error, function);
    panic!("JNI DETECTED ERROR IN APPLICATION: {} in call to {}", error, function)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_decode_misses_are_recoverable() {
        assert!(Error::NullReference.is_recoverable());
        assert!(Error::ClearedWeakReference(Handle::new(RefKind::WeakGlobal, 0, 3)).is_recoverable());
        assert!(Error::NotAttached.is_fatal());
        assert!(Error::NotRunnable(ThreadState::Native).is_fatal());
        assert!(Error::InvalidTransition {
            from: ThreadState::Native,
            to: ThreadState::Suspended
        }
        .is_fatal());
    }
}
