use std::time::Duration;

use crate::utils::{read_bool_from_env, read_uint_from_env};

/// Runtime configuration. Fixed once the [`Runtime`](crate::Runtime) is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Hand native code private copies of array and string data instead of
    /// direct views into the heap. Required when the collector may move
    /// objects while native code holds a pointer.
    pub force_copy: bool,
    /// Abort the offending call-in on fatal reference errors instead of
    /// returning them. Defaults to on in debug builds.
    pub check_jni: bool,
    /// Abort the process when a thread stays suspended at a checkpoint longer
    /// than this. `None` waits forever.
    pub checkpoint_timeout: Option<Duration>,
    /// How long a coordinator waits for threads to suspend before logging the
    /// ones that are still running. It keeps waiting afterwards.
    pub suspend_timeout: Duration,
    pub local_capacity: usize,
    pub global_capacity: usize,
    pub weak_global_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            force_copy: false,
            check_jni: cfg!(debug_assertions),
            checkpoint_timeout: None,
            suspend_timeout: Duration::from_secs(10),
            local_capacity: 512,
            global_capacity: 51200,
            weak_global_capacity: 51200,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(force_copy) = read_bool_from_env("JNI_FORCE_COPY") {
            config.force_copy = force_copy;
        }

        if let Some(check_jni) = read_bool_from_env("JNI_CHECK") {
            config.check_jni = check_jni;
        }

        config.checkpoint_timeout = match read_uint_from_env("JNI_CHECKPOINT_TIMEOUT_MS") {
            Some(0) | None => None,
            Some(ms) => Some(Duration::from_millis(ms as u64)),
        };

        if let Some(ms) = read_uint_from_env("JNI_SUSPEND_TIMEOUT_MS") {
            config.suspend_timeout = Duration::from_millis(ms.max(1) as u64);
        }

        if let Some(capacity) = read_uint_from_env("JNI_LOCAL_CAPACITY") {
            config.local_capacity = capacity.max(16);
        }

        if let Some(capacity) = read_uint_from_env("JNI_GLOBAL_CAPACITY") {
            config.global_capacity = capacity.max(16);
        }

        if let Some(capacity) = read_uint_from_env("JNI_WEAK_GLOBAL_CAPACITY") {
            config.weak_global_capacity = capacity.max(16);
        }

        config
    }

    pub fn with_force_copy(mut self, force_copy: bool) -> Self {
        self.force_copy = force_copy;
        self
    }

    pub fn with_check_jni(mut self, check_jni: bool) -> Self {
        self.check_jni = check_jni;
        self
    }

    pub fn with_checkpoint_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.checkpoint_timeout = timeout;
        self
    }

    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }
}
