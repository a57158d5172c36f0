use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};

/// Mutex paired with a condition variable. Both suspended threads and the
/// coordinator waiting for them block on the same monitor and re-check their
/// own predicate after every wakeup.
pub struct Monitor<T> {
    lock: Mutex<T>,
    condvar: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(val: T) -> Self {
        Self {
            lock: Mutex::new(val),
            condvar: Condvar::new(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn lock(&self) -> MonitorLock<'_, T> {
        MonitorLock::new(self)
    }
}

pub struct MonitorLock<'a, T> {
    lock: MutexGuard<'a, T>,
    condvar: &'a Condvar,
}

impl<'a, T> MonitorLock<'a, T> {
    pub fn new(monitor: &'a Monitor<T>) -> Self {
        Self {
            lock: monitor.lock.lock(),
            condvar: &monitor.condvar,
        }
    }

    pub fn wait(&mut self) {
        self.condvar.wait(&mut self.lock);
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> WaitTimeoutResult {
        self.condvar.wait_for(&mut self.lock, timeout)
    }

    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }
}

impl<'a, T> Deref for MonitorLock<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.lock
    }
}

impl<'a, T> DerefMut for MonitorLock<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.lock
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn wait_until_predicate_holds() {
        let monitor = Arc::new(Monitor::new(false));
        let signaller = {
            let monitor = monitor.clone();
            std::thread::spawn(move || {
                let mut lock = monitor.lock();
                *lock = true;
                lock.notify_all();
            })
        };

        let mut lock = monitor.lock();
        while !*lock {
            lock.wait();
        }
        drop(lock);

        signaller.join().unwrap();
        assert!(!monitor.is_locked());
    }

    #[test]
    fn wait_timeout_reports_timeout() {
        let monitor = Monitor::new(());
        let mut lock = monitor.lock();
        assert!(lock.wait_timeout(Duration::from_millis(1)).timed_out());
    }
}
