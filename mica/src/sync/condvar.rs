//! A condition variable.
use super::MutexGuard;

/// A condition variable paired with a [`Mutex`](super::Mutex).
///
/// A waiter atomically releases the mutex and sleeps until another thread
/// signals the variable, then reacquires the mutex before returning.
pub struct Condvar {
    inner: std::sync::Condvar,
}

impl Condvar {
    /// Creates a new condition variable.
    pub const fn new() -> Self {
        Self {
            inner: std::sync::Condvar::new(),
        }
    }

    /// Blocks until the variable is signaled.
    ///
    /// `guard` is released while sleeping and reacquired before this
    /// function returns the new guard.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        MutexGuard {
            inner: self
                .inner
                .wait(guard.inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    /// Wakes up one waiter, if any.
    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    /// Wakes up every waiter.
    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
