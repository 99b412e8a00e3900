//! A counting semaphore.
use super::{Condvar, Mutex};

/// A counting semaphore.
///
/// A semaphore maintains a number of available permits. [`Semaphore::wait`]
/// takes a permit, blocking while none are available;
/// [`Semaphore::signal`] returns one and wakes a blocked waiter.
///
/// A semaphore initialized with zero permits doubles as an event counter:
/// producers `signal` once per queued item and a consumer `wait`s for the
/// next one. The buffer cache drives its read-ahead worker this way.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with `permits` initially available permits.
    pub const fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Acquires a permit, blocking until one becomes available.
    pub fn wait(&self) {
        let mut guard = self.permits.lock();
        while *guard == 0 {
            guard = self.cond.wait(guard);
        }
        *guard -= 1;
    }

    /// Acquires a permit if one is immediately available.
    pub fn try_wait(&self) -> bool {
        let mut guard = self.permits.lock();
        if *guard > 0 {
            *guard -= 1;
            true
        } else {
            false
        }
    }

    /// Releases a permit, waking one blocked waiter if any.
    pub fn signal(&self) {
        let mut guard = self.permits.lock();
        *guard += 1;
        self.cond.notify_one();
    }
}
