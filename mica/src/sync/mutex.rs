//! A mutual exclusion lock.
use core::fmt;
use core::ops::{Deref, DerefMut};

/// A blocking mutual-exclusion lock protecting a value of type `T`.
///
/// Unlike a spinlock, a thread that fails to acquire the lock is descheduled
/// until the holder releases it, so it is safe to hold a [`Mutex`] across
/// blocking disk I/O. The subsystems that do so (the buffer cache, the swap
/// table) rely on exactly this property: the mutex acts as a turn-taking
/// queue in front of the device.
pub struct Mutex<T> {
    inner: std::sync::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(value),
        }
    }

    /// Acquires the mutex, blocking until it is available.
    ///
    /// The returned guard releases the lock when dropped; call
    /// [`MutexGuard::unlock`] to release it at a point of your choosing.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            inner: self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    /// Attempts to acquire the mutex without blocking.
    ///
    /// Returns `None` if the lock is currently held by another thread.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(inner) => Some(MutexGuard { inner }),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Some(MutexGuard {
                inner: poisoned.into_inner(),
            }),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    /// Consumes the mutex, returning the inner value.
    pub fn into_inner(self) -> T {
        self.inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

/// An RAII guard for a locked [`Mutex`].
///
/// The protected value is reachable through the guard's [`Deref`] and
/// [`DerefMut`] implementations.
pub struct MutexGuard<'a, T> {
    pub(crate) inner: std::sync::MutexGuard<'a, T>,
}

impl<T> MutexGuard<'_, T> {
    /// Releases the lock.
    ///
    /// Equivalent to dropping the guard; the explicit form reads better at
    /// call sites that release early.
    pub fn unlock(self) {}
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
