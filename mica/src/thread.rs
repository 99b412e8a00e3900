//! Kernel thread runtime.
//!
//! Subsystems spawn long-running workers (the buffer cache's flush-back and
//! read-ahead threads) and short-lived loader threads through
//! [`ThreadBuilder`]. Threads are preemptive and scheduled by the host; the
//! kernel-visible surface is a named spawn, a joinable handle, and the
//! [`sleep_ms`]/[`yield_now`] suspension points.

/// A builder for spawning a named kernel thread.
///
/// ```
/// use mica::thread::ThreadBuilder;
///
/// let handle = ThreadBuilder::new("worker").spawn(|| { /* ... */ });
/// handle.join();
/// ```
pub struct ThreadBuilder {
    name: String,
}

impl ThreadBuilder {
    /// Creates a builder for a thread named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Spawns the thread, running `thread_fn` to completion.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        let inner = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(thread_fn)
            .expect("failed to spawn kernel thread");
        JoinHandle {
            name: self.name,
            inner,
        }
    }
}

/// A handle to a spawned thread.
///
/// Dropping the handle detaches the thread.
pub struct JoinHandle {
    /// Name the thread was spawned with.
    pub name: String,
    inner: std::thread::JoinHandle<()>,
}

impl JoinHandle {
    /// Waits for the thread to finish.
    pub fn join(self) {
        let _ = self.inner.join();
    }
}

/// Puts the current thread to sleep for at least `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}

/// Yields the processor to another ready thread.
pub fn yield_now() {
    std::thread::yield_now();
}
