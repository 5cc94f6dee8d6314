//! Executor configuration.

use std::time::Duration;

/// Default name of the tracking table.
pub const DEFAULT_TRACKING_TABLE: &str = "tidemark_migrations";

/// Default advisory lock key ("tidemark" in ASCII).
pub const DEFAULT_LOCK_KEY: i64 = 0x7469_6465_6d61_726b;

/// How to behave when the migration lock is already held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockMode {
    /// Block until the lock is available.
    #[default]
    Wait,
    /// Fail immediately with `LockContention`.
    NoWait,
}

/// Options controlling how the executor takes its lock.
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Behaviour on contention.
    pub lock_mode: LockMode,
    /// Upper bound on waiting in [`LockMode::Wait`]; `None` waits forever.
    pub lock_timeout: Option<Duration>,
}

impl ExecutorOptions {
    /// Creates options that wait for the lock without a timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock mode.
    #[must_use]
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Bounds how long to wait for the lock.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Shorthand for [`LockMode::NoWait`].
    #[must_use]
    pub fn no_wait(self) -> Self {
        self.lock_mode(LockMode::NoWait)
    }
}
