//! Stable identity for the executing thread.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// A stable identifier for the calling thread.
///
/// The id is assigned from a process-wide counter the first time a thread
/// asks for it and stays fixed for the thread's lifetime, so it can be used
/// as a map key and compared cheaply. Ids are never reused within a
/// process.
///
/// # Examples
///
/// ```
/// use relock::ExecutorId;
///
/// let me = ExecutorId::current();
/// assert_eq!(me, ExecutorId::current());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorId(NonZeroU64);

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_EXECUTOR: ExecutorId = ExecutorId(
        NonZeroU64::new(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed))
            .expect("executor id counter wrapped"),
    );
}

impl ExecutorId {
    /// Returns the id of the calling thread.
    #[inline]
    #[must_use]
    pub fn current() -> Self {
        CURRENT_EXECUTOR.with(|id| *id)
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor-{}", self.0)
    }
}
