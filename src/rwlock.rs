//! Reentrant read/write mutex.
//!
//! [`ReentrantRwLock`] allows many concurrent readers or one writer, and it
//! tracks both roles per thread:
//!
//! - the current writer may take the write lock again (depth grows) and may
//!   also take read locks while writing;
//! - a thread that is the *only* reader may take the write lock without
//!   releasing its read holds first (the sole-reader upgrade);
//! - a reader sharing the lock with other threads' readers must wait like
//!   everyone else.
//!
//! # Coordination rule
//!
//! A writer may install itself while readers exist only when every
//! remaining read hold belongs to the installing thread, checked as
//! `total_readers == reader_counts[me]` under the internal mutex. This is
//! the one non-obvious rule; everything else is plain owner bookkeeping.
//!
//! # Wake protocol
//!
//! Two one-shot signals serve the two wait reasons: `wake_writer` closes
//! when the writer releases, `wake_readers` closes when a thread's last
//! read hold drains. A candidate writer waits on either; a reader only
//! needs `wake_writer`. Wakeups are advisory: woken threads re-check
//! state under the internal mutex and re-queue on fresh signals if they
//! lose the race.
//!
//! # Examples
//!
//! ```
//! use relock::ReentrantRwLock;
//!
//! let lock = ReentrantRwLock::new();
//! lock.lock_shared();
//! lock.lock(); // sole reader upgrades to writer
//! lock.unlock();
//! lock.unlock_shared();
//! assert!(!lock.is_locked());
//! ```

use crate::config;
use crate::diagnostics;
use crate::error::LockFault;
use crate::executor::ExecutorId;
use crate::pool::CounterPool;
use crate::signal::{wait_either, WaitOutcome, WakeSignal};
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::time::Instant;

/// A thread-aware reentrant read/write mutex.
pub struct ReentrantRwLock {
    fast: Mutex<RwInner>,
    backend: RawMutex,
}

struct RwInner {
    writer: Option<ExecutorId>,
    write_depth: usize,
    /// Per-thread read-hold counters; cells come from `count_pool`.
    reader_counts: HashMap<ExecutorId, Box<i64>>,
    /// Sum of all cells in `reader_counts`.
    total_readers: i64,
    /// Closed when the writer releases.
    wake_writer: Option<WakeSignal>,
    /// Closed when a thread's last read hold drains.
    wake_readers: Option<WakeSignal>,
    count_pool: CounterPool,
    gc_tick: u8,
    default_deadline: Option<Instant>,
}

impl RwInner {
    fn shared_held_by(&self, id: ExecutorId) -> i64 {
        self.reader_counts.get(&id).map_or(0, |count| **count)
    }

    fn note_shared_acquire(&mut self, me: ExecutorId) {
        match self.reader_counts.get_mut(&me) {
            Some(count) => **count += 1,
            None => {
                // Cells leave the pool primed to 1.
                let cell = self.count_pool.take();
                self.reader_counts.insert(me, cell);
            }
        }
        self.total_readers += 1;
    }

    /// Reclaims drained counter cells on every 256th zero-transition.
    ///
    /// The fixed period keeps release O(1) amortized while bounding map
    /// growth; correctness does not depend on the cadence.
    fn sweep_idle_cells(&mut self) {
        self.gc_tick = self.gc_tick.wrapping_add(1);
        if self.gc_tick != 0 {
            return;
        }
        let idle: SmallVec<[ExecutorId; 8]> = self
            .reader_counts
            .iter()
            .filter(|(_, count)| ***count == 0)
            .map(|(id, _)| *id)
            .collect();
        if idle.is_empty() {
            return;
        }
        tracing::trace!(reclaimed = idle.len(), "sweeping idle reader cells");
        for id in &idle {
            if let Some(cell) = self.reader_counts.remove(id) {
                self.count_pool.give(cell);
            }
        }
    }
}

impl ReentrantRwLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fast: Mutex::new(RwInner {
                writer: None,
                write_depth: 0,
                reader_counts: HashMap::new(),
                total_readers: 0,
                wake_writer: None,
                wake_readers: None,
                count_pool: CounterPool::new(),
                gc_tick: 0,
                default_deadline: None,
            }),
            backend: RawMutex::INIT,
        }
    }

    /// Returns `true` if any thread currently holds the write lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.fast.lock().writer.is_some()
    }

    /// Returns the total number of outstanding read holds.
    #[inline]
    #[must_use]
    pub fn reader_count(&self) -> i64 {
        self.fast.lock().total_readers
    }

    /// Sets this lock's default deadline for blocking acquisitions.
    ///
    /// Expiry of the default deadline is treated as a suspected deadlock;
    /// see [`ReentrantMutex::set_default_deadline`](crate::ReentrantMutex::set_default_deadline).
    pub fn set_default_deadline(&self, deadline: Option<Instant>) {
        self.fast.lock().default_deadline = deadline;
    }

    // ── Writer side ────────────────────────────────────────────────────

    /// Acquires the write lock, blocking until it is held.
    ///
    /// Succeeds immediately when the calling thread is already the writer
    /// (depth grows) or is the sole reader (upgrade).
    pub fn lock(&self) {
        let acquired = self.acquire_write(None, true);
        debug_assert!(acquired, "unbounded acquisition cannot fail");
    }

    /// Tries to acquire the write lock without blocking.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.acquire_write(None, false)
    }

    /// Acquires the write lock, blocking at most until `deadline`.
    #[must_use]
    pub fn lock_until(&self, deadline: Instant) -> bool {
        self.acquire_write(Some(deadline), true)
    }

    /// Releases one level of the write hold.
    ///
    /// # Panics
    ///
    /// Panics with a [`LockFault`] message if no thread holds the write
    /// lock, or a different thread does.
    pub fn unlock(&self) {
        let me = ExecutorId::current();
        let mut inner = self.fast.lock();
        match inner.writer {
            None => {
                drop(inner);
                panic!("{}", LockFault::ReleaseOfNeverHeld);
            }
            Some(holder) if holder != me => {
                drop(inner);
                panic!("{}", LockFault::ReleaseByNonOwner { holder, caller: me });
            }
            Some(_) => {}
        }

        inner.write_depth -= 1;
        if inner.write_depth == 0 {
            inner.writer = None;
            // Paired with the acquisition on the first-writer path; only
            // the writer thread reaches this line.
            unsafe { self.backend.unlock() };
        }
        let closed = inner.wake_writer.take();
        drop(inner);
        drop(closed);
    }

    // ── Reader side ────────────────────────────────────────────────────

    /// Acquires a read hold, blocking until granted.
    ///
    /// The current writer is always granted read holds immediately.
    pub fn lock_shared(&self) {
        let acquired = self.acquire_read(None, true);
        debug_assert!(acquired, "unbounded acquisition cannot fail");
    }

    /// Tries to acquire a read hold without blocking.
    #[must_use]
    pub fn try_lock_shared(&self) -> bool {
        self.acquire_read(None, false)
    }

    /// Acquires a read hold, blocking at most until `deadline`.
    #[must_use]
    pub fn lock_shared_until(&self, deadline: Instant) -> bool {
        self.acquire_read(Some(deadline), true)
    }

    /// Releases one read hold of the calling thread.
    ///
    /// # Panics
    ///
    /// Panics with a [`LockFault`] message if the calling thread holds no
    /// read lock.
    pub fn unlock_shared(&self) {
        let me = ExecutorId::current();
        let mut inner = self.fast.lock();
        let remaining = match inner.reader_counts.get_mut(&me) {
            Some(count) if **count > 0 => {
                **count -= 1;
                **count
            }
            _ => {
                drop(inner);
                panic!("{}", LockFault::ReleaseOfUnheldShared { caller: me });
            }
        };
        inner.total_readers -= 1;

        let mut closed = None;
        if remaining == 0 {
            inner.sweep_idle_cells();
            // A pending writer may now pass the sole-reader check.
            closed = inner.wake_readers.take();
        }
        drop(inner);
        drop(closed);
    }

    // ── Scoped wrappers ────────────────────────────────────────────────

    /// Runs `f` with the write lock held, releasing on every exit path.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let _release = WriteReleaseOnDrop { lock: self };
        f()
    }

    /// Runs `f` with the write lock held if it is free right now.
    pub fn try_with_lock<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if !self.try_lock() {
            return None;
        }
        let _release = WriteReleaseOnDrop { lock: self };
        Some(f())
    }

    /// Runs `f` with the write lock held if acquired by `deadline`.
    pub fn with_lock_until<R>(&self, deadline: Instant, f: impl FnOnce() -> R) -> Option<R> {
        if !self.lock_until(deadline) {
            return None;
        }
        let _release = WriteReleaseOnDrop { lock: self };
        Some(f())
    }

    /// Runs `f` with a read hold, releasing on every exit path.
    pub fn with_lock_shared<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock_shared();
        let _release = ReadReleaseOnDrop { lock: self };
        f()
    }

    /// Runs `f` with a read hold if one is grantable right now.
    pub fn try_with_lock_shared<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if !self.try_lock_shared() {
            return None;
        }
        let _release = ReadReleaseOnDrop { lock: self };
        Some(f())
    }

    /// Runs `f` with a read hold if one is granted by `deadline`.
    pub fn with_lock_shared_until<R>(
        &self,
        deadline: Instant,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        if !self.lock_shared_until(deadline) {
            return None;
        }
        let _release = ReadReleaseOnDrop { lock: self };
        Some(f())
    }

    // ── Acquisition machinery ──────────────────────────────────────────

    fn acquire_write(&self, deadline: Option<Instant>, should_wait: bool) -> bool {
        let me = ExecutorId::current();
        let mut inner = self.fast.lock();
        if inner.writer == Some(me) {
            inner.write_depth += 1;
            return true;
        }

        loop {
            if inner.write_depth == 0 {
                let mine = inner.shared_held_by(me);
                if inner.total_readers == 0 || inner.total_readers == mine {
                    inner.writer = Some(me);
                    inner.write_depth = 1;
                    drop(inner);
                    // First-writer path; uncontended for the same reason as
                    // the exclusive mutex.
                    self.backend.lock();
                    return true;
                }
            }

            if !should_wait {
                return false;
            }

            let on_writer = inner.wake_writer.get_or_insert_with(WakeSignal::new).listen();
            let on_readers = inner
                .wake_readers
                .get_or_insert_with(WakeSignal::new)
                .listen();
            let (bound, is_default) =
                config::resolve_wait_bound(deadline, inner.default_deadline);
            drop(inner);

            tracing::trace!(executor = %me, "waiting for write access");
            match wait_either(&on_writer, &on_readers, bound) {
                WaitOutcome::Woken => {}
                WaitOutcome::TimedOut => {
                    if is_default {
                        self.abort_suspected_deadlock();
                    }
                    return false;
                }
            }
            inner = self.fast.lock();
        }
    }

    fn acquire_read(&self, deadline: Option<Instant>, should_wait: bool) -> bool {
        let me = ExecutorId::current();
        let mut inner = self.fast.lock();
        loop {
            if inner.write_depth == 0 || inner.writer == Some(me) {
                inner.note_shared_acquire(me);
                return true;
            }

            if !should_wait {
                return false;
            }

            let on_writer = inner.wake_writer.get_or_insert_with(WakeSignal::new).listen();
            let (bound, is_default) =
                config::resolve_wait_bound(deadline, inner.default_deadline);
            drop(inner);

            tracing::trace!(executor = %me, "waiting for read access");
            match on_writer.wait(bound) {
                WaitOutcome::Woken => {}
                WaitOutcome::TimedOut => {
                    if is_default {
                        self.abort_suspected_deadlock();
                    }
                    return false;
                }
            }
            inner = self.fast.lock();
        }
    }

    /// Dumps holder state to the diagnostic sink and aborts the caller.
    fn abort_suspected_deadlock(&self) -> ! {
        let (holder, depth, total, entries) = {
            let inner = self.fast.lock();
            let entries: SmallVec<[(ExecutorId, i64); 8]> = inner
                .reader_counts
                .iter()
                .map(|(id, count)| (*id, **count))
                .collect();
            (inner.writer, inner.write_depth, inner.total_readers, entries)
        };
        let fault = LockFault::SuspectedDeadlock { holder };

        let mut report = String::new();
        let _ = writeln!(report, "{fault}");
        if let Some(holder) = holder {
            let _ = writeln!(report, "write-held by {holder} at depth {depth}");
        }
        for (id, count) in &entries {
            if *count > 0 {
                let _ = writeln!(report, "reader {id} holds {count} shared acquisition(s)");
            }
        }
        let _ = writeln!(report, "total shared holds: {total}");
        let _ = writeln!(report, "waiter stack:\n{}", diagnostics::waiter_backtrace());
        diagnostics::emit(&report);

        tracing::error!(%fault, "aborting acquisition");
        panic!("{fault}");
    }

    #[cfg(test)]
    fn debug_state(&self) -> RwDebugState {
        let inner = self.fast.lock();
        RwDebugState {
            writer: inner.writer,
            write_depth: inner.write_depth,
            total_readers: inner.total_readers,
            entries: inner
                .reader_counts
                .iter()
                .map(|(id, count)| (*id, **count))
                .collect(),
            pooled_cells: inner.count_pool.idle(),
        }
    }
}

impl Default for ReentrantRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReentrantRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.fast.lock();
        f.debug_struct("ReentrantRwLock")
            .field("writer", &inner.writer)
            .field("write_depth", &inner.write_depth)
            .field("total_readers", &inner.total_readers)
            .finish_non_exhaustive()
    }
}

struct WriteReleaseOnDrop<'a> {
    lock: &'a ReentrantRwLock,
}

impl Drop for WriteReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

struct ReadReleaseOnDrop<'a> {
    lock: &'a ReentrantRwLock,
}

impl Drop for ReadReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

#[cfg(test)]
struct RwDebugState {
    writer: Option<ExecutorId>,
    write_depth: usize,
    total_readers: i64,
    entries: Vec<(ExecutorId, i64)>,
    pooled_cells: usize,
}
