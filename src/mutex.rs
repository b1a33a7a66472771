//! Reentrant exclusive mutex.
//!
//! [`ReentrantMutex`] is an exclusive mutex that tracks its owner: the
//! thread holding it may call [`lock`](ReentrantMutex::lock) again and the
//! hold depth grows instead of deadlocking. The lock is released when every
//! acquisition has been matched by an [`unlock`](ReentrantMutex::unlock).
//!
//! # Internal shape
//!
//! Ownership lives behind a short internal mutex (`fast`) that is only ever
//! held for constant-time bookkeeping. A separate `backend` mutex is taken
//! on the none-to-owned transition and released on the final unlock; it is
//! not the source of truth for ownership, it only serializes first-owner
//! handoffs and gives external code a conventional sequencing point.
//! Waiters block on a one-shot wake signal that the releasing thread closes
//! after leaving the critical section; wakeups are advisory and every woken
//! thread re-checks ownership before winning or re-queuing.

use crate::config;
use crate::diagnostics;
use crate::error::LockFault;
use crate::executor::ExecutorId;
use crate::signal::{WaitOutcome, WakeSignal};
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};
use std::fmt;
use std::fmt::Write as _;
use std::time::Instant;

/// A thread-aware reentrant exclusive mutex.
///
/// # Examples
///
/// ```
/// use relock::ReentrantMutex;
///
/// let lock = ReentrantMutex::new();
/// lock.lock();
/// assert!(lock.try_lock()); // same thread re-acquires
/// lock.unlock();
/// lock.unlock();
/// assert!(!lock.is_locked());
/// ```
pub struct ReentrantMutex {
    fast: Mutex<MutexInner>,
    backend: RawMutex,
}

struct MutexInner {
    owner: Option<ExecutorId>,
    depth: usize,
    wake: Option<WakeSignal>,
    default_deadline: Option<Instant>,
}

impl ReentrantMutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fast: Mutex::new(MutexInner {
                owner: None,
                depth: 0,
                wake: None,
                default_deadline: None,
            }),
            backend: RawMutex::INIT,
        }
    }

    /// Returns `true` if any thread currently holds the lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.fast.lock().owner.is_some()
    }

    /// Sets this lock's default deadline for blocking acquisitions.
    ///
    /// Expiry of the default deadline is treated as a suspected deadlock:
    /// the holder is dumped to the diagnostic sink and the waiter panics.
    /// `None` restores the infinite default (falling back to the
    /// process-wide value from [`config`], if any).
    pub fn set_default_deadline(&self, deadline: Option<Instant>) {
        self.fast.lock().default_deadline = deadline;
    }

    /// Acquires the lock, blocking until it is held by the calling thread.
    ///
    /// Re-acquisition by the holding thread succeeds immediately and
    /// deepens the hold.
    pub fn lock(&self) {
        let acquired = self.acquire(None, true);
        debug_assert!(acquired, "unbounded acquisition cannot fail");
    }

    /// Tries to acquire the lock without blocking.
    ///
    /// Returns `true` iff the lock is now held by the calling thread.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.acquire(None, false)
    }

    /// Acquires the lock, blocking at most until `deadline`.
    ///
    /// Returns `false` if the deadline passed first; the lock state is
    /// untouched in that case.
    #[must_use]
    pub fn lock_until(&self, deadline: Instant) -> bool {
        self.acquire(Some(deadline), true)
    }

    /// Releases one level of the hold.
    ///
    /// When the depth reaches zero the lock becomes free and one waiting
    /// thread is woken.
    ///
    /// # Panics
    ///
    /// Panics with a [`LockFault`] message if the lock is not held, or is
    /// held by a different thread.
    pub fn unlock(&self) {
        let me = ExecutorId::current();
        let mut inner = self.fast.lock();
        match inner.owner {
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

        inner.depth -= 1;
        if inner.depth == 0 {
            inner.owner = None;
            // Paired with the acquisition on the first-owner path; only the
            // owner thread reaches this line.
            unsafe { self.backend.unlock() };
        }
        let closed = inner.wake.take();
        drop(inner);
        // Closing wakes every waiter; they race to re-check ownership and
        // the losers queue on a fresh signal.
        drop(closed);
    }

    /// Runs `f` with the lock held, releasing on every exit path.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let _release = UnlockOnDrop { lock: self };
        f()
    }

    /// Runs `f` with the lock held if it can be acquired without blocking.
    ///
    /// Returns `None` (without running `f`) if the lock was busy.
    pub fn try_with_lock<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if !self.try_lock() {
            return None;
        }
        let _release = UnlockOnDrop { lock: self };
        Some(f())
    }

    /// Runs `f` with the lock held if it can be acquired by `deadline`.
    ///
    /// Returns `None` (without running `f`) if the deadline passed first.
    pub fn with_lock_until<R>(&self, deadline: Instant, f: impl FnOnce() -> R) -> Option<R> {
        if !self.lock_until(deadline) {
            return None;
        }
        let _release = UnlockOnDrop { lock: self };
        Some(f())
    }

    fn acquire(&self, deadline: Option<Instant>, should_wait: bool) -> bool {
        let me = ExecutorId::current();
        loop {
            let mut inner = self.fast.lock();
            match inner.owner {
                None => {
                    inner.owner = Some(me);
                    inner.depth = 1;
                    drop(inner);
                    // First-owner path. Uncontended: the previous owner
                    // released `backend` under `fast` before clearing
                    // `owner`, and no other thread takes it until `owner`
                    // is cleared again.
                    self.backend.lock();
                    return true;
                }
                Some(owner) if owner == me => {
                    inner.depth += 1;
                    return true;
                }
                Some(_) => {}
            }

            if !should_wait {
                return false;
            }

            let listener = inner.wake.get_or_insert_with(WakeSignal::new).listen();
            let (bound, is_default) =
                config::resolve_wait_bound(deadline, inner.default_deadline);
            drop(inner);

            tracing::trace!(executor = %me, "waiting for exclusive mutex");
            match listener.wait(bound) {
                WaitOutcome::Woken => {}
                WaitOutcome::TimedOut => {
                    if is_default {
                        self.abort_suspected_deadlock();
                    }
                    return false;
                }
            }
        }
    }

    /// Dumps holder state to the diagnostic sink and aborts the caller.
    fn abort_suspected_deadlock(&self) -> ! {
        let (holder, depth) = {
            let inner = self.fast.lock();
            (inner.owner, inner.depth)
        };
        let fault = LockFault::SuspectedDeadlock { holder };

        let mut report = String::new();
        let _ = writeln!(report, "{fault}");
        if let Some(holder) = holder {
            let _ = writeln!(report, "held by {holder} at depth {depth}");
        }
        let _ = writeln!(report, "waiter stack:\n{}", diagnostics::waiter_backtrace());
        diagnostics::emit(&report);

        tracing::error!(%fault, "aborting acquisition");
        panic!("{fault}");
    }

    #[cfg(test)]
    fn debug_state(&self) -> (Option<ExecutorId>, usize) {
        let inner = self.fast.lock();
        (inner.owner, inner.depth)
    }
}

impl Default for ReentrantMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReentrantMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.fast.lock();
        f.debug_struct("ReentrantMutex")
            .field("owner", &inner.owner)
            .field("depth", &inner.depth)
            .finish_non_exhaustive()
    }
}

struct UnlockOnDrop<'a> {
    lock: &'a ReentrantMutex,
}

impl Drop for UnlockOnDrop<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{assert_with_log, init_test_logging, test_complete, test_phase};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn init_test(name: &str) {
        init_test_logging();
        test_phase!(name);
    }

    /// Holds the lock on a helper thread until the returned sender fires.
    fn hold_elsewhere(lock: &Arc<ReentrantMutex>) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let lock = Arc::clone(lock);
        let handle = thread::spawn(move || {
            lock.lock();
            held_tx.send(()).expect("main thread gone");
            let _ = release_rx.recv();
            lock.unlock();
        });
        held_rx.recv().expect("holder thread died");
        (release_tx, handle)
    }

    #[test]
    fn reentrant_acquire_and_balanced_release() {
        init_test("reentrant_acquire_and_balanced_release");
        let lock = ReentrantMutex::new();

        lock.lock();
        lock.lock();
        let (owner, depth) = lock.debug_state();
        assert_with_log!(depth == 2, "depth after double lock", 2usize, depth);
        assert_with_log!(owner.is_some(), "owner installed", true, owner.is_some());

        lock.unlock();
        let still_locked = lock.is_locked();
        assert_with_log!(still_locked, "still held at depth 1", true, still_locked);

        lock.unlock();
        let (owner, depth) = lock.debug_state();
        assert_with_log!(owner.is_none(), "owner cleared", true, owner.is_none());
        assert_with_log!(depth == 0, "depth cleared", 0usize, depth);
        test_complete!("reentrant_acquire_and_balanced_release");
    }

    #[test]
    fn released_lock_is_acquirable_from_any_thread() {
        init_test("released_lock_is_acquirable_from_any_thread");
        let lock = Arc::new(ReentrantMutex::new());

        for _ in 0..3 {
            lock.lock();
            lock.lock();
            lock.unlock();
            lock.unlock();
        }

        let elsewhere = Arc::clone(&lock);
        let acquired = thread::spawn(move || {
            let ok = elsewhere.try_lock();
            if ok {
                elsewhere.unlock();
            }
            ok
        })
        .join()
        .expect("probe thread panicked");
        assert_with_log!(acquired, "fresh thread acquires", true, acquired);
        test_complete!("released_lock_is_acquirable_from_any_thread");
    }

    #[test]
    fn try_lock_fails_while_held_elsewhere() {
        init_test("try_lock_fails_while_held_elsewhere");
        let lock = Arc::new(ReentrantMutex::new());
        let (release, handle) = hold_elsewhere(&lock);

        let busy = !lock.try_lock();
        assert_with_log!(busy, "try_lock busy while held", true, busy);

        release.send(()).expect("holder gone");
        handle.join().expect("holder panicked");

        // After the holder releases, a blocking acquisition succeeds.
        lock.lock();
        lock.unlock();
        test_complete!("try_lock_fails_while_held_elsewhere");
    }

    #[test]
    fn lock_until_expires_without_side_effects() {
        init_test("lock_until_expires_without_side_effects");
        let lock = Arc::new(ReentrantMutex::new());
        let (release, handle) = hold_elsewhere(&lock);

        let acquired = lock.lock_until(Instant::now() + Duration::from_millis(5));
        assert_with_log!(!acquired, "bounded wait expired", false, acquired);

        // The failed wait left no trace; the holder releases normally.
        release.send(()).expect("holder gone");
        handle.join().expect("holder panicked");
        assert_with_log!(!lock.is_locked(), "lock empty after release", false, lock.is_locked());
        test_complete!("lock_until_expires_without_side_effects");
    }

    #[test]
    fn contended_lock_succeeds_after_release() {
        init_test("contended_lock_succeeds_after_release");
        let lock = Arc::new(ReentrantMutex::new());
        let (release, handle) = hold_elsewhere(&lock);

        let waiter_lock = Arc::clone(&lock);
        let waiter = thread::spawn(move || {
            waiter_lock.lock();
            waiter_lock.unlock();
        });

        thread::sleep(Duration::from_millis(10));
        release.send(()).expect("holder gone");
        handle.join().expect("holder panicked");
        waiter.join().expect("waiter panicked");
        test_complete!("contended_lock_succeeds_after_release");
    }

    #[test]
    fn with_lock_releases_on_panic() {
        init_test("with_lock_releases_on_panic");
        let lock = ReentrantMutex::new();

        let result = catch_unwind(AssertUnwindSafe(|| {
            lock.with_lock(|| panic!("deliberate panic inside the scope"))
        }));
        assert_with_log!(result.is_err(), "scope panicked", true, result.is_err());
        assert_with_log!(!lock.is_locked(), "released after panic", false, lock.is_locked());
        test_complete!("with_lock_releases_on_panic");
    }

    #[test]
    fn try_with_lock_skips_the_closure_when_busy() {
        init_test("try_with_lock_skips_the_closure_when_busy");
        let lock = Arc::new(ReentrantMutex::new());
        let (release, handle) = hold_elsewhere(&lock);

        let ran = lock.try_with_lock(|| 1);
        assert_with_log!(ran.is_none(), "closure skipped", true, ran.is_none());

        release.send(()).expect("holder gone");
        handle.join().expect("holder panicked");

        let ran = lock.try_with_lock(|| 1);
        assert_with_log!(ran == Some(1), "closure ran after release", Some(1), ran);
        test_complete!("try_with_lock_skips_the_closure_when_busy");
    }

    #[test]
    fn with_lock_until_runs_when_free() {
        init_test("with_lock_until_runs_when_free");
        let lock = ReentrantMutex::new();
        let value = lock.with_lock_until(Instant::now() + Duration::from_millis(50), || 7);
        assert_with_log!(value == Some(7), "closure ran", Some(7), value);
        assert_with_log!(!lock.is_locked(), "released", false, lock.is_locked());
        test_complete!("with_lock_until_runs_when_free");
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn unlock_of_never_held_lock_aborts() {
        let lock = ReentrantMutex::new();
        lock.unlock();
    }

    #[test]
    #[should_panic(expected = "release a lock held by")]
    fn unlock_by_non_owner_aborts() {
        let lock = Arc::new(ReentrantMutex::new());
        let (_release, _handle) = hold_elsewhere(&lock);
        lock.unlock();
    }

    #[test]
    fn default_deadline_expiry_is_a_suspected_deadlock() {
        init_test("default_deadline_expiry_is_a_suspected_deadlock");
        let lock = Arc::new(ReentrantMutex::new());
        let (release, handle) = hold_elsewhere(&lock);

        lock.set_default_deadline(Some(Instant::now()));
        let result = catch_unwind(AssertUnwindSafe(|| lock.lock()));
        let message = match result {
            Err(payload) => payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_default(),
            Ok(()) => String::from("acquisition unexpectedly succeeded"),
        };
        assert_with_log!(
            message.contains("suspected deadlock"),
            "panic names the fault",
            "suspected deadlock",
            message
        );

        release.send(()).expect("holder gone");
        handle.join().expect("holder panicked");
        test_complete!("default_deadline_expiry_is_a_suspected_deadlock");
    }
}
