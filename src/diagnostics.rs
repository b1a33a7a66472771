//! Diagnostic output for suspected deadlocks.
//!
//! When an acquisition waits past its default (infinite) bound, the lock
//! dumps its holder state here before panicking. The sink defaults to
//! standard error and can be swapped for tests.

use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::io::{self, Write};

static SINK: Mutex<Option<Box<dyn Write + Send>>> = Mutex::new(None);

/// Redirects diagnostic dumps to `sink` instead of standard error.
pub fn set_sink(sink: Box<dyn Write + Send>) {
    *SINK.lock() = Some(sink);
}

/// Restores the default standard-error sink.
pub fn reset_sink() {
    *SINK.lock() = None;
}

/// Writes a holder dump to the configured sink.
///
/// Write failures are swallowed: the dump is best-effort context for the
/// abort that follows it.
pub(crate) fn emit(report: &str) {
    let mut slot = SINK.lock();
    match slot.as_mut() {
        Some(sink) => {
            let _ = sink.write_all(report.as_bytes());
            let _ = sink.flush();
        }
        None => {
            let _ = io::stderr().write_all(report.as_bytes());
        }
    }
}

/// Captures the waiting thread's own stack.
///
/// Stacks of other threads are not reachable through supported interfaces,
/// so the dump degrades to the holder's identity plus the waiter's stack.
pub(crate) fn waiter_backtrace() -> String {
    Backtrace::force_capture().to_string()
}
