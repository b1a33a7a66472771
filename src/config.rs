//! Process-wide lock configuration.
//!
//! Each lock can carry its own default deadline; when it does not, blocking
//! acquisitions fall back to the process-wide value configured here, and
//! when that is also unset they wait forever. Expiry of a default deadline
//! is treated as a suspected deadlock, so setting a short process-wide
//! value in a test binary turns every silent deadlock into a loud abort.

use parking_lot::Mutex;
use std::time::Instant;

static DEFAULT_DEADLINE: Mutex<Option<Instant>> = Mutex::new(None);

/// Sets the process-wide default deadline for blocking acquisitions.
///
/// `None` restores the infinite default.
pub fn set_default_deadline(deadline: Option<Instant>) {
    *DEFAULT_DEADLINE.lock() = deadline;
}

/// Returns the process-wide default deadline, if one is configured.
#[must_use]
pub fn default_deadline() -> Option<Instant> {
    *DEFAULT_DEADLINE.lock()
}

/// Resolves the wait bound for one blocking acquisition.
///
/// An explicit deadline wins; otherwise the per-lock default applies, then
/// the process-wide default. The flag is `true` when the resolved bound
/// came from a default, whose expiry is a suspected deadlock rather than
/// an ordinary timeout.
pub(crate) fn resolve_wait_bound(
    explicit: Option<Instant>,
    per_lock: Option<Instant>,
) -> (Option<Instant>, bool) {
    match explicit {
        Some(at) => (Some(at), false),
        None => (per_lock.or_else(default_deadline), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_deadline_round_trips() {
        assert_eq!(default_deadline(), None);

        let at = Instant::now() + Duration::from_secs(5);
        set_default_deadline(Some(at));
        assert_eq!(default_deadline(), Some(at));

        set_default_deadline(None);
        assert_eq!(default_deadline(), None);
    }
}
