//! Fault taxonomy for contract violations.
//!
//! These faults describe impossible-by-contract states; they are reported
//! by panicking with the fault's `Display` message rather than through a
//! `Result`, because no caller-side recovery policy applies.

use crate::executor::ExecutorId;
use std::fmt;

/// A contract violation detected by a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFault {
    /// A release was attempted on a lock that no thread holds.
    ReleaseOfNeverHeld,
    /// A release was attempted by a thread other than the holder.
    ReleaseByNonOwner {
        /// The thread that actually holds the lock.
        holder: ExecutorId,
        /// The thread that attempted the release.
        caller: ExecutorId,
    },
    /// A shared release was attempted by a thread with no shared hold.
    ReleaseOfUnheldShared {
        /// The thread that attempted the release.
        caller: ExecutorId,
    },
    /// An acquisition waited past its default (infinite) bound, which only
    /// happens when the holder never releases.
    SuspectedDeadlock {
        /// The writer holding the lock when the wait bound expired, if it
        /// was still installed at dump time.
        holder: Option<ExecutorId>,
    },
}

impl fmt::Display for LockFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReleaseOfNeverHeld => {
                write!(f, "an attempt to release a lock that is not held")
            }
            Self::ReleaseByNonOwner { holder, caller } => {
                write!(
                    f,
                    "an attempt by {caller} to release a lock held by {holder}"
                )
            }
            Self::ReleaseOfUnheldShared { caller } => {
                write!(
                    f,
                    "an attempt by {caller} to release a shared lock it does not hold"
                )
            }
            Self::SuspectedDeadlock { holder: Some(holder) } => {
                write!(
                    f,
                    "suspected deadlock: acquisition wait bound expired while {holder} holds the lock"
                )
            }
            Self::SuspectedDeadlock { holder: None } => {
                write!(
                    f,
                    "suspected deadlock: acquisition wait bound expired with no holder installed"
                )
            }
        }
    }
}

impl std::error::Error for LockFault {}
