//! One-shot close-only wake channels.
//!
//! A [`WakeSignal`] is a broadcast signal consumed by close-once semantics:
//! it is never sent to, only dropped. Every [`WakeListener`] cloned from it
//! observes the close and returns from its wait. Wakeups are advisory; the
//! lock that owns the signal re-checks its state after every wake.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Select, Sender};
use std::time::Instant;

/// Outcome of waiting on a wake signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The signal was closed; re-check lock state and retry.
    Woken,
    /// The wait bound expired before the signal closed.
    TimedOut,
}

/// A single-use broadcast signal, closed by dropping it.
///
/// The zero-capacity channel never carries a message; listeners block in
/// `recv` until the held [`Sender`] is dropped, at which point every
/// listener sees the disconnect at once.
#[derive(Debug)]
pub(crate) struct WakeSignal {
    _closer: Sender<()>,
    rx: Receiver<()>,
}

impl WakeSignal {
    pub(crate) fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self { _closer: tx, rx }
    }

    /// Registers a listener that will observe the close.
    pub(crate) fn listen(&self) -> WakeListener {
        WakeListener {
            rx: self.rx.clone(),
        }
    }
}

/// A handle waiting for one [`WakeSignal`] to close.
#[derive(Debug)]
pub(crate) struct WakeListener {
    rx: Receiver<()>,
}

impl WakeListener {
    /// Blocks until the signal closes or `bound` passes.
    ///
    /// `None` waits forever.
    pub(crate) fn wait(&self, bound: Option<Instant>) -> WaitOutcome {
        match bound {
            None => {
                // The only way out is the sender being dropped.
                let _ = self.rx.recv();
                WaitOutcome::Woken
            }
            Some(at) => match self.rx.recv_deadline(at) {
                Err(RecvTimeoutError::Timeout) => WaitOutcome::TimedOut,
                _ => WaitOutcome::Woken,
            },
        }
    }
}

/// Blocks until either signal closes or `bound` passes.
pub(crate) fn wait_either(
    first: &WakeListener,
    second: &WakeListener,
    bound: Option<Instant>,
) -> WaitOutcome {
    let mut select = Select::new();
    let first_index = select.recv(&first.rx);
    let second_index = select.recv(&second.rx);

    let op = match bound {
        None => select.select(),
        Some(at) => match select.select_deadline(at) {
            Ok(op) => op,
            Err(_) => return WaitOutcome::TimedOut,
        },
    };

    // A selected operation must be completed against its receiver; a closed
    // channel completes immediately with a disconnect error.
    let index = op.index();
    if index == first_index {
        let _ = op.recv(&first.rx);
    } else {
        debug_assert_eq!(index, second_index);
        let _ = op.recv(&second.rx);
    }
    WaitOutcome::Woken
}
