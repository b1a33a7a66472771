//! Shared helpers for unit tests.

pub(crate) fn init_test_logging() {
    // Initialize tracing for tests if not already done
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Phase tracking macro for structured test logging.
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Assertion with logging for better test output.
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

pub(crate) use {assert_with_log, test_complete, test_phase};
