//! Wall-clock interval alignment.
//!
//! The tidemark counter and its stores rotate on wall-clock boundaries that
//! are exact multiples of the configured interval since the Unix epoch, not
//! on a fixed offset from process start. Two independently scheduled actors
//! configured with the same interval therefore rotate in lockstep without
//! exchanging any coordination messages, even across processes.
//!
//! The timer produced here is one-shot. Callers must re-arm it after every
//! firing by recomputing the delay from the wall clock; a repeating ticker
//! would drift off the boundary grid.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::{self, Sleep};

/// Fixed amount added past every boundary so that timer granularity cannot
/// fire the sleep fractionally before the boundary itself.
pub const BOUNDARY_SKEW: Duration = Duration::from_micros(10);

/// Delay from `since_epoch` until the next boundary that is an exact
/// multiple of `interval` since the Unix epoch, plus [`BOUNDARY_SKEW`].
///
/// A caller sitting exactly on a boundary is pointed at the next one, never
/// at itself. The pure arithmetic behind [`next_boundary_delay`], split out
/// so it can be exercised without a clock.
///
/// # Panics
///
/// Function will panic if `interval` is zero or longer than `u64::MAX`
/// nanoseconds.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn until_next_boundary(interval: Duration, since_epoch: Duration) -> Duration {
    assert!(!interval.is_zero(), "alignment interval must be non-zero");
    let unit = interval.as_nanos();
    assert!(
        unit <= u128::from(u64::MAX),
        "alignment interval exceeds u64 nanoseconds"
    );
    let from = since_epoch.as_nanos();
    let next = (from / unit + 1) * unit;
    // `next - from` is at most `unit`, which was asserted to fit in u64.
    Duration::from_nanos((next - from) as u64) + BOUNDARY_SKEW
}

/// Delay from now until the next wall-clock boundary for `interval`.
///
/// # Panics
///
/// Function will panic if `interval` is zero or longer than `u64::MAX`
/// nanoseconds.
#[must_use]
pub fn next_boundary_delay(interval: Duration) -> Duration {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    until_next_boundary(interval, since_epoch)
}

/// A one-shot sleep that completes just after the next wall-clock boundary
/// for `interval`.
///
/// Not a repeating timer. After each firing, re-arm with a fresh call or by
/// resetting the sleep to `Instant::now() + next_boundary_delay(interval)`.
///
/// # Panics
///
/// Function will panic if `interval` is zero or longer than `u64::MAX`
/// nanoseconds.
#[must_use]
pub fn sleep_until_boundary(interval: Duration) -> Sleep {
    time::sleep(next_boundary_delay(interval))
}
