//! Rolling time-window event counter.
//!
//! Accepts a stream of keyed increment events and maintains an approximate
//! count per key over the most recent N completed wall-clock intervals, for
//! lightweight popularity tracking ("hits per product over the last three
//! minutes, rotated every minute").
//!
//! Two pieces compose as a pipeline. The [`Counter`] actor serializes
//! concurrent increments into an in-flight [`Tally`] and flushes it to a
//! [`Store`] on every interval boundary. The store owns the sliding window
//! of completed tallies, rotates it on its own boundary-aligned cadence and
//! answers aggregate reports. Two backends are provided: an in-process
//! [`RingStore`] and a remote [`SortedSetStore`]. Both cadences align to
//! wall-clock multiples of the configured interval (see `tidemark-clock`),
//! so counter and store rotate in lockstep without exchanging signals.

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

use rustc_hash::FxHashMap;

pub mod counter;
pub mod store;

pub use counter::Counter;
pub use store::ring::RingStore;
pub use store::sorted_set::SortedSetStore;
pub use store::{CollectError, Element, Store};

/// Per-key counts accumulated within one time slot.
///
/// Created empty, mutated by the owning actor and handed off by value on
/// flush; a store folds it into the open window slot and discards it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    counts: FxHashMap<String, u64>,
}

impl Tally {
    /// Create an empty tally.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `key`. Counts saturate at `u64::MAX`.
    pub fn record(&mut self, key: String) {
        let count = self.counts.entry(key).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Fold another tally's counts into this one additively.
    pub fn merge(&mut self, other: Tally) {
        for (key, count) in other.counts {
            let total = self.counts.entry(key).or_insert(0);
            *total = total.saturating_add(count);
        }
    }

    /// Whether any key has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Number of distinct keys recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// The count recorded for `key`, zero if absent.
    #[must_use]
    pub fn count(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Iterate over recorded keys and counts, in arbitrary order.
    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(key, count)| (key.as_str(), *count))
    }
}

impl FromIterator<(String, u64)> for Tally {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            counts: iter.into_iter().collect(),
        }
    }
}
