//! Storage backends for completed tallies.
//!
//! A store owns the sliding window: `retained + 1` slots of which exactly
//! one is open for writes at any time. Flushed tallies merge into the open
//! slot; rotation evicts the oldest slot on every wall-clock boundary and
//! reports sum every slot except the open one.

use std::error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Tally;

pub mod ring;
pub mod sorted_set;

/// A reported key and its aggregate count across the retained window.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Element {
    /// The tracked key.
    pub key: String,
    /// Total count across all completed window slots.
    pub count: u64,
}

/// Error produced when a store cannot assemble a report.
#[derive(thiserror::Error, Debug)]
#[error("unable to collect window contents: {source}")]
pub struct CollectError {
    #[source]
    source: Box<dyn error::Error + Send + Sync>,
}

impl CollectError {
    pub(crate) fn new(source: impl Into<Box<dyn error::Error + Send + Sync>>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// The sliding window of completed tallies.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Merge a completed tally additively into the currently open slot.
    ///
    /// Blocks only for the handoff into the store's rotation actor; a
    /// stalled backend backpressures the caller here. Backend failures are
    /// not reported -- ingestion is best effort.
    async fn ingest(&self, tally: Tally);

    /// Sum counts per key across all slots except the currently open one.
    ///
    /// # Errors
    ///
    /// Function will return an error if the backing state cannot be
    /// retrieved or merged.
    async fn collect(&self) -> Result<Vec<Element>, CollectError>;

    /// Whether [`Store::collect`] already returns elements sorted by
    /// descending count. When false the caller sorts.
    fn sorted(&self) -> bool;

    /// Start the store's rotation actor. A second call is a no-op.
    fn start(&self);

    /// Stop the store's rotation actor. A second call is a no-op. The
    /// window's contents are not flushed anywhere on stop.
    fn stop(&self);
}
