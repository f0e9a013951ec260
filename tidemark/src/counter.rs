//! The tally aggregator.
//!
//! A [`Counter`] is a cloneless handle over a single actor task that owns
//! the in-flight [`Tally`]. Producers only enqueue keys; the actor
//! multiplexes increments, the wall-clock alignment timer and the stop
//! signal, so all tally mutation is serialized without a lock. On every
//! boundary firing the accumulated tally is handed to the attached store
//! and a fresh one installed.

use std::{
    mem,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::info;

use crate::{
    Tally,
    store::{CollectError, Element, Store},
};

/// Configuration for [`Counter`].
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// How often the in-flight tally is flushed to the attached store,
    /// aligned to wall-clock multiples of this duration. Usually equal to
    /// the store's rotation interval; a shorter flush interval accumulates
    /// multiple flushes into the store's open slot.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// The rolling event counter.
pub struct Counter<S> {
    keys: mpsc::Sender<String>,
    store: Option<Arc<S>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl<S> std::fmt::Debug for Counter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("attached", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl<S> Counter<S>
where
    S: Store,
{
    /// Create a counter attached to `store`, starting both the aggregator
    /// actor and the store's rotation actor.
    #[must_use]
    pub fn new(config: Config, store: S) -> Self {
        let store = Arc::new(store);
        store.start();
        Self::spawn(config.flush_interval, Some(store))
    }

    /// Create a counter with no store attached. Flushed tallies are
    /// discarded and [`Counter::report`] always returns an empty list.
    #[must_use]
    pub fn detached(config: Config) -> Self {
        Self::spawn(config.flush_interval, None)
    }

    fn spawn(flush_interval: Duration, store: Option<Arc<S>>) -> Self {
        let (keys, intake) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(run(flush_interval, store.clone(), intake, stop_rx));
        Self {
            keys,
            store,
            stop: Mutex::new(Some(stop_tx)),
        }
    }

    /// Record one occurrence of `key` in the currently accumulating tally.
    ///
    /// Blocks only for the handoff into the aggregator actor; a slow store
    /// backpressures callers here. Increments arriving after
    /// [`Counter::stop`] are discarded.
    pub async fn increment(&self, key: impl Into<String>) {
        // The only send failure is a stopped aggregator; the increment is
        // discarded in that case.
        let _ = self.keys.send(key.into()).await;
    }

    /// Aggregate counts across all completed window slots of the attached
    /// store, sorted by descending count. Ties keep the order the store
    /// returned them in.
    ///
    /// Returns an empty list when no store is attached.
    ///
    /// # Errors
    ///
    /// Function will return an error if the store cannot assemble the
    /// report, for instance when a remote backend is unreachable. Failed
    /// reports are not retried; the next call is independent.
    pub async fn report(&self) -> Result<Vec<Element>, CollectError> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let mut elements = store.collect().await?;
        if !store.sorted() {
            elements.sort_by(|a, b| b.count.cmp(&a.count));
        }
        Ok(elements)
    }

    /// Stop the aggregator actor and the rotation actor of the store this
    /// counter started. A tally accumulated since the last flush is lost.
    /// A second call is a no-op.
    ///
    /// # Panics
    ///
    /// Function will panic if the internal stop lock is poisoned.
    pub fn stop(&self) {
        if let Some(sender) = self.stop.lock().expect("stop lock poisoned").take() {
            // Send failure means the actor already exited.
            let _ = sender.send(());
            if let Some(store) = &self.store {
                store.stop();
            }
        }
    }
}

/// Aggregator actor: the single thread of control that mutates the
/// in-flight tally.
async fn run<S>(
    flush_interval: Duration,
    store: Option<Arc<S>>,
    mut intake: mpsc::Receiver<String>,
    mut stop: oneshot::Receiver<()>,
) where
    S: Store,
{
    info!(interval = ?flush_interval, "counter aggregator started");
    let mut tally = Tally::new();
    let boundary = tidemark_clock::sleep_until_boundary(flush_interval);
    tokio::pin!(boundary);
    loop {
        tokio::select! {
            () = boundary.as_mut() => {
                let flushed = mem::take(&mut tally);
                if let Some(store) = &store {
                    store.ingest(flushed).await;
                }
                boundary
                    .as_mut()
                    .reset(Instant::now() + tidemark_clock::next_boundary_delay(flush_interval));
            }
            key = intake.recv() => match key {
                Some(key) => tally.record(key),
                None => {
                    info!("all counter handles dropped");
                    return;
                }
            },
            _sig = &mut stop => {
                info!("counter aggregator stop signal received");
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{num::NonZeroUsize, sync::Arc, time::Duration};

    use async_trait::async_trait;

    use super::{Config, Counter, run};
    use crate::{
        Tally,
        store::{CollectError, Element, Store, ring},
    };

    fn element(key: &str, count: u64) -> Element {
        Element {
            key: key.to_string(),
            count,
        }
    }

    /// A store that returns a canned report.
    #[derive(Debug)]
    struct Canned {
        elements: Vec<Element>,
        pre_sorted: bool,
        offline: bool,
    }

    #[async_trait]
    impl Store for Canned {
        async fn ingest(&self, _tally: Tally) {}

        async fn collect(&self) -> Result<Vec<Element>, CollectError> {
            if self.offline {
                return Err(CollectError::new("service offline"));
            }
            Ok(self.elements.clone())
        }

        fn sorted(&self) -> bool {
            self.pre_sorted
        }

        fn start(&self) {}

        fn stop(&self) {}
    }

    fn config(flush_interval: Duration) -> Config {
        Config { flush_interval }
    }

    #[tokio::test]
    async fn report_sorts_for_unsorted_backends() {
        let counter = Counter::new(
            config(Duration::from_secs(3600)),
            Canned {
                elements: vec![element("b", 2), element("a", 5), element("c", 2)],
                pre_sorted: false,
                offline: false,
            },
        );

        let elements = counter.report().await.expect("report");
        // Descending by count; the b/c tie keeps store order.
        assert_eq!(
            elements,
            vec![element("a", 5), element("b", 2), element("c", 2)]
        );
        counter.stop();
    }

    #[tokio::test]
    async fn report_trusts_presorted_backends() {
        let unsorted = vec![element("low", 1), element("high", 9)];
        let counter = Counter::new(
            config(Duration::from_secs(3600)),
            Canned {
                elements: unsorted.clone(),
                pre_sorted: true,
                offline: false,
            },
        );

        let elements = counter.report().await.expect("report");
        assert_eq!(elements, unsorted);
        counter.stop();
    }

    #[tokio::test]
    async fn report_without_store_is_empty() {
        let counter = Counter::<Canned>::detached(config(Duration::from_secs(3600)));
        counter.increment("ignored").await;

        let elements = counter.report().await.expect("report");
        assert!(elements.is_empty());
        counter.stop();
    }

    #[tokio::test]
    async fn collect_failures_surface_through_report() {
        let counter = Counter::new(
            config(Duration::from_secs(3600)),
            Canned {
                elements: Vec::new(),
                pre_sorted: false,
                offline: true,
            },
        );

        assert!(counter.report().await.is_err());
        counter.stop();
    }

    #[tokio::test]
    async fn increments_after_stop_are_discarded() {
        let counter = Counter::new(
            config(Duration::from_secs(3600)),
            Canned {
                elements: Vec::new(),
                pre_sorted: false,
                offline: false,
            },
        );
        counter.stop();
        // Must return promptly rather than wedge on a dead actor.
        counter.increment("late").await;
        counter.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_increments_are_not_lost() {
        let store = ring::RingStore::new(ring::Config {
            rotation_interval: Duration::from_millis(200),
            retained_intervals: NonZeroUsize::new(5).unwrap(),
        });
        let counter = Arc::new(Counter::new(config(Duration::from_millis(200)), store));

        let mut producers = Vec::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            producers.push(tokio::spawn(async move {
                for _ in 0..250 {
                    counter.increment("popular").await;
                }
            }));
        }
        for producer in producers {
            producer.await.expect("producer panicked");
        }

        // Wait out enough boundaries for the flush to land and the slot
        // holding it to complete.
        tokio::time::sleep(Duration::from_millis(700)).await;

        let elements = counter.report().await.expect("report");
        let total: u64 = elements
            .iter()
            .filter(|element| element.key == "popular")
            .map(|element| element.count)
            .sum();
        assert_eq!(total, 1000);
        counter.stop();
    }

    // `run` is exercised through `Counter`, but a detached aggregator must
    // also drain and discard cleanly when its handle goes away.
    #[tokio::test]
    async fn actor_exits_when_handles_drop() {
        let (keys, intake) = tokio::sync::mpsc::channel(1);
        let (_stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(run::<Canned>(
            Duration::from_secs(3600),
            None,
            intake,
            stop_rx,
        ));

        keys.send("k".to_string()).await.expect("send");
        drop(keys);
        handle.await.expect("actor panicked");
    }
}
