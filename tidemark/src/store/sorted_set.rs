//! The remote sorted-set backend.
//!
//! Keeps the window as `retained + 1` sorted sets on a remote service, one
//! per slot, named `<prefix>:<slot>`. Slot identifiers cycle through
//! `0..=retained`; rotation repurposes the oldest set as the new open slot
//! after clearing it, rather than moving any data. Reports are assembled
//! remotely by union-merging all completed slots and reading back the top
//! entries, already sorted by the service.
//!
//! The service sees three transient keys besides the slots:
//! `<prefix>:temp` batches score increments during ingest and
//! `<prefix>:collect` holds the merged window during collection.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    time::Instant,
};
use tracing::{info, warn};

use super::{CollectError, Element, Store};
use crate::Tally;

/// Number of elements a collection reads back from the merged window.
const TOP_K: usize = 10;

/// Name of the transient set used to batch-increment scores.
const MERGE_SET: &str = "temp";

/// Name of the transient set collections merge into.
const COLLECT_SET: &str = "collect";

/// Key namespace shared by all tidemark sorted-set stores.
const KEY_SPACE: &str = "tidemark:store";

/// Configuration for [`SortedSetStore`].
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// How often the window slides, aligned to wall-clock multiples of this
    /// duration.
    #[serde(with = "humantime_serde")]
    pub rotation_interval: Duration,
    /// Number of fully elapsed intervals retained and reported.
    pub retained_intervals: NonZeroUsize,
    /// Distinguishes this store's keys from other stores sharing the same
    /// service.
    pub name: String,
}

/// The sorted-set operations the store requires of a remote service.
///
/// Any [`redis::aio::ConnectionLike`] connection implements this; tests
/// substitute an in-memory fake.
#[async_trait]
pub trait SortedSets {
    /// Error produced by the remote service.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Set `count` as the score of each member in `set`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the service rejects the command or
    /// is unreachable.
    async fn add_scores(
        &mut self,
        set: &str,
        members: &[(String, u64)],
    ) -> Result<(), Self::Error>;

    /// Union `sources` into `dest`, summing scores per member. Missing
    /// sources are treated as empty.
    ///
    /// # Errors
    ///
    /// Function will return an error if the service rejects the command or
    /// is unreachable.
    async fn merge_into(&mut self, dest: &str, sources: &[String]) -> Result<(), Self::Error>;

    /// Delete `set` entirely.
    ///
    /// # Errors
    ///
    /// Function will return an error if the service rejects the command or
    /// is unreachable.
    async fn delete(&mut self, set: &str) -> Result<(), Self::Error>;

    /// The top `k` members of `set` by descending score.
    ///
    /// # Errors
    ///
    /// Function will return an error if the service rejects the command or
    /// is unreachable.
    async fn top(&mut self, set: &str, k: usize) -> Result<Vec<Element>, Self::Error>;
}

#[async_trait]
impl<C> SortedSets for C
where
    C: redis::aio::ConnectionLike + Send,
{
    type Error = redis::RedisError;

    async fn add_scores(
        &mut self,
        set: &str,
        members: &[(String, u64)],
    ) -> Result<(), Self::Error> {
        let items: Vec<(u64, &str)> = members
            .iter()
            .map(|(member, count)| (*count, member.as_str()))
            .collect();
        let () = self.zadd_multiple(set, &items).await?;
        Ok(())
    }

    async fn merge_into(&mut self, dest: &str, sources: &[String]) -> Result<(), Self::Error> {
        let sources: Vec<&str> = sources.iter().map(String::as_str).collect();
        let () = self.zunionstore(dest, &sources).await?;
        Ok(())
    }

    async fn delete(&mut self, set: &str) -> Result<(), Self::Error> {
        let () = self.del(set).await?;
        Ok(())
    }

    async fn top(&mut self, set: &str, k: usize) -> Result<Vec<Element>, Self::Error> {
        let stop = isize::try_from(k).unwrap_or(isize::MAX).saturating_sub(1);
        let entries: Vec<(String, u64)> = self.zrevrange_withscores(set, 0, stop).await?;
        Ok(entries
            .into_iter()
            .map(|(key, count)| Element { key, count })
            .collect())
    }
}

/// Remote window state: the connection plus the slot-identifier ring.
///
/// Every remote sequence runs with this whole struct locked, serializing
/// ingest, rotation and collection within the process. A concurrent process
/// sharing the prefix can still interleave at the service; accuracy there is
/// eventually consistent within one interval.
struct Inner<C> {
    conn: C,
    slots: Vec<String>,
    current: usize,
    prefix: String,
}

impl<C> Inner<C>
where
    C: SortedSets,
{
    fn new(retained: NonZeroUsize, name: &str, conn: C) -> Self {
        let slots = (0..=retained.get()).map(|slot| slot.to_string()).collect();
        Self {
            conn,
            slots,
            current: 0,
            prefix: format!("{KEY_SPACE}:{name}"),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn current_key(&self) -> String {
        self.key(&self.slots[self.current])
    }

    /// Batch the tally into the transient merge set, union it into the
    /// current slot, then drop the transient set. Sorted-set services lack a
    /// batch add-or-increment primitive; this is the minimal round-trip
    /// equivalent.
    async fn ingest(&mut self, tally: &Tally) -> Result<(), C::Error> {
        if tally.is_empty() {
            return Ok(());
        }
        let members: Vec<(String, u64)> = tally
            .iter()
            .map(|(key, count)| (key.to_owned(), count))
            .collect();
        let merge_set = self.key(MERGE_SET);
        let current = self.current_key();

        self.conn.add_scores(&merge_set, &members).await?;
        self.conn
            .merge_into(&current, &[current.clone(), merge_set.clone()])
            .await?;
        self.conn.delete(&merge_set).await
    }

    /// Advance to the next slot identifier and clear the set it names; its
    /// contents went stale `retained` rotations ago.
    async fn rotate(&mut self) -> Result<(), C::Error> {
        self.current = (self.current + 1) % self.slots.len();
        let current = self.current_key();
        self.conn.delete(&current).await
    }

    /// Union every completed slot into the transient collection set and
    /// read back the top entries by descending score.
    async fn collect(&mut self) -> Result<Vec<Element>, C::Error> {
        let collect_set = self.key(COLLECT_SET);
        let sources: Vec<String> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != self.current)
            .map(|(_, slot)| self.key(slot))
            .collect();

        self.conn.delete(&collect_set).await?;
        self.conn.merge_into(&collect_set, &sources).await?;
        self.conn.top(&collect_set, TOP_K).await
    }
}

/// The remote sorted-set backend.
pub struct SortedSetStore<C> {
    rotation_interval: Duration,
    inner: Arc<Mutex<Inner<C>>>,
    deposits: mpsc::Sender<Tally>,
    intake: StdMutex<Option<mpsc::Receiver<Tally>>>,
    stop_tx: StdMutex<Option<oneshot::Sender<()>>>,
    stop_rx: StdMutex<Option<oneshot::Receiver<()>>>,
}

impl<C> fmt::Debug for SortedSetStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedSetStore")
            .field("rotation_interval", &self.rotation_interval)
            .finish_non_exhaustive()
    }
}

impl<C> SortedSetStore<C>
where
    C: SortedSets + Send + 'static,
{
    /// Create a store over an established connection. The rotation actor is
    /// not running until [`Store::start`] is called.
    #[must_use]
    pub fn new(config: Config, conn: C) -> Self {
        let (deposits, intake) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        Self {
            rotation_interval: config.rotation_interval,
            inner: Arc::new(Mutex::new(Inner::new(
                config.retained_intervals,
                &config.name,
                conn,
            ))),
            deposits,
            intake: StdMutex::new(Some(intake)),
            stop_tx: StdMutex::new(Some(stop_tx)),
            stop_rx: StdMutex::new(Some(stop_rx)),
        }
    }
}

#[async_trait]
impl<C> Store for SortedSetStore<C>
where
    C: SortedSets + Send + 'static,
{
    async fn ingest(&self, tally: Tally) {
        // Send failure means the rotation actor already stopped; the flush
        // is discarded.
        let _ = self.deposits.send(tally).await;
    }

    async fn collect(&self) -> Result<Vec<Element>, CollectError> {
        let mut inner = self.inner.lock().await;
        inner.collect().await.map_err(CollectError::new)
    }

    fn sorted(&self) -> bool {
        true
    }

    fn start(&self) {
        let intake = self.intake.lock().expect("intake lock poisoned").take();
        let stop = self.stop_rx.lock().expect("stop lock poisoned").take();
        let (Some(intake), Some(stop)) = (intake, stop) else {
            warn!("sorted-set store rotation actor already started");
            return;
        };
        tokio::spawn(run(
            self.rotation_interval,
            Arc::clone(&self.inner),
            intake,
            stop,
        ));
    }

    fn stop(&self) {
        if let Some(sender) = self.stop_tx.lock().expect("stop lock poisoned").take() {
            // Send failure means the actor already exited.
            let _ = sender.send(());
        }
    }
}

/// Rotation actor: serializes ingest and rotation by multiplexing deposits,
/// the wall-clock alignment timer and the stop signal. Remote failures here
/// are best effort and only logged; collection is the surface that reports
/// errors.
async fn run<C>(
    rotation_interval: Duration,
    inner: Arc<Mutex<Inner<C>>>,
    mut intake: mpsc::Receiver<Tally>,
    mut stop: oneshot::Receiver<()>,
) where
    C: SortedSets + Send + 'static,
{
    info!(interval = ?rotation_interval, "sorted-set store rotation actor started");
    let boundary = tidemark_clock::sleep_until_boundary(rotation_interval);
    tokio::pin!(boundary);
    loop {
        tokio::select! {
            () = boundary.as_mut() => {
                if let Err(error) = inner.lock().await.rotate().await {
                    // A failed clear leaves stale members in the repurposed
                    // slot until the next successful rotation over it.
                    warn!(%error, "window rotation failed");
                }
                boundary
                    .as_mut()
                    .reset(Instant::now() + tidemark_clock::next_boundary_delay(rotation_interval));
            }
            tally = intake.recv() => match tally {
                Some(tally) => {
                    if let Err(error) = inner.lock().await.ingest(&tally).await {
                        warn!(%error, "tally ingest failed, counts dropped");
                    }
                }
                None => {
                    info!("all sorted-set store handles dropped");
                    return;
                }
            },
            _sig = &mut stop => {
                info!("sorted-set store stop signal received");
                return;
            }
        }
    }
}
