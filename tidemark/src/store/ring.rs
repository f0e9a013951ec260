//! The in-process ring-buffer backend.
//!
//! Holds the window as a fixed `Vec` of tallies with an explicit current
//! index advanced by modular arithmetic. Contents are lost on process exit;
//! this backend trades durability for zero external dependencies.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{info, warn};

use super::{CollectError, Element, Store};
use crate::Tally;

/// Configuration for [`RingStore`].
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// How often the window slides, aligned to wall-clock multiples of this
    /// duration.
    #[serde(with = "humantime_serde")]
    pub rotation_interval: Duration,
    /// Number of fully elapsed intervals retained and reported.
    pub retained_intervals: NonZeroUsize,
}

/// Fixed-capacity circular window of tally slots.
///
/// Capacity is `retained + 1`: the extra slot is the one currently
/// accumulating, excluded from collection. Length never changes after
/// construction.
#[derive(Debug)]
struct Window {
    slots: Vec<Tally>,
    current: usize,
}

impl Window {
    fn new(retained: NonZeroUsize) -> Self {
        Self {
            slots: vec![Tally::new(); retained.get() + 1],
            current: 0,
        }
    }

    fn ingest(&mut self, tally: Tally) {
        if tally.is_empty() {
            return;
        }
        self.slots[self.current].merge(tally);
    }

    /// Advance the current index, evicting whatever occupied that position.
    /// The evicted contents went stale `retained` rotations ago.
    fn rotate(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
        self.slots[self.current] = Tally::new();
    }

    fn collect(&self) -> Vec<Element> {
        let mut total = Tally::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            if idx == self.current {
                continue;
            }
            total.merge(slot.clone());
        }
        total
            .iter()
            .map(|(key, count)| Element {
                key: key.to_owned(),
                count,
            })
            .collect()
    }
}

/// The in-process backend.
#[derive(Debug)]
pub struct RingStore {
    rotation_interval: Duration,
    window: Arc<Mutex<Window>>,
    deposits: mpsc::Sender<Tally>,
    intake: Mutex<Option<mpsc::Receiver<Tally>>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    stop_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RingStore {
    /// Create a new `RingStore`, all slots empty. The rotation actor is not
    /// running until [`Store::start`] is called.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (deposits, intake) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        Self {
            rotation_interval: config.rotation_interval,
            window: Arc::new(Mutex::new(Window::new(config.retained_intervals))),
            deposits,
            intake: Mutex::new(Some(intake)),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx: Mutex::new(Some(stop_rx)),
        }
    }
}

#[async_trait]
impl Store for RingStore {
    async fn ingest(&self, tally: Tally) {
        // Send failure means the rotation actor already stopped; the flush
        // is discarded.
        let _ = self.deposits.send(tally).await;
    }

    async fn collect(&self) -> Result<Vec<Element>, CollectError> {
        Ok(self.window.lock().expect("window lock poisoned").collect())
    }

    fn sorted(&self) -> bool {
        false
    }

    fn start(&self) {
        let intake = self.intake.lock().expect("intake lock poisoned").take();
        let stop = self.stop_rx.lock().expect("stop lock poisoned").take();
        let (Some(intake), Some(stop)) = (intake, stop) else {
            warn!("ring store rotation actor already started");
            return;
        };
        tokio::spawn(run(
            self.rotation_interval,
            Arc::clone(&self.window),
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

/// Rotation actor: serializes all window mutation by multiplexing deposits,
/// the wall-clock alignment timer and the stop signal.
async fn run(
    rotation_interval: Duration,
    window: Arc<Mutex<Window>>,
    mut intake: mpsc::Receiver<Tally>,
    mut stop: oneshot::Receiver<()>,
) {
    info!(interval = ?rotation_interval, "ring store rotation actor started");
    let boundary = tidemark_clock::sleep_until_boundary(rotation_interval);
    tokio::pin!(boundary);
    loop {
        tokio::select! {
            () = boundary.as_mut() => {
                window.lock().expect("window lock poisoned").rotate();
                boundary
                    .as_mut()
                    .reset(Instant::now() + tidemark_clock::next_boundary_delay(rotation_interval));
            }
            tally = intake.recv() => match tally {
                Some(tally) => window.lock().expect("window lock poisoned").ingest(tally),
                None => {
                    info!("all ring store handles dropped");
                    return;
                }
            },
            _sig = &mut stop => {
                info!("ring store stop signal received");
                return;
            }
        }
    }
}
