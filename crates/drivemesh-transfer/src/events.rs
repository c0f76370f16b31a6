//! Transfer event fan-out and speed estimation
//!
//! Every persisted mutation of a transfer record publishes the full updated
//! record. Subscribers get bounded buffers: intermediate updates are dropped
//! when a subscriber lags (it will coalesce on the next update), but a
//! terminal event is always delivered, waiting for buffer room if necessary.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use drivemesh_core::domain::{Transfer, TransferId};

/// Buffered events per subscriber.
const SUBSCRIBER_BUFFER: usize = 64;

/// Minimum wall-clock window between speed samples.
const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// One update on the bus: the full record plus the rolling speed estimate.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub transfer: Transfer,
    /// Rolling estimate in bytes per second, 0 until the first full sample
    /// window has elapsed.
    pub speed_bps: u64,
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        self.transfer.status.is_terminal()
    }
}

/// Multi-subscriber event bus with per-subscriber bounded buffers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<TransferEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    pub async fn subscribe(&self) -> mpsc::Receiver<TransferEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Publishes one event to every live subscriber.
    ///
    /// Non-terminal events are best-effort: a full buffer drops the event
    /// for that subscriber. Terminal events wait for room so they are never
    /// lost. Closed subscribers are pruned.
    pub async fn publish(&self, event: TransferEvent) {
        let mut subscribers = self.subscribers.lock().await;
        let mut live = Vec::with_capacity(subscribers.len());

        for tx in subscribers.drain(..) {
            if event.is_terminal() {
                if tx.send(event.clone()).await.is_ok() {
                    live.push(tx);
                }
            } else {
                match tx.try_send(event.clone()) {
                    Ok(()) => live.push(tx),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(transfer_id = %event.transfer.id, "Subscriber lagging, coalescing update");
                        live.push(tx);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }

        *subscribers = live;
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

/// Rolling per-transfer speed meter.
///
/// `(Δtransferred / Δwalltime)` over the most recent sample window of at
/// least 250 ms.
#[derive(Default)]
pub struct SpeedTracker {
    samples: DashMap<TransferId, Sample>,
}

struct Sample {
    at: Instant,
    bytes: u64,
    rate_bps: u64,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current cumulative byte count, returning the rolling
    /// estimate.
    pub fn observe(&self, id: &TransferId, transferred: u64) -> u64 {
        let now = Instant::now();
        let mut entry = self.samples.entry(id.clone()).or_insert(Sample {
            at: now,
            bytes: transferred,
            rate_bps: 0,
        });

        let elapsed = now.duration_since(entry.at);
        if elapsed >= SPEED_SAMPLE_INTERVAL {
            let delta = transferred.saturating_sub(entry.bytes);
            entry.rate_bps = (delta as f64 / elapsed.as_secs_f64()) as u64;
            entry.at = now;
            entry.bytes = transferred;
        }
        entry.rate_bps
    }

    /// Drops the sample state for a finished transfer.
    pub fn forget(&self, id: &TransferId) {
        self.samples.remove(id);
    }
}
