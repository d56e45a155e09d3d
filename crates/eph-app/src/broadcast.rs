use crossfire::mpmc;
use crossfire::{MAsyncTx, MRx, TryRecvError, TrySendError, detect_backoff_cfg};
use eph_core::{SnapshotPublisher, WorldSnapshot};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub type SnapshotSender = MAsyncTx<WorldSnapshot>;
pub type SnapshotReceiver = MRx<WorldSnapshot>;

/// Bounded snapshot channel; a slow consumer loses snapshots rather than stalling the tick.
pub fn create_snapshot_bus(capacity: usize) -> (SnapshotSender, SnapshotReceiver) {
    detect_backoff_cfg();
    mpmc::bounded_tx_async_rx_blocking(capacity.max(1))
}

/// Publishes world snapshots with `try_send`, counting drops.
pub struct BroadcastPublisher {
    sender: SnapshotSender,
    dropped: Arc<AtomicU64>,
}

impl BroadcastPublisher {
    #[must_use]
    pub fn new(sender: SnapshotSender) -> Self {
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of snapshots dropped because the channel was full or closed.
    #[must_use]
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl SnapshotPublisher for BroadcastPublisher {
    fn publish(&mut self, snapshot: WorldSnapshot) {
        match self.sender.try_send(snapshot) {
            Ok(()) => {}
            Err(TrySendError::Full(snapshot)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(tick = snapshot.tick.0, "broadcast queue full; dropping snapshot");
            }
            Err(TrySendError::Disconnected(snapshot)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(tick = snapshot.tick.0, "broadcast receiver gone; dropping snapshot");
            }
        }
    }
}

/// Hand every queued snapshot to `consume`, returning how many were drained.
pub fn drain_snapshots(
    receiver: &SnapshotReceiver,
    mut consume: impl FnMut(WorldSnapshot),
) -> usize {
    let mut drained = 0;
    loop {
        match receiver.try_recv() {
            Ok(snapshot) => {
                consume(snapshot);
                drained += 1;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    drained
}
