use crossbeam_channel::RecvTimeoutError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use tw_types::SnapshotCadence;

use crate::queue::SnapshotQueue;
use crate::store::MarketStore;

/// Spawns the snapshot publisher. It takes a snapshot when the store signals
/// `every_n_ticks` new ticks or when `every_us` elapses, whichever is first.
/// After `cancel` is set it publishes one final snapshot and exits.
pub fn spawn_publisher(
    store: Arc<MarketStore>,
    queue: SnapshotQueue,
    cadence: SnapshotCadence,
    cancel: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    let wake = store.wake_signal();
    let period = Duration::from_micros(cadence.every_us.max(1));

    thread::Builder::new()
        .name("tw-snapshot-publisher".to_string())
        .spawn(move || {
            info!(every_us = cadence.every_us, every_n_ticks = cadence.every_n_ticks, "snapshot publisher started");
            while !cancel.load(Ordering::Acquire) {
                match wake.recv_timeout(period) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if cancel.load(Ordering::Acquire) {
                    break;
                }
                let snapshot = store.take_snapshot();
                if !queue.publish(Arc::new(snapshot)) {
                    debug!("snapshot consumer gone");
                    break;
                }
            }
            let last = store.take_snapshot();
            let seq = last.seq;
            queue.publish(Arc::new(last));
            info!(seq, "snapshot publisher drained");
        })
}
