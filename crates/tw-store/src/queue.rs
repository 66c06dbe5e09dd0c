use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::Arc;
use tracing::warn;

use tw_types::{Counters, Snapshot};

/// Producer side of the bounded snapshot queue. On overflow the oldest queued
/// snapshot is discarded so the newest always gets in; publishing never blocks.
#[derive(Clone)]
pub struct SnapshotQueue {
    tx: Sender<Arc<Snapshot>>,
    evict: Receiver<Arc<Snapshot>>,
    counters: Counters,
}

pub fn snapshot_queue(capacity: usize, counters: Counters) -> (SnapshotQueue, Receiver<Arc<Snapshot>>) {
    let (tx, rx) = bounded(capacity.max(1));
    let queue = SnapshotQueue {
        tx,
        evict: rx.clone(),
        counters,
    };
    (queue, rx)
}

impl SnapshotQueue {
    /// Enqueues a snapshot. Returns `false` once the consumer is gone.
    pub fn publish(&self, snapshot: Arc<Snapshot>) -> bool {
        let mut pending = snapshot;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    if let Ok(dropped) = self.evict.try_recv() {
                        self.counters.snapshot_dropped.inc();
                        warn!(seq = dropped.seq, "snapshot queue full, dropped oldest");
                    }
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn snap(seq: u64) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            seq,
            taken_at: Utc::now(),
            prices: HashMap::new(),
            positions: HashMap::new(),
        })
    }

    #[test]
    fn overflow_drops_oldest() {
        let counters = Counters::new().unwrap();
        let (queue, rx) = snapshot_queue(2, counters.clone());
        for seq in 1..=5 {
            assert!(queue.publish(snap(seq)));
        }
        assert_eq!(counters.snapshot_dropped.get(), 3);
        let seqs: Vec<u64> = rx.try_iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn no_drop_below_capacity() {
        let counters = Counters::new().unwrap();
        let (queue, rx) = snapshot_queue(4, counters.clone());
        queue.publish(snap(1));
        queue.publish(snap(2));
        assert_eq!(queue.len(), 2);
        assert_eq!(counters.snapshot_dropped.get(), 0);
        assert_eq!(rx.recv().unwrap().seq, 1);
    }
}
