use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

use tw_types::RiskMetrics;

/// Bounded, seq-ordered history of emitted metrics records, read by the
/// control plane.
#[derive(Debug)]
pub struct MetricsHistory {
    records: RwLock<VecDeque<Arc<RiskMetrics>>>,
    capacity: usize,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, record: Arc<RiskMetrics>) {
        let mut records = self.records.write();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn latest(&self) -> Option<Arc<RiskMetrics>> {
        self.records.read().back().cloned()
    }

    pub fn latest_seq(&self) -> u64 {
        self.records.read().back().map(|m| m.seq).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Records with `computed_at` in `[from, to]`; open bounds are unbounded.
    pub fn range(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<Arc<RiskMetrics>> {
        self.records
            .read()
            .iter()
            .filter(|m| from.map_or(true, |f| m.computed_at >= f))
            .filter(|m| to.map_or(true, |t| m.computed_at <= t))
            .cloned()
            .collect()
    }

    /// Records with `seq` in `[from, to]`.
    pub fn seq_range(&self, from: u64, to: u64) -> Vec<Arc<RiskMetrics>> {
        self.records
            .read()
            .iter()
            .filter(|m| m.seq >= from && m.seq <= to)
            .cloned()
            .collect()
    }
}
