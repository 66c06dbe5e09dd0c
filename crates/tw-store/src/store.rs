//! Market & position store.
//!
//! Ingest threads write prices and positions concurrently through sharded
//! maps, holding the read side of a gate lock. `take_snapshot` holds the write
//! side while it copies both maps, so a snapshot always reflects a prefix of
//! the applied events and never a torn fill.

use chrono::{DateTime, TimeZone, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use tw_types::{
    Ack, Clock, Counters, Fill, IngestError, InstrumentId, Position, PositionKey, Snapshot, Tick,
};

use crate::registry::InstrumentRegistry;

#[derive(Debug, Clone, Copy)]
struct PriceEntry {
    mid: Decimal,
    source_ts: DateTime<Utc>,
}

pub struct MarketStore {
    registry: Arc<InstrumentRegistry>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    gate: RwLock<()>,
    prices: DashMap<InstrumentId, PriceEntry>,
    positions: DashMap<PositionKey, Position>,
    seq: AtomicU64,
    accepting: AtomicBool,
    /// Ingest stamp high-water mark, in nanoseconds since the epoch.
    last_ingest_ns: AtomicI64,
    ticks_since_snapshot: AtomicU64,
    every_n_ticks: u64,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl MarketStore {
    /// Creates a quiesced store; call [`MarketStore::resume`] to accept events.
    pub fn new(
        registry: Arc<InstrumentRegistry>,
        clock: Arc<dyn Clock>,
        counters: Counters,
        every_n_ticks: u64,
    ) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            registry,
            clock,
            counters,
            gate: RwLock::new(()),
            prices: DashMap::new(),
            positions: DashMap::new(),
            seq: AtomicU64::new(0),
            accepting: AtomicBool::new(false),
            last_ingest_ns: AtomicI64::new(i64::MIN),
            ticks_since_snapshot: AtomicU64::new(0),
            every_n_ticks: every_n_ticks.max(1),
            wake_tx,
            wake_rx,
        }
    }

    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.registry
    }

    // --- ingest control ---

    pub fn resume(&self) {
        self.accepting.store(true, Ordering::SeqCst);
        info!("market store accepting events");
    }

    pub fn quiesce(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("market store quiesced");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Receiver woken every `every_n_ticks` applied ticks.
    pub fn wake_signal(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    /// Sequence number of the latest snapshot, `0` before the first.
    pub fn latest_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    // --- ingest ---

    /// Updates the latest price of the tick's instrument. A tick whose source
    /// timestamp is not newer than the stored one is acknowledged but ignored.
    pub fn apply_tick(&self, mut tick: Tick) -> Result<Ack, IngestError> {
        self.admit(&tick.instrument_id)
            .and_then(|_| tick.validate())
            .inspect_err(|_| self.counters.rejected_inputs.inc())?;
        let mid = tick.mid_price().ok_or_else(|| IngestError::InvalidTick {
            reason: "tick carries no price".to_string(),
        })?;

        let _gate = self.gate.read();
        tick.ingest_timestamp = self.stamp();

        let mut applied = false;
        self.prices
            .entry(tick.instrument_id.clone())
            .and_modify(|entry| {
                if tick.source_timestamp > entry.source_ts {
                    *entry = PriceEntry {
                        mid,
                        source_ts: tick.source_timestamp,
                    };
                    applied = true;
                }
            })
            .or_insert_with(|| {
                applied = true;
                PriceEntry {
                    mid,
                    source_ts: tick.source_timestamp,
                }
            });

        if applied {
            self.counters.ticks.inc();
            let n = self.ticks_since_snapshot.fetch_add(1, Ordering::Relaxed) + 1;
            if n % self.every_n_ticks == 0 {
                // Publisher already has a pending wake-up if this fails
                let _ = self.wake_tx.try_send(());
            }
        }

        Ok(Ack {
            ingest_timestamp: tick.ingest_timestamp,
            applied,
        })
    }

    /// Applies a fill to its position in one step.
    pub fn apply_fill(&self, fill: Fill) -> Result<Ack, IngestError> {
        self.admit(&fill.instrument_id)
            .and_then(|_| fill.validate())
            .inspect_err(|_| self.counters.rejected_inputs.inc())?;

        let _gate = self.gate.read();
        let ingest_timestamp = self.stamp();
        let key = fill.key();
        self.positions
            .entry(key.clone())
            .or_insert_with(|| Position::new(&key, fill.timestamp))
            .apply_fill(&fill)
            .inspect_err(|e| {
                self.counters.rejected_inputs.inc();
                warn!(position = %key, error = %e, "fill rejected");
            })?;
        self.counters.fills.inc();
        debug!(position = %key, qty = %fill.signed_quantity, price = %fill.price, "fill applied");

        Ok(Ack {
            ingest_timestamp,
            applied: true,
        })
    }

    fn admit(&self, instrument_id: &str) -> Result<(), IngestError> {
        if !self.is_accepting() {
            return Err(IngestError::NotAccepting);
        }
        if !self.registry.contains(instrument_id) {
            return Err(IngestError::UnknownInstrument {
                instrument_id: instrument_id.to_string(),
            });
        }
        Ok(())
    }

    /// Ingest timestamp: the clock reading, pushed forward when needed so
    /// stamps strictly increase across all ingesting threads.
    fn stamp(&self) -> DateTime<Utc> {
        let now = nanos(self.clock.now());
        let prev = self
            .last_ingest_ns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        Utc.timestamp_nanos(now.max(prev.saturating_add(1)))
    }

    // --- snapshots ---

    /// Produces a consistent snapshot with a fresh `seq`.
    pub fn take_snapshot(&self) -> Snapshot {
        let _gate = self.gate.write();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        let last_ingest = self.last_ingest_ns.load(Ordering::SeqCst);
        let now = self.clock.now();
        let taken_at = if last_ingest > nanos(now) {
            Utc.timestamp_nanos(last_ingest)
        } else {
            now
        };

        let prices: HashMap<InstrumentId, Decimal> = self
            .prices
            .iter()
            .map(|e| (e.key().clone(), e.value().mid))
            .collect();
        let positions: HashMap<PositionKey, Position> = self
            .positions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.ticks_since_snapshot.store(0, Ordering::Relaxed);
        self.counters.snapshots.inc();

        Snapshot {
            seq,
            taken_at,
            prices,
            positions,
        }
    }

    pub fn position(&self, key: &PositionKey) -> Option<Position> {
        self.positions.get(key).map(|p| p.clone())
    }

    pub fn price(&self, instrument_id: &str) -> Option<Decimal> {
        self.prices.get(instrument_id).map(|p| p.mid)
    }
}

fn nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}
