//! The risk computation worker: consumes snapshots in `seq` order, produces
//! one metrics record per snapshot and hands it to the rule engine.

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use tw_types::{Clock, Counters, DegenerateReason, RiskMetrics, Snapshot};

use crate::calculator::RiskCalculator;
use crate::history::MetricsHistory;

const POLL: Duration = Duration::from_millis(20);

/// Called once per blocked record when the metrics queue has been full for
/// longer than the configured threshold: `(seq, blocked_for)`.
pub type BackpressureHook = Arc<dyn Fn(u64, Duration) + Send + Sync>;

/// Shared equity figure; written by the control plane, read per record.
#[derive(Debug, Clone)]
pub struct EquityHandle(Arc<AtomicU64>);

impl EquityHandle {
    pub fn new(equity: f64) -> Self {
        Self(Arc::new(AtomicU64::new(equity.to_bits())))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, equity: f64) {
        self.0.store(equity.to_bits(), Ordering::Release);
    }
}

pub struct RiskWorker {
    calculator: RiskCalculator,
    equity: EquityHandle,
    clock: Arc<dyn Clock>,
    counters: Counters,
    history: Arc<MetricsHistory>,
    latency_budget: Duration,
    backpressure_alert: Duration,
    hook: Option<BackpressureHook>,
    last_seq: u64,
}

impl RiskWorker {
    pub fn new(
        calculator: RiskCalculator,
        equity: EquityHandle,
        clock: Arc<dyn Clock>,
        counters: Counters,
        history: Arc<MetricsHistory>,
        latency_budget: Duration,
    ) -> Self {
        Self {
            calculator,
            equity,
            clock,
            counters,
            history,
            latency_budget,
            backpressure_alert: Duration::from_secs(2),
            hook: None,
            last_seq: 0,
        }
    }

    pub fn with_backpressure_hook(mut self, after: Duration, hook: BackpressureHook) -> Self {
        self.backpressure_alert = after;
        self.hook = Some(hook);
        self
    }

    /// Computes the record for one snapshot. Returns `None` for a snapshot
    /// that is not newer than the last one processed.
    pub fn process(&mut self, snapshot: &Snapshot) -> Option<Arc<RiskMetrics>> {
        if snapshot.seq <= self.last_seq {
            error!(seq = snapshot.seq, last_seq = self.last_seq, "out-of-order snapshot ignored");
            return None;
        }
        self.last_seq = snapshot.seq;

        let started = Instant::now();
        let mut m = self.calculator.compute(snapshot, self.equity.get());
        let elapsed = started.elapsed();

        let now = self.clock.now();
        m.computed_at = if now > snapshot.taken_at { now } else { snapshot.taken_at };
        m.computation_us = elapsed.as_micros() as u64;

        if elapsed > self.latency_budget {
            self.counters.slow_computation.inc();
            warn!(
                seq = m.seq,
                computation_us = m.computation_us,
                budget_us = self.latency_budget.as_micros() as u64,
                "slow risk computation"
            );
        }
        if m.degenerate {
            self.counters.degenerate_state.inc();
            let routine = m.degenerate_reasons.iter().all(|r| {
                matches!(r, DegenerateReason::WindowWarming | DegenerateReason::EmptyPortfolio)
            });
            if routine {
                debug!(seq = m.seq, reasons = ?m.degenerate_reasons, "degenerate metrics");
            } else {
                warn!(seq = m.seq, reasons = ?m.degenerate_reasons, "degenerate metrics");
            }
        }

        let record = Arc::new(m);
        self.history.push(record.clone());
        self.counters.metrics_records.inc();
        Some(record)
    }

    /// Blocks until the rule engine takes the record. Returns `false` once the
    /// consumer is gone.
    fn forward(&self, out: &Sender<Arc<RiskMetrics>>, record: Arc<RiskMetrics>) -> bool {
        let record = match out.try_send(record) {
            Ok(()) => return true,
            Err(TrySendError::Disconnected(_)) => return false,
            Err(TrySendError::Full(record)) => record,
        };

        self.counters.backpressure.inc();
        let seq = record.seq;
        warn!(seq, "metrics queue full, risk pipeline blocked");
        let blocked_since = Instant::now();
        let mut reported = false;
        let mut pending = record;
        loop {
            match out.send_timeout(pending, POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Disconnected(_)) => return false,
                Err(SendTimeoutError::Timeout(back)) => {
                    pending = back;
                    let blocked = blocked_since.elapsed();
                    if !reported && blocked >= self.backpressure_alert {
                        reported = true;
                        error!(seq, blocked_ms = blocked.as_millis() as u64, "sustained backpressure");
                        if let Some(hook) = &self.hook {
                            hook(seq, blocked);
                        }
                    }
                }
            }
        }
    }

    /// Runs the worker on its own thread. After `cancel` is set the worker
    /// drains whatever is queued and exits, closing the metrics queue.
    pub fn spawn(
        mut self,
        snapshots: Receiver<Arc<Snapshot>>,
        out: Sender<Arc<RiskMetrics>>,
        cancel: Arc<AtomicBool>,
    ) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("tw-risk-worker".to_string())
            .spawn(move || {
                info!(
                    window = self.calculator.params().window_size,
                    "risk worker started"
                );
                loop {
                    match snapshots.recv_timeout(POLL) {
                        Ok(snapshot) => {
                            if let Some(record) = self.process(&snapshot) {
                                if !self.forward(&out, record) {
                                    break;
                                }
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if cancel.load(Ordering::Acquire) {
                                for snapshot in snapshots.try_iter() {
                                    if let Some(record) = self.process(&snapshot) {
                                        if !self.forward(&out, record) {
                                            break;
                                        }
                                    }
                                }
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!(last_seq = self.last_seq, "risk worker drained");
            })
    }
}
