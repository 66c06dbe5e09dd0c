//! Engine assembly.
//!
//! Wires the store, snapshot publisher, risk worker, rule engine and alert
//! manager together with bounded queues, replays the journal before ingest is
//! enabled, and tears everything down in pipeline order.

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use tw_alerts::{
    build_router, read_journal, AimExit, AimHandle, AimTiming, AlertManager, FileJournal,
    IsolationBook, IsolationPolicy, Journal, JournalRecord, Notifier, NullJournal,
};
use tw_risk::{CalculatorParams, EquityHandle, MetricsHistory, RiskCalculator, RiskWorker};
use tw_rules::{PathContext, RuleBook, RuleEngine};
use tw_store::{snapshot_queue, spawn_publisher, InstrumentRegistry, MarketStore};
use tw_types::{
    config_error, Ack, AlertPayload, CandidateAlert, Clock, ConfigError, Counters, EngineConfig,
    Fill, JournalError, Priority, RiskMetrics, RulePatch, RuleSetSpec, Target, Tick, TwError,
    TwResult, BACKPRESSURE_RULE,
};

/// Start-up failure, by exit code class.
#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("journal replay failed: {0}")]
    Replay(#[from] JournalError),

    #[error("engine failed to start: {0}")]
    Runtime(#[from] TwError),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl StartError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartError::Config(_) => 1,
            StartError::Replay(_) => 2,
            StartError::Runtime(_) | StartError::Spawn(_) => 3,
        }
    }
}

/// Liveness and readiness as reported by the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub ready: bool,
    pub accepting: bool,
    pub unsafe_reason: Option<String>,
    pub latest_snapshot_seq: u64,
    pub latest_metrics_seq: u64,
    pub aim_queue_depth: i64,
    pub rule_set_version: u64,
}

struct Workers {
    publisher: JoinHandle<()>,
    risk: JoinHandle<()>,
    rules: JoinHandle<()>,
    aim: JoinHandle<AimExit>,
}

pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    counters: Counters,
    store: Arc<MarketStore>,
    rules: Arc<RuleBook>,
    history: Arc<MetricsHistory>,
    equity: EquityHandle,
    aim: AimHandle,
    cancel: Arc<AtomicBool>,
    unsafe_reason: Arc<Mutex<Option<String>>>,
    fatal: Arc<Notify>,
    workers: Mutex<Option<Workers>>,
}

impl Engine {
    /// Validates the configuration, replays the journal and starts every
    /// worker. Ingest is enabled last.
    pub fn start(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self, StartError> {
        config.validate()?;
        let counters = Counters::new()?;

        let registry = Arc::new(InstrumentRegistry::from_instruments(&config.instruments)?);
        let instruments = registry.current();
        let store = Arc::new(MarketStore::new(
            registry,
            clock.clone(),
            counters.clone(),
            config.snapshot_cadence.every_n_ticks,
        ));

        let rules = Arc::new(
            RuleBook::new(
                &config.rule_set(),
                PathContext {
                    var_confidences: config.confidences.var.clone(),
                    es_confidences: config.confidences.es.clone(),
                },
            )
            .map_err(|e| config_error!("{}", e))?,
        );
        let isolations = IsolationBook::new(IsolationPolicy {
            operators: config.operators.clone(),
            auto_isolation: config.auto_isolation_rules.clone(),
            auto_release: config.auto_release.clone(),
            release_timeout_ms: config.release_timeout_ms,
        })
        .map_err(|e| config_error!("{}", e))?
        .with_retention(config.retention.released_isolations);
        let notifier =
            Notifier::from_config(&config.sinks, counters.clone()).map_err(|e| config_error!("{}", e))?;
        let router = build_router(&config.router).map_err(|e| config_error!("{}", e))?;

        let (journal, records) = open_journal(&config)?;

        let unsafe_reason = Arc::new(Mutex::new(None));
        let fatal = Arc::new(Notify::new());
        let hook = {
            let store = store.clone();
            let unsafe_reason = unsafe_reason.clone();
            let fatal = fatal.clone();
            Arc::new(move |reason: &str| {
                store.quiesce();
                *unsafe_reason.lock() = Some(reason.to_string());
                fatal.notify_one();
            })
        };
        let mut manager = AlertManager::new(
            isolations,
            journal,
            notifier,
            router,
            clock.clone(),
            counters.clone(),
            config.escalation.unacked_after_ms,
        )
        .with_alert_retention(config.retention.resolved_alerts)
        .with_fatal_hook(hook);
        manager.replay(records)?;

        // --- queues ---
        let caps = config.queue_capacity;
        let (snapshots, snapshot_rx) = snapshot_queue(caps.snapshots, counters.clone());
        let (metrics_tx, metrics_rx) = bounded(caps.metrics);
        let (evaluations_tx, evaluations_rx) = bounded(caps.alerts);
        let (commands_tx, commands_rx) = bounded(caps.commands);
        let aim = AimHandle::new(commands_tx, Duration::from_secs(5));

        // --- workers, downstream first ---
        let aim_thread = tw_alerts::spawn(
            manager,
            evaluations_rx,
            commands_rx,
            counters.clone(),
            AimTiming {
                tick: Duration::from_millis(config.aim_tick_ms),
                flush_deadline: Duration::from_millis(config.flush_deadline_ms),
            },
        )?;
        let rules_thread = RuleEngine::new(rules.clone(), clock.clone(), counters.clone())
            .spawn(metrics_rx, evaluations_tx)?;

        let history = Arc::new(MetricsHistory::new(config.history_capacity));
        let equity = EquityHandle::new(config.equity);
        let calculator = RiskCalculator::new(
            instruments,
            CalculatorParams {
                window_size: config.window_size,
                min_observations: config.min_observations(),
                var_confidences: config.confidences.var.clone(),
                es_confidences: config.confidences.es.clone(),
                tail_sigma: config.tail_sigma,
            },
        );
        let backpressure = {
            let aim = aim.clone();
            let clock = clock.clone();
            Arc::new(move |seq: u64, blocked: Duration| {
                let raised = aim.raise(CandidateAlert {
                    rule_id: BACKPRESSURE_RULE.to_string(),
                    target: Target::System,
                    priority: Priority::High,
                    triggered_seq: seq,
                    triggered_at: clock.now(),
                    rule_set_version: 0,
                    payload: AlertPayload::internal(format!(
                        "metrics queue blocked for {} ms",
                        blocked.as_millis()
                    )),
                });
                if !raised {
                    warn!(seq, "backpressure alert not queued");
                }
            })
        };
        let risk_thread = RiskWorker::new(
            calculator,
            equity.clone(),
            clock.clone(),
            counters.clone(),
            history.clone(),
            Duration::from_micros(config.latency_budget_us),
        )
        .with_backpressure_hook(Duration::from_millis(config.backpressure_alert_ms), backpressure)
        // Not cancelled directly: it drains once the publisher drops the queue
        .spawn(snapshot_rx, metrics_tx, Arc::new(AtomicBool::new(false)))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let publisher_thread =
            spawn_publisher(store.clone(), snapshots, config.snapshot_cadence, cancel.clone())?;

        store.resume();
        info!(
            instruments = config.instruments.len(),
            rule_set_version = rules.version(),
            "engine started"
        );

        Ok(Self {
            config,
            clock,
            counters,
            store,
            rules,
            history,
            equity,
            aim,
            cancel,
            unsafe_reason,
            fatal,
            workers: Mutex::new(Some(Workers {
                publisher: publisher_thread,
                risk: risk_thread,
                rules: rules_thread,
                aim: aim_thread,
            })),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn aim(&self) -> &AimHandle {
        &self.aim
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Notified once when the alert manager enters safe mode.
    pub fn fatal_signal(&self) -> Arc<Notify> {
        self.fatal.clone()
    }

    pub fn unsafe_reason(&self) -> Option<String> {
        self.unsafe_reason.lock().clone()
    }

    // --- ingress ---

    pub fn ingest_tick(&self, tick: Tick) -> TwResult<Ack> {
        Ok(self.store.apply_tick(tick)?)
    }

    pub fn ingest_fill(&self, fill: Fill) -> TwResult<Ack> {
        Ok(self.store.apply_fill(fill)?)
    }

    pub fn set_equity(&self, equity: f64) -> TwResult<()> {
        if !equity.is_finite() || equity < 0.0 {
            return Err(config_error!("equity must be finite and non-negative, got {}", equity).into());
        }
        self.equity.set(equity);
        info!(equity, "equity updated");
        Ok(())
    }

    pub fn equity(&self) -> f64 {
        self.equity.get()
    }

    // --- metrics ---

    pub fn current_metrics(&self) -> Option<Arc<RiskMetrics>> {
        self.history.latest()
    }

    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    // --- rules ---

    pub fn rule_set(&self) -> (u64, RuleSetSpec) {
        let set = self.rules.load();
        (set.version, set.spec.clone())
    }

    pub fn publish_rules(&self, spec: RuleSetSpec) -> TwResult<u64> {
        Ok(self.rules.publish(spec)?)
    }

    pub fn patch_rule(&self, rule_id: &str, patch: &RulePatch) -> TwResult<u64> {
        Ok(self.rules.patch_rule(rule_id, patch)?)
    }

    // --- health ---

    pub fn status(&self) -> EngineStatus {
        let accepting = self.store.is_accepting();
        let unsafe_reason = self.unsafe_reason();
        let latest_snapshot_seq = self.store.latest_seq();
        let latest_metrics_seq = self.history.latest_seq();
        let aim_queue_depth = self.counters.aim_queue_depth.get();
        let lag = latest_snapshot_seq.saturating_sub(latest_metrics_seq);
        let ready = accepting
            && unsafe_reason.is_none()
            && lag <= self.config.ready_lag_snapshots
            && aim_queue_depth < self.config.ready_aim_depth as i64;
        EngineStatus {
            ready,
            accepting,
            unsafe_reason,
            latest_snapshot_seq,
            latest_metrics_seq,
            aim_queue_depth,
            rule_set_version: self.rules.version(),
        }
    }

    // --- shutdown ---

    /// Quiesces ingest, lets the publisher emit its final snapshot, drains
    /// the risk worker and rule engine, then waits for the alert manager's
    /// bounded notification flush. Returns the process exit code.
    pub fn shutdown(&self) -> i32 {
        let Some(workers) = self.workers.lock().take() else {
            return self.exit_code();
        };
        info!("engine shutting down");
        self.store.quiesce();
        self.cancel.store(true, Ordering::Release);

        // Each worker exits once its upstream queue disconnects
        join("snapshot publisher", workers.publisher);
        join("risk worker", workers.risk);
        join("rule engine", workers.rules);
        match workers.aim.join() {
            Ok(exit) => {
                if exit.abandoned_notifications > 0 {
                    warn!(abandoned = exit.abandoned_notifications, "notifications abandoned at shutdown");
                }
            }
            Err(_) => error!("alert manager thread panicked"),
        }
        let code = self.exit_code();
        info!(exit_code = code, "engine stopped");
        code
    }

    fn exit_code(&self) -> i32 {
        if self.unsafe_reason().is_some() {
            3
        } else {
            0
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.workers.lock().is_some() {
            self.shutdown();
        }
    }
}

fn join(name: &str, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        error!(worker = name, "worker thread panicked");
    }
}

fn open_journal(config: &EngineConfig) -> Result<(Box<dyn Journal>, Vec<JournalRecord>), JournalError> {
    match &config.journal_path {
        Some(path) => {
            let records = read_journal(path)?;
            let journal = FileJournal::open(path, config.journal_fsync)?;
            info!(path = %path.display(), records = records.len(), "journal opened");
            Ok((Box::new(journal), records))
        }
        None => {
            warn!("no journal_path configured; alert state will not survive a restart");
            Ok((Box::new(NullJournal), Vec::new()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::thread;
    use tw_types::{
        AckState, ActivationRequest, AlertFilter, AssetClass, Comparator, Instrument,
        IsolationMethod, ManualClock, Rule, SnapshotCadence, SystemClock,
    };

    pub(crate) fn test_config() -> EngineConfig {
        EngineConfig {
            instruments: vec![Instrument::new("AAA", "USD", AssetClass::Equity)],
            window_size: 3,
            min_observations: Some(2),
            snapshot_cadence: SnapshotCadence {
                every_n_ticks: 1,
                every_us: 2_000,
            },
            equity: 1_000_000.0,
            rules: vec![Rule {
                rule_id: "gross-limit".into(),
                metric_path: "gross_exposure".into(),
                comparator: Comparator::Gt,
                threshold: 50_000.0,
                priority: Priority::High,
                cooldown_ms: 60_000,
                enabled: true,
                auto_resolve: false,
            }],
            operators: vec!["ops".into()],
            flush_deadline_ms: 200,
            aim_tick_ms: 10,
            ..EngineConfig::default()
        }
    }

    fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> T {
        for _ in 0..400 {
            if let Some(v) = poll() {
                return v;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn invalid_config_is_exit_code_one() {
        let mut config = test_config();
        config.instruments.clear();
        let err = Engine::start(config, Arc::new(SystemClock)).err().unwrap();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn bad_rule_path_is_exit_code_one() {
        let mut config = test_config();
        config.rules[0].metric_path = "no_such_metric".into();
        let err = Engine::start(config, Arc::new(SystemClock)).err().unwrap();
        assert!(matches!(err, StartError::Config(_)));
    }

    #[test]
    fn corrupt_journal_is_exit_code_two() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aim.jsonl");
        std::fs::write(&path, "not json\n{}\n").unwrap();
        let mut config = test_config();
        config.journal_path = Some(path);
        let err = Engine::start(config, Arc::new(SystemClock)).err().unwrap();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn fills_flow_through_to_alerts() {
        let engine = Engine::start(test_config(), Arc::new(SystemClock)).unwrap();
        assert!(engine.status().accepting);

        let now = Utc::now();
        engine
            .ingest_tick(Tick::quote("AAA", dec!(99.5), dec!(100.5), now))
            .unwrap();
        engine
            .ingest_fill(Fill::new("s1", "AAA", dec!(1000), dec!(100), now))
            .unwrap();
        engine
            .ingest_tick(Tick::quote("AAA", dec!(99.5), dec!(100.5), now + chrono::Duration::milliseconds(1)))
            .unwrap();

        let alerts = wait_for(|| {
            let alerts = engine.aim().alerts(AlertFilter::Active).ok()?;
            (!alerts.is_empty()).then_some(alerts)
        });
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, "gross-limit");
        let m = engine.current_metrics().unwrap();
        assert_eq!(m.gross_exposure, 100_000.0);
        assert_eq!(engine.shutdown(), 0);
        assert!(!engine.status().accepting);
    }

    #[test]
    fn unknown_instrument_is_rejected_at_the_boundary() {
        let engine = Engine::start(test_config(), Arc::new(SystemClock)).unwrap();
        let err = engine
            .ingest_tick(Tick::quote("ZZZ", dec!(1), dec!(2), Utc::now()))
            .unwrap_err();
        assert_eq!(err.kind(), "UnknownInstrument");
        assert_eq!(engine.counters().rejected_inputs.get(), 1);
        engine.shutdown();
    }

    #[test]
    fn restart_replays_acked_alert_and_active_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.journal_path = Some(dir.path().join("aim.jsonl"));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));

        let (alert_id, action_id) = {
            let engine = Engine::start(config.clone(), clock.clone()).unwrap();
            let now = clock.now();
            engine.ingest_tick(Tick::quote("AAA", dec!(100), dec!(100), now)).unwrap();
            engine
                .ingest_fill(Fill::new("s1", "AAA", dec!(1000), dec!(100), now))
                .unwrap();
            let alert = wait_for(|| engine.aim().alerts(AlertFilter::Active).ok()?.pop());
            engine.aim().ack(alert.alert_id, "ops").unwrap();
            let action = engine
                .aim()
                .activate(ActivationRequest {
                    method: IsolationMethod::StrategySuspension,
                    target: Target::Strategy("s1".into()),
                    reason: "limit breach".into(),
                    principal: "ops".into(),
                    hold_ms: None,
                    severity_score: 0.7,
                })
                .unwrap();
            assert_eq!(engine.shutdown(), 0);
            (alert.alert_id, action.action_id)
        };

        let engine = Engine::start(config, clock).unwrap();
        let alert = engine.aim().alert(alert_id).unwrap().unwrap();
        assert_eq!(alert.ack_state, AckState::Acked);
        let active = engine.aim().isolations(true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].action_id, action_id);
        assert_eq!(engine.counters().isolations_active.get(), 1);
        engine.shutdown();
    }

    #[test]
    fn equity_must_be_finite() {
        let engine = Engine::start(test_config(), Arc::new(SystemClock)).unwrap();
        assert!(engine.set_equity(f64::NAN).is_err());
        engine.set_equity(2_000_000.0).unwrap();
        assert_eq!(engine.equity(), 2_000_000.0);
        engine.shutdown();
    }
}
