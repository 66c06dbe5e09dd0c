//! Rule evaluation.
//!
//! [`RuleEngine::evaluate`] is a function of the metrics record, the rule set
//! loaded for that record and the per-`(rule, target)` last-fired times the
//! engine keeps for debouncing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use tw_types::{
    AlertPayload, CandidateAlert, Clock, Counters, IsolationCandidate, IsolationSource,
    RiskMetrics, Target,
};

use crate::book::{RuleBook, RuleSet};

/// Rule engine output for one metrics record. Sent even when empty so the
/// alert manager sees every record.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub metrics: Arc<RiskMetrics>,
    pub rule_set_version: u64,
    pub alerts: Vec<CandidateAlert>,
    pub isolations: Vec<IsolationCandidate>,
    /// `(rule_id, target)` pairs of auto-resolve rules whose condition is false.
    pub cleared: Vec<(String, Target)>,
}

pub struct RuleEngine {
    book: Arc<RuleBook>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    last_fired: HashMap<(String, String), DateTime<Utc>>,
    seen_version: u64,
    misconfig_logged: HashSet<String>,
}

impl RuleEngine {
    pub fn new(book: Arc<RuleBook>, clock: Arc<dyn Clock>, counters: Counters) -> Self {
        Self {
            book,
            clock,
            counters,
            last_fired: HashMap::new(),
            seen_version: 0,
            misconfig_logged: HashSet::new(),
        }
    }

    pub fn evaluate(&mut self, metrics: Arc<RiskMetrics>) -> Evaluation {
        // One load per record: the whole record sees a single version
        let set = self.book.load();
        if set.version != self.seen_version {
            self.on_new_version(&set);
        }
        let now = self.clock.now();
        let context = metrics.headline();

        let mut alerts = Vec::new();
        let mut isolations = Vec::new();
        let mut cleared = Vec::new();
        let mut breached = HashSet::new();

        for compiled in &set.rules {
            let rule = &compiled.rule;
            if !rule.enabled {
                continue;
            }
            let Some(resolved) = compiled.path.resolve(&metrics) else {
                self.misconfigured(&rule.rule_id, &rule.metric_path, metrics.seq);
                continue;
            };
            for (target, value) in resolved {
                if !rule.comparator.holds(value, rule.threshold) {
                    if rule.auto_resolve && value.is_finite() {
                        cleared.push((rule.rule_id.clone(), target));
                    }
                    continue;
                }
                breached.insert((rule.rule_id.clone(), target.clone()));
                if !self.fire(&rule.rule_id, &target, rule.cooldown_ms, now) {
                    continue;
                }
                alerts.push(CandidateAlert {
                    rule_id: rule.rule_id.clone(),
                    target,
                    priority: rule.priority,
                    triggered_seq: metrics.seq,
                    triggered_at: now,
                    rule_set_version: set.version,
                    payload: AlertPayload {
                        metric_path: rule.metric_path.clone(),
                        value,
                        threshold: rule.threshold,
                        comparator: Some(rule.comparator),
                        context: context.clone(),
                        message: format!(
                            "{} = {} {} {}",
                            rule.metric_path, value, rule.comparator, rule.threshold
                        ),
                    },
                });
            }
        }

        // A key breached anywhere in this record is never cleared by it
        cleared.retain(|key| !breached.contains(key));

        for compiled in &set.isolation_rules {
            let rule = &compiled.rule;
            if !rule.enabled {
                continue;
            }
            let Some(resolved) = compiled.path.resolve(&metrics) else {
                self.misconfigured(&rule.rule_id, &rule.metric_path, metrics.seq);
                continue;
            };
            for (resolved_target, value) in resolved {
                if !rule.comparator.holds(value, rule.threshold) {
                    continue;
                }
                let target = compiled.target_for(&resolved_target);
                if !self.fire(&rule.rule_id, &target, rule.cooldown_ms, now) {
                    continue;
                }
                isolations.push(IsolationCandidate {
                    rule_id: rule.rule_id.clone(),
                    method: rule.method,
                    target,
                    source: IsolationSource::Rule,
                    reason: format!(
                        "{}: {} = {} {} {}",
                        rule.rule_id, rule.metric_path, value, rule.comparator, rule.threshold
                    ),
                    triggered_seq: metrics.seq,
                    hold_ms: rule.hold_ms,
                    severity_score: rule.severity_score,
                });
            }
        }

        if !alerts.is_empty() || !isolations.is_empty() {
            self.counters.candidate_alerts.inc_by(alerts.len() as u64);
            debug!(
                seq = metrics.seq,
                version = set.version,
                alerts = alerts.len(),
                isolations = isolations.len(),
                "rules fired"
            );
        }

        Evaluation {
            metrics,
            rule_set_version: set.version,
            alerts,
            isolations,
            cleared,
        }
    }

    /// Applies the cooldown; records the firing time when the rule may fire.
    fn fire(&mut self, rule_id: &str, target: &Target, cooldown_ms: u64, now: DateTime<Utc>) -> bool {
        let key = (rule_id.to_string(), target.key());
        if let Some(last) = self.last_fired.get(&key) {
            let cooldown = ChronoDuration::milliseconds(cooldown_ms.min(i64::MAX as u64) as i64);
            if now - *last < cooldown {
                return false;
            }
        }
        self.last_fired.insert(key, now);
        true
    }

    fn misconfigured(&mut self, rule_id: &str, path: &str, seq: u64) {
        self.counters.rule_misconfig.inc();
        if self.misconfig_logged.insert(rule_id.to_string()) {
            warn!(rule_id, path, seq, "metric path not present in record, rule skipped");
        }
    }

    fn on_new_version(&mut self, set: &RuleSet) {
        // Cooldowns survive reloads for rules that still exist
        self.last_fired.retain(|(rule_id, _), _| set.contains(rule_id));
        self.misconfig_logged.clear();
        self.seen_version = set.version;
        debug!(version = set.version, "rule engine picked up rule set");
    }

    /// Runs the engine on its own thread until the metrics queue closes. The
    /// output queue is never dropped from: sends block.
    pub fn spawn(
        mut self,
        input: Receiver<Arc<RiskMetrics>>,
        out: Sender<Evaluation>,
    ) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("tw-rule-engine".to_string())
            .spawn(move || {
                info!(version = self.book.version(), "rule engine started");
                let mut last_seq = 0;
                for metrics in input.iter() {
                    last_seq = metrics.seq;
                    let evaluation = self.evaluate(metrics);
                    if out.send(evaluation).is_err() {
                        warn!(seq = last_seq, "alert manager gone, rule engine stopping");
                        break;
                    }
                    self.counters.aim_queue_depth.set(out.len() as i64);
                }
                info!(last_seq, "rule engine drained");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::PathContext;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tw_risk::{CalculatorParams, RiskCalculator};
    use tw_types::{
        AssetClass, Comparator, ExposureBreakdown, Instrument, IsolationMethod, IsolationRule,
        ManualClock, Position, PositionKey, Priority, Rule, RuleSetSpec, Snapshot,
    };

    fn rule(id: &str, path: &str, cmp: Comparator, threshold: f64, cooldown_ms: u64) -> Rule {
        Rule {
            rule_id: id.to_string(),
            metric_path: path.to_string(),
            comparator: cmp,
            threshold,
            priority: Priority::High,
            cooldown_ms,
            enabled: true,
            auto_resolve: false,
        }
    }

    fn ctx() -> PathContext {
        PathContext {
            var_confidences: vec![0.95, 0.99],
            es_confidences: vec![0.975],
        }
    }

    fn engine(rules: Vec<Rule>, clock: Arc<ManualClock>) -> (RuleEngine, Arc<RuleBook>, Counters) {
        let spec = RuleSetSpec {
            rules,
            isolation_rules: vec![],
        };
        let book = Arc::new(RuleBook::new(&spec, ctx()).unwrap());
        let counters = Counters::new().unwrap();
        (RuleEngine::new(book.clone(), clock, counters.clone()), book, counters)
    }

    fn record(seq: u64, var_1d: f64) -> Arc<RiskMetrics> {
        let mut m = RiskMetrics::empty(seq, Utc::now());
        m.var_1d = var_1d;
        m.by_strategy.insert("s1".into(), ExposureBreakdown { gross: 100.0, net: 100.0 });
        Arc::new(m)
    }

    fn snapshot(seq: u64, px: Decimal, qty: Decimal) -> Snapshot {
        let key = PositionKey::new("s1", "AAA");
        let mut pos = Position::new(&key, Utc::now());
        pos.signed_quantity = qty;
        Snapshot {
            seq,
            taken_at: Utc::now(),
            prices: StdHashMap::from([("AAA".to_string(), px)]),
            positions: StdHashMap::from([(key, pos)]),
        }
    }

    fn breach_path() -> Vec<Decimal> {
        let mut px = dec!(100);
        let mut path = vec![px];
        for i in 1..=20 {
            if i == 5 || i == 15 {
                px -= dec!(2.5);
            } else {
                px += dec!(0.1);
            }
            path.push(px);
        }
        path
    }

    #[test]
    fn cooldown_debounces_per_target() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (mut re, _, _) = engine(vec![rule("var", "var_1d", Comparator::Gt, 2_000.0, 1_000)], clock.clone());

        assert_eq!(re.evaluate(record(1, 2_500.0)).alerts.len(), 1);
        clock.advance_ms(999);
        assert!(re.evaluate(record(2, 2_500.0)).alerts.is_empty());
        clock.advance_ms(1);
        assert_eq!(re.evaluate(record(3, 2_500.0)).alerts.len(), 1);
    }

    #[test]
    fn nan_metrics_never_fire() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (mut re, _, _) = engine(vec![rule("var", "var_1d", Comparator::Gt, 2_000.0, 0)], clock);
        assert!(re.evaluate(record(1, f64::NAN)).alerts.is_empty());
    }

    #[test]
    fn missing_path_counts_misconfig() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (mut re, _, counters) = engine(
            vec![rule("ghost", "by_strategy.ghost.gross", Comparator::Gt, 0.0, 0)],
            clock,
        );
        re.evaluate(record(1, 0.0));
        re.evaluate(record(2, 0.0));
        assert_eq!(counters.rule_misconfig.get(), 2);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut r = rule("var", "var_1d", Comparator::Gt, 0.0, 0);
        r.enabled = false;
        let (mut re, _, _) = engine(vec![r], clock);
        assert!(re.evaluate(record(1, 10.0)).alerts.is_empty());
    }

    #[test]
    fn breakdown_rules_target_the_strategy() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (mut re, _, _) = engine(
            vec![rule("gross", "by_strategy.*.gross", Comparator::Gt, 50.0, 0)],
            clock,
        );
        let ev = re.evaluate(record(1, 0.0));
        assert_eq!(ev.alerts.len(), 1);
        assert_eq!(ev.alerts[0].target, Target::Strategy("s1".into()));
        assert_eq!(ev.alerts[0].payload.value, 100.0);
        assert_eq!(ev.alerts[0].payload.context.get("var_1d"), Some(&0.0));
    }

    #[test]
    fn asset_classes_fire_and_clear_independently() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut class_rule = rule("class-gross", "by_asset_class.*.gross", Comparator::Gt, 1_000.0, 60_000);
        class_rule.auto_resolve = true;
        let (mut re, _, _) = engine(vec![class_rule], clock);

        let mut m = RiskMetrics::empty(1, Utc::now());
        m.by_asset_class.insert("equity".into(), ExposureBreakdown { gross: 5_000.0, net: 5_000.0 });
        m.by_asset_class.insert("crypto".into(), ExposureBreakdown { gross: 10.0, net: 10.0 });
        let ev = re.evaluate(Arc::new(m.clone()));
        assert_eq!(ev.alerts.len(), 1);
        assert_eq!(ev.alerts[0].target, Target::AssetClass("equity".into()));
        assert_eq!(
            ev.cleared,
            vec![("class-gross".to_string(), Target::AssetClass("crypto".into()))]
        );

        // A second class breaching is not held back by the first one's cooldown
        m.seq = 2;
        m.by_asset_class.insert("crypto".into(), ExposureBreakdown { gross: 2_000.0, net: 2_000.0 });
        let ev = re.evaluate(Arc::new(m));
        assert_eq!(ev.alerts.len(), 1);
        assert_eq!(ev.alerts[0].target, Target::AssetClass("crypto".into()));
        assert!(ev.cleared.is_empty());
    }

    #[test]
    fn scalar_breach_under_cooldown_is_not_cleared() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut var_rule = rule("var", "var_1d", Comparator::Gt, 2_000.0, 60_000);
        var_rule.auto_resolve = true;
        let (mut re, _, _) = engine(vec![var_rule], clock);
        assert_eq!(re.evaluate(record(1, 2_500.0)).alerts.len(), 1);
        let ev = re.evaluate(record(2, 2_500.0));
        assert!(ev.alerts.is_empty());
        assert!(ev.cleared.is_empty());
    }

    #[test]
    fn isolation_rules_emit_candidates() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let spec = RuleSetSpec {
            rules: vec![],
            isolation_rules: vec![IsolationRule {
                rule_id: "suspend".into(),
                metric_path: "by_strategy.s1.gross".into(),
                comparator: Comparator::Ge,
                threshold: 100.0,
                method: IsolationMethod::StrategySuspension,
                target: None,
                cooldown_ms: 0,
                enabled: true,
                hold_ms: Some(60_000),
                severity_score: 0.8,
            }],
        };
        let book = Arc::new(RuleBook::new(&spec, ctx()).unwrap());
        let mut re = RuleEngine::new(book, clock, Counters::new().unwrap());
        let ev = re.evaluate(record(7, 0.0));
        assert_eq!(ev.isolations.len(), 1);
        let iso = &ev.isolations[0];
        assert_eq!(iso.target, Target::Strategy("s1".into()));
        assert_eq!(iso.source, IsolationSource::Rule);
        assert_eq!(iso.triggered_seq, 7);
        assert_eq!(iso.hold_ms, Some(60_000));
    }

    /// VaR breach: one alert on the first full-window record, none within the
    /// cooldown while the breach persists.
    #[test]
    fn var_breach_fires_once_per_cooldown() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (mut re, _, _) = engine(
            vec![rule("var-limit", "var_1d", Comparator::Gt, 2_000.0, 1_000)],
            clock.clone(),
        );
        let instruments = Arc::new(StdHashMap::from([(
            "AAA".to_string(),
            Arc::new(Instrument::new("AAA", "USD", AssetClass::Equity)),
        )]));
        let path = breach_path();
        let mut calc = RiskCalculator::new(
            instruments,
            CalculatorParams {
                window_size: path.len(),
                min_observations: path.len(),
                ..CalculatorParams::default()
            },
        );

        let mut fired_at = Vec::new();
        for (i, px) in path.iter().enumerate() {
            let seq = i as u64 + 1;
            let m = calc.compute(&snapshot(seq, *px, dec!(1000)), 1_000_000.0);
            if !re.evaluate(Arc::new(m)).alerts.is_empty() {
                fired_at.push(seq);
            }
            clock.advance_ms(1);
        }
        assert_eq!(fired_at, vec![path.len() as u64]);

        // Breach persists for the next 500 ms: still one alert
        for seq in 22..522 {
            assert!(re.evaluate(record(seq, 2_500.0)).alerts.is_empty(), "seq {}", seq);
            clock.advance_ms(1);
        }
        clock.advance_ms(500);
        assert_eq!(re.evaluate(record(522, 2_500.0)).alerts.len(), 1);
    }

    /// Position flatten: zero exposure and VaR, and the auto-resolve rule
    /// reports its condition cleared.
    #[test]
    fn flatten_clears_auto_resolve_rule() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut var_rule = rule("var-limit", "var_1d", Comparator::Gt, 2_000.0, 1_000);
        var_rule.auto_resolve = true;
        let (mut re, _, _) = engine(vec![var_rule], clock.clone());
        let instruments = Arc::new(StdHashMap::from([(
            "AAA".to_string(),
            Arc::new(Instrument::new("AAA", "USD", AssetClass::Equity)),
        )]));
        let path = breach_path();
        let mut calc = RiskCalculator::new(
            instruments,
            CalculatorParams {
                window_size: path.len(),
                min_observations: path.len(),
                ..CalculatorParams::default()
            },
        );
        for (i, px) in path.iter().enumerate() {
            let m = calc.compute(&snapshot(i as u64 + 1, *px, dec!(1000)), 1_000_000.0);
            re.evaluate(Arc::new(m));
            clock.advance_ms(1);
        }

        let m = calc.compute(&snapshot(22, dec!(100), dec!(0)), 1_000_000.0);
        assert_eq!(m.gross_exposure, 0.0);
        assert_eq!(m.net_exposure, 0.0);
        assert_eq!(m.var_1d, 0.0);
        let ev = re.evaluate(Arc::new(m));
        assert!(ev.alerts.is_empty());
        assert_eq!(ev.cleared, vec![("var-limit".to_string(), Target::System)]);
    }

    /// Hot reload: every record is evaluated against exactly one version and
    /// versions observed by the engine never go backwards.
    #[test]
    fn hot_reload_is_atomic_per_record() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let set = |prefix: &str| RuleSetSpec {
            rules: (0..100)
                .map(|i| rule(&format!("{}-{}", prefix, i), "var_1d", Comparator::Gt, 0.0, 0))
                .collect(),
            isolation_rules: vec![],
        };
        let book = Arc::new(RuleBook::new(&set("a"), ctx()).unwrap());
        let mut re = RuleEngine::new(book.clone(), clock, Counters::new().unwrap());

        let stop = Arc::new(AtomicBool::new(false));
        let publisher = {
            let book = book.clone();
            let stop = stop.clone();
            let (a, b) = (set("a"), set("b"));
            thread::spawn(move || {
                let mut flip = false;
                while !stop.load(Ordering::Relaxed) {
                    book.publish(if flip { a.clone() } else { b.clone() }).unwrap();
                    flip = !flip;
                }
            })
        };

        let mut last_version = 0;
        for seq in 1..=2_000 {
            let ev = re.evaluate(record(seq, 1.0));
            assert_eq!(ev.alerts.len(), 100);
            assert!(ev.rule_set_version >= last_version);
            last_version = ev.rule_set_version;
            let prefix = &ev.alerts[0].rule_id[..2];
            assert!(ev
                .alerts
                .iter()
                .all(|a| a.rule_id.starts_with(prefix) && a.rule_set_version == ev.rule_set_version));
        }
        stop.store(true, Ordering::Relaxed);
        publisher.join().unwrap();
    }
}
