//! Start-up configuration document.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::alerts::Priority;
use crate::config_error;
use crate::errors::ConfigError;
use crate::market::Instrument;
use crate::rules::{AutoIsolationRule, AutoReleaseConfig, IsolationRule, Rule, RuleSetSpec};

/// Environment variable that overrides `listen_addr`.
pub const LISTEN_ADDR_ENV: &str = "TRIPWIRE_ADDR";

/// Snapshot cadence: on every N-th tick or every T microseconds, whichever
/// comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCadence {
    pub every_n_ticks: u64,
    pub every_us: u64,
}

impl Default for SnapshotCadence {
    fn default() -> Self {
        Self {
            every_n_ticks: 100,
            every_us: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confidences {
    /// VaR levels; the first one drives `var_1d` / `var_10d`.
    pub var: Vec<f64>,
    /// ES levels; the first one drives `expected_shortfall`.
    pub es: Vec<f64>,
}

impl Default for Confidences {
    fn default() -> Self {
        Self {
            var: vec![0.95, 0.99],
            es: vec![0.975],
        }
    }
}

/// Retry policy for a notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total delivery attempts before the alert is marked `notification_failed`.
    pub max: u32,
    pub base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_cap_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: 3,
            base_ms: 100,
            max_delay_ms: default_retry_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stderr,
    /// HTTP POST of the alert JSON to `target`.
    Webhook,
    /// JSON lines appended to the file at `target`.
    Journal,
}

/// One notification fan-out: alerts at or above `priority` go to this sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub priority: Priority,
    pub transport: TransportKind,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Order-router egress transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouterConfig {
    /// Log requests and acknowledge them; for dry runs.
    Log,
    Webhook {
        url: String,
        #[serde(default = "default_router_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_router_timeout_ms() -> u64 {
    2_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig::Log
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Escalate a still-new alert one level per elapsed interval. `0` disables.
    pub unacked_after_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            unacked_after_ms: 300_000,
        }
    }
}

/// How many terminal records the alert manager keeps in memory. The oldest
/// resolved alerts and released isolations beyond these are dropped, live and
/// on journal replay alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub resolved_alerts: usize,
    pub released_isolations: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            resolved_alerts: 10_000,
            released_isolations: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCapacity {
    pub snapshots: usize,
    pub metrics: usize,
    pub alerts: usize,
    pub commands: usize,
}

impl Default for QueueCapacity {
    fn default() -> Self {
        Self {
            snapshots: 64,
            metrics: 1_024,
            alerts: 1_024,
            commands: 64,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub instruments: Vec<Instrument>,
    pub window_size: usize,
    /// Marks required before VaR is reported; defaults to `window_size`.
    pub min_observations: Option<usize>,
    pub snapshot_cadence: SnapshotCadence,
    pub equity: f64,
    pub confidences: Confidences,
    /// Tail threshold in standard deviations below zero.
    pub tail_sigma: f64,
    pub rules: Vec<Rule>,
    pub isolation_rules: Vec<IsolationRule>,
    pub auto_isolation_rules: Vec<AutoIsolationRule>,
    pub auto_release: Option<AutoReleaseConfig>,
    pub sinks: Vec<SinkConfig>,
    pub router: RouterConfig,
    pub escalation: EscalationConfig,
    /// Principals allowed to act on isolations. Empty authorises nobody.
    pub operators: Vec<String>,
    pub listen_addr: String,
    pub journal_path: Option<PathBuf>,
    pub journal_fsync: bool,
    pub history_capacity: usize,
    pub retention: RetentionConfig,
    pub queue_capacity: QueueCapacity,
    pub latency_budget_us: u64,
    pub ready_lag_snapshots: u64,
    pub ready_aim_depth: usize,
    pub backpressure_alert_ms: u64,
    /// Default ceiling for pending releases requested without one.
    pub release_timeout_ms: u64,
    pub flush_deadline_ms: u64,
    /// AIM housekeeping period: retries, escalation, timeouts.
    pub aim_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            window_size: 250,
            min_observations: None,
            snapshot_cadence: SnapshotCadence::default(),
            equity: 0.0,
            confidences: Confidences::default(),
            tail_sigma: 3.0,
            rules: Vec::new(),
            isolation_rules: Vec::new(),
            auto_isolation_rules: Vec::new(),
            auto_release: None,
            sinks: Vec::new(),
            router: RouterConfig::default(),
            escalation: EscalationConfig::default(),
            operators: Vec::new(),
            listen_addr: "127.0.0.1:8090".to_string(),
            journal_path: None,
            journal_fsync: false,
            history_capacity: 10_000,
            retention: RetentionConfig::default(),
            queue_capacity: QueueCapacity::default(),
            latency_budget_us: 1_000,
            ready_lag_snapshots: 16,
            ready_aim_depth: 512,
            backpressure_alert_ms: 2_000,
            release_timeout_ms: 600_000,
            flush_deadline_ms: 5_000,
            aim_tick_ms: 50,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    pub fn rule_set(&self) -> RuleSetSpec {
        RuleSetSpec {
            rules: self.rules.clone(),
            isolation_rules: self.isolation_rules.clone(),
        }
    }

    pub fn min_observations(&self) -> usize {
        self.min_observations.unwrap_or(self.window_size)
    }

    /// Structural validation. Metric paths are checked by the rule book.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instruments.is_empty() {
            return Err(config_error!("at least one instrument is required"));
        }
        let mut ids = HashSet::new();
        for inst in &self.instruments {
            if inst.id.is_empty() {
                return Err(config_error!("instrument id must not be empty"));
            }
            if !ids.insert(inst.id.as_str()) {
                return Err(config_error!("duplicate instrument id '{}'", inst.id));
            }
            if let Some((f, w)) = inst.factors.iter().find(|(_, w)| !w.is_finite()) {
                return Err(config_error!(
                    "instrument '{}' has non-finite weight {} for factor '{}'",
                    inst.id,
                    w,
                    f
                ));
            }
        }

        if self.window_size < 2 {
            return Err(config_error!("window_size must be at least 2"));
        }
        let min_obs = self.min_observations();
        if min_obs < 2 || min_obs > self.window_size {
            return Err(config_error!(
                "min_observations must be in [2, window_size], got {}",
                min_obs
            ));
        }
        if self.snapshot_cadence.every_n_ticks == 0 || self.snapshot_cadence.every_us == 0 {
            return Err(config_error!("snapshot cadence values must be positive"));
        }
        if !self.equity.is_finite() {
            return Err(config_error!("equity must be finite"));
        }

        if self.confidences.var.is_empty() || self.confidences.es.is_empty() {
            return Err(config_error!("at least one VaR and one ES confidence is required"));
        }
        for c in self.confidences.var.iter().chain(self.confidences.es.iter()) {
            if !(*c > 0.0 && *c < 1.0) {
                return Err(config_error!("confidence {} is outside (0, 1)", c));
            }
        }
        if !(self.tail_sigma.is_finite() && self.tail_sigma > 0.0) {
            return Err(config_error!("tail_sigma must be positive"));
        }

        for sink in &self.sinks {
            if sink.retry.max == 0 {
                return Err(config_error!("sink retry.max must be at least 1"));
            }
            if matches!(sink.transport, TransportKind::Webhook | TransportKind::Journal)
                && sink.target.is_empty()
            {
                return Err(config_error!(
                    "{:?} sink at priority {} needs a target",
                    sink.transport,
                    sink.priority
                ));
            }
        }
        if let RouterConfig::Webhook { url, .. } = &self.router {
            if url.is_empty() {
                return Err(config_error!("router webhook url must not be empty"));
            }
        }

        let q = &self.queue_capacity;
        if q.snapshots == 0 || q.metrics == 0 || q.alerts == 0 || q.commands == 0 {
            return Err(config_error!("queue capacities must be positive"));
        }
        if self.history_capacity == 0 {
            return Err(config_error!("history_capacity must be positive"));
        }
        if self.retention.resolved_alerts == 0 || self.retention.released_isolations == 0 {
            return Err(config_error!("retention limits must be positive"));
        }
        if self.aim_tick_ms == 0 {
            return Err(config_error!("aim_tick_ms must be positive"));
        }

        let mut auto_ids = HashSet::new();
        for rule in &self.auto_isolation_rules {
            if !auto_ids.insert(rule.rule_id.as_str()) {
                return Err(config_error!(
                    "duplicate auto-isolation rule id '{}'",
                    rule.rule_id
                ));
            }
            if rule.predicate.consecutive == 0 {
                return Err(config_error!(
                    "auto-isolation rule '{}' needs consecutive >= 1",
                    rule.rule_id
                ));
            }
        }
        if let Some(release) = &self.auto_release {
            if release.predicate.consecutive == 0 {
                return Err(config_error!("auto_release needs consecutive >= 1"));
            }
        }
        Ok(())
    }
}
