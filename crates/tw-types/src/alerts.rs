//! Alert records and their lifecycle vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::rules::Comparator;
use crate::serde_utils::float_or_null;
use crate::target::Target;

/// Rule id used for alerts raised when a pending release times out.
pub const RELEASE_STALLED_RULE: &str = "isolation.release_stalled";
/// Rule id used for the safe-mode alert.
pub const SYSTEM_UNSAFE_RULE: &str = "system.unsafe";
/// Rule id used when the metrics queue has been blocked for too long.
pub const BACKPRESSURE_RULE: &str = "pipeline.backpressure";

/// Alert priority, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Info,
    Low,
    Medium,
    High,
    Critical,
    Emergency,
}

impl Priority {
    pub const ALL: [Priority; 6] = [
        Priority::Info,
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
        Priority::Emergency,
    ];

    /// One level up, saturating at `Emergency`.
    pub fn raised(self) -> Priority {
        match self {
            Priority::Info => Priority::Low,
            Priority::Low => Priority::Medium,
            Priority::Medium => Priority::High,
            Priority::High => Priority::Critical,
            Priority::Critical | Priority::Emergency => Priority::Emergency,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Info => "info",
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
            Priority::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    New,
    Acked,
    Resolved,
}

impl AckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckState::New => "new",
            AckState::Acked => "acked",
            AckState::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selection used by alert listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertFilter {
    /// Not yet resolved.
    #[default]
    Active,
    State(AckState),
    All,
}

impl AlertFilter {
    pub fn matches(&self, alert: &Alert) -> bool {
        match self {
            AlertFilter::Active => alert.ack_state != AckState::Resolved,
            AlertFilter::State(state) => alert.ack_state == *state,
            AlertFilter::All => true,
        }
    }
}

impl FromStr for AlertFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertFilter::Active),
            "all" => Ok(AlertFilter::All),
            "new" => Ok(AlertFilter::State(AckState::New)),
            "acked" => Ok(AlertFilter::State(AckState::Acked)),
            "resolved" => Ok(AlertFilter::State(AckState::Resolved)),
            other => Err(format!("unknown alert state filter '{}'", other)),
        }
    }
}

/// What an alert is about: the offending value and the record context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub metric_path: String,
    #[serde(with = "float_or_null")]
    pub value: f64,
    #[serde(with = "float_or_null")]
    pub threshold: f64,
    /// Absent for internally generated alerts.
    #[serde(default)]
    pub comparator: Option<Comparator>,
    #[serde(default)]
    pub context: BTreeMap<String, f64>,
    pub message: String,
}

impl AlertPayload {
    /// Payload for alerts that do not come from a threshold comparison.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            metric_path: String::new(),
            value: f64::NAN,
            threshold: f64::NAN,
            comparator: None,
            context: BTreeMap::new(),
            message: message.into(),
        }
    }
}

/// Alert emitted by the rule engine, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAlert {
    pub rule_id: String,
    pub target: Target,
    pub priority: Priority,
    pub triggered_seq: u64,
    pub triggered_at: DateTime<Utc>,
    pub rule_set_version: u64,
    pub payload: AlertPayload,
}

impl CandidateAlert {
    /// Deduplication key.
    pub fn dedup_key(&self) -> (String, String) {
        (self.rule_id.clone(), self.target.key())
    }
}

/// An alert owned by the alert manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub rule_id: String,
    pub target: Target,
    pub triggered_seq: u64,
    pub triggered_at: DateTime<Utc>,
    pub priority: Priority,
    pub payload: AlertPayload,
    pub ack_state: AckState,
    pub assignee: Option<String>,
    pub acked_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub escalation_count: u32,
    pub escalated_at: Option<DateTime<Utc>>,
    pub hit_count: u64,
    pub last_seen: DateTime<Utc>,
    pub last_seen_seq: u64,
    pub rule_set_version: u64,
    pub notification_failed: bool,
}

impl Alert {
    pub fn from_candidate(alert_id: Uuid, candidate: CandidateAlert) -> Self {
        Self {
            alert_id,
            rule_id: candidate.rule_id,
            target: candidate.target,
            triggered_seq: candidate.triggered_seq,
            triggered_at: candidate.triggered_at,
            priority: candidate.priority,
            payload: candidate.payload,
            ack_state: AckState::New,
            assignee: None,
            acked_at: None,
            resolved_at: None,
            resolution_notes: None,
            escalation_count: 0,
            escalated_at: None,
            hit_count: 1,
            last_seen: candidate.triggered_at,
            last_seen_seq: candidate.triggered_seq,
            rule_set_version: candidate.rule_set_version,
            notification_failed: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ack_state != AckState::Resolved
    }

    pub fn dedup_key(&self) -> (String, String) {
        (self.rule_id.clone(), self.target.key())
    }
}

/// Aggregate counts over the alert book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total_raised: u64,
    pub duplicates_folded: u64,
    pub escalations: u64,
    pub notification_failed: u64,
    pub by_priority: BTreeMap<String, u64>,
    pub by_state: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> CandidateAlert {
        CandidateAlert {
            rule_id: "var-limit".to_string(),
            target: Target::Strategy("s1".to_string()),
            priority: Priority::High,
            triggered_seq: 12,
            triggered_at: Utc::now(),
            rule_set_version: 3,
            payload: AlertPayload::internal("test"),
        }
    }

    #[test]
    fn priority_order_and_raise() {
        assert!(Priority::Info < Priority::Emergency);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::High.raised(), Priority::Critical);
        assert_eq!(Priority::Emergency.raised(), Priority::Emergency);
    }

    #[test]
    fn new_alert_from_candidate() {
        let id = Uuid::new_v4();
        let alert = Alert::from_candidate(id, candidate());
        assert_eq!(alert.ack_state, AckState::New);
        assert_eq!(alert.hit_count, 1);
        assert_eq!(alert.rule_set_version, 3);
        assert_eq!(
            alert.dedup_key(),
            ("var-limit".to_string(), "strategy:s1".to_string())
        );
    }

    #[test]
    fn filter_parsing() {
        assert_eq!("acked".parse::<AlertFilter>(), Ok(AlertFilter::State(AckState::Acked)));
        assert_eq!("active".parse::<AlertFilter>(), Ok(AlertFilter::Active));
        assert!("bogus".parse::<AlertFilter>().is_err());

        let mut alert = Alert::from_candidate(Uuid::new_v4(), candidate());
        assert!(AlertFilter::Active.matches(&alert));
        alert.ack_state = AckState::Resolved;
        assert!(!AlertFilter::Active.matches(&alert));
        assert!(AlertFilter::All.matches(&alert));
    }

    #[test]
    fn internal_payload_serializes_nan_as_null() {
        let json = serde_json::to_value(AlertPayload::internal("stalled")).unwrap();
        assert!(json["value"].is_null());
        assert_eq!(json["message"], "stalled");
    }
}
