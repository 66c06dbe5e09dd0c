//! Isolation actions: requests that an operational restriction be applied to a
//! target by the external order router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::rules::WindowPredicate;
use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMethod {
    PositionQuarantine,
    StrategySuspension,
    CounterpartyBlacklist,
    AssetRestriction,
    MarketDisconnection,
    /// System-wide stop on new orders; the safe-mode action.
    HaltAllOrders,
}

impl fmt::Display for IsolationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IsolationMethod::PositionQuarantine => "position_quarantine",
            IsolationMethod::StrategySuspension => "strategy_suspension",
            IsolationMethod::CounterpartyBlacklist => "counterparty_blacklist",
            IsolationMethod::AssetRestriction => "asset_restriction",
            IsolationMethod::MarketDisconnection => "market_disconnection",
            IsolationMethod::HaltAllOrders => "halt_all_orders",
        };
        write!(f, "{}", s)
    }
}

/// Who asked for the isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationSource {
    Manual,
    Rule,
    Auto,
}

impl fmt::Display for IsolationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IsolationSource::Manual => "manual",
            IsolationSource::Rule => "rule",
            IsolationSource::Auto => "auto",
        };
        write!(f, "{}", s)
    }
}

/// Per-target isolation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationState {
    Free,
    Isolated,
    PendingRelease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Forced release by an authorised principal.
    Forced,
    /// A conditional release request whose predicate held.
    ConditionsMet,
    /// The configured auto-release predicate held.
    AutoRelease,
    /// `planned_release_at` passed.
    PlannedRelease,
}

/// Progress of a conditional release. `satisfied` is journaled with the
/// request; later increments live in memory and replay from the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRelease {
    pub predicate: WindowPredicate,
    pub requested_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub satisfied: usize,
    /// Set when the release came from the auto-release configuration.
    pub automatic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationAction {
    pub action_id: Uuid,
    pub method: IsolationMethod,
    pub target: Target,
    pub reason: String,
    pub source: IsolationSource,
    pub rule_id: Option<String>,
    pub authorized_by: Option<String>,
    pub severity_score: f64,
    pub activated_at: DateTime<Utc>,
    pub planned_release_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub state: IsolationState,
    pub pending: Option<PendingRelease>,
    pub released_at: Option<DateTime<Utc>>,
    pub release_reason: Option<ReleaseReason>,
    /// Later activation requests for the same target folded into this one.
    pub duplicate_requests: u32,
    /// Whether the order router acknowledged the activation.
    pub router_acked: bool,
}

/// Isolation requested by a rule or an auto-isolation predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationCandidate {
    pub rule_id: String,
    pub method: IsolationMethod,
    pub target: Target,
    pub source: IsolationSource,
    pub reason: String,
    pub triggered_seq: u64,
    pub hold_ms: Option<u64>,
    pub severity_score: f64,
}

/// Operator activation request, as received by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub method: IsolationMethod,
    pub target: Target,
    pub reason: String,
    pub principal: String,
    #[serde(default)]
    pub hold_ms: Option<u64>,
    #[serde(default)]
    pub severity_score: f64,
}

/// Operator request to release once a predicate holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub principal: String,
    pub predicate: WindowPredicate,
    /// Ceiling on the pending-release state; the configured default otherwise.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_serde_names() {
        let m: IsolationMethod = serde_json::from_str("\"halt_all_orders\"").unwrap();
        assert_eq!(m, IsolationMethod::HaltAllOrders);
        assert_eq!(m.to_string(), "halt_all_orders");
        assert_eq!(
            serde_json::to_string(&IsolationMethod::StrategySuspension).unwrap(),
            "\"strategy_suspension\""
        );
    }

    #[test]
    fn activation_request_defaults() {
        let req: ActivationRequest = serde_json::from_str(
            r#"{"method":"strategy_suspension","target":{"kind":"strategy","id":"s1"},"reason":"drill","principal":"ops"}"#,
        )
        .unwrap();
        assert_eq!(req.hold_ms, None);
        assert_eq!(req.target, Target::Strategy("s1".into()));
    }
}
