//! Rule descriptors. Rules are data; the rule engine interprets them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::alerts::Priority;
use crate::isolation::IsolationMethod;
use crate::target::Target;

/// Relative tolerance used by `==` on binary64 metrics.
const EQ_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=", alias = "≤")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=", alias = "≥")]
    Ge,
    #[serde(rename = "==")]
    Eq,
}

impl Comparator {
    /// Applies the comparator. Any comparison against `NaN` is false.
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        if value.is_nan() || threshold.is_nan() {
            return false;
        }
        match self {
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Gt => value > threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Eq => {
                (value - threshold).abs() <= EQ_EPSILON * threshold.abs().max(1.0)
            }
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
        };
        write!(f, "{}", s)
    }
}

fn default_true() -> bool {
    true
}

/// Alerting rule descriptor. Only `enabled` and `threshold` change at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub metric_path: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub priority: Priority,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Resolve the open alert for a target once the condition clears.
    #[serde(default)]
    pub auto_resolve: bool,
}

/// Rule whose effect is an isolation request rather than an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationRule {
    pub rule_id: String,
    pub metric_path: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub method: IsolationMethod,
    /// Explicit target; when absent it is derived from the metric path.
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub hold_ms: Option<u64>,
    #[serde(default)]
    pub severity_score: f64,
}

/// "`metric_path` `comparator` `threshold` for `consecutive` records".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowPredicate {
    pub metric_path: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub consecutive: usize,
}

impl fmt::Display for WindowPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} for {} consecutive records",
            self.metric_path, self.comparator, self.threshold, self.consecutive
        )
    }
}

/// Isolation activated automatically when a window predicate holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoIsolationRule {
    pub rule_id: String,
    pub predicate: WindowPredicate,
    pub method: IsolationMethod,
    #[serde(default = "system_target")]
    pub target: Target,
    #[serde(default)]
    pub hold_ms: Option<u64>,
    #[serde(default)]
    pub severity_score: f64,
}

fn system_target() -> Target {
    Target::System
}

/// Automatic release of non-manual isolations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoReleaseConfig {
    pub predicate: WindowPredicate,
    /// Ceiling on the pending-release state before it reverts to isolated.
    pub pending_timeout_ms: u64,
}

/// The replaceable part of the rule set, as carried by `GET/PUT /rules`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSetSpec {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub isolation_rules: Vec<IsolationRule>,
}

/// Runtime patch: the only mutable fields of a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulePatch {
    pub enabled: Option<bool>,
    pub threshold: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparator_semantics() {
        assert!(Comparator::Gt.holds(2.0, 1.0));
        assert!(!Comparator::Gt.holds(1.0, 1.0));
        assert!(Comparator::Ge.holds(1.0, 1.0));
        assert!(Comparator::Lt.holds(0.5, 1.0));
        assert!(Comparator::Le.holds(1.0, 1.0));
        assert!(Comparator::Eq.holds(0.1 + 0.2, 0.3));
        assert!(!Comparator::Gt.holds(f64::NAN, 1.0));
        assert!(!Comparator::Lt.holds(f64::NAN, 1.0));
    }

    #[test]
    fn comparator_parses_symbols() {
        let c: Comparator = serde_json::from_str("\">\"").unwrap();
        assert_eq!(c, Comparator::Gt);
        let c: Comparator = serde_json::from_str("\"≤\"").unwrap();
        assert_eq!(c, Comparator::Le);
        assert_eq!(serde_json::to_string(&Comparator::Ge).unwrap(), "\">=\"");
    }

    #[test]
    fn rule_defaults() {
        let rule: Rule = serde_json::from_str(
            r#"{"rule_id":"r1","metric_path":"var_1d","comparator":">","threshold":2000,"priority":"high"}"#,
        )
        .unwrap();
        assert!(rule.enabled);
        assert!(!rule.auto_resolve);
        assert_eq!(rule.cooldown_ms, 0);
        assert_eq!(rule.priority, Priority::High);
    }
}
