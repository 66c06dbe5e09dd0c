//! The per-snapshot risk record produced by the computation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::serde_utils::float_or_null;

/// Gross and net notional for one decomposition key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureBreakdown {
    /// Sum of absolute notionals.
    pub gross: f64,
    /// Sum of signed notionals.
    pub net: f64,
}

impl ExposureBreakdown {
    pub fn add(&mut self, notional: f64) {
        self.gross += notional.abs();
        self.net += notional;
    }
}

/// VaR at one confidence level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarLevel {
    pub confidence: f64,
    #[serde(with = "float_or_null")]
    pub var_1d: f64,
    #[serde(with = "float_or_null")]
    pub var_10d: f64,
}

/// Expected shortfall at one confidence level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EsLevel {
    pub confidence: f64,
    #[serde(with = "float_or_null")]
    pub expected_shortfall: f64,
}

/// Why a record carries the `DegenerateState` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegenerateReason {
    /// Fewer marks in the rolling window than the configured minimum.
    WindowWarming,
    /// Equity is zero, negative or not finite; leverage is undefined.
    ZeroEquity,
    /// No open positions.
    EmptyPortfolio,
    /// A position references an instrument with no mark yet.
    MissingPrice,
    /// An intermediate statistic was not finite.
    NonFinite,
}

impl fmt::Display for DegenerateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DegenerateReason::WindowWarming => "window_warming",
            DegenerateReason::ZeroEquity => "zero_equity",
            DegenerateReason::EmptyPortfolio => "empty_portfolio",
            DegenerateReason::MissingPrice => "missing_price",
            DegenerateReason::NonFinite => "non_finite",
        };
        write!(f, "{}", s)
    }
}

/// Risk measures for one snapshot. One-to-one with the snapshot `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub seq: u64,
    pub computed_at: DateTime<Utc>,
    pub snapshot_taken_at: DateTime<Utc>,

    // --- exposure ---
    /// Mark-to-market value of all open positions.
    pub portfolio_value: f64,
    pub gross_exposure: f64,
    pub net_exposure: f64,
    #[serde(with = "float_or_null")]
    pub equity: f64,
    /// Gross exposure / equity.
    #[serde(with = "float_or_null")]
    pub leverage: f64,

    // --- VaR / tail (primary confidence) ---
    #[serde(with = "float_or_null")]
    pub var_1d: f64,
    #[serde(with = "float_or_null")]
    pub var_10d: f64,
    #[serde(with = "float_or_null")]
    pub expected_shortfall: f64,
    pub var_levels: Vec<VarLevel>,
    pub es_levels: Vec<EsLevel>,

    // --- window statistics ---
    #[serde(with = "float_or_null")]
    pub max_drawdown_window: f64,
    #[serde(with = "float_or_null")]
    pub volatility: f64,
    #[serde(with = "float_or_null")]
    pub tail_loss_prob: f64,
    /// Number of marks currently in the rolling window.
    pub observations: usize,

    // --- decomposition ---
    pub by_strategy: BTreeMap<String, ExposureBreakdown>,
    pub by_asset_class: BTreeMap<String, ExposureBreakdown>,
    pub by_instrument: BTreeMap<String, ExposureBreakdown>,
    pub by_factor: BTreeMap<String, f64>,

    // --- health ---
    pub degenerate: bool,
    pub degenerate_reasons: Vec<DegenerateReason>,
    /// Wall time spent computing this record.
    pub computation_us: u64,
}

impl RiskMetrics {
    /// An all-zero record for `seq`, used as the starting point of computation.
    pub fn empty(seq: u64, snapshot_taken_at: DateTime<Utc>) -> Self {
        Self {
            seq,
            computed_at: snapshot_taken_at,
            snapshot_taken_at,
            portfolio_value: 0.0,
            gross_exposure: 0.0,
            net_exposure: 0.0,
            equity: f64::NAN,
            leverage: f64::NAN,
            var_1d: f64::NAN,
            var_10d: f64::NAN,
            expected_shortfall: f64::NAN,
            var_levels: Vec::new(),
            es_levels: Vec::new(),
            max_drawdown_window: f64::NAN,
            volatility: f64::NAN,
            tail_loss_prob: f64::NAN,
            observations: 0,
            by_strategy: BTreeMap::new(),
            by_asset_class: BTreeMap::new(),
            by_instrument: BTreeMap::new(),
            by_factor: BTreeMap::new(),
            degenerate: false,
            degenerate_reasons: Vec::new(),
            computation_us: 0,
        }
    }

    pub fn flag(&mut self, reason: DegenerateReason) {
        self.degenerate = true;
        if !self.degenerate_reasons.contains(&reason) {
            self.degenerate_reasons.push(reason);
        }
    }

    /// Headline scalar fields keyed by name, finite values only. Copied into
    /// alert payloads so a sink sees the context of a breach.
    pub fn headline(&self) -> BTreeMap<String, f64> {
        [
            ("portfolio_value", self.portfolio_value),
            ("gross_exposure", self.gross_exposure),
            ("net_exposure", self.net_exposure),
            ("equity", self.equity),
            ("leverage", self.leverage),
            ("var_1d", self.var_1d),
            ("var_10d", self.var_10d),
            ("expected_shortfall", self.expected_shortfall),
            ("max_drawdown_window", self.max_drawdown_window),
            ("volatility", self.volatility),
            ("tail_loss_prob", self.tail_loss_prob),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakdown_accumulates_gross_and_net() {
        let mut b = ExposureBreakdown::default();
        b.add(100.0);
        b.add(-40.0);
        assert_eq!(b.gross, 140.0);
        assert_eq!(b.net, 60.0);
    }

    #[test]
    fn flag_is_idempotent() {
        let mut m = RiskMetrics::empty(1, Utc::now());
        m.flag(DegenerateReason::ZeroEquity);
        m.flag(DegenerateReason::ZeroEquity);
        assert!(m.degenerate);
        assert_eq!(m.degenerate_reasons, vec![DegenerateReason::ZeroEquity]);
    }

    #[test]
    fn degenerate_record_serializes_nan_as_null() {
        let m = RiskMetrics::empty(7, Utc::now());
        let json = serde_json::to_value(&m).unwrap();
        assert!(json["leverage"].is_null());
        assert_eq!(json["seq"], 7);
        let back: RiskMetrics = serde_json::from_value(json).unwrap();
        assert!(back.leverage.is_nan());
    }

    #[test]
    fn headline_skips_non_finite() {
        let mut m = RiskMetrics::empty(1, Utc::now());
        m.gross_exposure = 10.0;
        let h = m.headline();
        assert_eq!(h.get("gross_exposure"), Some(&10.0));
        assert!(!h.contains_key("leverage"));
    }
}
