//! Risk metrics computation.
//!
//! [`RiskCalculator`] maps each [`Snapshot`] to a [`RiskMetrics`] record:
//! mark-to-market exposures and their decompositions, then historical VaR,
//! expected shortfall, drawdown, volatility and tail probability over the
//! rolling mark window.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use tw_types::{
    DegenerateReason, EsLevel, Instrument, InstrumentId, RiskMetrics, Snapshot, VarLevel,
};

use crate::stats::{
    max_drawdown, quantile_sorted, sample_std, tail_mean_sorted, tail_probability, unsigned_zero,
};
use crate::window::MarkWindow;

/// Square-root-of-time factor from 1-day to 10-day VaR.
const TEN_DAY_SCALE: f64 = 3.162_277_660_168_379_5;

#[derive(Debug, Clone, PartialEq)]
pub struct CalculatorParams {
    pub window_size: usize,
    pub min_observations: usize,
    /// VaR confidences; the first is the headline level.
    pub var_confidences: Vec<f64>,
    /// ES confidences; the first is the headline level.
    pub es_confidences: Vec<f64>,
    pub tail_sigma: f64,
}

impl Default for CalculatorParams {
    fn default() -> Self {
        Self {
            window_size: 250,
            min_observations: 250,
            var_confidences: vec![0.95, 0.99],
            es_confidences: vec![0.975],
            tail_sigma: 3.0,
        }
    }
}

/// Stateful calculator: owns the rolling window and reusable scratch buffers.
pub struct RiskCalculator {
    instruments: Arc<HashMap<InstrumentId, Arc<Instrument>>>,
    params: CalculatorParams,
    window: MarkWindow,
    holdings: Vec<(InstrumentId, f64)>,
    values: Vec<f64>,
    returns: Vec<f64>,
    losses: Vec<f64>,
}

impl RiskCalculator {
    pub fn new(
        instruments: Arc<HashMap<InstrumentId, Arc<Instrument>>>,
        params: CalculatorParams,
    ) -> Self {
        let w = params.window_size.max(2);
        Self {
            instruments,
            window: MarkWindow::new(w),
            holdings: Vec::new(),
            values: Vec::with_capacity(w),
            returns: Vec::with_capacity(w),
            losses: Vec::with_capacity(w),
            params,
        }
    }

    pub fn params(&self) -> &CalculatorParams {
        &self.params
    }

    pub fn observations(&self) -> usize {
        self.window.len()
    }

    /// Computes the record for `snapshot`. Never fails: arithmetic problems
    /// are reported through the record's degenerate flag.
    pub fn compute(&mut self, snapshot: &Snapshot, equity: f64) -> RiskMetrics {
        let mut m = RiskMetrics::empty(snapshot.seq, snapshot.taken_at);

        self.mark_to_market(snapshot, &mut m);

        // --- leverage ---
        m.equity = equity;
        if equity.is_finite() && equity > 0.0 {
            m.leverage = m.gross_exposure / equity;
        } else {
            m.leverage = f64::NAN;
            m.flag(DegenerateReason::ZeroEquity);
        }

        // --- window ---
        let current = snapshot.marks_f64();
        self.window.push(current.clone());
        m.observations = self.window.len();
        self.holdings_from(snapshot);
        self.window.revalue(&self.holdings, &current, &mut self.values);
        self.returns.clear();
        self.returns
            .extend(self.values.windows(2).map(|w| w[1] - w[0]));

        self.window_statistics(&mut m);

        if [m.var_1d, m.expected_shortfall, m.max_drawdown_window, m.leverage, m.volatility]
            .iter()
            .any(|v| v.is_infinite())
        {
            m.flag(DegenerateReason::NonFinite);
        }
        m
    }

    // --- exposures ---

    fn mark_to_market(&self, snapshot: &Snapshot, m: &mut RiskMetrics) {
        let mut open_positions = 0usize;
        for pos in snapshot.positions.values() {
            if !pos.is_flat() {
                open_positions += 1;
            }
            let Some(mark) = snapshot.mid_price(&pos.instrument_id) else {
                if !pos.is_flat() {
                    m.flag(DegenerateReason::MissingPrice);
                }
                continue;
            };
            let notional = match pos.signed_quantity.checked_mul(mark).and_then(|n| n.to_f64()) {
                Some(n) => n,
                None => {
                    warn!(seq = snapshot.seq, position = %pos.key(), "notional overflow");
                    m.flag(DegenerateReason::NonFinite);
                    continue;
                }
            };

            m.gross_exposure += notional.abs();
            m.net_exposure += notional;
            m.by_strategy
                .entry(pos.strategy_id.clone())
                .or_default()
                .add(notional);
            m.by_instrument
                .entry(pos.instrument_id.clone())
                .or_default()
                .add(notional);

            if let Some(inst) = self.instruments.get(&pos.instrument_id) {
                m.by_asset_class
                    .entry(inst.asset_class.to_string())
                    .or_default()
                    .add(notional);
                if inst.factors.is_empty() {
                    if let Some(bucket) = &inst.factor_bucket {
                        *m.by_factor.entry(bucket.clone()).or_insert(0.0) += notional;
                    }
                } else {
                    for (factor, weight) in &inst.factors {
                        *m.by_factor.entry(factor.clone()).or_insert(0.0) += weight * notional;
                    }
                }
            }
        }
        m.portfolio_value = m.net_exposure;
        if open_positions == 0 {
            m.flag(DegenerateReason::EmptyPortfolio);
        }
    }

    fn holdings_from(&mut self, snapshot: &Snapshot) {
        self.holdings.clear();
        for (id, qty) in snapshot.net_quantities() {
            if qty == Decimal::ZERO {
                continue;
            }
            if let Some(q) = qty.to_f64() {
                self.holdings.push((id, q));
            }
        }
        // Stable summation order across snapshots
        self.holdings.sort_by(|a, b| a.0.cmp(&b.0));
    }

    // --- VaR / ES / window statistics ---

    fn window_statistics(&mut self, m: &mut RiskMetrics) {
        let returns = &self.returns;

        m.max_drawdown_window = unsigned_zero(max_drawdown(&self.values));
        m.volatility = sample_std(returns);
        m.tail_loss_prob = tail_probability(returns, m.volatility, self.params.tail_sigma);

        let warm = self.window.len() >= self.params.min_observations && !returns.is_empty();
        if !warm {
            m.flag(DegenerateReason::WindowWarming);
        }

        self.losses.clear();
        self.losses.extend(returns.iter().map(|r| -r));
        self.losses.sort_by(f64::total_cmp);

        m.var_levels = self
            .params
            .var_confidences
            .iter()
            .map(|&c| {
                let var_1d = if warm {
                    unsigned_zero(quantile_sorted(&self.losses, c))
                } else {
                    f64::NAN
                };
                VarLevel {
                    confidence: c,
                    var_1d,
                    var_10d: unsigned_zero(var_1d * TEN_DAY_SCALE),
                }
            })
            .collect();
        m.es_levels = self
            .params
            .es_confidences
            .iter()
            .map(|&c| EsLevel {
                confidence: c,
                expected_shortfall: if warm {
                    unsigned_zero(tail_mean_sorted(&self.losses, c))
                } else {
                    f64::NAN
                },
            })
            .collect();

        if let Some(primary) = m.var_levels.first() {
            m.var_1d = primary.var_1d;
            m.var_10d = primary.var_10d;
        }
        if let Some(primary) = m.es_levels.first() {
            m.expected_shortfall = primary.expected_shortfall;
        }
    }
}
