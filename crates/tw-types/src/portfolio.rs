use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::errors::IngestError;
use crate::market::{InstrumentId, StrategyId};

/// Positions are identified by `(strategy, instrument)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub strategy_id: StrategyId,
    pub instrument_id: InstrumentId,
}

impl PositionKey {
    pub fn new(strategy_id: &str, instrument_id: &str) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            instrument_id: instrument_id.to_string(),
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.strategy_id, self.instrument_id)
    }
}

/// An execution reported by the order-management system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub strategy_id: StrategyId,
    pub instrument_id: InstrumentId,
    /// Positive buys, negative sells.
    pub signed_quantity: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Fill {
    pub fn new(
        strategy_id: &str,
        instrument_id: &str,
        signed_quantity: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            instrument_id: instrument_id.to_string(),
            signed_quantity,
            price,
            timestamp,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(&self.strategy_id, &self.instrument_id)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.signed_quantity == Decimal::ZERO {
            return Err(IngestError::InvalidFill {
                reason: "zero quantity".to_string(),
            });
        }
        if self.price <= Decimal::ZERO {
            return Err(IngestError::InvalidFill {
                reason: format!("non-positive price {}", self.price),
            });
        }
        if self.strategy_id.is_empty() {
            return Err(IngestError::InvalidFill {
                reason: "empty strategy id".to_string(),
            });
        }
        Ok(())
    }
}

/// Open position of one strategy in one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub strategy_id: StrategyId,
    pub instrument_id: InstrumentId,
    pub signed_quantity: Decimal,
    pub average_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    pub fn new(key: &PositionKey, at: DateTime<Utc>) -> Self {
        Self {
            strategy_id: key.strategy_id.clone(),
            instrument_id: key.instrument_id.clone(),
            signed_quantity: Decimal::ZERO,
            average_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            last_updated: at,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(&self.strategy_id, &self.instrument_id)
    }

    pub fn is_flat(&self) -> bool {
        self.signed_quantity == Decimal::ZERO
    }

    /// Applies a fill in full: new quantity, re-weighted entry price and the
    /// realized PnL of any closed portion. A fill that crosses through zero
    /// closes the old position and opens the remainder at the fill price.
    /// The position is left untouched when any step overflows.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<(), IngestError> {
        let fill_quantity = fill.signed_quantity;
        let new_quantity = checked(self.signed_quantity.checked_add(fill_quantity))?;
        let mut average_entry_price = self.average_entry_price;
        let mut realized_pnl = self.realized_pnl;

        if self.signed_quantity == Decimal::ZERO {
            // Opening new position
            average_entry_price = fill.price;
        } else if self.signed_quantity.is_sign_positive() == fill_quantity.is_sign_positive() {
            // Adding to existing position
            let held_cost = checked(self.signed_quantity.abs().checked_mul(self.average_entry_price))?;
            let fill_cost = checked(fill_quantity.abs().checked_mul(fill.price))?;
            let total_cost = checked(held_cost.checked_add(fill_cost))?;
            let total_quantity = checked(self.signed_quantity.abs().checked_add(fill_quantity.abs()))?;
            average_entry_price = checked(total_cost.checked_div(total_quantity))?;
        } else {
            // Reducing, closing or flipping
            let closed_quantity = fill_quantity.abs().min(self.signed_quantity.abs());
            let per_unit = if self.signed_quantity > Decimal::ZERO {
                fill.price.checked_sub(self.average_entry_price)
            } else {
                self.average_entry_price.checked_sub(fill.price)
            };
            let realized = checked(checked(per_unit)?.checked_mul(closed_quantity))?;
            realized_pnl = checked(realized_pnl.checked_add(realized))?;

            if new_quantity == Decimal::ZERO {
                average_entry_price = Decimal::ZERO;
            } else if new_quantity.is_sign_positive() != self.signed_quantity.is_sign_positive() {
                // Flipped through zero: remainder opens at the fill price
                average_entry_price = fill.price;
            }
        }

        self.signed_quantity = new_quantity;
        self.average_entry_price = average_entry_price;
        self.realized_pnl = realized_pnl;
        self.last_updated = fill.timestamp;
        Ok(())
    }

    /// Signed notional at the given mark; `None` on overflow.
    pub fn notional(&self, mark: Decimal) -> Option<Decimal> {
        self.signed_quantity.checked_mul(mark)
    }

    pub fn unrealized_pnl(&self, mark: Decimal) -> Option<Decimal> {
        mark.checked_sub(self.average_entry_price)?
            .checked_mul(self.signed_quantity)
    }

    pub fn total_pnl(&self, mark: Decimal) -> Option<Decimal> {
        self.realized_pnl.checked_add(self.unrealized_pnl(mark)?)
    }
}

fn checked(value: Option<Decimal>) -> Result<Decimal, IngestError> {
    value.ok_or_else(|| IngestError::InvalidFill {
        reason: "position arithmetic overflows".to_string(),
    })
}

/// A consistent cut of prices and positions.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub seq: u64,
    pub taken_at: DateTime<Utc>,
    /// Latest mid price per instrument.
    pub prices: HashMap<InstrumentId, Decimal>,
    pub positions: HashMap<PositionKey, Position>,
}

impl Snapshot {
    pub fn mid_price(&self, instrument_id: &str) -> Option<Decimal> {
        self.prices.get(instrument_id).copied()
    }

    /// Mid prices as binary64 for the statistics pipeline.
    pub fn marks_f64(&self) -> HashMap<InstrumentId, f64> {
        self.prices
            .iter()
            .filter_map(|(id, px)| px.to_f64().map(|v| (id.clone(), v)))
            .collect()
    }

    /// Net signed quantity per instrument across all strategies.
    pub fn net_quantities(&self) -> HashMap<InstrumentId, Decimal> {
        let mut out: HashMap<InstrumentId, Decimal> = HashMap::new();
        for pos in self.positions.values() {
            *out.entry(pos.instrument_id.clone()).or_insert(Decimal::ZERO) += pos.signed_quantity;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(qty: Decimal, price: Decimal) -> Fill {
        Fill::new("s1", "AAA", qty, price, Utc::now())
    }

    fn position() -> Position {
        Position::new(&PositionKey::new("s1", "AAA"), Utc::now())
    }

    #[test]
    fn test_open_and_add_reweights_entry() {
        let mut pos = position();
        pos.apply_fill(&fill(dec!(100), dec!(10))).unwrap();
        pos.apply_fill(&fill(dec!(100), dec!(12))).unwrap();
        assert_eq!(pos.signed_quantity, dec!(200));
        assert_eq!(pos.average_entry_price, dec!(11));
        assert_eq!(pos.realized_pnl, dec!(0));
    }

    #[test]
    fn test_round_trip_leaves_flat_with_zero_pnl() {
        let mut pos = position();
        pos.apply_fill(&fill(dec!(1000), dec!(100))).unwrap();
        pos.apply_fill(&fill(dec!(-1000), dec!(100))).unwrap();
        assert!(pos.is_flat());
        assert_eq!(pos.realized_pnl, dec!(0));
        assert_eq!(pos.average_entry_price, dec!(0));
    }

    #[test]
    fn test_partial_close_realizes_pnl() {
        let mut pos = position();
        pos.apply_fill(&fill(dec!(-50), dec!(20))).unwrap();
        pos.apply_fill(&fill(dec!(20), dec!(15))).unwrap();
        assert_eq!(pos.signed_quantity, dec!(-30));
        assert_eq!(pos.average_entry_price, dec!(20));
        assert_eq!(pos.realized_pnl, dec!(100));
    }

    #[test]
    fn test_flip_opens_remainder_at_fill_price() {
        let mut pos = position();
        pos.apply_fill(&fill(dec!(10), dec!(100))).unwrap();
        pos.apply_fill(&fill(dec!(-25), dec!(110))).unwrap();
        assert_eq!(pos.signed_quantity, dec!(-15));
        assert_eq!(pos.average_entry_price, dec!(110));
        assert_eq!(pos.realized_pnl, dec!(100));
    }

    #[test]
    fn test_pnl_reconciles_with_marks() {
        let mut pos = position();
        pos.apply_fill(&fill(dec!(10), dec!(100))).unwrap();
        pos.apply_fill(&fill(dec!(-4), dec!(105))).unwrap();
        // 20 realized, 6 * (103 - 100) unrealized
        assert_eq!(pos.total_pnl(dec!(103)), Some(dec!(38)));
        assert_eq!(pos.notional(dec!(103)), Some(dec!(618)));
    }

    #[test]
    fn test_overflowing_fill_is_rejected_without_mutation() {
        let mut pos = position();
        let huge = Decimal::MAX / dec!(4);
        pos.apply_fill(&fill(huge, dec!(10))).unwrap();
        let before = pos.clone();
        let err = pos.apply_fill(&fill(huge, dec!(10))).unwrap_err();
        assert!(matches!(err, IngestError::InvalidFill { .. }));
        assert_eq!(pos, before);
    }

    #[test]
    fn test_zero_quantity_fill_invalid() {
        let f = fill(dec!(0), dec!(100));
        assert!(matches!(f.validate(), Err(IngestError::InvalidFill { .. })));
    }
}
