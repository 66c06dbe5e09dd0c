use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::IngestError;

/// Opaque, stable instrument key.
pub type InstrumentId = String;

/// Strategy identifier as reported by the order-management system.
pub type StrategyId = String;

/// Asset classes tracked by the risk core
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    Crypto,
    Forex,
    Commodity,
    Bond,
    Derivative,
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetClass::Equity => "equity",
            AssetClass::Crypto => "crypto",
            AssetClass::Forex => "forex",
            AssetClass::Commodity => "commodity",
            AssetClass::Bond => "bond",
            AssetClass::Derivative => "derivative",
        };
        write!(f, "{}", s)
    }
}

/// A tradable instrument. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub currency: String,
    pub asset_class: AssetClass,
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,
    /// Coarse risk-factor bucket, e.g. "us_tech".
    #[serde(default)]
    pub factor_bucket: Option<String>,
    /// Factor loadings used for `by_factor` decomposition.
    #[serde(default)]
    pub factors: BTreeMap<String, f64>,
}

fn default_tick_size() -> Decimal {
    Decimal::new(1, 2)
}

impl Instrument {
    pub fn new(id: &str, currency: &str, asset_class: AssetClass) -> Self {
        Self {
            id: id.to_string(),
            currency: currency.to_string(),
            asset_class,
            tick_size: default_tick_size(),
            factor_bucket: None,
            factors: BTreeMap::new(),
        }
    }

    pub fn with_factor(mut self, factor: &str, weight: f64) -> Self {
        self.factors.insert(factor.to_string(), weight);
        self
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.asset_class, self.id)
    }
}

/// Top-of-book market data event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_id: InstrumentId,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    #[serde(default)]
    pub volume: Decimal,
    pub source_timestamp: DateTime<Utc>,
    /// Assigned by the store on entry; whatever the caller supplies is overwritten.
    #[serde(default = "Utc::now")]
    pub ingest_timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(
        instrument_id: &str,
        bid: Option<Decimal>,
        ask: Option<Decimal>,
        last: Option<Decimal>,
        volume: Decimal,
        source_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            bid,
            ask,
            last,
            volume,
            source_timestamp,
            ingest_timestamp: source_timestamp,
        }
    }

    /// Quote-only tick with both sides present.
    pub fn quote(instrument_id: &str, bid: Decimal, ask: Decimal, at: DateTime<Utc>) -> Self {
        Self::new(instrument_id, Some(bid), Some(ask), None, Decimal::ZERO, at)
    }

    /// Mid price: the bid/ask midpoint when both sides are present, else the
    /// last trade, else whichever single side is present. `None` when the
    /// quote sum overflows.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => bid.checked_add(ask).map(|sum| sum / Decimal::from(2)),
            _ => self.last.or(self.bid).or(self.ask),
        }
    }

    /// Checks the structural invariants of a tick before it reaches the store.
    pub fn validate(&self) -> Result<(), IngestError> {
        if let (Some(bid), Some(ask)) = (self.bid, self.ask) {
            if bid > ask {
                return Err(IngestError::InvalidTick {
                    reason: format!("crossed quote: bid {bid} > ask {ask}"),
                });
            }
        }
        for (name, px) in [("bid", self.bid), ("ask", self.ask), ("last", self.last)] {
            if let Some(px) = px {
                if px <= Decimal::ZERO {
                    return Err(IngestError::InvalidTick {
                        reason: format!("non-positive {name} price {px}"),
                    });
                }
            }
        }
        if self.volume < Decimal::ZERO {
            return Err(IngestError::InvalidTick {
                reason: format!("negative volume {}", self.volume),
            });
        }
        if let (Some(bid), Some(ask)) = (self.bid, self.ask) {
            if bid.checked_add(ask).is_none() {
                return Err(IngestError::InvalidTick {
                    reason: format!("quote {bid}/{ask} overflows"),
                });
            }
        }
        if self.mid_price().is_none() {
            return Err(IngestError::InvalidTick {
                reason: "tick carries no price".to_string(),
            });
        }
        Ok(())
    }
}

/// Synchronous acknowledgement that an event was placed into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ingest_timestamp: DateTime<Utc>,
    /// False when the event was a no-op (e.g. a repeated tick).
    pub applied: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mid_price_prefers_quote() {
        let t = Tick::new("AAA", Some(dec!(99)), Some(dec!(101)), Some(dec!(120)), dec!(0), Utc::now());
        assert_eq!(t.mid_price(), Some(dec!(100)));

        let t = Tick::new("AAA", Some(dec!(99)), None, Some(dec!(120)), dec!(0), Utc::now());
        assert_eq!(t.mid_price(), Some(dec!(120)));

        let t = Tick::new("AAA", None, Some(dec!(101)), None, dec!(0), Utc::now());
        assert_eq!(t.mid_price(), Some(dec!(101)));
    }

    #[test]
    fn test_crossed_quote_rejected() {
        let t = Tick::quote("AAA", dec!(101), dec!(100), Utc::now());
        assert!(matches!(t.validate(), Err(IngestError::InvalidTick { .. })));
    }

    #[test]
    fn test_overflowing_quote_rejected() {
        let t = Tick::quote("AAA", Decimal::MAX, Decimal::MAX, Utc::now());
        assert_eq!(t.mid_price(), None);
        assert!(matches!(t.validate(), Err(IngestError::InvalidTick { .. })));
    }

    #[test]
    fn test_priceless_tick_rejected() {
        let t = Tick::new("AAA", None, None, None, dec!(10), Utc::now());
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_asset_class_serde_name() {
        let json = serde_json::to_string(&AssetClass::Equity).unwrap();
        assert_eq!(json, "\"equity\"");
        assert_eq!(format!("{}", AssetClass::Crypto), "crypto");
    }
}
