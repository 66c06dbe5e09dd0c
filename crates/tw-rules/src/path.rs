//! Metric paths: the small language rules use to address a `RiskMetrics`
//! field.
//!
//! ```text
//! var_1d                      headline scalar
//! var_1d[0.99]                scalar at a configured confidence
//! by_strategy.alpha.gross     breakdown entry (gross | net)
//! by_strategy.*.net           every entry of a breakdown, one target each
//! by_factor.tech              factor exposure
//! ```

use std::str::FromStr;

use tw_types::{RiskMetrics, RuleError, Target};

const CONFIDENCE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    PortfolioValue,
    GrossExposure,
    NetExposure,
    Equity,
    Leverage,
    Var1d,
    Var10d,
    ExpectedShortfall,
    MaxDrawdownWindow,
    Volatility,
    TailLossProb,
    Observations,
    ComputationUs,
}

impl Scalar {
    fn parse(name: &str) -> Option<Scalar> {
        let s = match name {
            "portfolio_value" => Scalar::PortfolioValue,
            "gross_exposure" => Scalar::GrossExposure,
            "net_exposure" => Scalar::NetExposure,
            "equity" => Scalar::Equity,
            "leverage" => Scalar::Leverage,
            "var_1d" => Scalar::Var1d,
            "var_10d" => Scalar::Var10d,
            "expected_shortfall" => Scalar::ExpectedShortfall,
            "max_drawdown_window" => Scalar::MaxDrawdownWindow,
            "volatility" => Scalar::Volatility,
            "tail_loss_prob" => Scalar::TailLossProb,
            "observations" => Scalar::Observations,
            "computation_us" => Scalar::ComputationUs,
            _ => return None,
        };
        Some(s)
    }

    fn read(&self, m: &RiskMetrics) -> f64 {
        match self {
            Scalar::PortfolioValue => m.portfolio_value,
            Scalar::GrossExposure => m.gross_exposure,
            Scalar::NetExposure => m.net_exposure,
            Scalar::Equity => m.equity,
            Scalar::Leverage => m.leverage,
            Scalar::Var1d => m.var_1d,
            Scalar::Var10d => m.var_10d,
            Scalar::ExpectedShortfall => m.expected_shortfall,
            Scalar::MaxDrawdownWindow => m.max_drawdown_window,
            Scalar::Volatility => m.volatility,
            Scalar::TailLossProb => m.tail_loss_prob,
            Scalar::Observations => m.observations as f64,
            Scalar::ComputationUs => m.computation_us as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelMetric {
    Var1d,
    Var10d,
    ExpectedShortfall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Strategy,
    AssetClass,
    Instrument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Gross,
    Net,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySelector {
    Exact(String),
    Any,
}

/// A parsed metric path.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricPath {
    Scalar(Scalar),
    Level { metric: LevelMetric, confidence: f64 },
    Breakdown { dimension: Dimension, key: KeySelector, field: Field },
    Factor(KeySelector),
}

impl MetricPath {
    pub fn parse(path: &str) -> Result<MetricPath, RuleError> {
        let invalid = |message: &str| RuleError::InvalidPath {
            path: path.to_string(),
            message: message.to_string(),
        };
        let path = path.trim();
        if path.is_empty() {
            return Err(invalid("empty path"));
        }

        if let Some(open) = path.find('[') {
            let body = path
                .strip_suffix(']')
                .ok_or_else(|| invalid("missing closing ']'"))?;
            let metric = match &path[..open] {
                "var_1d" => LevelMetric::Var1d,
                "var_10d" => LevelMetric::Var10d,
                "expected_shortfall" => LevelMetric::ExpectedShortfall,
                _ => return Err(invalid("only var_1d, var_10d and expected_shortfall take a confidence")),
            };
            let confidence: f64 = body[open + 1..]
                .parse()
                .map_err(|_| invalid("confidence is not a number"))?;
            if !(confidence > 0.0 && confidence < 1.0) {
                return Err(invalid("confidence must be in (0, 1)"));
            }
            return Ok(MetricPath::Level { metric, confidence });
        }

        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let dimension = match head {
            "by_strategy" => Some(Dimension::Strategy),
            "by_asset_class" => Some(Dimension::AssetClass),
            "by_instrument" => Some(Dimension::Instrument),
            "by_factor" => {
                let key = rest
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| invalid("expected by_factor.<factor>"))?;
                return Ok(MetricPath::Factor(selector(key)));
            }
            _ => None,
        };

        match (dimension, rest) {
            (None, None) => Scalar::parse(head)
                .map(MetricPath::Scalar)
                .ok_or_else(|| invalid("unknown metric")),
            (None, Some(_)) => Err(invalid("unknown metric")),
            (Some(_), None) => Err(invalid("expected <dimension>.<key>.gross|net")),
            (Some(dimension), Some(rest)) => {
                // Keys may contain dots; the field is after the last one
                let (key, field) = rest
                    .rsplit_once('.')
                    .ok_or_else(|| invalid("expected <dimension>.<key>.gross|net"))?;
                let field = match field {
                    "gross" => Field::Gross,
                    "net" => Field::Net,
                    _ => return Err(invalid("field must be gross or net")),
                };
                if key.is_empty() {
                    return Err(invalid("empty key"));
                }
                Ok(MetricPath::Breakdown {
                    dimension,
                    key: selector(key),
                    field,
                })
            }
        }
    }

    /// Confidence this path requires to be configured, if any.
    pub fn required_confidence(&self) -> Option<(LevelMetric, f64)> {
        match self {
            MetricPath::Level { metric, confidence } => Some((*metric, *confidence)),
            _ => None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(
            self,
            MetricPath::Breakdown { key: KeySelector::Any, .. } | MetricPath::Factor(KeySelector::Any)
        )
    }

    /// Resolves the path to `(target, value)` pairs. `None` means the path
    /// does not exist in this record; a wildcard over an empty breakdown
    /// resolves to an empty list.
    pub fn resolve(&self, m: &RiskMetrics) -> Option<Vec<(Target, f64)>> {
        match self {
            MetricPath::Scalar(s) => Some(vec![(Target::System, s.read(m))]),
            MetricPath::Level { metric, confidence } => {
                let close = |c: f64| (c - confidence).abs() < CONFIDENCE_EPSILON;
                let v = match metric {
                    LevelMetric::Var1d => m.var_levels.iter().find(|l| close(l.confidence))?.var_1d,
                    LevelMetric::Var10d => m.var_levels.iter().find(|l| close(l.confidence))?.var_10d,
                    LevelMetric::ExpectedShortfall => {
                        m.es_levels
                            .iter()
                            .find(|l| close(l.confidence))?
                            .expected_shortfall
                    }
                };
                Some(vec![(Target::System, v)])
            }
            MetricPath::Breakdown { dimension, key, field } => {
                let map = match dimension {
                    Dimension::Strategy => &m.by_strategy,
                    Dimension::AssetClass => &m.by_asset_class,
                    Dimension::Instrument => &m.by_instrument,
                };
                let read = |b: &tw_types::ExposureBreakdown| match field {
                    Field::Gross => b.gross,
                    Field::Net => b.net,
                };
                match key {
                    KeySelector::Exact(k) => {
                        let b = map.get(k)?;
                        Some(vec![(target_for(*dimension, k), read(b))])
                    }
                    KeySelector::Any => Some(
                        map.iter()
                            .map(|(k, b)| (target_for(*dimension, k), read(b)))
                            .collect(),
                    ),
                }
            }
            MetricPath::Factor(key) => match key {
                KeySelector::Exact(f) => Some(vec![(Target::Factor(f.clone()), *m.by_factor.get(f)?)]),
                KeySelector::Any => Some(
                    m.by_factor
                        .iter()
                        .map(|(f, v)| (Target::Factor(f.clone()), *v))
                        .collect(),
                ),
            },
        }
    }

    /// Convenience for single-valued paths.
    pub fn resolve_one(&self, m: &RiskMetrics) -> Option<f64> {
        self.resolve(m)?.first().map(|(_, v)| *v)
    }
}

fn selector(key: &str) -> KeySelector {
    if key == "*" {
        KeySelector::Any
    } else {
        KeySelector::Exact(key.to_string())
    }
}

fn target_for(dimension: Dimension, key: &str) -> Target {
    match dimension {
        Dimension::Strategy => Target::Strategy(key.to_string()),
        Dimension::Instrument => Target::Instrument(key.to_string()),
        Dimension::AssetClass => Target::AssetClass(key.to_string()),
    }
}

impl FromStr for MetricPath {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricPath::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tw_types::{ExposureBreakdown, VarLevel};

    fn metrics() -> RiskMetrics {
        let mut m = RiskMetrics::empty(1, Utc::now());
        m.var_1d = 2_500.0;
        m.var_levels = vec![
            VarLevel { confidence: 0.95, var_1d: 2_500.0, var_10d: 7_905.0 },
            VarLevel { confidence: 0.99, var_1d: 3_000.0, var_10d: 9_486.0 },
        ];
        m.by_strategy.insert("alpha".into(), ExposureBreakdown { gross: 10.0, net: -4.0 });
        m.by_strategy.insert("beta".into(), ExposureBreakdown { gross: 3.0, net: 3.0 });
        m.by_instrument.insert("BRK.B".into(), ExposureBreakdown { gross: 7.0, net: 7.0 });
        m.by_factor.insert("tech".into(), 1.5);
        m
    }

    #[test]
    fn parses_and_resolves_scalars() {
        let p = MetricPath::parse("var_1d").unwrap();
        assert_eq!(p.resolve(&metrics()), Some(vec![(Target::System, 2_500.0)]));
        assert!(MetricPath::parse("var_2d").is_err());
        assert!(MetricPath::parse("").is_err());
    }

    #[test]
    fn levels_by_confidence() {
        let p = MetricPath::parse("var_1d[0.99]").unwrap();
        assert_eq!(p.resolve_one(&metrics()), Some(3_000.0));
        let missing = MetricPath::parse("var_1d[0.9]").unwrap();
        assert_eq!(missing.resolve(&metrics()), None);
        assert!(MetricPath::parse("leverage[0.99]").is_err());
        assert!(MetricPath::parse("var_1d[1.5]").is_err());
        assert!(MetricPath::parse("var_1d[0.99").is_err());
    }

    #[test]
    fn breakdown_paths_target_their_key() {
        let p = MetricPath::parse("by_strategy.alpha.gross").unwrap();
        assert_eq!(
            p.resolve(&metrics()),
            Some(vec![(Target::Strategy("alpha".into()), 10.0)])
        );
        let dotted = MetricPath::parse("by_instrument.BRK.B.net").unwrap();
        assert_eq!(
            dotted.resolve(&metrics()),
            Some(vec![(Target::Instrument("BRK.B".into()), 7.0)])
        );
        let missing = MetricPath::parse("by_strategy.gamma.net").unwrap();
        assert_eq!(missing.resolve(&metrics()), None);
        assert!(MetricPath::parse("by_strategy.alpha.value").is_err());
        assert!(MetricPath::parse("by_strategy.alpha").is_err());
    }

    #[test]
    fn wildcard_expands_per_target() {
        let p = MetricPath::parse("by_strategy.*.net").unwrap();
        assert!(p.is_wildcard());
        let resolved = p.resolve(&metrics()).unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains(&(Target::Strategy("beta".into()), 3.0)));

        let empty = RiskMetrics::empty(2, Utc::now());
        assert_eq!(p.resolve(&empty), Some(vec![]));
    }

    #[test]
    fn asset_class_wildcard_keeps_each_class_distinct() {
        let mut m = metrics();
        m.by_asset_class.insert("equity".into(), ExposureBreakdown { gross: 5_000.0, net: 5_000.0 });
        m.by_asset_class.insert("crypto".into(), ExposureBreakdown { gross: 10.0, net: 10.0 });
        let resolved = MetricPath::parse("by_asset_class.*.gross").unwrap().resolve(&m).unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains(&(Target::AssetClass("equity".into()), 5_000.0)));
        assert!(resolved.contains(&(Target::AssetClass("crypto".into()), 10.0)));
    }

    #[test]
    fn factor_paths() {
        let p = MetricPath::parse("by_factor.tech").unwrap();
        assert_eq!(
            p.resolve(&metrics()),
            Some(vec![(Target::Factor("tech".into()), 1.5)])
        );
        assert!(MetricPath::parse("by_factor").is_err());
    }
}
