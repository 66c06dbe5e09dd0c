use serde::{Deserialize, Serialize};
use std::fmt;

/// The entity an alert or isolation concerns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Strategy(String),
    Instrument(String),
    Counterparty(String),
    AssetClass(String),
    Factor(String),
    System,
}

impl Target {
    /// Stable string key, used for deduplication and per-target state.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Strategy(id) => write!(f, "strategy:{id}"),
            Target::Instrument(id) => write!(f, "instrument:{id}"),
            Target::Counterparty(id) => write!(f, "counterparty:{id}"),
            Target::AssetClass(id) => write!(f, "asset_class:{id}"),
            Target::Factor(id) => write!(f, "factor:{id}"),
            Target::System => write!(f, "system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_distinct_per_kind() {
        assert_eq!(Target::Strategy("a".into()).key(), "strategy:a");
        assert_ne!(
            Target::Strategy("a".into()).key(),
            Target::Instrument("a".into()).key()
        );
        assert_eq!(Target::System.key(), "system");
        assert_ne!(
            Target::AssetClass("equity".into()).key(),
            Target::Factor("equity".into()).key()
        );
    }

    #[test]
    fn serde_shape() {
        let json = serde_json::to_string(&Target::Strategy("alpha".into())).unwrap();
        assert_eq!(json, r#"{"kind":"strategy","id":"alpha"}"#);
        let sys: Target = serde_json::from_str(r#"{"kind":"system"}"#).unwrap();
        assert_eq!(sys, Target::System);
    }
}
