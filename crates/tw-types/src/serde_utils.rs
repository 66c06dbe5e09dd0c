//! Shared serialization helpers.

use serde::{Deserialize, Deserializer, Serializer};

/// Serialize a binary64 with `NaN`/infinite values as JSON `null`, and read
/// `null` back as `NaN`. Degenerate risk metrics use `NaN` as their sentinel.
pub mod float_or_null {
    use super::*;

    pub fn serialize<S>(value: &f64, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_finite() {
            s.serialize_f64(*value)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }
}
