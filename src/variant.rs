//! The closed value type carried by a [`crate::descriptor::PacketDescriptor`]'s
//! `features` map.
//!
//! Feature extractors only ever produce an integer, a real, a list of
//! integers (histogram bins), or text, so a closed enum round-trips
//! losslessly through `serde_json` and lets callers match exhaustively
//! instead of probing a dynamic type.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    Int(i64),
    Real(f64),
    Text(String),
    IntList(Vec<i64>),
}

impl Variant {
    /// Numeric value for filter comparisons, if this variant carries one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Int(v) => Some(*v as f64),
            Variant::Real(v) => Some(*v),
            Variant::Text(_) | Variant::IntList(_) => None,
        }
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Real(v)
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::Text(v)
    }
}

impl From<Vec<i64>> for Variant {
    fn from(v: Vec<i64>) -> Self {
        Variant::IntList(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        for v in [
            Variant::Int(-7),
            Variant::Real(3.25),
            Variant::Text("unknown".into()),
            Variant::IntList(vec![1, 2, 3]),
        ] {
            let encoded = serde_json::to_string(&v).unwrap();
            let decoded: Variant = serde_json::from_str(&encoded).unwrap();
            assert_eq!(v, decoded);
        }
    }

    #[test]
    fn as_f64_only_for_numeric_variants() {
        assert_eq!(Variant::Int(4).as_f64(), Some(4.0));
        assert_eq!(Variant::Real(1.5).as_f64(), Some(1.5));
        assert_eq!(Variant::Text("x".into()).as_f64(), None);
        assert_eq!(Variant::IntList(vec![1]).as_f64(), None);
    }
}
