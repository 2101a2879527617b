//! The index record ([`PacketDescriptor`]) and the query value used to
//! filter/sort/limit a set of them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::variant::Variant;

/// Maximum payload size accepted for a single packet (10 MiB), per the
/// frame-format validation rules.
pub const MAX_PAYLOAD_SIZE: u32 = 10 * 1024 * 1024;

/// The 8-bit protocol opcode extracted from a packet header.
///
/// Values outside the enumerated set are accepted and tagged `Unknown`;
/// `command_type` on [`PacketDescriptor`] always stores the raw byte, this
/// type is purely a convenience for description/logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Passthrough,
    CmdLineData,
    CmdLineBta,
    CmdLineUlps,
    VideoPreviewLine,
    DuplicateMarkedLine,
    CmdLineDirective,
    FrameStartMarker,
    MonitorDevice,
    Unknown(u8),
}

impl CommandType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => CommandType::Passthrough,
            0x11 => CommandType::CmdLineData,
            0x22 => CommandType::CmdLineBta,
            0x33 => CommandType::CmdLineUlps,
            0x44 => CommandType::VideoPreviewLine,
            0x55 => CommandType::DuplicateMarkedLine,
            0x66 => CommandType::CmdLineDirective,
            0x77 => CommandType::FrameStartMarker,
            0x88 => CommandType::MonitorDevice,
            other => CommandType::Unknown(other),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CommandType::Passthrough => "default/passthrough",
            CommandType::CmdLineData => "CMD-line command data",
            CommandType::CmdLineBta => "CMD-line BTA flag",
            CommandType::CmdLineUlps => "CMD-line ULPS flag",
            CommandType::VideoPreviewLine => "video preview line",
            CommandType::DuplicateMarkedLine => "duplicate-marked line",
            CommandType::CmdLineDirective => "command-line directive",
            CommandType::FrameStartMarker => "frame-start marker",
            CommandType::MonitorDevice => "monitor device",
            CommandType::Unknown(_) => "unknown",
        }
    }
}

/// The index record: everything IndexStore knows about one framed packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketDescriptor {
    pub timestamp_ns: u64,
    pub file_path: String,
    pub file_offset: u64,
    pub size: u32,
    pub batch_id: u32,
    pub packet_index: u32,
    pub command_type: u8,
    pub sequence: u32,
    pub valid_header: bool,
    pub features: BTreeMap<String, Variant>,
}

impl PacketDescriptor {
    pub fn command_description(&self) -> &'static str {
        CommandType::from_byte(self.command_type).description()
    }
}

/// Sort direction for [`Query`] results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// A single `field op value` feature filter, e.g. `average>12.5`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl FeatureFilter {
    /// Parses `"field op value"` with no surrounding spaces required.
    ///
    /// Operators are tried in the order `>=`, `<=`, `>`, `<`, `=` so that a
    /// two-character operator is never mistaken for its one-character
    /// prefix.
    pub fn parse(raw: &str) -> Option<FeatureFilter> {
        const OPS: &[(&str, FilterOp)] = &[
            (">=", FilterOp::Ge),
            ("<=", FilterOp::Le),
            (">", FilterOp::Gt),
            ("<", FilterOp::Lt),
            ("=", FilterOp::Eq),
        ];

        for (token, op) in OPS {
            if let Some(idx) = raw.find(token) {
                let field = raw[..idx].trim().to_string();
                let value = raw[idx + token.len()..].trim().to_string();
                if field.is_empty() {
                    return None;
                }
                return Some(FeatureFilter {
                    field,
                    op: *op,
                    value,
                });
            }
        }
        None
    }

    /// Whether `descriptor` passes this filter. Missing features, or
    /// filters that fail to parse as numeric comparisons against a
    /// non-numeric feature, reject the descriptor (`QueryBadFilter`
    /// disposition: treat as unmatched).
    pub fn matches(&self, descriptor: &PacketDescriptor) -> bool {
        let Some(feature) = descriptor.features.get(&self.field) else {
            return false;
        };

        if self.op == FilterOp::Eq {
            if let Variant::Text(t) = feature {
                return t == &self.value;
            }
        }

        let (Some(lhs), Ok(rhs)) = (feature.as_f64(), self.value.parse::<f64>()) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => lhs == rhs,
            FilterOp::Gt => lhs > rhs,
            FilterOp::Ge => lhs >= rhs,
            FilterOp::Lt => lhs < rhs,
            FilterOp::Le => lhs <= rhs,
        }
    }
}

/// A query over the index: a timestamp range, conjunctive feature filters,
/// an optional result cap, and a sort direction.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub timestamp_start: u64,
    pub timestamp_end: u64,
    pub feature_filters: Vec<String>,
    pub limit: Option<usize>,
    pub direction: SortDirection,
}

impl Query {
    pub fn new(timestamp_start: u64, timestamp_end: u64) -> Self {
        Query {
            timestamp_start,
            timestamp_end,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.feature_filters.push(filter.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn descending(mut self) -> Self {
        self.direction = SortDirection::Descending;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_with(features: &[(&str, Variant)]) -> PacketDescriptor {
        PacketDescriptor {
            timestamp_ns: 0,
            file_path: "f".into(),
            file_offset: 0,
            size: 4,
            batch_id: 0,
            packet_index: 0,
            command_type: 0x11,
            sequence: 0,
            valid_header: true,
            features: features
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn parses_two_char_operators_before_prefixes() {
        let f = FeatureFilter::parse("average>=12.5").unwrap();
        assert_eq!(f.field, "average");
        assert_eq!(f.op, FilterOp::Ge);
        assert_eq!(f.value, "12.5");
    }

    #[test]
    fn unknown_field_rejects() {
        let f = FeatureFilter::parse("bogus=1").unwrap();
        let d = descriptor_with(&[("average", Variant::Real(1.0))]);
        assert!(!f.matches(&d));
    }

    #[test]
    fn command_type_unknown_for_unlisted_byte() {
        assert_eq!(CommandType::from_byte(0x99).description(), "unknown");
        assert_eq!(CommandType::from_byte(0x77).description(), "frame-start marker");
    }
}
