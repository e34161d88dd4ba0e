//! Normalized data model: stat keys/results/metadata and the output Point
//!
//! See spec §3. `StatKey` is an opaque dotted name; `StatResult` is one
//! API-returned record per key per tick; `StatDetail` is per-key metadata
//! fetched once at startup; `Point` is the normalized measurement the
//! decoder emits and the sink consumes.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::value::Value;

/// Opaque dotted stat name, e.g. `cluster.cpu.user.avg`.
pub type StatKey = String;

/// Numeric device identifier. `0` means cluster-aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn is_cluster_wide(&self) -> bool {
        self.0 == 0
    }
}

/// Logical node number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeNumber(pub u32);

/// Per-stat error taxonomy observed on `StatResult.error_code` (spec §7).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorCode {
    None,
    Degraded,
    Stale,
    ConnTimeout,
    Timeout,
    NoHistory,
    System,
    NotPresent,
    NotImplemented,
    NotConfigured,
    NoData,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Success,
    Degraded,
    Permanent,
    Transient,
    Unknown,
}

impl ErrorCode {
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorCode::None => ErrorClass::Success,
            ErrorCode::Degraded => ErrorClass::Degraded,
            ErrorCode::NotPresent
            | ErrorCode::NotImplemented
            | ErrorCode::NotConfigured
            | ErrorCode::NoData => ErrorClass::Permanent,
            ErrorCode::Stale
            | ErrorCode::ConnTimeout
            | ErrorCode::Timeout
            | ErrorCode::NoHistory
            | ErrorCode::System => ErrorClass::Transient,
            ErrorCode::Unknown => ErrorClass::Unknown,
        }
    }

    /// A result whose value is present and decodable (success or degraded).
    pub fn is_usable(&self) -> bool {
        matches!(self.class(), ErrorClass::Success | ErrorClass::Degraded)
    }
}

/// One API-returned record for a key at a collection tick.
#[derive(Debug, Clone)]
pub struct StatResult {
    pub key: StatKey,
    pub devid: DeviceId,
    pub node: Option<NodeNumber>,
    pub time: i64,
    pub error_code: ErrorCode,
    pub error: Option<String>,
    pub value: Value,
}

/// Per-key metadata, fetched once per cluster at startup.
#[derive(Debug, Clone)]
pub struct StatDetail {
    pub valid: bool,
    pub description: String,
    pub units: String,
    pub scope: String,
    pub datatype: String,
    pub aggregation_type: String,
    /// Native update interval in seconds; 0 means "on demand" / unspecified.
    pub native_update_interval: Duration,
}

impl StatDetail {
    /// Synthetic detail for the fixed-cadence summary stats (spec §6.3).
    pub fn synthetic_summary(kind: &str) -> Self {
        StatDetail {
            valid: true,
            description: format!("Summary statistics for {kind}"),
            units: String::new(),
            scope: String::new(),
            datatype: String::new(),
            aggregation_type: String::new(),
            native_update_interval: Duration::from_secs(5),
        }
    }

    pub fn invalid() -> Self {
        StatDetail {
            valid: false,
            description: String::new(),
            units: String::new(),
            scope: String::new(),
            datatype: String::new(),
            aggregation_type: String::new(),
            native_update_interval: Duration::ZERO,
        }
    }
}

/// A single field value: numeric in the common case, string for the rare
/// fields the decoder treats as primitives rather than tags (spec §4.3
/// speaks only of "numeric or (rarely) string"; the decoder itself only
/// ever emits numbers into fields, but downstream sinks may carry strings
/// through `extra`-style passthrough, so the type allows for it).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    String(String),
}

pub type Fields = HashMap<String, FieldValue>;
pub type Tags = HashMap<String, String>;

/// Normalized measurement record. Invariant: `fields.len() == tags.len()`.
#[derive(Debug, Clone)]
pub struct Point {
    pub name: String,
    pub timestamp: i64,
    pub fields: Vec<Fields>,
    pub tags: Vec<Tags>,
}

impl Point {
    pub fn new(name: impl Into<String>, timestamp: i64, fields: Vec<Fields>, tags: Vec<Tags>) -> Self {
        debug_assert_eq!(
            fields.len(),
            tags.len(),
            "fields/tags arrays must stay aligned"
        );
        Point {
            name: name.into(),
            timestamp,
            fields,
            tags,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_classification() {
        assert_eq!(ErrorCode::None.class(), ErrorClass::Success);
        assert_eq!(ErrorCode::Degraded.class(), ErrorClass::Degraded);
        assert_eq!(ErrorCode::NotPresent.class(), ErrorClass::Permanent);
        assert_eq!(ErrorCode::Stale.class(), ErrorClass::Transient);
        assert_eq!(ErrorCode::Unknown.class(), ErrorClass::Unknown);
        assert!(ErrorCode::Degraded.is_usable());
        assert!(!ErrorCode::NotPresent.is_usable());
    }

    #[test]
    fn device_id_cluster_wide() {
        assert!(DeviceId(0).is_cluster_wide());
        assert!(!DeviceId(5).is_cluster_wide());
    }
}
