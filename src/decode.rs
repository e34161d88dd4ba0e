//! Recursive stat decoder (spec §4.3)
//!
//! Flattens an arbitrarily nested per-key `Value` into aligned
//! `(fields, tags)` arrays. The recursion is a fold over the closed value
//! set with depth-parameterized rules; see spec §4.3 for the full table.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::{FieldValue, Point, StatResult, Tags};
use crate::value::{Value, ValueKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The point is unusable; caller drops it and continues.
    #[error("unusable value at depth {depth}: {kind} ({detail})")]
    Unusable {
        depth: u32,
        kind: ValueKind,
        detail: &'static str,
    },
    /// A logic invariant was violated; this is a programming defect, not a
    /// data defect, and the caller should treat it as fatal (spec §7).
    #[error("decoder invariant violated: {0}")]
    Invariant(&'static str),
}

impl DecodeError {
    /// Logic invariant violations are programming defects, not data
    /// defects, and the caller must treat them as fatal (spec §7).
    pub fn is_invariant(&self) -> bool {
        matches!(self, DecodeError::Invariant(_))
    }
}

const DROPPED_OP_NAMES: [&str; 2] = ["change_notify", "read_directory_change"];
const SENTINEL_FIELDNAME: &str = "value";

/// One entry emitted mid-recursion, before the drop predicate is applied.
struct Entry {
    fields: HashMap<String, FieldValue>,
    tags: Tags,
}

/// Build the base tag set for a `StatResult` (spec §4.3 "Base tagging").
pub fn base_tags(cluster_name: &str, result: &StatResult, degraded_labeling: bool) -> Tags {
    let mut tags = Tags::new();
    tags.insert("cluster".to_string(), cluster_name.to_string());
    if !result.devid.is_cluster_wide() {
        tags.insert("devid".to_string(), result.devid.0.to_string());
        let node = result
            .node
            .map(|n| n.0.to_string())
            .unwrap_or_else(|| result.devid.0.to_string());
        tags.insert("node".to_string(), node);
    }
    if degraded_labeling {
        let is_degraded = matches!(result.error_code, crate::model::ErrorCode::Degraded);
        tags.insert(
            "degraded".to_string(),
            if is_degraded { "true" } else { "false" }.to_string(),
        );
    }
    tags
}

/// Decode one `StatResult` (assumed "present": `None`/`Degraded` error
/// code) into aligned `(fields, tags)` arrays, dropping entries the §4.3
/// drop predicate excludes.
pub fn decode_result(
    cluster_name: &str,
    result: &StatResult,
    degraded_labeling: bool,
) -> Result<Point, DecodeError> {
    let base = base_tags(cluster_name, result, degraded_labeling);
    let entries = decode_value(&result.key, SENTINEL_FIELDNAME, &result.value, &base, 0)?;

    let mut fields = Vec::with_capacity(entries.len());
    let mut tags = Vec::with_capacity(entries.len());
    for entry in entries {
        if should_drop(&entry.tags) {
            continue;
        }
        fields.push(entry.fields);
        tags.push(entry.tags);
    }

    Ok(Point::new(result.key.clone(), result.time, fields, tags))
}

fn should_drop(tags: &Tags) -> bool {
    tags.get("op_name")
        .map(|v| DROPPED_OP_NAMES.contains(&v.as_str()))
        .unwrap_or(false)
}

fn decode_value(
    name: &str,
    fieldname: &str,
    v: &Value,
    base_tags: &Tags,
    depth: u32,
) -> Result<Vec<Entry>, DecodeError> {
    match v {
        Value::Number(n) => {
            if fieldname.is_empty() {
                return Err(DecodeError::Invariant(
                    "numeric primitive emitted with an empty fieldname",
                ));
            }
            let mut fields = HashMap::new();
            fields.insert(fieldname.to_string(), FieldValue::Number(*n));
            Ok(vec![Entry {
                fields,
                tags: base_tags.clone(),
            }])
        }
        Value::String(s) => {
            if depth == 0 {
                return Err(DecodeError::Unusable {
                    depth,
                    kind: ValueKind::String,
                    detail: "a bare string at the top level carries no field to emit",
                });
            }
            let mut tags = base_tags.clone();
            tags.insert(fieldname.to_string(), s.clone());
            Ok(vec![Entry {
                fields: HashMap::new(),
                tags,
            }])
        }
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => {
            let mut out = Vec::new();
            for item in items {
                if matches!(item.kind(), ValueKind::Sequence) {
                    return Err(DecodeError::Invariant(
                        "sequences must not nest directly inside sequences",
                    ));
                }
                out.extend(decode_value(name, "", item, base_tags, depth + 1)?);
            }
            Ok(out)
        }
        Value::Map(entries) => decode_map(name, entries, base_tags, depth),
    }
}

fn decode_map(
    name: &str,
    entries: &std::collections::BTreeMap<String, Value>,
    base_tags: &Tags,
    depth: u32,
) -> Result<Vec<Entry>, DecodeError> {
    let mut own_fields: HashMap<String, FieldValue> = HashMap::new();
    let mut own_tags = base_tags.clone();
    let mut sub_entries: Vec<Vec<Entry>> = Vec::new();

    for (key, value) in entries {
        if key == "op_id" {
            // spec §9: drop op_id, never attempt the masked-int fixup.
            continue;
        }
        match value {
            Value::String(s) => {
                own_tags.insert(key.clone(), s.clone());
            }
            Value::Number(n) => {
                own_fields.insert(key.clone(), FieldValue::Number(*n));
            }
            Value::Null => {}
            Value::Sequence(_) => {
                let emitted = decode_value(name, key, value, base_tags, depth + 1)?;
                sub_entries.push(emitted);
            }
            Value::Map(_) => {
                return Err(DecodeError::Invariant(
                    "nested maps inside a map entry are not part of the decoder's closed shape",
                ));
            }
        }
    }

    if sub_entries.is_empty() {
        return Ok(vec![Entry {
            fields: own_fields,
            tags: own_tags,
        }]);
    }

    let mut out = Vec::new();
    for group in sub_entries {
        for entry in group {
            let mut fields = own_fields.clone();
            fields.extend(entry.fields);
            let mut tags = own_tags.clone();
            tags.extend(entry.tags);
            out.push(Entry { fields, tags });
        }
    }
    Ok(out)
}

/// One protocol-summary item → one point (spec §4.3 "Summary decoders").
pub fn decode_protocol_summary_item(
    cluster_name: &str,
    node: Option<crate::model::NodeNumber>,
    item: &crate::value::Value,
) -> Result<Point, DecodeError> {
    let m = item
        .as_map()
        .ok_or(DecodeError::Invariant("protocol summary item must be a map"))?;

    let mut tags = Tags::new();
    tags.insert("cluster".to_string(), cluster_name.to_string());
    if let Some(n) = node {
        tags.insert("node".to_string(), n.0.to_string());
    }
    for tag_key in ["class", "operation", "protocol"] {
        if let Some(Value::String(s)) = m.get(tag_key) {
            tags.insert(tag_key.to_string(), s.clone());
        }
    }

    let mut fields = HashMap::new();
    for (key, value) in m {
        if matches!(key.as_str(), "class" | "operation" | "protocol") {
            continue;
        }
        if let Value::Number(n) = value {
            fields.insert(key.clone(), FieldValue::Number(*n));
        }
    }

    Ok(Point::new("node.summary.protocol", 0, vec![fields], vec![tags]))
}

/// One client-summary item → one point (spec §4.3).
pub fn decode_client_summary_item(
    cluster_name: &str,
    node: Option<crate::model::NodeNumber>,
    item: &crate::value::Value,
) -> Result<Point, DecodeError> {
    let m = item
        .as_map()
        .ok_or(DecodeError::Invariant("client summary item must be a map"))?;

    let mut tags = Tags::new();
    tags.insert("cluster".to_string(), cluster_name.to_string());
    if let Some(n) = node {
        tags.insert("node".to_string(), n.0.to_string());
    }
    const TAG_KEYS: [&str; 8] = [
        "local_addr",
        "local_name",
        "remote_addr",
        "remote_name",
        "protocol",
        "user_id",
        "user_name",
        "user_type",
    ];
    for tag_key in TAG_KEYS {
        if let Some(Value::String(s)) = m.get(tag_key) {
            tags.insert(tag_key.to_string(), s.clone());
        }
    }
    if let Some(Value::String(s)) = m.get("class") {
        tags.insert("class".to_string(), s.clone());
    }

    let mut fields = HashMap::new();
    for (key, value) in m {
        if TAG_KEYS.contains(&key.as_str()) || key == "class" {
            continue;
        }
        if let Value::Number(n) = value {
            fields.insert(key.clone(), FieldValue::Number(*n));
        }
    }

    Ok(Point::new("node.summary.client", 0, vec![fields], vec![tags]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceId, ErrorCode, NodeNumber};
    use serde_json::json;

    fn result(key: &str, devid: u32, node: Option<u32>, value: serde_json::Value) -> StatResult {
        StatResult {
            key: key.to_string(),
            devid: DeviceId(devid),
            node: node.map(NodeNumber),
            time: 1000,
            error_code: ErrorCode::None,
            error: None,
            value: value.into(),
        }
    }

    #[test]
    fn simple_cluster_scope_numeric() {
        let r = result("cluster.net.ext.bytes.in.rate", 0, None, json!(88920.0));
        let p = decode_result("clusterA", &r, false).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p.fields[0]["value"], FieldValue::Number(88920.0));
        assert_eq!(p.tags[0].get("cluster"), Some(&"clusterA".to_string()));
        assert!(!p.tags[0].contains_key("devid"));
    }

    #[test]
    fn node_scope_map() {
        let r = result(
            "node.mds.cache.stats",
            5,
            Some(5),
            json!({"hits": 5191200, "misses": 414440}),
        );
        let p = decode_result("clusterD", &r, false).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p.fields[0]["hits"], FieldValue::Number(5191200.0));
        assert_eq!(p.fields[0]["misses"], FieldValue::Number(414440.0));
        assert_eq!(p.tags[0]["devid"], "5");
        assert_eq!(p.tags[0]["node"], "5");
    }

    #[test]
    fn multi_valued_sequence_of_maps() {
        let r = result(
            "node.ifs.heat.lock",
            16,
            Some(2),
            json!([
                {"op_rate": 131.65, "path": "SYSTEM (0x0)"},
                {"op_rate": 60.76, "path": "/ifs/"}
            ]),
        );
        let p = decode_result("clusterC", &r, false).unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p.fields[0]["op_rate"], FieldValue::Number(131.65));
        assert_eq!(p.tags[0]["path"], "SYSTEM (0x0)");
        assert_eq!(p.fields[1]["op_rate"], FieldValue::Number(60.76));
        assert_eq!(p.tags[1]["path"], "/ifs/");
    }

    #[test]
    fn nested_map_containing_sequence() {
        let r = result(
            "stat_with_array",
            0,
            None,
            json!({
                "count": 42,
                "items": [{"name": "item1", "value": 100}, {"name": "item2", "value": 200}]
            }),
        );
        let p = decode_result("clusterG", &r, false).unwrap();
        assert_eq!(p.len(), 2);
        for i in 0..2 {
            assert_eq!(p.fields[i]["count"], FieldValue::Number(42.0));
        }
        let values: Vec<_> = p.fields.iter().map(|f| f["value"].clone()).collect();
        assert!(values.contains(&FieldValue::Number(100.0)));
        assert!(values.contains(&FieldValue::Number(200.0)));
        let names: Vec<_> = p.tags.iter().map(|t| t["name"].clone()).collect();
        assert!(names.contains(&"item1".to_string()));
        assert!(names.contains(&"item2".to_string()));
    }

    #[test]
    fn drop_predicate_removes_change_notify() {
        let r = result(
            "cluster.protostats.smb2",
            0,
            None,
            json!([
                {"op_name": "change_notify", "op_rate": 12.6},
                {"op_name": "read", "op_rate": 3456.1},
                {"op_name": "write", "op_rate": 789.2}
            ]),
        );
        let p = decode_result("clusterX", &r, false).unwrap();
        assert_eq!(p.len(), 2);
        let op_names: Vec<_> = p.tags.iter().map(|t| t["op_name"].clone()).collect();
        assert!(!op_names.contains(&"change_notify".to_string()));
        assert!(op_names.contains(&"read".to_string()));
        assert!(op_names.contains(&"write".to_string()));
    }

    #[test]
    fn empty_sequence_produces_zero_points() {
        let r = result("cluster.empty", 0, None, json!([]));
        let p = decode_result("clusterA", &r, false).unwrap();
        assert_eq!(p.len(), 0);
    }

    #[test]
    fn null_at_depth_zero_produces_zero_points() {
        let r = result("cluster.nothing", 0, None, json!(null));
        let p = decode_result("clusterA", &r, false).unwrap();
        assert_eq!(p.len(), 0);
    }

    #[test]
    fn invariant_errors_are_distinguished_from_unusable() {
        let r = result("cluster.bad_shape", 0, None, json!({"a": {"nested": 1}}));
        let err = decode_result("clusterA", &r, false).unwrap_err();
        assert!(err.is_invariant());

        let r = result("cluster.bad_string", 0, None, json!("oops"));
        let err = decode_result("clusterA", &r, false).unwrap_err();
        assert!(!err.is_invariant());
    }

    #[test]
    fn string_at_depth_zero_is_an_error() {
        let r = result("cluster.bad", 0, None, json!("oops"));
        let err = decode_result("clusterA", &r, false).unwrap_err();
        assert!(matches!(err, DecodeError::Unusable { depth: 0, .. }));
    }

    #[test]
    fn op_id_is_dropped_without_fixup() {
        let r = result(
            "cluster.protostats.nfs",
            0,
            None,
            json!({"op_id": 4294967295u64, "op_rate": 1.0}),
        );
        let p = decode_result("clusterA", &r, false).unwrap();
        assert_eq!(p.len(), 1);
        assert!(!p.fields[0].contains_key("op_id"));
    }

    #[test]
    fn degraded_labeling_adds_tag() {
        let mut r = result("cluster.x", 0, None, json!(1.0));
        r.error_code = ErrorCode::Degraded;
        let p = decode_result("clusterA", &r, true).unwrap();
        assert_eq!(p.tags[0]["degraded"], "true");
    }

    #[test]
    fn protocol_summary_item_decodes() {
        let item: Value = json!({
            "class": "read",
            "operation": "read",
            "protocol": "nfs3",
            "operation_count": 10.0,
            "operation_rate": 2.5
        })
        .into();
        let p = decode_protocol_summary_item("clusterA", Some(NodeNumber(2)), &item).unwrap();
        assert_eq!(p.name, "node.summary.protocol");
        assert_eq!(p.tags[0]["node"], "2");
        assert_eq!(p.fields[0]["operation_count"], FieldValue::Number(10.0));
    }
}
