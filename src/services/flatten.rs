//! Payload flattening and per-payload deduplication.
//!
//! Vendor rows arrive in three shapes: already-flat maps (SolisCloud,
//! ShineMonitor after re-keying), nested objects, and Solarman's
//! `{collectTime, dataList: [{key, value}]}` samples. All of them are folded
//! into flat string-keyed maps, then deduplicated on the raw timestamp field
//! within the payload. First occurrence wins.

use log::{debug, warn};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::models::reading::RawPayload;

/// Nested objects deeper than this keep their remaining subtree as a raw
/// value instead of recursing further.
const MAX_FLATTEN_DEPTH: u32 = 10;

/// Raw timestamp fields in lookup order; shared with the mapper so dedup and
/// normalization agree on which field is the sample time.
pub const TIMESTAMP_KEYS: [&str; 5] = ["timestamp", "collectTime", "dataTimestamp", "time", "timeStr"];

#[derive(Debug, Default, PartialEq)]
pub struct FlattenStats {
    pub rows: usize,
    pub duplicates: usize,
    pub non_dict: usize,
}

pub fn raw_timestamp_of(row: &Map<String, Value>) -> Option<&Value> {
    TIMESTAMP_KEYS
        .iter()
        .find_map(|k| row.get(*k))
        .filter(|v| !v.is_null())
}

/// Flatten every row of a payload and drop duplicate timestamps. Payloads
/// arrive as a single object, a list of objects, or nested lists of objects;
/// lists are descended up to the depth cap. Rows without any recognizable
/// timestamp are kept; normalization rejects them individually with an
/// error record.
pub fn flatten_payload(payload: &RawPayload) -> (Vec<Map<String, Value>>, FlattenStats) {
    let mut stats = FlattenStats::default();
    let mut rows: Vec<&Map<String, Value>> = Vec::new();
    if !payload.rows.is_null() {
        collect_rows(&payload.rows, 0, &mut rows, &mut stats);
    }

    let mut by_timestamp: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    let mut untimed: Vec<Map<String, Value>> = Vec::new();

    for obj in rows {
        let flat = flatten_row(obj);
        match raw_timestamp_of(&flat) {
            Some(ts) => {
                let key = timestamp_dedup_key(ts);
                if by_timestamp.contains_key(&key) {
                    stats.duplicates += 1;
                } else {
                    by_timestamp.insert(key, flat);
                }
            }
            None => untimed.push(flat),
        }
    }

    let mut out: Vec<Map<String, Value>> = by_timestamp.into_values().collect();
    out.extend(untimed);
    stats.rows = out.len();
    (out, stats)
}

/// Gather row objects, descending nested lists up to the depth cap.
fn collect_rows<'a>(
    value: &'a Value,
    depth: u32,
    out: &mut Vec<&'a Map<String, Value>>,
    stats: &mut FlattenStats,
) {
    match value {
        Value::Object(obj) => out.push(obj),
        Value::Array(items) if depth < MAX_FLATTEN_DEPTH => {
            for item in items {
                collect_rows(item, depth + 1, out, stats);
            }
        }
        Value::Array(_) => {
            warn!("payload list nesting exceeds depth {}, ignoring subtree", MAX_FLATTEN_DEPTH);
            stats.non_dict += 1;
        }
        other => {
            warn!("skipping non-object payload row ({})", type_name(other));
            stats.non_dict += 1;
        }
    }
}

/// One row: fold `dataList` key/value pairs, then flatten any remaining
/// nested objects with underscore-joined keys.
fn flatten_row(obj: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in obj {
        if key == "dataList" {
            if let Value::Array(items) = value {
                fold_data_list(items, &mut out);
                continue;
            }
        }
        flatten_value(key, value, 0, &mut out);
    }
    out
}

fn fold_data_list(items: &[Value], out: &mut Map<String, Value>) {
    for item in items {
        let (Some(k), Some(v)) = (
            item.get("key").and_then(Value::as_str),
            item.get("value"),
        ) else {
            warn!("dataList item without key/value, skipping");
            continue;
        };
        out.insert(k.to_string(), v.clone());
    }
}

fn flatten_value(key: &str, value: &Value, depth: u32, out: &mut Map<String, Value>) {
    match value {
        Value::Object(nested) if depth < MAX_FLATTEN_DEPTH => {
            for (sub_key, sub_value) in nested {
                let joined = format!("{}_{}", key, sub_key);
                flatten_value(&joined, sub_value, depth + 1, out);
            }
        }
        Value::Object(_) => {
            debug!("{}: nesting exceeds depth {}, kept as raw value", key, MAX_FLATTEN_DEPTH);
            out.insert(key.to_string(), value.clone());
        }
        other => {
            out.insert(key.to_string(), other.clone());
        }
    }
}

/// Numbers and numeric strings of the same instant must collide, so numeric
/// timestamps are canonicalized before use as a dedup key.
fn timestamp_dedup_key(ts: &Value) -> String {
    match ts {
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            let t = s.trim();
            if t.chars().all(|c| c.is_ascii_digit()) && !t.is_empty() {
                t.trim_start_matches('0').to_string()
            } else {
                t.to_string()
            }
        }
        other => other.to_string(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(rows: Value) -> RawPayload {
        RawPayload { rows, day_energy_kwh: None }
    }

    #[test]
    fn duplicate_timestamps_first_wins() {
        let (rows, stats) = flatten_payload(&payload(json!([
            {"timestamp": 1000, "power": 1.0},
            {"timestamp": 1000, "power": 2.0},
            {"timestamp": 2000, "power": 3.0},
        ])));
        assert_eq!(stats.duplicates, 1);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("power"), Some(&json!(1.0)));
    }

    #[test]
    fn numeric_string_and_number_timestamps_collide() {
        let (rows, stats) = flatten_payload(&payload(json!([
            {"collectTime": 1718000000_i64, "a": 1},
            {"collectTime": "1718000000", "a": 2},
        ])));
        assert_eq!(stats.duplicates, 1);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn data_list_is_folded() {
        let (rows, _) = flatten_payload(&payload(json!([
            {"collectTime": 1718000000_i64, "dataList": [
                {"key": "pv1_voltage", "value": "350.5"},
                {"key": "power", "value": 4000},
            ]},
        ])));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("pv1_voltage"), Some(&json!("350.5")));
        assert_eq!(rows[0].get("power"), Some(&json!(4000)));
        assert!(rows[0].get("dataList").is_none());
    }

    #[test]
    fn list_of_lists_rows_are_descended() {
        let (rows, stats) = flatten_payload(&payload(json!([
            [
                {"timestamp": 1000, "power": 1.0},
                {"timestamp": 2000, "power": 2.0},
            ],
            {"timestamp": 3000, "power": 3.0},
        ])));
        assert_eq!(stats.non_dict, 0);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].get("power"), Some(&json!(3.0)));
    }

    #[test]
    fn single_object_payload_is_one_row() {
        let (rows, stats) = flatten_payload(&payload(json!(
            {"timestamp": 1000, "power": 1.0}
        )));
        assert_eq!(stats.non_dict, 0);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn list_nesting_beyond_cap_is_dropped_and_counted() {
        let mut v = json!([{"timestamp": 1, "power": 1.0}]);
        for _ in 0..15 {
            v = json!([v]);
        }
        let (rows, stats) = flatten_payload(&payload(v));
        assert!(rows.is_empty());
        assert_eq!(stats.non_dict, 1);
    }

    #[test]
    fn nested_objects_flatten_with_joined_keys() {
        let (rows, _) = flatten_payload(&payload(json!([
            {"timestamp": 1, "grid": {"phase": {"r": 230.0}}},
        ])));
        assert_eq!(rows[0].get("grid_phase_r"), Some(&json!(230.0)));
    }

    #[test]
    fn depth_cap_keeps_subtree_as_value() {
        // Build an object nested well past the cap.
        let mut v = json!({"leaf": 1});
        for i in 0..15 {
            let mut wrapper = Map::new();
            wrapper.insert(format!("l{}", i), v);
            v = Value::Object(wrapper);
        }
        let (rows, _) = flatten_payload(&payload(json!([{"timestamp": 1, "deep": v}])));
        assert_eq!(rows.len(), 1);
        // Something survived and no key exceeds the joined-depth bound.
        assert!(rows[0].keys().any(|k| k.starts_with("deep_")));
        assert!(rows[0].keys().all(|k| k.matches('_').count() <= MAX_FLATTEN_DEPTH as usize + 2));
    }

    #[test]
    fn non_objects_are_counted_and_skipped() {
        let (rows, stats) = flatten_payload(&payload(json!([
            "garbage",
            42,
            {"timestamp": 1, "power": 1.0},
        ])));
        assert_eq!(stats.non_dict, 2);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn rows_without_timestamp_are_kept() {
        let (rows, stats) = flatten_payload(&payload(json!([
            {"power": 1.0},
            {"timestamp": 1, "power": 2.0},
        ])));
        assert_eq!(stats.duplicates, 0);
        assert_eq!(rows.len(), 2);
    }
}
