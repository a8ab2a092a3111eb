use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value, json};

pub const MAX_STRING_CHARS: usize = 512;
pub const MAX_ARRAY_ITEMS: usize = 10;
pub const MAX_OBJECT_KEYS: usize = 32;
pub const MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub time: DateTime<Utc>,
    pub value: Value,
}

/// Last N inputs per node and input port, truncated for display.
#[derive(Debug)]
pub struct InputHistory {
    size: usize,
    entries: DashMap<String, Vec<VecDeque<HistoryEntry>>>,
}

impl InputHistory {
    pub fn new(size: usize) -> Self {
        Self { size, entries: DashMap::new() }
    }

    pub fn is_enabled(&self) -> bool {
        self.size > 0
    }

    pub fn record(&self, node_id: &str, port: u32, value: &Value) {
        if !self.is_enabled() {
            return;
        }
        let entry = HistoryEntry { time: Utc::now(), value: truncate_value(value) };
        let mut ports = self.entries.entry(node_id.to_string()).or_default();
        let port = port as usize;
        if ports.len() <= port {
            ports.resize_with(port + 1, VecDeque::new);
        }
        let slot = &mut ports[port];
        if slot.len() == self.size {
            slot.pop_front();
        }
        slot.push_back(entry);
    }

    /// Entries per input port, oldest first.
    pub fn entries(&self, node_id: &str) -> Vec<Vec<HistoryEntry>> {
        self.entries
            .get(node_id)
            .map(|ports| ports.iter().map(|p| p.iter().cloned().collect()).collect())
            .unwrap_or_default()
    }

    pub fn last(&self, node_id: &str, port: u32) -> Option<HistoryEntry> {
        self.entries.get(node_id)?.get(port as usize)?.back().cloned()
    }

    pub fn to_value(&self, node_id: &str) -> Value {
        serde_json::to_value(self.entries(node_id)).unwrap_or(Value::Null)
    }

    pub fn clear_node(&self, node_id: &str) {
        self.entries.remove(node_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

pub fn truncate_value(value: &Value) -> Value {
    truncate_at(value, 0)
}

fn truncate_at(value: &Value, depth: usize) -> Value {
    match value {
        Value::String(s) if s.chars().count() > MAX_STRING_CHARS => {
            let mut short: String = s.chars().take(MAX_STRING_CHARS).collect();
            short.push_str("...");
            Value::String(short)
        }
        Value::Array(_) | Value::Object(_) if depth >= MAX_DEPTH => json!("..."),
        Value::Array(items) => {
            let mut out: Vec<Value> = items.iter().take(MAX_ARRAY_ITEMS).map(|v| truncate_at(v, depth + 1)).collect();
            if items.len() > MAX_ARRAY_ITEMS {
                out.push(json!(format!("... {} more", items.len() - MAX_ARRAY_ITEMS)));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out: Map<String, Value> = map
                .iter()
                .take(MAX_OBJECT_KEYS)
                .map(|(k, v)| (k.clone(), truncate_at(v, depth + 1)))
                .collect();
            if map.len() > MAX_OBJECT_KEYS {
                out.insert("...".to_string(), json!(map.len() - MAX_OBJECT_KEYS));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_n_per_port() {
        let history = InputHistory::new(3);
        for i in 0..5 {
            history.record("n1", 1, &json!(i));
        }
        let entries = history.entries("n1");
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_empty());
        let values: Vec<_> = entries[1].iter().map(|e| e.value.clone()).collect();
        assert_eq!(values, vec![json!(2), json!(3), json!(4)]);
        assert_eq!(history.last("n1", 1).unwrap().value, json!(4));
    }

    #[test]
    fn disabled_history_records_nothing() {
        let history = InputHistory::new(0);
        history.record("n1", 0, &json!("x"));
        assert!(history.entries("n1").is_empty());
        assert_eq!(history.to_value("n1"), json!([]));
    }

    #[test]
    fn large_values_are_truncated() {
        let long = "x".repeat(MAX_STRING_CHARS + 100);
        let value = json!({"text": long, "list": (0..50).collect::<Vec<_>>()});
        let short = truncate_value(&value);
        assert_eq!(short["text"].as_str().unwrap().chars().count(), MAX_STRING_CHARS + 3);
        let list = short["list"].as_array().unwrap();
        assert_eq!(list.len(), MAX_ARRAY_ITEMS + 1);
        assert_eq!(list[MAX_ARRAY_ITEMS], json!("... 40 more"));
    }

    #[test]
    fn deep_nesting_is_cut() {
        let mut value = json!(1);
        for _ in 0..20 {
            value = json!([value]);
        }
        let mut cursor = &truncate_value(&value);
        let mut depth = 0;
        while let Value::Array(items) = cursor {
            cursor = &items[0];
            depth += 1;
        }
        assert_eq!(depth, MAX_DEPTH);
        assert_eq!(cursor, &json!("..."));
    }

    #[test]
    fn clearing_a_node_forgets_it() {
        let history = InputHistory::new(2);
        history.record("a", 0, &json!(1));
        history.record("b", 0, &json!(2));
        history.clear_node("a");
        assert!(history.entries("a").is_empty());
        assert_eq!(history.entries("b").len(), 1);
    }
}
