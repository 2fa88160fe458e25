//! Incrementally-built report record for one test run.

use serde_json::{Map, Value};

/// Append-only, order-preserving accumulator of diagnostic values.
///
/// Phases and test streams only ever add keys; nothing is removed, so a
/// later phase can rely on everything an earlier phase recorded.
///
/// # Examples
///
/// ```
/// use ndt_client::Entry;
///
/// let mut entry = Entry::new();
/// entry.set("server_address", "127.0.0.1");
/// entry.push("receiver_data", serde_json::json!([0.5, 1234.0]));
/// assert_eq!(entry.as_json()["server_address"], "127.0.0.1");
/// ```
#[derive(Debug, Default, Clone)]
pub struct Entry {
    root: Map<String, Value>,
}

impl Entry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a top-level scalar or structured value.
    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        self.root.insert(key.to_string(), value.into());
    }

    /// Appends `value` to the array at `key`, creating the array on first
    /// use. A non-array value already present under `key` is left alone.
    pub fn push(&mut self, key: &str, value: Value) {
        match self.root.entry(key.to_string()).or_insert_with(|| Value::Array(Vec::new())) {
            Value::Array(items) => items.push(value),
            other => {
                log::warn!("entry key {key:?} already holds a non-array: {other}");
            }
        }
    }

    /// Sets `key = value` inside the object stored at `object_key`,
    /// creating the object on first use.
    pub fn set_nested<V: Into<Value>>(&mut self, object_key: &str, key: &str, value: V) {
        match self
            .root
            .entry(object_key.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
        {
            Value::Object(map) => {
                map.insert(key.to_string(), value.into());
            }
            other => {
                log::warn!("entry key {object_key:?} already holds a non-object: {other}");
            }
        }
    }

    /// Read-only view of a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// The whole record as a JSON value, keys in insertion order.
    pub fn as_json(&self) -> Value {
        Value::Object(self.root.clone())
    }
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.root.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_keep_insertion_order() {
        let mut entry = Entry::new();
        entry.set("zulu", 1);
        entry.set("alpha", 2);
        entry.set("mike", 3);
        let json = entry.as_json();
        let keys: Vec<&str> = match json {
            Value::Object(ref map) => map.keys().map(|k| k.as_str()).collect(),
            _ => unreachable!(),
        };
        assert_eq!(keys, vec!["zulu", "alpha", "mike"]);
    }

    #[test]
    fn push_accumulates_without_overwriting() {
        let mut entry = Entry::new();
        entry.push("samples", json!([0.5, 100.0]));
        entry.push("samples", json!([1.0, 120.0]));
        assert_eq!(entry.as_json()["samples"], json!([[0.5, 100.0], [1.0, 120.0]]));
    }

    #[test]
    fn nested_objects_grow_in_place() {
        let mut entry = Entry::new();
        entry.set_nested("summary_data", "CurRTO", "300");
        entry.set_nested("summary_data", "MaxRwinRcvd", "16384");
        assert_eq!(entry.as_json()["summary_data"]["CurRTO"], "300");
        assert_eq!(entry.as_json()["summary_data"]["MaxRwinRcvd"], "16384");
    }
}
