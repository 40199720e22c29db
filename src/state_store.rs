use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shared handle to one instance's store. The registry owns it; hook calls
/// borrow it only for the duration of a single host function.
pub type StateHandle = Rc<RefCell<StateStore>>;

/// Per-instance key/value state, independent of the code bound to the
/// instance. Keys are kept in sorted order so snapshots are stable.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct StateStore {
    values: BTreeMap<String, Value>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_handle(self) -> StateHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Missing keys read as `None`; callers pick the documented default.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Integer read that degrades to `default` for missing keys and for
    /// values of another type (stale keys written by older code).
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.values.get(key) {
            Some(Value::String(s)) => s.as_str(),
            _ => default,
        }
    }

    #[cfg(test)]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    /// String-valued entries of a nested object, e.g. `equipment` or `exits`.
    pub fn get_string_map(&self, key: &str) -> BTreeMap<String, String> {
        match self.values.get(key) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    pub fn add_i64(&mut self, key: &str, delta: i64) -> i64 {
        let next = self.get_i64(key, 0).saturating_add(delta);
        self.values.insert(key.to_string(), Value::from(next));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_and_mistyped_keys_read_as_default() {
        let mut store = StateStore::new();
        store.set("hp", json!("lots"));
        assert_eq!(store.get_i64("hp", 7), 7);
        assert_eq!(store.get_i64("mana", 3), 3);
        assert_eq!(store.get_str("name", "nobody"), "nobody");
        assert!(!store.get_bool("hostile", false));
        assert!(store.get("nope").is_none());
    }

    #[test]
    fn float_numbers_truncate_for_integer_reads() {
        let mut store = StateStore::new();
        store.set("hp", json!(9.75));
        assert_eq!(store.get_i64("hp", 0), 9);
    }

    #[test]
    fn string_map_skips_non_string_entries() {
        let mut store = StateStore::new();
        store.set(
            "exits",
            json!({"north": "room/hall", "down": 4, "east": "room/yard"}),
        );
        let exits = store.get_string_map("exits");
        assert_eq!(exits.len(), 2);
        assert_eq!(exits.get("north").map(String::as_str), Some("room/hall"));
        assert!(store.get_string_map("missing").is_empty());
    }

    #[test]
    fn serializes_as_plain_sorted_object() {
        let mut store = StateStore::new();
        store.set("zeta", json!(1));
        store.set("alpha", json!({"nested": [1, 2]}));
        let text = serde_json::to_string(&store).expect("serialize");
        assert_eq!(text, r#"{"alpha":{"nested":[1,2]},"zeta":1}"#);
        let back: StateStore = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, store);
    }

    #[test]
    fn add_i64_starts_from_zero() {
        let mut store = StateStore::new();
        assert_eq!(store.add_i64("xp", 5), 5);
        assert_eq!(store.add_i64("xp", 5), 10);
        assert!(store.remove("xp").is_some());
        assert!(store.is_empty());
    }
}
