// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Workspace directory for relative file references.
pub const KEY_WORKSPACE: &str = "engine:workspace";
/// Installation directory of the engine itself.
pub const KEY_ENGINE_PATH: &str = "engine:path";
/// strftime-style format sinks may use to render timestamps.
pub const KEY_TIME_FORMAT: &str = "engine:timeFormat";
/// Registry of user-defined model descriptions.
pub const KEY_MODEL_REGISTRY: &str = "engine:modelRegistry";
/// Default worker-pool size for `Controller::execute`.
pub const KEY_WORKERS: &str = "engine:workers";

lazy_static! {
    static ref RESERVED_KEYS: Vec<&'static str> = vec![
        KEY_WORKSPACE,
        KEY_ENGINE_PATH,
        KEY_TIME_FORMAT,
        KEY_MODEL_REGISTRY,
    ];
}

/// Flat key→value store shared by the whole session. Keys are
/// namespaced by convention (`namespace:key`), which is also how
/// parameter expressions address them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    entries: HashMap<String, Value>,
}

impl Settings {
    pub fn new() -> Self {
        let mut s = Settings {
            entries: HashMap::new(),
        };
        s.set(KEY_TIME_FORMAT, Value::Str("%Y-%m-%d %H:%M:%S".into()));
        s
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.to_string())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(|v| v.as_int())
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_owned(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop every entry except the reserved system keys.
    pub fn clear(&mut self) {
        self.entries
            .retain(|k, _| RESERVED_KEYS.contains(&k.as_str()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_preserves_reserved_keys() {
        let mut s = Settings::new();
        s.set(KEY_WORKSPACE, Value::Str("/data/ws".into()));
        s.set("viewer:palette", Value::Str("viridis".into()));
        s.set(KEY_WORKERS, Value::Int(4));

        s.clear();

        assert!(s.contains(KEY_WORKSPACE));
        assert!(s.contains(KEY_TIME_FORMAT));
        assert!(!s.contains("viewer:palette"));
        // engine:workers is an ordinary key, not reserved
        assert!(!s.contains(KEY_WORKERS));
    }

    #[test]
    fn typed_getters() {
        let mut s = Settings::new();
        s.set(KEY_WORKERS, Value::Str("8".into()));
        assert_eq!(s.get_int(KEY_WORKERS), Some(8));
        assert_eq!(s.get_int("missing:key"), None);
    }

    #[test]
    fn serde_round_trip() {
        let mut s = Settings::new();
        s.set("sim:runs", Value::Int(12));
        let json = serde_json::to_string(&s).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get_int("sim:runs"), Some(12));
    }
}
