//! The control-bus envelope.
//!
//! Wire shape, one JSON object per line:
//!
//! ```text
//! {"set": {"<key>": <value>, ...}}
//! {"get": {"<key>": <value-or-null>, ...}}
//! {"get": {"all": null}}
//! {"action": ["<key>", ...]}
//! ```
//!
//! Any subset of the three fields may be present in one envelope. An
//! envelope with none of them is a no-op and produces no response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key whose presence in a `get` requests the full state snapshot.
pub const GET_ALL_KEY: &str = "all";

/// One control-bus message, grouping zero or more set/get/action entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Values to apply, keyed by handler key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Map<String, Value>>,

    /// Values to read; the entry value is an optional qualifier for the
    /// getter (`null` for none).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<Map<String, Value>>,

    /// Keys whose setter is invoked with no value argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Vec<String>>,
}

impl Envelope {
    /// Envelope carrying a single `set` entry.
    pub fn set_one(key: impl Into<String>, value: Value) -> Self {
        let mut map = Map::new();
        map.insert(key.into(), value);
        Self {
            set: Some(map),
            ..Self::default()
        }
    }

    /// Envelope carrying a single `get` entry.
    pub fn get_one(key: impl Into<String>, qualifier: Value) -> Self {
        let mut map = Map::new();
        map.insert(key.into(), qualifier);
        Self {
            get: Some(map),
            ..Self::default()
        }
    }

    /// Extract the envelope fields from an already-parsed inbound object.
    ///
    /// Fields other than `set`/`get`/`action` are ignored; an object with
    /// none of the three yields an empty envelope.
    pub fn from_object(obj: &Map<String, Value>) -> Self {
        Self {
            set: obj.get("set").and_then(Value::as_object).cloned(),
            get: obj.get("get").and_then(Value::as_object).cloned(),
            action: obj.get("action").and_then(Value::as_array).map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            }),
        }
    }

    /// Whether this envelope carries no entries at all.
    pub fn is_empty(&self) -> bool {
        self.set.is_none() && self.get.is_none() && self.action.is_none()
    }
}
