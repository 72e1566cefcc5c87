//! Registry mapping state keys to their setter/getter pair.
//!
//! # Example
//!
//! ```
//! use pixelbus::handler::{HandlerEntry, HandlerRegistry};
//! use serde_json::{json, Value};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(
//!     "brightness",
//!     HandlerEntry::new()
//!         .on_set(|v: Value| async move {
//!             let _ = v; // forward to the display collaborator
//!             Ok(())
//!         })
//!         .on_get(|_arg: Option<&Value>| Ok(json!(40))),
//! );
//!
//! assert_eq!(registry.dispatch_get("brightness", None).unwrap(), json!(40));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::sink::{ErrorSink, LogSink, Op};
use super::{Getter, Setter};
use crate::error::{Error, Result};

/// One registered key: an optional setter plus an optional getter.
///
/// At least one of the two must be present by the time the entry is
/// registered.
#[derive(Default)]
pub struct HandlerEntry {
    setter: Option<Box<dyn Setter>>,
    getter: Option<Box<dyn Getter>>,
}

impl HandlerEntry {
    /// Create an empty entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a setter.
    pub fn on_set<S: Setter>(mut self, setter: S) -> Self {
        self.setter = Some(Box::new(setter));
        self
    }

    /// Attach a getter.
    pub fn on_get<G: Getter>(mut self, getter: G) -> Self {
        self.getter = Some(Box::new(getter));
        self
    }

    fn is_empty(&self) -> bool {
        self.setter.is_none() && self.getter.is_none()
    }
}

/// Registry mapping state keys to handler entries.
///
/// Registration happens once during startup, before concurrent traffic
/// begins; afterwards the registry is only read. No locking is needed beyond
/// what the bus provides.
pub struct HandlerRegistry {
    entries: HashMap<String, HandlerEntry>,
    sink: Arc<dyn ErrorSink>,
}

impl HandlerRegistry {
    /// Create an empty registry with the default logging sink.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            sink: Arc::new(LogSink),
        }
    }

    /// Replace the dispatch-failure observer.
    pub fn set_error_sink(&mut self, sink: Arc<dyn ErrorSink>) {
        self.sink = sink;
    }

    /// Register handlers for `key`, replacing any existing entry.
    ///
    /// # Panics
    ///
    /// Panics if the entry has neither a setter nor a getter. Registration
    /// is a startup-time operation; an empty entry is a wiring bug.
    pub fn register(&mut self, key: impl Into<String>, entry: HandlerEntry) {
        let key = key.into();
        assert!(
            !entry.is_empty(),
            "handler entry for {key:?} must define a setter or a getter"
        );
        self.entries.insert(key, entry);
    }

    /// All registered keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Whether `key` has a registered entry.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Invoke the setter for `key` with `value`.
    pub async fn dispatch_set(&self, key: &str, value: Value) -> Result<()> {
        match self.entries.get(key).and_then(|e| e.setter.as_ref()) {
            Some(setter) => setter.apply(value).await,
            None => Err(Error::UnknownKey(key.to_string())),
        }
    }

    /// Invoke the getter for `key`, passing the qualifier if one was given.
    pub fn dispatch_get(&self, key: &str, arg: Option<&Value>) -> Result<Value> {
        match self.entries.get(key).and_then(|e| e.getter.as_ref()) {
            Some(getter) => getter.read(arg),
            None => Err(Error::UnknownKey(key.to_string())),
        }
    }

    /// Invoke the setter for `key` with no value argument.
    pub async fn dispatch_action(&self, key: &str) -> Result<()> {
        self.dispatch_set(key, Value::Null).await
    }

    /// Read every registered getter with no argument.
    ///
    /// Keys without a getter, and getters that fail, are omitted; failures
    /// are reported to the sink.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (key, entry) in &self.entries {
            let Some(getter) = entry.getter.as_ref() else {
                continue;
            };
            match getter.read(None) {
                Ok(value) => {
                    out.insert(key.clone(), value);
                }
                Err(err) => self.sink.handler_error(Op::Get, key, &err),
            }
        }
        out
    }

    /// The configured dispatch-failure observer.
    pub(crate) fn sink(&self) -> &Arc<dyn ErrorSink> {
        &self.sink
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
