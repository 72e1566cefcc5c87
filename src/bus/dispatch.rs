//! Envelope dispatch against the handler registry.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};

use super::envelope::{Envelope, GET_ALL_KEY};
use crate::connection::ConnectionSet;
use crate::error::{Error, Result};
use crate::handler::{HandlerRegistry, Op};

/// Decodes inbound envelopes into set/get/action groups and dispatches each
/// group to the handler registry.
///
/// Dispatch policy (processing order: set, then get, then action):
/// - all setters of one envelope run concurrently; `handle` returns only
///   once every one has completed or failed
/// - unknown keys and failing handlers are reported to the error sink and
///   otherwise ignored
/// - a response object is produced only when a `get` was present
pub struct MessageBus {
    registry: Arc<HandlerRegistry>,
    connections: ConnectionSet,
}

impl MessageBus {
    /// Create a bus dispatching into `registry` and pushing unsolicited
    /// updates to `connections`.
    pub fn new(registry: Arc<HandlerRegistry>, connections: ConnectionSet) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// The registry this bus dispatches into.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Process one envelope, returning the response object if one is due.
    pub async fn handle(&self, envelope: Envelope) -> Option<Value> {
        if let Some(entries) = envelope.set {
            self.apply_all(entries).await;
        }

        let response = envelope.get.map(|entries| self.read_all(&entries));

        if let Some(keys) = envelope.action {
            self.run_actions(&keys).await;
        }

        response.map(Value::Object)
    }

    /// Run every setter of one `set` group concurrently to completion.
    async fn apply_all(&self, entries: Map<String, Value>) {
        let sink = self.registry.sink();
        let jobs = entries.into_iter().map(|(key, value)| {
            let registry = &self.registry;
            async move {
                match registry.dispatch_set(&key, value).await {
                    Ok(()) => {}
                    Err(Error::UnknownKey(_)) => sink.unknown_key(Op::Set, &key),
                    Err(err) => sink.handler_error(Op::Set, &key, &err),
                }
            }
        });
        join_all(jobs).await;
    }

    /// Build the response object for one `get` group.
    ///
    /// The special key `"all"` requests the full snapshot. Otherwise unknown
    /// keys and failing getters produce no entry.
    fn read_all(&self, entries: &Map<String, Value>) -> Map<String, Value> {
        if entries.contains_key(GET_ALL_KEY) {
            return self.registry.snapshot();
        }

        let sink = self.registry.sink();
        let mut out = Map::new();
        for (key, qualifier) in entries {
            let arg = (!qualifier.is_null()).then_some(qualifier);
            match self.registry.dispatch_get(key, arg) {
                Ok(value) => {
                    out.insert(key.clone(), value);
                }
                Err(Error::UnknownKey(_)) => sink.unknown_key(Op::Get, key),
                Err(err) => sink.handler_error(Op::Get, key, &err),
            }
        }
        out
    }

    /// Run every `action` entry concurrently, like sets with no value.
    async fn run_actions(&self, keys: &[String]) {
        let sink = self.registry.sink();
        let jobs = keys.iter().map(|key| {
            let registry = &self.registry;
            async move {
                match registry.dispatch_action(key).await {
                    Ok(()) => {}
                    Err(Error::UnknownKey(_)) => sink.unknown_key(Op::Action, key),
                    Err(err) => sink.handler_error(Op::Action, key, &err),
                }
            }
        });
        join_all(jobs).await;
    }

    /// Push the current values of `keys` to all active connections without
    /// waiting for a request.
    ///
    /// Keys that are unknown or whose getter fails are serialized as `null`.
    pub async fn send_update<I, S>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sink = self.registry.sink();
        let mut out = Map::new();
        for key in keys {
            let key = key.as_ref();
            let value = match self.registry.dispatch_get(key, None) {
                Ok(value) => value,
                Err(Error::UnknownKey(_)) => {
                    sink.unknown_key(Op::Update, key);
                    Value::Null
                }
                Err(err) => {
                    sink.handler_error(Op::Update, key, &err);
                    Value::Null
                }
            };
            out.insert(key.to_string(), value);
        }

        let line = serde_json::to_string(&Value::Object(out))?;
        self.connections.broadcast(&line).await;
        Ok(())
    }
}
