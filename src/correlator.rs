//! Request correlator: awaitable calls over a fire-and-forget bus.
//!
//! The bus protocol has no request ids. A `get` is answered by a plain
//! `{key: value}` object on the same stream, so the only way to wait for an
//! answer is to watch inbound traffic for the key. [`RequestCorrelator`]
//! keeps one pending slot per key: `call_and_wait` sends the `get` and
//! suspends the caller; the first inbound payload carrying the key fulfills
//! the slot.
//!
//! Exactly one call per key may be in flight. A second concurrent call for
//! the same key is rejected with [`Error::CallPending`] instead of silently
//! replacing the first caller's slot.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::bus::Envelope;
use crate::connection::ConnectionSet;
use crate::error::{Error, Result};

/// Matches inbound values to callers waiting on a key.
pub struct RequestCorrelator {
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    connections: ConnectionSet,
}

impl RequestCorrelator {
    /// Create a correlator sending its requests through `connections`.
    pub fn new(connections: ConnectionSet) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            connections,
        }
    }

    /// Send `{"get": {key: qualifier}}` and wait for the next inbound value
    /// observed for `key`.
    ///
    /// On timeout the pending slot is removed unfulfilled and
    /// [`Error::CallTimeout`] is returned. If a call for `key` is already in
    /// flight, returns [`Error::CallPending`] without sending anything.
    pub async fn call_and_wait(
        &self,
        key: &str,
        qualifier: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let rx = {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(key) {
                return Err(Error::CallPending(key.to_string()));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(key.to_string(), tx);
            rx
        };

        // Removes the slot on every exit path that leaves it unfulfilled.
        let mut guard = PendingGuard {
            pending: &self.pending,
            key,
            armed: true,
        };

        let line = serde_json::to_string(&Envelope::get_one(key, qualifier))?;
        self.connections.broadcast(&line).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => {
                guard.armed = false;
                Ok(value)
            }
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::CallTimeout(key.to_string())),
        }
    }

    /// Inspect one inbound payload and fulfill any pending call whose key
    /// appears at its top level. Each slot is fulfilled at most once and
    /// removed on fulfillment.
    pub fn observe(&self, payload: &Map<String, Value>) {
        let mut pending = self.pending.lock().unwrap();
        for (key, value) in payload {
            if let Some(tx) = pending.remove(key) {
                let _ = tx.send(value.clone());
            }
        }
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, oneshot::Sender<Value>>>,
    key: &'a str,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.lock().unwrap().remove(self.key);
        }
    }
}
