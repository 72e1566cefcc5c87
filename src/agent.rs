//! Agent builder and runtime wiring.
//!
//! The [`Agent`] is the one long-lived service object of a device process:
//! it owns the handler registry, the active-connection set, the message bus,
//! and the request correlator, and it runs the durable connection that ties
//! them to the control socket. Construct it once at startup via
//! [`AgentBuilder`] and hand clones of the `Arc` to every task that needs it.
//!
//! # Example
//!
//! ```ignore
//! use pixelbus::{Agent, HandlerEntry, UnixTransport};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() {
//!     let agent = std::sync::Arc::new(
//!         Agent::builder()
//!             .handler(
//!                 "brightness",
//!                 HandlerEntry::new()
//!                     .on_set(|v| async move { apply_brightness(v).await })
//!                     .on_get(|_arg: Option<&Value>| Ok(json!(40))),
//!             )
//!             .build(UnixTransport::new("/tmp/led_display.sock")),
//!     );
//!
//!     let runner = agent.clone();
//!     tokio::spawn(async move { runner.run().await });
//!
//!     agent.send_update(["brightness"]).await.unwrap();
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::connection::{ConnectionSet, DurableConnection, ReconnectPolicy};
use crate::correlator::RequestCorrelator;
use crate::error::Result;
use crate::handler::{ErrorSink, HandlerEntry, HandlerRegistry};
use crate::transport::Transport;

/// Default per-connection outbound queue length.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default wait for a correlated call's response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder collecting handlers and policies before the registry freezes.
pub struct AgentBuilder {
    registry: HandlerRegistry,
    policy: ReconnectPolicy,
    channel_capacity: usize,
    call_timeout: Duration,
}

impl AgentBuilder {
    /// Create a builder with default policies and an empty registry.
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            policy: ReconnectPolicy::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Register handlers for one state key, replacing any existing entry.
    pub fn handler(mut self, key: impl Into<String>, entry: HandlerEntry) -> Self {
        self.registry.register(key, entry);
        self
    }

    /// Observe unknown keys and handler failures.
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.registry.set_error_sink(sink);
        self
    }

    /// Override the reconnect backoff intervals.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the per-connection outbound queue length.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Override the wait for correlated call responses.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Freeze the registry and wire the agent over `transport`.
    pub fn build<T: Transport>(self, transport: T) -> Agent<T> {
        let connections = ConnectionSet::new(self.channel_capacity);
        let registry = Arc::new(self.registry);
        let bus = Arc::new(MessageBus::new(registry, connections.clone()));
        let correlator = Arc::new(RequestCorrelator::new(connections.clone()));
        let shutdown = CancellationToken::new();
        let supervisor = DurableConnection::new(
            transport,
            self.policy,
            connections.clone(),
            bus.clone(),
            correlator.clone(),
            shutdown.clone(),
        );

        Agent {
            bus,
            correlator,
            supervisor,
            connections,
            shutdown,
            call_timeout: self.call_timeout,
        }
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired device agent. See the module docs for lifecycle.
pub struct Agent<T: Transport> {
    bus: Arc<MessageBus>,
    correlator: Arc<RequestCorrelator>,
    supervisor: DurableConnection<T>,
    connections: ConnectionSet,
    shutdown: CancellationToken,
    call_timeout: Duration,
}

impl<T: Transport> Agent<T> {
    /// Create a new agent builder.
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Run the durable connection. Returns only after [`Agent::shutdown`].
    pub async fn run(&self) {
        self.supervisor.run().await;
    }

    /// Stop the connection loop and release the link.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Push the current values of `keys` to every connected peer.
    pub async fn send_update<I, S>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.bus.send_update(keys).await
    }

    /// Ask the peers for `key` and wait for the first answer.
    pub async fn call_and_wait(&self, key: &str, qualifier: Value) -> Result<Value> {
        self.correlator
            .call_and_wait(key, qualifier, self.call_timeout)
            .await
    }

    /// Number of currently open control-bus connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The message bus, for collaborators that dispatch envelopes directly.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }
}
