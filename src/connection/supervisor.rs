//! Reconnect-forever supervisor for the control bus link.
//!
//! The supervisor loops: establish the transport, read `\n`-delimited JSON
//! lines until the stream closes or errors, tear the connection down, and
//! try again. A failed establishment waits a backoff first — longer when the
//! peer actively refused the connection — while a stream that closes after
//! being established reconnects immediately.
//!
//! The supervisor does not interpret message content. Each decoded line is
//! offered to the request correlator and dispatched through the message bus;
//! a failure in either is logged and never aborts the read loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::set::ConnectionSet;
use crate::bus::{Envelope, MessageBus};
use crate::correlator::RequestCorrelator;
use crate::transport::Transport;

/// Backoff intervals between failed connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait after a generic establishment error.
    pub error_backoff: Duration,
    /// Wait after the peer actively refused the connection.
    pub refused_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            error_backoff: Duration::from_secs(10),
            refused_backoff: Duration::from_secs(20),
        }
    }
}

/// A single logical duplex link to the control-bus peer, kept alive across
/// transport failures.
pub struct DurableConnection<T: Transport> {
    transport: T,
    policy: ReconnectPolicy,
    connections: ConnectionSet,
    bus: Arc<MessageBus>,
    correlator: Arc<RequestCorrelator>,
    shutdown: CancellationToken,
}

impl<T: Transport> DurableConnection<T> {
    /// Wire a supervisor over `transport`.
    pub fn new(
        transport: T,
        policy: ReconnectPolicy,
        connections: ConnectionSet,
        bus: Arc<MessageBus>,
        correlator: Arc<RequestCorrelator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            policy,
            connections,
            bus,
            correlator,
            shutdown,
        }
    }

    /// Run the connect/read/reconnect loop. Returns only when the shutdown
    /// token fires.
    pub async fn run(&self) {
        loop {
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = self.transport.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    self.serve(stream).await;
                    // A stream that was up and closed reconnects immediately;
                    // if the listener is gone the next attempt fails and
                    // backs off.
                }
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    tracing::warn!("control bus refused connection: {}", err);
                    if !self.backoff(self.policy.refused_backoff).await {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!("control bus connect failed: {}", err);
                    if !self.backoff(self.policy.error_backoff).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep for `wait`; returns false if shutdown fired first.
    async fn backoff(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    /// Read lines off one established stream until it closes or errors.
    async fn serve(&self, stream: T::Stream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (id, rx) = self.connections.add();
        let writer = ConnectionSet::spawn_writer(rx, write_half);
        tracing::debug!("control bus connected (connection {})", id);

        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.dispatch_line(id, &line).await,
                    Ok(None) => {
                        tracing::debug!("control bus connection {} closed by peer", id);
                        break;
                    }
                    Err(err) => {
                        tracing::warn!("control bus read failed: {}", err);
                        break;
                    }
                }
            }
        }

        // Release both halves before the reconnect loop retries. This runs
        // no matter how dispatch fared on the last line.
        self.connections.remove(id);
        writer.abort();
    }

    /// Decode and dispatch one inbound line. Never propagates an error.
    async fn dispatch_line(&self, id: u64, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("dropping undecodable control line: {}", err);
                return;
            }
        };
        let Value::Object(obj) = value else {
            tracing::warn!("dropping non-object control line");
            return;
        };

        // Responses to our own outstanding gets look like {key: value};
        // the correlator picks them out before envelope dispatch.
        self.correlator.observe(&obj);

        let envelope = Envelope::from_object(&obj);
        if envelope.is_empty() {
            return;
        }

        if let Some(response) = self.bus.handle(envelope).await {
            match serde_json::to_string(&response) {
                Ok(line) => self.connections.send_to(id, line).await,
                Err(err) => tracing::error!("failed to encode response: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerEntry, HandlerRegistry};
    use crate::transport::ConnectFuture;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    async fn read_peer_line(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    fn split_peer(
        peer: DuplexStream,
    ) -> (BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>) {
        let (r, w) = tokio::io::split(peer);
        (BufReader::new(r), w)
    }

    /// Always refuses (or otherwise fails) to connect, counting attempts.
    struct FailingTransport {
        kind: io::ErrorKind,
        attempts: Arc<AtomicUsize>,
    }

    impl Transport for FailingTransport {
        type Stream = DuplexStream;

        fn connect(&self) -> ConnectFuture<'_, DuplexStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let kind = self.kind;
            Box::pin(async move { Err(io::Error::new(kind, "unavailable")) })
        }
    }

    /// Hands out one prepared stream, then never connects again.
    struct OneShotTransport {
        stream: Mutex<Option<DuplexStream>>,
    }

    impl Transport for OneShotTransport {
        type Stream = DuplexStream;

        fn connect(&self) -> ConnectFuture<'_, DuplexStream> {
            let stream = self.stream.lock().unwrap().take();
            Box::pin(async move {
                match stream {
                    Some(s) => Ok(s),
                    None => futures::future::pending().await,
                }
            })
        }
    }

    fn supervisor<T: Transport>(transport: T, registry: HandlerRegistry) -> DurableConnection<T> {
        let connections = ConnectionSet::new(8);
        let bus = Arc::new(MessageBus::new(Arc::new(registry), connections.clone()));
        let correlator = Arc::new(RequestCorrelator::new(connections.clone()));
        DurableConnection::new(
            transport,
            ReconnectPolicy::default(),
            connections,
            bus,
            correlator,
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_uses_long_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let sup = Arc::new(supervisor(
            FailingTransport {
                kind: io::ErrorKind::ConnectionRefused,
                attempts: attempts.clone(),
            },
            HandlerRegistry::new(),
        ));
        let runner = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.run().await })
        };

        // First attempt fires straight away.
        tokio::task::yield_now().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // Each further attempt only after a full refused backoff, never the
        // shorter generic one.
        for expected in 2..=4 {
            tokio::time::advance(Duration::from_secs(10)).await;
            tokio::task::yield_now().await;
            assert_eq!(attempts.load(Ordering::SeqCst), expected - 1);

            tokio::time::advance(Duration::from_secs(10)).await;
            tokio::task::yield_now().await;
            assert_eq!(attempts.load(Ordering::SeqCst), expected);
        }

        runner.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_error_uses_short_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let sup = Arc::new(supervisor(
            FailingTransport {
                kind: io::ErrorKind::NotFound,
                attempts: attempts.clone(),
            },
            HandlerRegistry::new(),
        ));
        let runner = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.run().await })
        };

        tokio::task::yield_now().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        runner.abort();
    }

    #[tokio::test]
    async fn test_set_then_get_on_same_connection() {
        let brightness = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let cell = brightness.clone();
        let read_cell = brightness.clone();
        registry.register(
            "brightness",
            HandlerEntry::new()
                .on_set(move |v: Value| {
                    let cell = cell.clone();
                    async move {
                        cell.store(v.as_u64().unwrap_or(0) as usize, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .on_get(move |_arg: Option<&Value>| {
                    Ok(json!(read_cell.load(Ordering::SeqCst)))
                }),
        );

        let (ours, peer) = tokio::io::duplex(4096);
        let sup = Arc::new(supervisor(
            OneShotTransport {
                stream: Mutex::new(Some(ours)),
            },
            registry,
        ));
        let runner = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.run().await })
        };

        let (mut peer_read, mut peer_write) = split_peer(peer);
        peer_write
            .write_all(b"{\"set\": {\"brightness\": 50}}\n{\"get\": {\"brightness\": null}}\n")
            .await
            .unwrap();

        assert_eq!(read_peer_line(&mut peer_read).await, "{\"brightness\":50}\n");

        runner.abort();
    }

    #[tokio::test]
    async fn test_undecodable_line_does_not_kill_connection() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "image",
            HandlerEntry::new().on_get(|_arg: Option<&Value>| Ok(json!("cat.png"))),
        );

        let (ours, peer) = tokio::io::duplex(4096);
        let sup = Arc::new(supervisor(
            OneShotTransport {
                stream: Mutex::new(Some(ours)),
            },
            registry,
        ));
        let runner = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.run().await })
        };

        let (mut peer_read, mut peer_write) = split_peer(peer);
        peer_write.write_all(b"this is not json\n").await.unwrap();
        peer_write.write_all(b"[1, 2, 3]\n").await.unwrap();
        peer_write
            .write_all(b"{\"get\": {\"image\": null}}\n")
            .await
            .unwrap();

        assert_eq!(read_peer_line(&mut peer_read).await, "{\"image\":\"cat.png\"}\n");

        runner.abort();
    }

    #[tokio::test]
    async fn test_peer_close_releases_connection() {
        let (ours, peer) = tokio::io::duplex(4096);
        let sup = Arc::new(supervisor(
            OneShotTransport {
                stream: Mutex::new(Some(ours)),
            },
            HandlerRegistry::new(),
        ));
        let connections = sup.connections.clone();
        let runner = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.run().await })
        };

        while connections.is_empty() {
            tokio::task::yield_now().await;
        }
        drop(peer);
        while !connections.is_empty() {
            tokio::task::yield_now().await;
        }

        runner.abort();
    }
}
