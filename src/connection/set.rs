//! Active-connection registry with per-connection writer tasks.
//!
//! Each open connection gets a dedicated writer task fed by an mpsc channel;
//! senders never contend on the socket itself. Sending to a connection that
//! has since closed is a no-op, not an error.
//!
//! ```text
//! broadcast ──┬─► channel ─► writer task ─► peer 1
//!             └─► channel ─► writer task ─► peer 2
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Shared registry of open connections.
///
/// Cheaply cloneable; all clones share the same set.
#[derive(Clone)]
pub struct ConnectionSet {
    inner: Arc<Mutex<HashMap<u64, mpsc::Sender<String>>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl ConnectionSet {
    /// Create an empty set; `capacity` bounds each connection's outbound
    /// queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity,
        }
    }

    /// Register a new connection, returning its id and the receiving end of
    /// its outbound queue.
    pub fn add(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.inner.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    /// Remove a connection. Its writer task drains and exits once the
    /// sender is gone.
    pub fn remove(&self, id: u64) {
        self.inner.lock().unwrap().remove(&id);
    }

    /// Number of currently open connections.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether no connection is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue one line on every open connection.
    ///
    /// Connections that closed since the snapshot was taken are skipped
    /// silently.
    pub async fn broadcast(&self, line: &str) {
        let senders: Vec<mpsc::Sender<String>> =
            self.inner.lock().unwrap().values().cloned().collect();
        for tx in senders {
            let _ = tx.send(line.to_string()).await;
        }
    }

    /// Queue one line on a single connection; a no-op if it is gone.
    pub async fn send_to(&self, id: u64, line: String) {
        let tx = self.inner.lock().unwrap().get(&id).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(line).await;
        }
    }

    /// Spawn the writer task for one connection.
    ///
    /// Writes each queued line `\n`-terminated and flushed. Exits when the
    /// queue closes or the peer stops accepting writes.
    pub fn spawn_writer<W>(rx: mpsc::Receiver<String>, writer: W) -> JoinHandle<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(writer_loop(rx, writer))
    }
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<String>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        if let Err(err) = write.await {
            tracing::debug!("connection write failed: {}", err);
            break;
        }
    }
}
