//! Credit-controlled ingestion of the remote pixel feed.
//!
//! The ingestor is pull-based: a fixed-rate consumer (the display tick)
//! calls [`StreamIngestor::next_frame`] once per step. Pulls drive the state
//! machine Idle → Connecting → Streaming → Draining → Idle and keep a target
//! number of decoded frames buffered by issuing bounded `GET <n>` credits,
//! never letting the remote push unbounded data.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::frame::{base_frame, decode_frame, read_frame, PixelFrame, StreamInit, END_SENTINEL};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Session-configuration handshake, sent as the first line of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    /// Per-step compute timeout granted to the remote service, in ms.
    pub calc_timeout: u32,
    pub grid_width: u32,
    pub grid_height: u32,
    pub food: u32,
    pub food_decay: u32,
    pub snake_count: u32,
    /// Always `"pixel_data"`: request decoded pixel deltas.
    pub data_mode: String,
    /// Always `true`: frames only on explicit `GET` credits.
    pub data_on_demand: bool,
    /// Requested map, or `null` for the server default.
    pub map: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            calc_timeout: 1000,
            grid_width: 64,
            grid_height: 64,
            food: 15,
            food_decay: 100,
            snake_count: 20,
            data_mode: "pixel_data".to_string(),
            data_on_demand: true,
            map: None,
        }
    }
}

/// Buffering parameters for one subscription.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Desired steady-state count of buffered, unconsumed frames.
    pub target_buffer_size: usize,
    /// Smallest credit worth requesting; avoids chatty one-frame requests.
    pub min_request_size: usize,
    /// Handshake parameters for each session.
    pub session: SessionConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_buffer_size: 30,
            min_request_size: 5,
            session: SessionConfig::default(),
        }
    }
}

/// Lifecycle of the single live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No session. The next pull starts one.
    Idle,
    /// Transport/handshake in progress.
    Connecting,
    /// Live: credits issued, frames buffered.
    Streaming,
    /// Stream over; serving what is left in the buffer.
    Draining,
}

struct Shared {
    state: StreamState,
    buffer: VecDeque<PixelFrame>,
    /// Frames requested but not yet delivered. Never negative.
    pending: usize,
    /// Bumped by `stop`; a session whose generation is stale must not touch
    /// this state anymore.
    generation: u64,
}

struct SessionHandle {
    cancel: CancellationToken,
    requests: mpsc::UnboundedSender<usize>,
    _task: JoinHandle<()>,
}

/// Pull-based client for the remote pixel feed. Exactly one session is live
/// at a time.
pub struct StreamIngestor<T: Transport> {
    transport: Arc<T>,
    config: StreamConfig,
    shared: Arc<Mutex<Shared>>,
    session: Mutex<Option<SessionHandle>>,
}

impl<T: Transport> StreamIngestor<T> {
    /// Create an idle ingestor over `transport`.
    pub fn new(transport: T, config: StreamConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: StreamState::Idle,
                buffer: VecDeque::new(),
                pending: 0,
                generation: 0,
            })),
            session: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.shared.lock().unwrap().state
    }

    /// Frames buffered and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.shared.lock().unwrap().buffer.len()
    }

    /// Frames requested and not yet delivered.
    pub fn pending(&self) -> usize {
        self.shared.lock().unwrap().pending
    }

    /// Pull the next animation step, driving the state machine.
    ///
    /// Returns `None` while no frame is available (session still connecting,
    /// or the remote has not delivered yet). Must be called from within a
    /// tokio runtime.
    pub fn next_frame(&self) -> Option<PixelFrame> {
        let mut shared = self.shared.lock().unwrap();
        match shared.state {
            StreamState::Idle => {
                // Transition under the lock: a pull racing another pull (or
                // a handler task) must never start a second session.
                shared.state = StreamState::Connecting;
                let generation = shared.generation;
                drop(shared);
                self.start_session(generation);
                None
            }
            StreamState::Connecting => shared.buffer.pop_front(),
            StreamState::Streaming => {
                let outstanding = shared.buffer.len() + shared.pending;
                let credit = self.config.target_buffer_size.saturating_sub(outstanding);
                let request = if credit >= self.config.min_request_size {
                    shared.pending += credit;
                    Some(credit)
                } else {
                    None
                };
                let frame = shared.buffer.pop_front();
                drop(shared);

                if let Some(n) = request {
                    let sender = self
                        .session
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map(|h| h.requests.clone());
                    if let Some(tx) = sender {
                        // A closed channel means the session already ended;
                        // its cleanup resets the pending count.
                        let _ = tx.send(n);
                    }
                }
                frame
            }
            StreamState::Draining => {
                let frame = shared.buffer.pop_front();
                if shared.buffer.is_empty() {
                    shared.state = StreamState::Idle;
                    shared.pending = 0;
                    drop(shared);
                    self.teardown_session();
                }
                frame
            }
        }
    }

    /// Tear down any live session and reset to Idle.
    ///
    /// Callable from any state and any task; idempotent. The session task
    /// observes the cancellation at its next suspension point and releases
    /// its transport on the way out.
    pub fn stop(&self) {
        self.teardown_session();
        let mut shared = self.shared.lock().unwrap();
        shared.generation += 1;
        shared.buffer.clear();
        shared.pending = 0;
        shared.state = StreamState::Idle;
    }

    fn teardown_session(&self) {
        if let Some(handle) = self.session.lock().unwrap().take() {
            handle.cancel.cancel();
        }
    }

    fn start_session(&self, generation: u64) {
        let cancel = CancellationToken::new();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            self.transport.clone(),
            self.shared.clone(),
            self.config.session.clone(),
            cancel.clone(),
            req_rx,
            generation,
        ));

        let replaced = self.session.lock().unwrap().replace(SessionHandle {
            cancel,
            requests: req_tx,
            _task: task,
        });
        if let Some(old) = replaced {
            old.cancel.cancel();
        }
    }
}

/// One session from connect to teardown. The cleanup at the bottom always
/// runs, including when the cancellation token fires mid-await.
async fn run_session<T: Transport>(
    transport: Arc<T>,
    shared: Arc<Mutex<Shared>>,
    session: SessionConfig,
    cancel: CancellationToken,
    req_rx: mpsc::UnboundedReceiver<usize>,
    generation: u64,
) {
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = session_loop(transport, &shared, session, req_rx, generation) => result,
    };
    if let Err(err) = result {
        tracing::warn!("pixel stream session ended: {}", err);
    }

    let mut s = shared.lock().unwrap();
    if s.generation != generation {
        // stop() already reset the state this session used to own.
        return;
    }
    s.pending = 0;
    s.state = if s.buffer.is_empty() {
        StreamState::Idle
    } else {
        StreamState::Draining
    };
}

async fn session_loop<T: Transport>(
    transport: Arc<T>,
    shared: &Mutex<Shared>,
    session: SessionConfig,
    mut req_rx: mpsc::UnboundedReceiver<usize>,
    generation: u64,
) -> Result<()> {
    let stream = transport.connect().await?;
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    // Handshake: configuration out, acknowledgement and init payload in.
    let mut line = serde_json::to_string(&session)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;

    let mut ack = String::new();
    if reader.read_line(&mut ack).await? == 0 {
        return Err(Error::Protocol(
            "stream closed before acknowledgement".to_string(),
        ));
    }

    let mut init_line = String::new();
    if reader.read_line(&mut init_line).await? == 0 {
        return Err(Error::Protocol(
            "stream closed before init payload".to_string(),
        ));
    }
    let init: StreamInit = serde_json::from_str(&init_line)?;

    // Static obstacles go on screen before the first live step.
    {
        let mut s = shared.lock().unwrap();
        if s.generation != generation {
            return Ok(());
        }
        let base = base_frame(&init);
        if !base.is_empty() {
            s.buffer.push_back(base);
        }
        s.state = StreamState::Streaming;
    }

    // Credits are written by a subtask so a slow write never stalls the
    // frame reads.
    let request_writer = tokio::spawn(async move {
        while let Some(n) = req_rx.recv().await {
            let line = format!("GET {n}\n");
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        match read_frame(&mut reader).await {
            Ok(Some(payload)) => {
                if payload == END_SENTINEL {
                    break Ok(());
                }
                let frame = match decode_frame(&payload) {
                    Ok(frame) => frame,
                    Err(err) => break Err(err),
                };
                let mut s = shared.lock().unwrap();
                if s.generation != generation {
                    break Ok(());
                }
                s.buffer.push_back(frame);
                s.pending = s.pending.saturating_sub(1);
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    request_writer.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectFuture;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Hands out prepared streams one per connect, then blocks forever.
    struct ScriptedTransport {
        streams: Mutex<VecDeque<DuplexStream>>,
    }

    impl ScriptedTransport {
        fn new(streams: Vec<DuplexStream>) -> Self {
            Self {
                streams: Mutex::new(streams.into()),
            }
        }
    }

    impl Transport for ScriptedTransport {
        type Stream = DuplexStream;

        fn connect(&self) -> ConnectFuture<'_, DuplexStream> {
            let stream = self.streams.lock().unwrap().pop_front();
            Box::pin(async move {
                match stream {
                    Some(s) => Ok(s),
                    None => futures::future::pending().await,
                }
            })
        }
    }

    fn config(target: usize, min: usize) -> StreamConfig {
        StreamConfig {
            target_buffer_size: target,
            min_request_size: min,
            session: SessionConfig::default(),
        }
    }

    fn open_map_init() -> String {
        json!({
            "height": 4,
            "width": 4,
            "blocked_value": 1,
            "base_map": vec![vec![0; 4]; 4],
            "color_mapping": { "1": [40, 40, 40] },
        })
        .to_string()
    }

    fn encode(payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::with_capacity(4 + payload.len());
        wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        wire.extend_from_slice(payload);
        wire
    }

    /// Accept the handshake on `peer`, reply with ack + init, return the
    /// split halves for scripting frames.
    async fn accept_handshake(
        peer: DuplexStream,
        init_line: &str,
    ) -> (
        BufReader<tokio::io::ReadHalf<DuplexStream>>,
        tokio::io::WriteHalf<DuplexStream>,
    ) {
        let (read_half, mut write_half) = tokio::io::split(peer);
        let mut reader = BufReader::new(read_half);

        let mut handshake = String::new();
        reader.read_line(&mut handshake).await.unwrap();
        let cfg: serde_json::Value = serde_json::from_str(&handshake).unwrap();
        assert_eq!(cfg["data_mode"], "pixel_data");
        assert_eq!(cfg["data_on_demand"], true);

        write_half.write_all(b"{\"status\": \"ok\"}\n").await.unwrap();
        write_half
            .write_all(format!("{init_line}\n").as_bytes())
            .await
            .unwrap();
        (reader, write_half)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_first_pull_starts_session() {
        let (ours, _peer) = tokio::io::duplex(4096);
        let ingestor = StreamIngestor::new(ScriptedTransport::new(vec![ours]), config(10, 2));

        assert_eq!(ingestor.state(), StreamState::Idle);
        assert!(ingestor.next_frame().is_none());
        assert_eq!(ingestor.state(), StreamState::Connecting);
        // Pulling again while connecting neither panics nor double-starts.
        assert!(ingestor.next_frame().is_none());
        assert_eq!(ingestor.state(), StreamState::Connecting);
    }

    #[tokio::test]
    async fn test_three_frames_then_end() {
        let (ours, peer) = tokio::io::duplex(4096);
        let ingestor =
            Arc::new(StreamIngestor::new(ScriptedTransport::new(vec![ours]), config(10, 2)));

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = accept_handshake(peer, &open_map_init()).await;

            // Exactly one credit request is expected for this lifecycle.
            let mut request = String::new();
            reader.read_line(&mut request).await.unwrap();
            assert_eq!(request, "GET 10\n");

            for step in 0u8..3 {
                writer
                    .write_all(&encode(&[step, step, 9, 9, 9]))
                    .await
                    .unwrap();
            }
            writer.write_all(&encode(END_SENTINEL)).await.unwrap();

            // Any further read must be the peer closing, never another GET.
            let mut trailing = String::new();
            let n = reader.read_line(&mut trailing).await.unwrap();
            assert_eq!(n, 0, "unexpected extra request: {trailing:?}");
        });

        assert!(ingestor.next_frame().is_none());
        wait_for(|| ingestor.state() == StreamState::Streaming).await;

        // One pull issues the full credit; the server answers with three
        // frames and END.
        let first = ingestor.next_frame();
        assert!(first.is_none());
        wait_for(|| ingestor.buffered() == 3).await;
        wait_for(|| ingestor.state() == StreamState::Draining).await;

        let mut collected = Vec::new();
        while ingestor.state() == StreamState::Draining {
            if let Some(frame) = ingestor.next_frame() {
                collected.push(frame);
            }
        }
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].changes[0].x, 0);
        assert_eq!(collected[2].changes[0].x, 2);
        assert_eq!(ingestor.state(), StreamState::Idle);
        assert_eq!(ingestor.pending(), 0);

        drop(ingestor);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_base_frame_precedes_live_frames() {
        let (ours, peer) = tokio::io::duplex(4096);
        let ingestor =
            Arc::new(StreamIngestor::new(ScriptedTransport::new(vec![ours]), config(10, 2)));

        let init = json!({
            "height": 2,
            "width": 2,
            "blocked_value": 7,
            "base_map": [[7, 0], [0, 0]],
            "color_mapping": { "7": [40, 40, 40] },
        })
        .to_string();

        let server = tokio::spawn(async move {
            let (_reader, mut writer) = accept_handshake(peer, &init).await;
            writer.write_all(&encode(END_SENTINEL)).await.unwrap();
            // Keep the write half open until the client is done.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        assert!(ingestor.next_frame().is_none());
        wait_for(|| ingestor.buffered() == 1).await;

        let base = loop {
            if let Some(frame) = ingestor.next_frame() {
                break frame;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(
            base.changes,
            vec![crate::stream::PixelUpdate { x: 0, y: 0, r: 40, g: 40, b: 40 }]
        );

        server.abort();
    }

    #[tokio::test]
    async fn test_credit_arithmetic_and_soft_cap() {
        let (ours, peer) = tokio::io::duplex(4096);
        let ingestor =
            Arc::new(StreamIngestor::new(ScriptedTransport::new(vec![ours]), config(6, 2)));

        let server = tokio::spawn(async move {
            let (mut reader, mut writer) = accept_handshake(peer, &open_map_init()).await;

            let mut request = String::new();
            reader.read_line(&mut request).await.unwrap();
            assert_eq!(request, "GET 6\n");

            // Deliver two of the six requested frames.
            writer.write_all(&encode(&[1, 1, 1, 1, 1])).await.unwrap();
            writer.write_all(&encode(&[2, 2, 2, 2, 2])).await.unwrap();

            // The client consumes both; outstanding work is 4, credit 2.
            let mut request = String::new();
            reader.read_line(&mut request).await.unwrap();
            assert_eq!(request, "GET 2\n");

            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        assert!(ingestor.next_frame().is_none());
        wait_for(|| ingestor.state() == StreamState::Streaming).await;

        assert!(ingestor.next_frame().is_none());
        assert_eq!(ingestor.pending(), 6);

        wait_for(|| ingestor.buffered() == 2).await;
        assert_eq!(ingestor.pending(), 4);

        // buffered + pending == target: no new credit on these pulls.
        assert!(ingestor.next_frame().is_some());
        assert!(ingestor.next_frame().is_some());
        assert_eq!(ingestor.buffered(), 0);

        // Outstanding dropped to 4, credit 2 >= min_request_size.
        assert!(ingestor.next_frame().is_none());
        wait_for(|| ingestor.pending() == 6).await;

        server.abort();
    }

    #[tokio::test]
    async fn test_unsolicited_frames_never_drive_pending_negative() {
        let (ours, peer) = tokio::io::duplex(4096);
        let ingestor =
            Arc::new(StreamIngestor::new(ScriptedTransport::new(vec![ours]), config(3, 1)));

        let server = tokio::spawn(async move {
            let (_reader, mut writer) = accept_handshake(peer, &open_map_init()).await;
            // Five frames although at most three were requested.
            for step in 0u8..5 {
                writer
                    .write_all(&encode(&[step, 0, 1, 1, 1]))
                    .await
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        assert!(ingestor.next_frame().is_none());
        wait_for(|| ingestor.buffered() == 5).await;
        assert_eq!(ingestor.pending(), 0);

        server.abort();
    }

    #[tokio::test]
    async fn test_stop_resets_from_streaming() {
        let (ours, peer) = tokio::io::duplex(4096);
        let ingestor =
            Arc::new(StreamIngestor::new(ScriptedTransport::new(vec![ours]), config(5, 1)));

        let server = tokio::spawn(async move {
            let (_reader, mut writer) = accept_handshake(peer, &open_map_init()).await;
            writer.write_all(&encode(&[1, 1, 1, 1, 1])).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        assert!(ingestor.next_frame().is_none());
        wait_for(|| ingestor.buffered() == 1).await;
        assert_eq!(ingestor.state(), StreamState::Streaming);

        ingestor.stop();
        assert_eq!(ingestor.state(), StreamState::Idle);
        assert_eq!(ingestor.buffered(), 0);
        assert_eq!(ingestor.pending(), 0);

        // Safe to call twice in a row.
        ingestor.stop();
        assert_eq!(ingestor.state(), StreamState::Idle);

        server.abort();
    }

    #[tokio::test]
    async fn test_stop_while_connecting() {
        let (ours, _peer) = tokio::io::duplex(4096);
        let ingestor = StreamIngestor::new(ScriptedTransport::new(vec![ours]), config(5, 1));

        assert!(ingestor.next_frame().is_none());
        assert_eq!(ingestor.state(), StreamState::Connecting);

        ingestor.stop();
        assert_eq!(ingestor.state(), StreamState::Idle);
        assert_eq!(ingestor.pending(), 0);
        assert_eq!(ingestor.buffered(), 0);
    }

    #[tokio::test]
    async fn test_stop_from_idle_is_noop() {
        let (ours, _peer) = tokio::io::duplex(4096);
        let ingestor = StreamIngestor::new(ScriptedTransport::new(vec![ours]), config(5, 1));
        ingestor.stop();
        ingestor.stop();
        assert_eq!(ingestor.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn test_ragged_frame_aborts_session() {
        let (ours, peer) = tokio::io::duplex(4096);
        let ingestor =
            Arc::new(StreamIngestor::new(ScriptedTransport::new(vec![ours]), config(5, 1)));

        let server = tokio::spawn(async move {
            let (_reader, mut writer) = accept_handshake(peer, &open_map_init()).await;
            // Length not a multiple of the record size.
            writer.write_all(&encode(&[1, 2, 3])).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        assert!(ingestor.next_frame().is_none());
        // The bad frame aborts the session with nothing buffered.
        wait_for(|| ingestor.state() == StreamState::Idle).await;

        // The next pull re-enters Connecting (no more scripted streams, so
        // it stays there).
        assert!(ingestor.next_frame().is_none());
        assert_eq!(ingestor.state(), StreamState::Connecting);

        server.abort();
    }

    #[tokio::test]
    async fn test_transport_closure_drains_buffered_frames() {
        let (ours, peer) = tokio::io::duplex(4096);
        let ingestor =
            Arc::new(StreamIngestor::new(ScriptedTransport::new(vec![ours]), config(5, 1)));

        let server = tokio::spawn(async move {
            let (_reader, mut writer) = accept_handshake(peer, &open_map_init()).await;
            writer.write_all(&encode(&[1, 1, 1, 1, 1])).await.unwrap();
            writer.write_all(&encode(&[2, 2, 2, 2, 2])).await.unwrap();
            // Dropping both halves closes the transport mid-session.
        });

        assert!(ingestor.next_frame().is_none());
        wait_for(|| ingestor.state() == StreamState::Draining).await;
        assert_eq!(ingestor.buffered(), 2);

        assert!(ingestor.next_frame().is_some());
        assert!(ingestor.next_frame().is_some());
        assert_eq!(ingestor.state(), StreamState::Idle);

        server.await.unwrap();
    }
}
