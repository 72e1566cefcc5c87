//! Pull the remote pixel feed on a fixed display cadence.
//!
//! Connects the stream ingestor to a running snake compute service and
//! ticks at 10 frames per second, logging each consumed animation step.
//! Ctrl-C stops the session cleanly.
//!
//! Usage: `snake_feed [host:port]` (default `127.0.0.1:5488`).

use std::sync::Arc;
use std::time::Duration;

use pixelbus::{StreamConfig, StreamIngestor, TcpTransport};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5488".to_string());

    let ingestor = Arc::new(StreamIngestor::new(
        TcpTransport::new(addr.clone()),
        StreamConfig::default(),
    ));
    info!("pulling pixel feed from {}", addr);

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut steps = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping after {} steps", steps);
                ingestor.stop();
                break;
            }
            _ = ticker.tick() => {
                if let Some(frame) = ingestor.next_frame() {
                    steps += 1;
                    info!(
                        "step {}: {} pixel changes ({} buffered, {} pending)",
                        steps,
                        frame.len(),
                        ingestor.buffered(),
                        ingestor.pending(),
                    );
                }
            }
        }
    }
}
