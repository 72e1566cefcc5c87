//! # pixelbus
//!
//! Control-plane core of a home LED-matrix device agent.
//!
//! Two pieces share one hard problem — correct, non-blocking, self-healing
//! communication over an unreliable transport:
//!
//! - **Control bus**: arbitrary clients query and mutate the live state of
//!   the device process over a persistent duplex connection carrying one
//!   JSON object per line (`{"set": ...}`, `{"get": ...}`, `{"action": ...}`).
//!   The [`Agent`] keeps the link alive across failures, dispatches
//!   envelopes into the [`handler::HandlerRegistry`], and pushes unsolicited
//!   updates; the request correlator turns the fire-and-forget protocol into
//!   awaitable calls.
//! - **Pixel feed**: the [`stream::StreamIngestor`] pulls a procedurally
//!   generated pixel-delta stream from a remote compute service with bounded
//!   `GET <n>` credits, keeping a target buffer of decoded frames for a
//!   fixed-rate display tick.
//!
//! Rendering to hardware, image decode, and cloud sync are external
//! collaborators; they register handlers and consume frames, nothing more.
//!
//! # Example
//!
//! ```ignore
//! use pixelbus::{Agent, HandlerEntry, UnixTransport};
//! use serde_json::{json, Value};
//!
//! let agent = std::sync::Arc::new(
//!     Agent::builder()
//!         .handler(
//!             "brightness",
//!             HandlerEntry::new()
//!                 .on_set(|v| async move { Ok(()) })
//!                 .on_get(|_arg: Option<&Value>| Ok(json!(40))),
//!         )
//!         .build(UnixTransport::new("/tmp/led_display.sock")),
//! );
//! tokio::spawn({
//!     let agent = agent.clone();
//!     async move { agent.run().await }
//! });
//! ```

pub mod bus;
pub mod connection;
pub mod error;
pub mod handler;
pub mod stream;
pub mod transport;

mod agent;
mod correlator;

pub use agent::{Agent, AgentBuilder, DEFAULT_CALL_TIMEOUT, DEFAULT_CHANNEL_CAPACITY};
pub use bus::{Envelope, MessageBus};
pub use connection::ReconnectPolicy;
pub use correlator::RequestCorrelator;
pub use error::{Error, Result};
pub use handler::{ErrorSink, HandlerEntry, HandlerRegistry};
pub use stream::{PixelFrame, PixelUpdate, SessionConfig, StreamConfig, StreamIngestor};
pub use transport::{TcpTransport, Transport, UnixTransport};
