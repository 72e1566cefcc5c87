//! Backpressure-controlled ingestion of the remote pixel feed.
//!
//! A session opens with a JSON-line handshake, receives an acknowledgement
//! and an init payload (map layout and color mapping), then pulls binary
//! pixel-delta frames with bounded `GET <n>` credits. See
//! [`StreamIngestor`] for the lifecycle.

mod frame;
mod ingestor;

pub use frame::{
    base_frame, decode_frame, PixelFrame, PixelUpdate, StreamInit, END_SENTINEL, RECORD_SIZE,
};
pub use ingestor::{SessionConfig, StreamConfig, StreamIngestor, StreamState};
