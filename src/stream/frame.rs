//! Pixel-delta frame decoding and the stream-init payload.
//!
//! After the handshake, the feed carries binary frames: each frame is a
//! `u32` big-endian length prefix followed by that many payload bytes, and
//! each payload is a run of fixed-width 5-byte records `(x, y, r, g, b)` —
//! one discrete animation step. A frame whose payload is the literal bytes
//! `END` marks the end of the stream.

use std::collections::HashMap;
use std::io;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Bytes per pixel-change record on the wire.
pub const RECORD_SIZE: usize = 5;

/// Frame payload marking the end of the stream.
pub const END_SENTINEL: &[u8] = b"END";

/// Upper bound on a single frame payload. A full 256x256 grid repaint is
/// ~327 KiB; anything past this is a corrupt length prefix.
const MAX_FRAME_BYTES: usize = 1 << 20;

/// One pixel change: paint `(x, y)` with `(r, g, b)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelUpdate {
    pub x: u8,
    pub y: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// One decoded animation step, consumed exactly once by the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PixelFrame {
    pub changes: Vec<PixelUpdate>,
}

impl PixelFrame {
    /// Number of pixel changes in this step.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether this step paints nothing.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Decode one frame payload into its pixel changes.
///
/// A payload whose length is not a multiple of the record size is a
/// [`Error::Decode`]; an undecodable frame boundary is fatal to the session
/// that produced it.
pub fn decode_frame(payload: &[u8]) -> Result<PixelFrame> {
    if payload.len() % RECORD_SIZE != 0 {
        return Err(Error::Decode(format!(
            "frame length {} is not a multiple of {}",
            payload.len(),
            RECORD_SIZE
        )));
    }
    let changes = payload
        .chunks_exact(RECORD_SIZE)
        .map(|rec| PixelUpdate {
            x: rec[0],
            y: rec[1],
            r: rec[2],
            g: rec[3],
            b: rec[4],
        })
        .collect();
    Ok(PixelFrame { changes })
}

/// Read one length-prefixed frame payload off the stream.
///
/// Returns `Ok(None)` on a clean close at a frame boundary. A close inside
/// a frame, or a length prefix past [`MAX_FRAME_BYTES`], is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed inside a frame header",
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Decode(format!("frame length {len} exceeds limit")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Initialization payload sent by the remote endpoint after the handshake
/// acknowledgement.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInit {
    pub height: u32,
    pub width: u32,
    /// Cell value in `base_map` marking a static obstacle.
    pub blocked_value: i64,
    /// Grid of cell values, row-major.
    pub base_map: Vec<Vec<i64>>,
    /// Cell value (as a string key) to `[r, g, b]`.
    pub color_mapping: HashMap<String, [u8; 3]>,
}

impl StreamInit {
    /// Color assigned to blocked cells, if the mapping defines one.
    pub fn blocked_color(&self) -> Option<[u8; 3]> {
        self.color_mapping
            .get(&self.blocked_value.to_string())
            .copied()
    }
}

/// Pre-render the static obstacles of the map as one frame.
///
/// Every blocked region is traversed with a 4-neighbor flood and painted in
/// the block color. The result precedes the live feed so obstacles are on
/// screen before the first animation step.
pub fn base_frame(init: &StreamInit) -> PixelFrame {
    let Some([r, g, b]) = init.blocked_color() else {
        return PixelFrame::default();
    };

    let rows = init.base_map.len();
    let mut visited: Vec<Vec<bool>> = init
        .base_map
        .iter()
        .map(|row| vec![false; row.len()])
        .collect();
    let mut changes = Vec::new();
    let mut queue = std::collections::VecDeque::new();

    for start_y in 0..rows {
        for start_x in 0..init.base_map[start_y].len() {
            if visited[start_y][start_x] || init.base_map[start_y][start_x] != init.blocked_value {
                continue;
            }
            visited[start_y][start_x] = true;
            queue.push_back((start_x, start_y));

            while let Some((x, y)) = queue.pop_front() {
                if let (Ok(px), Ok(py)) = (u8::try_from(x), u8::try_from(y)) {
                    changes.push(PixelUpdate { x: px, y: py, r, g, b });
                }
                let neighbors = [
                    (x.wrapping_sub(1), y),
                    (x + 1, y),
                    (x, y.wrapping_sub(1)),
                    (x, y + 1),
                ];
                for (nx, ny) in neighbors {
                    if ny >= rows || nx >= init.base_map[ny].len() {
                        continue;
                    }
                    if !visited[ny][nx] && init.base_map[ny][nx] == init.blocked_value {
                        visited[ny][nx] = true;
                        queue.push_back((nx, ny));
                    }
                }
            }
        }
    }

    PixelFrame { changes }
}
