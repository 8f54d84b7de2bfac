//! The leaf-to-upstream wire format.
//!
//! One frame per leaf flush: a 4-byte big-endian payload length followed by
//! the bincode encoding of a `HashMap<String, f64>` (metric name to summed,
//! sample-rate-corrected value). Frames are self-delimiting, so one
//! connection carries any number of them back to back. Doubles survive the
//! round trip bit-exactly. Both endpoints live in this crate; the layout
//! here is the only wire contract between statsink instances.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on the payload of a single frame. A leaf would need millions
/// of distinct counters to approach this; anything larger is a corrupt or
/// hostile stream.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encodes one counter map as a single frame.
pub fn encode(counts: &HashMap<String, f64>) -> Result<Vec<u8>> {
    let payload = bincode::serialize(counts).context("encoding forward frame")?;
    if payload.len() > MAX_FRAME_LEN {
        bail!(
            "forward frame payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        );
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads and decodes one frame from the stream.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. A
/// truncated frame, an oversized length prefix, or an undecodable payload is
/// an error; the caller drops the connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<HashMap<String, f64>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];

    // Read the first length byte separately so end-of-stream between frames
    // is distinguishable from truncation inside one.
    let n = reader
        .read(&mut len_buf[..1])
        .await
        .context("reading frame length")?;
    if n == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut len_buf[1..])
        .await
        .context("reading frame length")?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds the {MAX_FRAME_LEN} byte limit");
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("reading frame payload")?;

    let counts = bincode::deserialize(&payload).context("decoding forward frame")?;
    Ok(Some(counts))
}
