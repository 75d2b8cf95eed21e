use bytes::{Buf, BytesMut};
use serde::Serialize;

use crate::error::ProtocolError;
use crate::messages::{ClientEvent, RelayEvent};

/// Maximum size of one event line: 8 MiB (file transfers ride on the same channel).
pub const MAX_LINE_SIZE: usize = 8 * 1024 * 1024;

/// Current protocol version, announced in `hello`.
pub const PROTOCOL_VERSION: u32 = 1;

fn encode_line<T: Serialize>(event: &T) -> Result<Vec<u8>, ProtocolError> {
    // serde_json escapes control characters, so the payload never contains a raw newline.
    let mut buf = serde_json::to_vec(event)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Encode a `ClientEvent` as one newline-terminated JSON line.
pub fn encode_client_event(event: &ClientEvent) -> Result<Vec<u8>, ProtocolError> {
    encode_line(event)
}

/// Decode a `ClientEvent` from one line (without the trailing newline).
pub fn decode_client_event(line: &[u8]) -> Result<ClientEvent, ProtocolError> {
    Ok(serde_json::from_slice(line)?)
}

/// Encode a `RelayEvent` as one newline-terminated JSON line.
pub fn encode_relay_event(event: &RelayEvent) -> Result<Vec<u8>, ProtocolError> {
    encode_line(event)
}

/// Decode a `RelayEvent` from one line (without the trailing newline).
pub fn decode_relay_event(line: &[u8]) -> Result<RelayEvent, ProtocolError> {
    Ok(serde_json::from_slice(line)?)
}

/// Attempt to extract one complete line from a byte buffer.
///
/// Returns `Ok(Some(line))` when a complete, non-blank line is available,
/// `Ok(None)` if more data is needed, or `Err` if a line exceeds
/// [`MAX_LINE_SIZE`]. An oversized line is dropped from the buffer so the
/// caller can keep reading the stream after reporting it.
pub fn try_decode_line(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    loop {
        let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_LINE_SIZE {
                let len = buf.len();
                buf.clear();
                return Err(ProtocolError::LineTooLong(len));
            }
            return Ok(None);
        };

        let mut line = buf.split_to(pos).to_vec();
        buf.advance(1);

        if line.len() > MAX_LINE_SIZE {
            return Err(ProtocolError::LineTooLong(line.len()));
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        return Ok(Some(line));
    }
}
