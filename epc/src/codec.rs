//! Length-prefixed framing: a 6-character lowercase hex byte count followed
//! by that many bytes of UTF-8 s-expression text ending in `\n`.

use crate::error::FramingError;
use crate::sexp::{self, Sexp};

const HEADER_LEN: usize = 6;

/// Encode a single value as a complete frame (header + payload + bytes).
pub fn encode(v: &Sexp) -> Vec<u8> {
    let mut payload = sexp::print(v).into_bytes();
    payload.push(b'\n');
    let mut frame = format!("{:06x}", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    frame
}

/// Decode the payload of a single already-extracted frame (the part after
/// the 6-byte header, including the trailing newline).
pub fn decode_payload(payload: &[u8]) -> Result<Sexp, FramingError> {
    let text = std::str::from_utf8(payload).map_err(FramingError::Utf8)?;
    sexp::parse(text.trim_end_matches('\n'))
}

/// Accumulates bytes arriving from a connection and peels off complete
/// frames as they become available, leaving partial frames buffered for
/// the next round of bytes.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buf: Vec<u8>,
}

impl ReadBuffer {
    /// A fresh, empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to take the next complete frame off the front of the buffer.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a complete frame
    /// (this is not an error: the rest of the bytes simply haven't arrived
    /// yet). Returns `Err` for a malformed header -- note that in that case
    /// the buffer cannot safely be advanced, since we don't know how many
    /// bytes the bogus frame was meant to span.
    pub fn take_frame(&mut self) -> Result<Option<Sexp>, FramingError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = &self.buf[..HEADER_LEN];
        let header_str = std::str::from_utf8(header)
            .map_err(|_| FramingError::BadHexHeader(format!("{:?}", header)))?;
        let len = usize::from_str_radix(header_str, 16)
            .map_err(|_| FramingError::BadHexHeader(header_str.to_owned()))?;
        if len == 0 {
            return Err(FramingError::ZeroLength);
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload: Vec<u8> = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        let value = decode_payload(&payload)?;
        Ok(Some(value))
    }

    /// Bytes currently buffered but not yet consumed as a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}
