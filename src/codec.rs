//! DAP wire framing: `Content-Length: N\r\n\r\n` + N bytes of UTF-8 JSON.
//!
//! Pure parsing and serialization over an accumulating byte buffer, no I/O.
//! The decoder is deliberately permissive: a malformed payload drops that
//! one frame (with a counter bump) instead of erroring the whole stream.

use crate::message::Message;
use bytes::BytesMut;
use log::debug;

const TWO_CRLF: &[u8] = b"\r\n\r\n";

/// Incremental frame decoder.
///
/// Feed it raw bytes as they arrive (partial reads and several frames per
/// read both work) and pull complete messages with [`FrameDecoder::next_frame`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    content_length: Option<usize>,
    /// Frames successfully decoded since creation.
    pub frames_decoded: u64,
    /// Frames dropped because the payload was empty, not JSON, or not a
    /// valid DAP envelope.
    pub frames_dropped: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete message from the buffer, if any.
    ///
    /// Bytes beyond a complete frame are retained for the next call.
    pub fn next_frame(&mut self) -> Option<Message> {
        loop {
            match self.content_length {
                Some(len) => {
                    if self.buf.len() < len {
                        return None;
                    }
                    let body = self.buf.split_to(len);
                    self.content_length = None;
                    match serde_json::from_slice::<Message>(&body) {
                        Ok(message) => {
                            self.frames_decoded += 1;
                            return Some(message);
                        }
                        Err(err) => {
                            self.frames_dropped += 1;
                            debug!(
                                target: "codec",
                                "dropping malformed frame ({err}): {}",
                                String::from_utf8_lossy(&body)
                            );
                            // keep scanning, the stream itself stays usable
                        }
                    }
                }
                None => {
                    let idx = self.buf.windows(TWO_CRLF.len()).position(|w| w == TWO_CRLF)?;
                    let header = self.buf.split_to(idx + TWO_CRLF.len());
                    for line in String::from_utf8_lossy(&header[..idx]).split("\r\n") {
                        let mut parts = line.splitn(2, ':');
                        // header name match is case-sensitive
                        if parts.next() == Some("Content-Length") {
                            if let Some(value) = parts.next() {
                                if let Some(len) = parse_content_length(value) {
                                    self.content_length = Some(len);
                                }
                            }
                        }
                    }
                    // a header block without Content-Length is skipped and
                    // the scan continues at the next block
                }
            }
        }
    }
}

/// Permissive `Content-Length` value parse: surrounding whitespace and a
/// leading `+` are accepted, mirroring the coercion the protocol's common
/// clients apply. Not a strict integer parse on purpose.
fn parse_content_length(value: &str) -> Option<usize> {
    let value = value.trim();
    let value = value.strip_prefix('+').unwrap_or(value);
    value.parse().ok()
}

/// Serialize a message into one writeable unit: header plus payload.
///
/// `Content-Length` counts UTF-8 bytes, not characters.
pub fn encode(message: &Message) -> Vec<u8> {
    let payload = serde_json::to_vec(message).expect("DAP envelopes always serialize");
    let mut frame = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    frame
}
