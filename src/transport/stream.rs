//! TCP/TLS stream reassembler (§4.1 framing).
//!
//! Three sub-states, matching the design exactly: `WaitingMessageStart`
//! skips leading CRLFs (keepalive pings some SIP stacks send between
//! messages), `MessageAcquisition` buffers until the blank line ending the
//! headers, and `BodyAcquisition` waits for exactly `Content-Length` more
//! bytes. A missing `Content-Length` on a reliable transport is a framing
//! error the caller turns into a 400 response, per §4.1: "The Content-Length
//! header MUST be present for reliable transports; if absent the channel
//! responds with 400 and does not advance."

use bytes::{Buf, BytesMut};

use crate::error::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubState {
    WaitingMessageStart,
    MessageAcquisition,
    BodyAcquisition { headers_end: usize, content_length: usize },
}

/// Incrementally reassembles whole SIP messages out of a byte stream.
#[derive(Debug)]
pub struct Reassembler {
    buffer: BytesMut,
    state: SubState,
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler {
            buffer: BytesMut::new(),
            state: SubState::WaitingMessageStart,
        }
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds newly read bytes into the buffer. Extraction happens via
    /// repeated calls to [`Reassembler::try_extract`].
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Attempts to pull one complete message out of the buffer. Returns
    /// `Ok(None)` when more bytes are needed, `Ok(Some(frame))` when a
    /// message was fully reassembled (advancing past it), and `Err` when the
    /// stream is malformed beyond recovery (missing Content-Length).
    pub fn try_extract(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                SubState::WaitingMessageStart => {
                    let leading_crlf = self
                        .buffer
                        .iter()
                        .take_while(|&&b| b == b'\r' || b == b'\n')
                        .count();
                    if leading_crlf > 0 {
                        self.buffer.advance(leading_crlf);
                    }
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    self.state = SubState::MessageAcquisition;
                }
                SubState::MessageAcquisition => {
                    match find_headers_end(&self.buffer) {
                        Some(headers_end) => {
                            let content_length = match parse_content_length(&self.buffer[..headers_end]) {
                                Some(len) => len,
                                None => {
                                    return Err(TransportError::MissingContentLength.into());
                                }
                            };
                            self.state = SubState::BodyAcquisition {
                                headers_end,
                                content_length,
                            };
                        }
                        None => return Ok(None),
                    }
                }
                SubState::BodyAcquisition {
                    headers_end,
                    content_length,
                } => {
                    let total = headers_end + content_length;
                    if self.buffer.len() < total {
                        return Ok(None);
                    }
                    let frame = self.buffer[..total].to_vec();
                    self.buffer.advance(total);
                    self.state = SubState::WaitingMessageStart;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

/// Finds the index just past the blank line terminating the header block
/// (`\r\n\r\n` or a bare `\n\n`).
fn find_headers_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = find_subslice(buf, b"\r\n\r\n") {
        return Some(pos + 4);
    }
    find_subslice(buf, b"\n\n").map(|pos| pos + 2)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extracts the value of the `Content-Length`/`l` header from a raw header
/// block. Case-insensitive per RFC 3261 header-name matching.
fn parse_content_length(header_block: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(header_block);
    for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        let mut parts = line.splitn(2, ':');
        let name = parts.next()?.trim();
        let value = parts.next()?.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            return value.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_one_message_with_body() {
        let mut r = Reassembler::new();
        let msg = b"INVITE sip:bob@example.org SIP/2.0\r\nContent-Length: 5\r\n\r\nhello";
        r.push(msg);
        let frame = r.try_extract().unwrap().unwrap();
        assert_eq!(frame, msg.to_vec());
        assert!(r.try_extract().unwrap().is_none());
    }

    #[test]
    fn waits_for_more_bytes_when_body_incomplete() {
        let mut r = Reassembler::new();
        r.push(b"INVITE sip:bob@example.org SIP/2.0\r\nContent-Length: 5\r\n\r\nhel");
        assert!(r.try_extract().unwrap().is_none());
        r.push(b"lo");
        let frame = r.try_extract().unwrap().unwrap();
        assert!(frame.ends_with(b"hello"));
    }

    #[test]
    fn missing_content_length_is_an_error() {
        let mut r = Reassembler::new();
        r.push(b"OPTIONS sip:bob@example.org SIP/2.0\r\n\r\n");
        assert!(r.try_extract().is_err());
    }

    #[test]
    fn skips_leading_keepalive_crlf() {
        let mut r = Reassembler::new();
        r.push(b"\r\n\r\nINVITE sip:bob@example.org SIP/2.0\r\nContent-Length: 0\r\n\r\n");
        let frame = r.try_extract().unwrap().unwrap();
        assert!(frame.starts_with(b"INVITE"));
    }

    #[test]
    fn two_messages_back_to_back_extract_separately() {
        let mut r = Reassembler::new();
        r.push(b"OPTIONS sip:bob@example.org SIP/2.0\r\nContent-Length: 0\r\n\r\n");
        r.push(b"OPTIONS sip:bob@example.org SIP/2.0\r\nContent-Length: 0\r\n\r\n");
        assert!(r.try_extract().unwrap().is_some());
        assert!(r.try_extract().unwrap().is_some());
        assert!(r.try_extract().unwrap().is_none());
    }
}
