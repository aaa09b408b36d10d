// HTTP upgrade handshake (RFC 6455 section 4.2).
//
// The server reads the client's opening request line by line from a
// `BufRead` until the blank line that ends the header block, locates the
// `Sec-WebSocket-Key` header, and answers with a `101 Switching Protocols`
// response carrying `Sec-WebSocket-Accept = base64(SHA1(key + GUID))`.
//
// The header block is bounded (`MAX_REQUEST_SIZE`) so a client that never
// sends the terminator cannot make the server buffer without limit. Bytes
// that arrive after the terminator stay inside the caller's `BufReader`
// and are picked up by the frame reader, so a client that pipelines its
// first frame right behind the request loses nothing.
//
// Only the key is validated. Other headers (`Upgrade`, `Connection`,
// `Sec-WebSocket-Version`, `Origin`) are recorded but not enforced.

use std::io::{self, BufRead, Read, Write};

use thiserror::Error;

use crate::base64;
use crate::sha1::sha1;

/// Fixed GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the size of the request header block, in bytes.
pub const MAX_REQUEST_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("i/o error during handshake: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed before the request header was complete")]
    UnexpectedEof,
    #[error("request header exceeds {MAX_REQUEST_SIZE} bytes")]
    TooLarge,
    #[error("request has no Sec-WebSocket-Key header")]
    MissingKey,
    #[error("malformed Sec-WebSocket-Key {0:?}")]
    InvalidKey(String),
}

/// The parts of an upgrade request the server cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub key: String,
}

impl UpgradeRequest {
    /// Case-insensitive header lookup. Returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read the opening request up to and including the blank line.
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<UpgradeRequest, HandshakeError> {
    let mut total = 0usize;
    let mut request_line: Option<String> = None;
    let mut headers = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        let remaining = MAX_REQUEST_SIZE.saturating_sub(total);
        if remaining == 0 {
            return Err(HandshakeError::TooLarge);
        }
        // `take` bounds a single line so one huge header cannot bypass the limit.
        let n = Read::take(&mut *reader, remaining as u64).read_until(b'\n', &mut line)?;
        if n == 0 {
            return Err(HandshakeError::UnexpectedEof);
        }
        total += n;
        if line.last() != Some(&b'\n') {
            if total >= MAX_REQUEST_SIZE {
                return Err(HandshakeError::TooLarge);
            }
            return Err(HandshakeError::UnexpectedEof);
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            if request_line.is_none() {
                // Tolerate stray blank lines before the request line.
                continue;
            }
            break;
        }

        if request_line.is_none() {
            request_line = Some(text.to_string());
        } else if let Some((name, value)) = text.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let key = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Sec-WebSocket-Key"))
        .map(|(_, v)| v.clone())
        .ok_or(HandshakeError::MissingKey)?;
    if !is_valid_key(&key) {
        return Err(HandshakeError::InvalidKey(key));
    }

    Ok(UpgradeRequest {
        request_line: request_line.unwrap_or_default(),
        headers,
        key,
    })
}

/// A client key is the base64 encoding of 16 random bytes: 24 characters,
/// the last two being `=` padding.
pub fn is_valid_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 24
        && bytes.ends_with(b"==")
        && bytes[..22]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut input = String::with_capacity(key.len() + WEBSOCKET_GUID.len());
    input.push_str(key);
    input.push_str(WEBSOCKET_GUID);
    base64::encode(&sha1(input.as_bytes()))
}

/// Full text of the `101 Switching Protocols` response for `key`.
pub fn response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}

pub fn write_response<W: Write>(writer: &mut W, key: &str) -> io::Result<()> {
    writer.write_all(response(key).as_bytes())?;
    writer.flush()
}

/// Build a client upgrade request. Used by test clients and tools that
/// need to speak to the server without a browser.
pub fn client_request(host: &str, key: &str) -> String {
    format!(
        "GET / HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor, Read};

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    #[test]
    fn rfc_example_accept_key() {
        assert_eq!(accept_key(RFC_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn parse_browser_request() {
        let raw = "GET /chat HTTP/1.1\r\n\
                   Host: 127.0.0.1:1234\r\n\
                   Upgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Origin: chrome-extension://abc\r\n\
                   Sec-WebSocket-Version: 13\r\n\r\n";
        let mut reader = Cursor::new(raw.as_bytes());
        let req = read_request(&mut reader).unwrap();
        assert_eq!(req.request_line, "GET /chat HTTP/1.1");
        assert_eq!(req.key, RFC_KEY);
        assert_eq!(req.header("origin"), Some("chrome-extension://abc"));
        assert_eq!(req.header("sec-websocket-version"), Some("13"));
    }

    #[test]
    fn header_name_is_case_insensitive() {
        let raw = format!("GET / HTTP/1.1\r\nsec-websocket-key: {RFC_KEY}\r\n\r\n");
        let req = read_request(&mut Cursor::new(raw.as_bytes())).unwrap();
        assert_eq!(req.key, RFC_KEY);
    }

    #[test]
    fn missing_key_is_rejected() {
        let raw = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let err = read_request(&mut Cursor::new(raw.as_bytes())).unwrap_err();
        assert!(matches!(err, HandshakeError::MissingKey));
    }

    #[test]
    fn malformed_key_is_rejected() {
        let raw = "GET / HTTP/1.1\r\nSec-WebSocket-Key: short\r\n\r\n";
        let err = read_request(&mut Cursor::new(raw.as_bytes())).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidKey(k) if k == "short"));
    }

    #[test]
    fn eof_before_terminator() {
        let raw = format!("GET / HTTP/1.1\r\nSec-WebSocket-Key: {RFC_KEY}\r\n");
        let err = read_request(&mut Cursor::new(raw.as_bytes())).unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedEof));
    }

    #[test]
    fn oversized_header_block() {
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        while raw.len() <= MAX_REQUEST_SIZE {
            raw.push_str("X-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        raw.push_str("\r\n");
        let err = read_request(&mut Cursor::new(raw.as_bytes())).unwrap_err();
        assert!(matches!(err, HandshakeError::TooLarge));
    }

    #[test]
    fn one_long_header_line_is_bounded() {
        let mut raw = String::from("GET / HTTP/1.1\r\nX-Long: ");
        raw.push_str(&"a".repeat(MAX_REQUEST_SIZE * 2));
        raw.push_str("\r\n\r\n");
        let mut reader = BufReader::new(Cursor::new(raw.into_bytes()));
        let err = read_request(&mut reader).unwrap_err();
        assert!(matches!(err, HandshakeError::TooLarge));
        assert!(!reader.fill_buf().unwrap().is_empty(), "rest of the line left unread");
    }

    #[test]
    fn bytes_after_terminator_stay_buffered() {
        let mut raw = client_request("localhost", RFC_KEY).into_bytes();
        raw.extend_from_slice(&[0x81, 0x00]);
        let mut reader = BufReader::new(Cursor::new(raw));
        read_request(&mut reader).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![0x81, 0x00]);
    }

    #[test]
    fn response_format() {
        let mut out = Vec::new();
        write_response(&mut out, RFC_KEY).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
    }
}
