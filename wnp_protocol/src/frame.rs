// RFC 6455 frame codec.
//
// Encoding is stateless: `encode_frame` / `write_frame` produce a single
// final, unmasked frame (the only kind a server ever sends), and
// `encode_client_frame` produces masked frames with an explicit FIN bit for
// test clients.
//
// Decoding is stateful. `MessageReader` assembles one logical message from
// any number of wire frames and surfaces control frames (ping/pong/close)
// as they arrive, even in the middle of a fragmented message. The rules
// enforced, in the order they are checked for each frame:
//
// 1. Reserved bits (RSV1-3) must be clear; no extensions are negotiated.
// 2. A continuation frame needs an active message, and a new text/binary
//    frame is not allowed while one is active.
// 3. The opcode must be one of the six defined ones.
// 4. Once the connection is closing, only close frames are accepted.
// 5. Control frames must be final and carry at most 125 bytes.
// 6. The aggregate payload of one message is capped at `MAX_MESSAGE_SIZE`.
//    The cap is checked from the header, before any payload is buffered.
// 7. Text payloads are fed to a streaming UTF-8 validator per fragment; the
//    validator's state carries across fragments and must end in the accept
//    state on the final one.
//
// Any violation is returned as a `FrameError`. The connection owner decides
// what to send before tearing down (see `FrameError::close_code`).
//
// Masking: client frames are expected to be masked, but an unmasked frame
// is accepted and read as-is.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::utf8::{Utf8Validator, is_valid_utf8};

/// Maximum aggregate payload of one message (16 MiB).
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Maximum payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status codes used by the server.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("reserved bits set in frame header")]
    ReservedBits,
    #[error("continuation frame without an active message")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is active")]
    InterleavedMessage,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("non-close frame received while closing")]
    FrameWhileClosing,
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes exceeds {MAX_CONTROL_PAYLOAD}")]
    ControlTooLarge(u64),
    #[error("message of {0} bytes exceeds {MAX_MESSAGE_SIZE}")]
    MessageTooLarge(u64),
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
}

impl FrameError {
    /// The close code to send the peer before tearing the connection down,
    /// or `None` when the transport itself failed and nothing can be sent.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Io(_) => None,
            Self::InvalidUtf8 => Some(close_code::INVALID_PAYLOAD),
            Self::MessageTooLarge(_) => Some(close_code::MESSAGE_TOO_BIG),
            _ => Some(close_code::PROTOCOL_ERROR),
        }
    }
}

/// A complete application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

/// One thing the reader can hand back to the connection owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Message(Message),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn push_header(out: &mut Vec<u8>, first: u8, mask_bit: u8, len: usize) {
    out.push(first);
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Encode a final, unmasked frame.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    push_header(&mut out, 0x80 | opcode as u8, 0, payload.len());
    out.extend_from_slice(payload);
    out
}

/// Encode and write a final, unmasked frame in a single `write_all`.
pub fn write_frame<W: Write>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&encode_frame(opcode, payload))?;
    writer.flush()
}

/// Encode a masked frame as a client would send it.
pub fn encode_client_frame(opcode: Opcode, fin: bool, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    let first = (if fin { 0x80 } else { 0 }) | opcode as u8;
    push_header(&mut out, first, 0x80, payload.len());
    out.extend_from_slice(&mask);
    let start = out.len();
    out.extend_from_slice(payload);
    apply_mask(&mut out[start..], mask);
    out
}

/// XOR `data` with the repeating 4-byte `mask`. Applying it twice restores
/// the original bytes.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

// ---------------------------------------------------------------------------
// Close negotiation
// ---------------------------------------------------------------------------

/// Codes a peer may legitimately put on the wire.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Payload of a close frame carrying just a status code.
pub fn close_payload(code: u16) -> [u8; 2] {
    code.to_be_bytes()
}

/// Status code in a received close payload, if it has one.
pub fn parse_close_code(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Payload to echo back when the peer initiates the close handshake.
///
/// An empty payload is echoed empty. A recognized code with a valid UTF-8
/// reason is echoed unchanged. Anything else (a one-byte payload, an
/// unrecognized code, a reason that is not UTF-8) is answered with 1002.
pub fn close_reply(payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return Vec::new();
    }
    match parse_close_code(payload) {
        Some(code) if is_valid_close_code(code) && is_valid_utf8(&payload[2..]) => payload.to_vec(),
        _ => close_payload(close_code::PROTOCOL_ERROR).to_vec(),
    }
}

// ---------------------------------------------------------------------------
// Ping ids
// ---------------------------------------------------------------------------

/// Payload of a server ping: the sequence number, big-endian.
pub fn ping_payload(id: u32) -> [u8; 4] {
    id.to_be_bytes()
}

/// Sequence number carried by a pong, if it has the 4-byte shape.
pub fn parse_ping_id(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Per-connection message assembler.
#[derive(Debug, Default)]
pub struct MessageReader {
    /// Opcode of the message being assembled (`Text` or `Binary`).
    active: Option<Opcode>,
    buffer: Vec<u8>,
    utf8: Utf8Validator,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a fragmented message is partially assembled.
    pub fn in_message(&self) -> bool {
        self.active.is_some()
    }

    fn reset(&mut self) {
        self.active = None;
        self.buffer = Vec::new();
        self.utf8.reset();
    }

    /// Read frames until a complete message or a control frame is available.
    ///
    /// `closing` is consulted for every frame so that a close initiated by
    /// another thread takes effect at the next frame boundary.
    pub fn read_event<R: Read, F: Fn() -> bool>(
        &mut self,
        reader: &mut R,
        closing: F,
    ) -> Result<Event, FrameError> {
        let result = self.read_event_inner(reader, &closing);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn read_event_inner<R: Read>(
        &mut self,
        reader: &mut R,
        closing: &dyn Fn() -> bool,
    ) -> Result<Event, FrameError> {
        loop {
            let mut head = [0u8; 2];
            reader.read_exact(&mut head)?;

            let fin = head[0] & 0x80 != 0;
            if head[0] & 0x70 != 0 {
                return Err(FrameError::ReservedBits);
            }

            let raw_opcode = head[0] & 0x0F;
            let opcode = Opcode::from_u8(raw_opcode);
            let is_control = opcode.is_some_and(Opcode::is_control);

            match (opcode, self.active) {
                (Some(Opcode::Continuation), None) => {
                    return Err(FrameError::UnexpectedContinuation);
                }
                (Some(Opcode::Continuation), Some(_)) => {}
                _ if is_control => {}
                (_, Some(_)) => return Err(FrameError::InterleavedMessage),
                _ => {}
            }

            let Some(opcode) = opcode else {
                return Err(FrameError::UnknownOpcode(raw_opcode));
            };

            if opcode != Opcode::Close && closing() {
                return Err(FrameError::FrameWhileClosing);
            }

            let masked = head[1] & 0x80 != 0;
            let len = match head[1] & 0x7F {
                126 => {
                    let mut ext = [0u8; 2];
                    reader.read_exact(&mut ext)?;
                    u64::from(u16::from_be_bytes(ext))
                }
                127 => {
                    let mut ext = [0u8; 8];
                    reader.read_exact(&mut ext)?;
                    u64::from_be_bytes(ext)
                }
                short => u64::from(short),
            };

            if is_control {
                if !fin {
                    return Err(FrameError::FragmentedControl);
                }
                if len > MAX_CONTROL_PAYLOAD as u64 {
                    return Err(FrameError::ControlTooLarge(len));
                }
            } else {
                let total = (self.buffer.len() as u64).saturating_add(len);
                if total > MAX_MESSAGE_SIZE {
                    return Err(FrameError::MessageTooLarge(total));
                }
            }

            let mask = if masked {
                let mut m = [0u8; 4];
                reader.read_exact(&mut m)?;
                Some(m)
            } else {
                None
            };

            // Bounded by MAX_MESSAGE_SIZE above, so this fits in usize.
            let len = len as usize;

            if is_control {
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload)?;
                if let Some(m) = mask {
                    apply_mask(&mut payload, m);
                }
                return Ok(match opcode {
                    Opcode::Ping => Event::Ping(payload),
                    Opcode::Pong => Event::Pong(payload),
                    _ => Event::Close(payload),
                });
            }

            if opcode != Opcode::Continuation {
                self.active = Some(opcode);
                self.utf8.reset();
            }

            let start = self.buffer.len();
            self.buffer.resize(start + len, 0);
            reader.read_exact(&mut self.buffer[start..])?;
            if let Some(m) = mask {
                apply_mask(&mut self.buffer[start..], m);
            }

            let is_text = self.active == Some(Opcode::Text);
            if is_text && !self.utf8.feed(&self.buffer[start..]) {
                return Err(FrameError::InvalidUtf8);
            }

            if !fin {
                continue;
            }

            if is_text && !self.utf8.is_complete() {
                return Err(FrameError::InvalidUtf8);
            }

            let data = std::mem::take(&mut self.buffer);
            self.reset();
            let message = if is_text {
                Message::Text(String::from_utf8(data).map_err(|_| FrameError::InvalidUtf8)?)
            } else {
                Message::Binary(data)
            };
            return Ok(Event::Message(message));
        }
    }
}
