// wnp_protocol: WebSocket wire protocol for the WebNowPlaying transport.
//
// This crate implements the server side of RFC 6455 as pure codecs over
// `std::io::Read`/`Write`: it never opens sockets or spawns threads, and it
// knows nothing about players. The connection manager (`wnp_server`) drives
// it per connection; the test browser client in `integration_tests` uses the
// client-side encoders.
//
// Module overview:
// - `sha1.rs`:      FIPS 180 SHA-1, used only for the accept key.
// - `base64.rs`:    Standard-alphabet base64 encoder.
// - `utf8.rs`:      Streaming UTF-8 validator (byte-class DFA) whose state
//                   survives across message fragments.
// - `handshake.rs`: Reads the HTTP upgrade request, computes
//                   `Sec-WebSocket-Accept`, writes the 101 response.
// - `frame.rs`:     Frame encoding, close-code negotiation, ping ids, and
//                   `MessageReader`, the per-connection frame state machine.
//
// Design decisions:
// - **No crypto or codec crates.** SHA-1 and base64 are small, and the
//   handshake needs one digest per connection.
// - **No async runtime.** Blocking `Read`/`Write`, matching the one thread
//   per connection model of the server.

pub mod base64;
pub mod frame;
pub mod handshake;
pub mod sha1;
pub mod utf8;

pub use frame::{
    Event, FrameError, MAX_CONTROL_PAYLOAD, MAX_MESSAGE_SIZE, Message, MessageReader, Opcode,
    apply_mask, close_code, close_payload, close_reply, encode_client_frame, encode_frame,
    is_valid_close_code, parse_close_code, parse_ping_id, ping_payload, write_frame,
};
pub use handshake::{
    HandshakeError, UpgradeRequest, WEBSOCKET_GUID, accept_key, client_request, read_request,
    write_response,
};
pub use utf8::{Utf8Validator, is_valid_utf8};

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use super::*;

    /// A full client session as bytes: upgrade request followed directly by
    /// frames, read back through one `BufReader` the way the server does.
    #[test]
    fn handshake_then_frames_share_one_reader() {
        let key = "x3JJHMbDL1EzLkh9GBhXDw==";
        let mut wire = client_request("127.0.0.1", key).into_bytes();
        wire.extend(encode_client_frame(
            Opcode::Text,
            true,
            b"ADAPTER_VERSION",
            [1, 2, 3, 4],
        ));
        wire.extend(encode_client_frame(
            Opcode::Close,
            true,
            &close_payload(close_code::NORMAL),
            [5, 6, 7, 8],
        ));

        let mut reader = BufReader::new(Cursor::new(wire));
        let request = read_request(&mut reader).unwrap();
        assert_eq!(accept_key(&request.key), "HSmrc0sMlYUkAGmm5OPpG2HaGWk=");

        let mut messages = MessageReader::new();
        let first = messages.read_event(&mut reader, || false).unwrap();
        assert_eq!(first, Event::Message(Message::Text("ADAPTER_VERSION".into())));
        let second = messages.read_event(&mut reader, || false).unwrap();
        assert_eq!(second, Event::Close(vec![0x03, 0xE8]));
        assert_eq!(close_reply(&[0x03, 0xE8]), vec![0x03, 0xE8]);
    }
}
