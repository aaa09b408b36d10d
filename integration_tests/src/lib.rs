// Test-only browser extension for end-to-end tests of the web adapter.
//
// `TestBrowser` speaks the same bytes a browser does: a real HTTP upgrade
// over TCP, masked client frames from `wnp_protocol`'s client encoders, and
// the pipe-delimited sub-protocol from `wnp::protocol`. Server frames are
// read back through the same `MessageReader` the server uses, so both sides
// of the codec are exercised.
//
// `Recorder` is a `Listener` that keeps every callback as a line of text,
// and `start_library` wires a `WebNowPlaying` on a random port to one.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use wnp::protocol::encode_fields;
use wnp::{EventId, EventKind, Listener, Player, WebNowPlaying, WnpConfig};
use wnp_protocol::{
    Event, FrameError, Message, MessageReader, Opcode, accept_key, client_request, close_payload,
    encode_client_frame,
};

/// Default timeout for blocking waits.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const MASK: [u8; 4] = [0x37, 0xFA, 0x21, 0x3D];

/// Poll `cond` until it holds or `POLL_TIMEOUT` passes.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + POLL_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
    cond()
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Records callbacks as "added NAME", "updated NAME", "removed NAME",
/// "active NAME" or "active none".
#[derive(Default)]
pub struct Recorder {
    lines: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, line: &str) -> bool {
        self.lines.lock().unwrap().iter().any(|l| l == line)
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }
}

impl Listener for Recorder {
    fn on_player_added(&self, player: &Player) {
        self.push(format!("added {}", player.name));
    }

    fn on_player_updated(&self, player: &Player) {
        self.push(format!("updated {}", player.name));
    }

    fn on_player_removed(&self, player: &Player) {
        self.push(format!("removed {}", player.name));
    }

    fn on_active_player_changed(&self, player: Option<&Player>) {
        let name = player.map_or("none", |p| p.name.as_str());
        self.push(format!("active {name}"));
    }
}

/// Start the library with only the web adapter, on a random port. Covers go
/// to `cover_dir` when given.
pub fn start_library(cover_dir: Option<&Path>) -> (WebNowPlaying, SocketAddr, Arc<Recorder>) {
    let config = WnpConfig {
        web_port: 0,
        adapter_version: "1.2.3".into(),
        cover_dir: cover_dir.map(Path::to_path_buf),
        use_desktop_players: Some(false),
        ..WnpConfig::default()
    };
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn Listener> = recorder.clone();
    let wnp = WebNowPlaying::start(&config, Some(listener)).expect("library failed to start");
    let addr = wnp.web_addr().expect("web adapter not listening");
    (wnp, addr, recorder)
}

// ---------------------------------------------------------------------------
// Browser
// ---------------------------------------------------------------------------

/// A control event as the browser receives it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRequest {
    pub port_id: i64,
    pub event_id: EventId,
    pub kind: EventKind,
    pub data: i64,
}

impl EventRequest {
    /// Parse "<port> <event> <kind> <data>".
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split(' ');
        let port_id = parts.next()?.parse().ok()?;
        let event_id = EventId(parts.next()?.parse().ok()?);
        let kind = EventKind::from_code(parts.next()?.parse().ok()?)?;
        let data = parts.next()?.parse().ok()?;
        Some(Self {
            port_id,
            event_id,
            kind,
            data,
        })
    }
}

pub struct TestBrowser {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    messages: MessageReader,
    /// The greeting received after the handshake.
    pub greeting: String,
}

impl TestBrowser {
    /// Connect, complete the handshake, and read the greeting.
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect failed");
        stream.set_read_timeout(Some(POLL_TIMEOUT)).unwrap();
        let mut writer = stream.try_clone().unwrap();
        writer
            .write_all(client_request(&addr.to_string(), KEY).as_bytes())
            .unwrap();

        let mut browser = Self {
            reader: BufReader::new(stream),
            writer,
            messages: MessageReader::new(),
            greeting: String::new(),
        };
        assert_eq!(browser.read_accept(), accept_key(KEY));
        browser.greeting = browser.recv_text();
        browser
    }

    fn read_accept(&mut self) -> String {
        let mut status = String::new();
        self.reader.read_line(&mut status).unwrap();
        assert_eq!(status, "HTTP/1.1 101 Switching Protocols\r\n");
        let mut accept = String::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                return accept;
            }
            if let Some(value) = line.strip_prefix("Sec-WebSocket-Accept: ") {
                accept = value.to_string();
            }
        }
    }

    fn send(&mut self, opcode: Opcode, payload: &[u8]) {
        self.writer
            .write_all(&encode_client_frame(opcode, true, payload, MASK))
            .unwrap();
    }

    pub fn send_text(&mut self, text: &str) {
        self.send(Opcode::Text, text.as_bytes());
    }

    /// PLAYER_ADDED with every field of `player`.
    pub fn add_player(&mut self, port_id: i64, player: &Player) {
        self.send_text(&format!("0 {port_id} {}", encode_fields(player, port_id)));
    }

    /// PLAYER_UPDATED with a raw field list.
    pub fn update_fields(&mut self, port_id: i64, fields: &str) {
        self.send_text(&format!("1 {port_id} {fields}"));
    }

    pub fn update_player(&mut self, port_id: i64, player: &Player) {
        self.update_fields(port_id, &encode_fields(player, port_id));
    }

    pub fn remove_player(&mut self, port_id: i64) {
        self.send_text(&format!("2 {port_id}"));
    }

    /// EVENT_RESULT: 1 succeeded, 2 failed.
    pub fn event_result(&mut self, event_id: EventId, result: i64) {
        self.send_text(&format!("3 {} {result}", event_id.0));
    }

    /// Binary cover message: little-endian port id, then the image.
    pub fn send_cover(&mut self, port_id: u32, image: &[u8]) {
        let mut payload = port_id.to_le_bytes().to_vec();
        payload.extend_from_slice(image);
        self.send(Opcode::Binary, &payload);
    }

    pub fn recv(&mut self) -> Result<Event, FrameError> {
        self.messages.read_event(&mut self.reader, || false)
    }

    /// Next text message, skipping pings.
    pub fn recv_text(&mut self) -> String {
        loop {
            match self.recv().expect("message from library") {
                Event::Message(Message::Text(text)) => return text,
                Event::Ping(payload) => self.send(Opcode::Pong, &payload),
                other => panic!("expected text, got {other:?}"),
            }
        }
    }

    pub fn recv_event_request(&mut self) -> EventRequest {
        let text = self.recv_text();
        EventRequest::parse(&text).unwrap_or_else(|| panic!("not an event request: {text:?}"))
    }

    /// Close handshake with code 1000, then hang up.
    pub fn close(mut self) {
        self.send(Opcode::Close, &close_payload(1000));
        match self.recv() {
            Ok(Event::Close(_)) | Err(FrameError::Io(_)) => {}
            Ok(other) => panic!("expected close, got {other:?}"),
            Err(e) => panic!("expected close, got {e}"),
        }
    }
}
