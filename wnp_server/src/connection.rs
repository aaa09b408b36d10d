// Per-connection state and send API.
//
// A `Connection` is shared (`Arc`) between its worker thread, the server's
// connection table, and whoever the handler hands it to (the web adapter
// keeps a `Weak` in each player's payload). It owns the write half of the
// socket behind its own lock, so any thread may send while the worker is
// blocked reading. Frames written under that lock are never interleaved.
//
// State machine: Connecting -> Open (handshake done) -> Closing (close frame
// sent or received) -> Closed (socket shut down). `Closed` is terminal.
//
// Ping bookkeeping: `ping()` sends the next sequence number as a 4-byte
// big-endian payload. A pong is recorded only if it carries an id that has
// actually been sent (`0..=current_ping_id`).

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;
use wnp_protocol::frame::{self, Opcode};

/// Identity of one accepted connection, unique for the lifetime of the
/// server (slots are reused, ids are not).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    current_ping_id: Option<u32>,
    last_pong_id: Option<u32>,
}

pub struct Connection {
    id: ConnectionId,
    slot: usize,
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    status: Mutex<Status>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, slot: usize, peer: SocketAddr, writer: TcpStream) -> Self {
        Self {
            id,
            slot,
            peer,
            writer: Mutex::new(writer),
            status: Mutex::new(Status {
                state: ConnectionState::Connecting,
                current_ping_id: None,
                last_pong_id: None,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Index of the table slot this connection occupies.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.status).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        lock(&self.status).state = state;
    }

    /// Move Connecting -> Open. Returns false if `stop` closed the
    /// connection during the handshake.
    pub(crate) fn finish_handshake(&self) -> bool {
        let mut status = lock(&self.status);
        if status.state == ConnectionState::Connecting {
            status.state = ConnectionState::Open;
            true
        } else {
            false
        }
    }

    /// Move Open -> Closing. Returns false if the connection was not open,
    /// in which case no close frame should be sent.
    pub(crate) fn begin_closing(&self) -> bool {
        let mut status = lock(&self.status);
        if status.state == ConnectionState::Open {
            status.state = ConnectionState::Closing;
            true
        } else {
            false
        }
    }

    /// Write raw bytes (the handshake response) without framing.
    pub(crate) fn write_raw(&self, bytes: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let mut writer = lock(&self.writer);
        writer.write_all(bytes)?;
        writer.flush()
    }

    /// Send one final frame. Fails once the connection is closed, and for
    /// data frames once a close frame has been sent or received.
    pub fn send(&self, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        match self.state() {
            ConnectionState::Closed => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("{} is closed", self.id),
                ));
            }
            ConnectionState::Closing if !opcode.is_control() => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("{} is closing", self.id),
                ));
            }
            _ => {}
        }
        let mut writer = lock(&self.writer);
        frame::write_frame(&mut *writer, opcode, payload)
    }

    pub fn send_text(&self, text: &str) -> io::Result<()> {
        self.send(Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&self, data: &[u8]) -> io::Result<()> {
        self.send(Opcode::Binary, data)
    }

    /// Send a ping carrying the next sequence number and return it.
    pub fn ping(&self) -> io::Result<u32> {
        let id = {
            let mut status = lock(&self.status);
            let next = status.current_ping_id.map_or(0, |id| id.wrapping_add(1));
            status.current_ping_id = Some(next);
            next
        };
        self.send(Opcode::Ping, &frame::ping_payload(id))?;
        Ok(id)
    }

    /// Record a pong payload. Returns whether it was accepted.
    pub(crate) fn record_pong(&self, payload: &[u8]) -> bool {
        let Some(id) = frame::parse_ping_id(payload) else {
            return false;
        };
        let mut status = lock(&self.status);
        match status.current_ping_id {
            Some(current) if id <= current => {
                status.last_pong_id = Some(id);
                true
            }
            _ => false,
        }
    }

    /// Highest-numbered ping the peer has answered, if any.
    pub fn last_pong_id(&self) -> Option<u32> {
        lock(&self.status).last_pong_id
    }

    pub fn current_ping_id(&self) -> Option<u32> {
        lock(&self.status).current_ping_id
    }

    /// Start the closing handshake with `code`. The worker ends once the
    /// peer answers with its own close frame. No-op unless open.
    pub fn close(&self, code: u16) -> io::Result<()> {
        if !self.begin_closing() {
            return Ok(());
        }
        debug!(conn = %self.id, code, "closing connection");
        self.send(Opcode::Close, &frame::close_payload(code))
    }

    /// Tear the socket down immediately. The worker's blocked read fails
    /// and it runs its normal cleanup.
    pub(crate) fn force_close(&self) {
        self.set_state(ConnectionState::Closed);
        let _ = lock(&self.writer).shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
