// Listener, accept loop, connection table, and per-connection workers.
//
// Architecture: thread-per-connection.
//
// - **Accept thread**: polls a non-blocking `TcpListener`, sleeping briefly
//   when no connection is pending so it can observe `keep_running`. Each
//   accepted socket claims a free slot in the fixed-size connection table;
//   when the table is full the socket is dropped on the spot (no queuing).
// - **Worker threads** (one per connection): run the upgrade handshake with
//   a read timeout, then loop `MessageReader::read_event` and dispatch to
//   the `Handler`. Pings are answered inline, pongs recorded, and a close
//   frame from the peer is echoed per the close-code rules before the
//   worker exits.
//
// Every worker ends the same way regardless of why it stopped: the
// connection is marked `Closed`, the socket is shut down, the slot is
// released, and `Handler::on_close` runs exactly once. A connection that
// fails the handshake never reaches `on_open` and gets no callbacks.
//
// Shutdown: `ServerHandle::stop` force-closes every connection (their
// blocked reads fail immediately), clears `keep_running`, and joins the
// accept thread, which in turn joins the workers it spawned. `stop` must
// not be called from inside a handler callback.

use std::io::{self, BufReader};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use wnp_protocol::frame::{self, Event, Message, MessageReader, Opcode};
use wnp_protocol::handshake;

use crate::connection::{Connection, ConnectionId, ConnectionState, lock};

/// How long a new connection may take to send its upgrade request.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept-loop sleep when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Callbacks invoked by worker threads. All methods may be called
/// concurrently from different connections' workers.
pub trait Handler: Send + Sync + 'static {
    /// Handshake completed; the connection is open.
    fn on_open(&self, _conn: &Arc<Connection>) {}

    /// A complete text or binary message arrived.
    fn on_message(&self, _conn: &Arc<Connection>, _message: Message) {}

    /// The connection is gone. Called exactly once per opened connection.
    fn on_close(&self, _conn: &Arc<Connection>) {}
}

/// Configuration for starting a server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    /// 0 lets the OS pick a free port.
    pub port: u16,
    /// Capacity of the connection table.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 1234,
            max_connections: 64,
        }
    }
}

/// Fixed-size table of live connections.
struct ConnectionTable {
    slots: Mutex<Vec<Option<Arc<Connection>>>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
            next_id: AtomicU64::new(1),
        }
    }

    /// Claim the first free slot for a new connection, or `None` if full.
    fn claim(&self, peer: SocketAddr, writer: TcpStream) -> Option<Arc<Connection>> {
        let mut slots = lock(&self.slots);
        let slot = slots.iter().position(Option::is_none)?;
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(id, slot, peer, writer));
        slots[slot] = Some(Arc::clone(&conn));
        Some(conn)
    }

    fn release(&self, conn: &Connection) {
        let mut slots = lock(&self.slots);
        if let Some(entry) = slots.get_mut(conn.slot()) {
            if entry.as_ref().is_some_and(|c| c.id() == conn.id()) {
                *entry = None;
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        lock(&self.slots).iter().flatten().cloned().collect()
    }
}

/// Handle returned by `start_server` to inspect and stop the running server.
pub struct ServerHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    table: Arc<ConnectionTable>,
    addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections currently holding a slot (any state but released).
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.table.snapshot()
    }

    /// Force-close every connection, stop accepting, and wait for the
    /// accept thread and all workers to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for conn in self.table.snapshot() {
            conn.force_close();
        }
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        info!(addr = %self.addr, "server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

/// Bind the listener and start the accept thread. Returns a handle and the
/// actual bound address (useful with port 0).
pub fn start_server(
    config: ServerConfig,
    handler: Arc<dyn Handler>,
) -> io::Result<(ServerHandle, SocketAddr)> {
    let listener = TcpListener::bind(SocketAddr::new(config.bind_addr, config.port))?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let table = Arc::new(ConnectionTable::new(config.max_connections));

    let thread = {
        let keep_running = Arc::clone(&keep_running);
        let table = Arc::clone(&table);
        thread::Builder::new()
            .name("wnp-accept".into())
            .spawn(move || accept_loop(listener, table, handler, keep_running))?
    };

    info!(%addr, max_connections = config.max_connections, "server listening");

    Ok((
        ServerHandle {
            keep_running,
            thread: Some(thread),
            table,
            addr,
        },
        addr,
    ))
}

fn accept_loop(
    listener: TcpListener,
    table: Arc<ConnectionTable>,
    handler: Arc<dyn Handler>,
    keep_running: Arc<AtomicBool>,
) {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                workers.retain(|w| !w.is_finished());
                if let Some(worker) = accept_one(&table, &handler, stream, peer) {
                    workers.push(worker);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "accept failed; listener shutting down");
                break;
            }
        }
    }

    // Connections accepted after `stop` took its snapshot are closed here.
    for conn in table.snapshot() {
        conn.force_close();
    }
    for worker in workers {
        let _ = worker.join();
    }
}

fn accept_one(
    table: &Arc<ConnectionTable>,
    handler: &Arc<dyn Handler>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Option<JoinHandle<()>> {
    if let Err(e) = stream.set_nonblocking(false) {
        warn!(%peer, error = %e, "could not make socket blocking");
        return None;
    }
    let _ = stream.set_nodelay(true);

    let writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            warn!(%peer, error = %e, "could not clone socket");
            return None;
        }
    };

    let Some(conn) = table.claim(peer, writer) else {
        warn!(%peer, "connection table full; rejecting");
        return None;
    };
    debug!(conn = %conn.id(), %peer, slot = conn.slot(), "connection accepted");

    let table = Arc::clone(table);
    let handler = Arc::clone(handler);
    let worker_conn = Arc::clone(&conn);
    let spawned = thread::Builder::new()
        .name(format!("wnp-{}", conn.id()))
        .spawn(move || run_connection(worker_conn, stream, handler, table));

    match spawned {
        Ok(worker) => Some(worker),
        Err(e) => {
            warn!(conn = %conn.id(), error = %e, "could not spawn worker");
            conn.force_close();
            None
        }
    }
}

/// Worker body: handshake, message loop, cleanup.
fn run_connection(
    conn: Arc<Connection>,
    stream: TcpStream,
    handler: Arc<dyn Handler>,
    table: Arc<ConnectionTable>,
) {
    let mut reader = BufReader::new(stream);

    if let Err(e) = open(&conn, &mut reader) {
        debug!(conn = %conn.id(), error = %e, "handshake failed");
        finish(&conn, &table);
        return;
    }

    handler.on_open(&conn);
    message_loop(&conn, &mut reader, handler.as_ref());

    finish(&conn, &table);
    debug!(conn = %conn.id(), "connection closed");
    handler.on_close(&conn);
}

fn open(conn: &Connection, reader: &mut BufReader<TcpStream>) -> Result<(), handshake::HandshakeError> {
    reader.get_ref().set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let request = handshake::read_request(reader)?;
    conn.write_raw(handshake::response(&request.key).as_bytes())?;
    reader.get_ref().set_read_timeout(None)?;

    // `stop` may have force-closed the socket mid-handshake.
    if !conn.finish_handshake() {
        return Err(io::Error::new(io::ErrorKind::NotConnected, "closed during handshake").into());
    }
    Ok(())
}

fn message_loop(conn: &Arc<Connection>, reader: &mut BufReader<TcpStream>, handler: &dyn Handler) {
    let mut messages = MessageReader::new();

    loop {
        let event = messages.read_event(reader, || conn.state() == ConnectionState::Closing);
        match event {
            Ok(Event::Message(message)) => handler.on_message(conn, message),
            Ok(Event::Ping(payload)) => {
                if let Err(e) = conn.send(Opcode::Pong, &payload) {
                    debug!(conn = %conn.id(), error = %e, "pong failed");
                    return;
                }
            }
            Ok(Event::Pong(payload)) => {
                if !conn.record_pong(&payload) {
                    debug!(conn = %conn.id(), "ignoring unsolicited pong");
                }
            }
            Ok(Event::Close(payload)) => {
                if conn.begin_closing() {
                    let reply = frame::close_reply(&payload);
                    debug!(
                        conn = %conn.id(),
                        code = frame::parse_close_code(&reply),
                        "peer closed; echoing close"
                    );
                    let _ = conn.send(Opcode::Close, &reply);
                }
                return;
            }
            Err(e) => {
                match e.close_code() {
                    Some(code) => {
                        warn!(conn = %conn.id(), error = %e, code, "protocol error");
                        if conn.begin_closing() {
                            let _ = conn.send(Opcode::Close, &frame::close_payload(code));
                        }
                    }
                    None => debug!(conn = %conn.id(), error = %e, "connection read ended"),
                }
                return;
            }
        }
    }
}

fn finish(conn: &Connection, table: &ConnectionTable) {
    conn.force_close();
    table.release(conn);
}
