// wnp_server: WebSocket connection manager for WebNowPlaying.
//
// Accepts TCP connections on loopback, upgrades them with the handshake
// from `wnp_protocol`, and runs one worker thread per connection that turns
// the byte stream into `Handler` callbacks. It knows nothing about players:
// the web adapter in the `wnp` crate implements `Handler` and speaks the
// sub-protocol on top.
//
// Module overview:
// - `connection.rs`: `Connection` (shared per-connection handle with the
//                    send API, state machine, ping/pong bookkeeping) and
//                    `ConnectionId`.
// - `server.rs`:     `ServerConfig`, `start_server`, the accept loop, the
//                    fixed-size connection table, worker threads, the
//                    `Handler` trait, and `ServerHandle::stop`.
//
// Dependencies: `wnp_protocol` (framing and handshake), `tracing` (logs
// connection lifecycle and protocol errors; no subscriber is installed).

pub mod connection;
pub mod server;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use server::{HANDSHAKE_TIMEOUT, Handler, ServerConfig, ServerHandle, start_server};
pub use wnp_protocol::{Message, Opcode, close_code};
