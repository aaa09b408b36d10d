// The web platform adapter: players reported by the browser extension over
// the WebSocket server.
//
// `WebAdapter::init` starts a `wnp_server` listener whose `WebHandler` turns
// sub-protocol messages (see `protocol.rs`) into registry update cycles:
//
// - open: send the greeting.
// - PLAYER_ADDED: add a default web player, claim any cover parked for its
//   port, apply the fields, all in one cycle so listeners see one "added"
//   callback with the complete record. If the connection already has a live
//   player on that port, the fields update it instead.
// - PLAYER_UPDATED / PLAYER_REMOVED: apply to every player of this
//   connection with that port id.
// - EVENT_RESULT: resolve the event id through the core.
// - binary: write the cover for the matching player, or park it until the
//   player is added.
// - close: remove the connection's players in one cycle and drop its parked
//   covers.
//
// Each web player's payload is a `WebPayload` holding a `Weak` to its
// connection. Control events are sent as text to that connection; if the
// connection is gone or the send fails, the event fails immediately.
//
// Shutdown (`uninit`) stops the server, which closes every connection and
// thereby removes every web player through the close path above.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};
use wnp_server::{Connection, ConnectionId, Handler, Message, ServerConfig, ServerHandle, start_server};

use crate::cover::{CoverBuffers, CoverStore};
use crate::dispatch::{Adapter, Core};
use crate::error::InitError;
use crate::events::{EventId, EventKind, EventResult, MAX_EVENT_RESULTS};
use crate::player::{Platform, Player, PlayerId};
use crate::protocol::{self, ClientMessage};
use crate::registry::{Payload, UpdateCycle};

/// Adapter payload of a web player.
#[derive(Debug)]
pub struct WebPayload {
    connection: Weak<Connection>,
    connection_id: ConnectionId,
    port_id: AtomicI64,
}

impl WebPayload {
    pub fn new(conn: &Arc<Connection>, port_id: i64) -> Self {
        Self {
            connection: Arc::downgrade(conn),
            connection_id: conn.id(),
            port_id: AtomicI64::new(port_id),
        }
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// The extension's id for this player, unique within its connection.
    pub fn port_id(&self) -> i64 {
        self.port_id.load(Ordering::Relaxed)
    }

    fn matches(&self, conn: ConnectionId, port_id: i64) -> bool {
        self.connection_id == conn && self.port_id() == port_id
    }
}

/// Web players in `cycle` belonging to `conn`, optionally narrowed to one
/// port id.
fn players_of(cycle: &UpdateCycle<'_>, conn: ConnectionId, port_id: Option<i64>) -> Vec<PlayerId> {
    cycle
        .payloads::<WebPayload>()
        .into_iter()
        .filter(|(_, payload)| match port_id {
            Some(port_id) => payload.matches(conn, port_id),
            None => payload.connection_id == conn,
        })
        .map(|(id, _)| id)
        .collect()
}

struct WebHandler {
    core: Weak<Core>,
    adapter_version: String,
    covers: CoverStore,
    buffers: CoverBuffers,
}

impl WebHandler {
    fn handle_text(&self, core: &Core, conn: &Arc<Connection>, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(conn = %conn.id(), error = %e, "ignoring message");
                return;
            }
        };

        match message {
            ClientMessage::PlayerAdded { port_id, fields } => {
                self.player_added(core, conn, port_id, fields);
            }
            ClientMessage::PlayerUpdated { port_id, fields } => {
                let mut cycle = core.registry().begin();
                for id in players_of(&cycle, conn.id(), Some(port_id)) {
                    let (Some(mut player), Some(payload)) =
                        (cycle.player(id), cycle.payload::<WebPayload>(id))
                    else {
                        continue;
                    };
                    if let Some(new_port) = protocol::apply_fields(&mut player, fields) {
                        payload.port_id.store(new_port, Ordering::Relaxed);
                    }
                    cycle.update(player);
                }
                cycle.end();
            }
            ClientMessage::PlayerRemoved { port_id } => {
                let mut cycle = core.registry().begin();
                for id in players_of(&cycle, conn.id(), Some(port_id)) {
                    cycle.remove(id);
                }
                cycle.end();
            }
            ClientMessage::EventResult { event_id, result } => {
                let Some(event_id) = usize::try_from(event_id)
                    .ok()
                    .filter(|&id| id < MAX_EVENT_RESULTS)
                else {
                    debug!(conn = %conn.id(), event_id, "event result for id outside the ring");
                    return;
                };
                match EventResult::from_code(result) {
                    Some(result @ (EventResult::Succeeded | EventResult::Failed)) => {
                        core.resolve_event(EventId(event_id), result);
                    }
                    _ => debug!(conn = %conn.id(), event_id, result, "ignoring event result"),
                }
            }
        }
    }

    fn player_added(&self, core: &Core, conn: &Arc<Connection>, port_id: i64, fields: &str) {
        let mut cycle = core.registry().begin();

        // A repeated add for a live (connection, port) refreshes that record.
        let existing = players_of(&cycle, conn.id(), Some(port_id)).first().copied();
        let (id, payload) = match existing.and_then(|id| Some((id, cycle.payload::<WebPayload>(id)?))) {
            Some(found) => {
                debug!(conn = %conn.id(), port_id, "player added twice, updating");
                found
            }
            None => {
                let payload = Arc::new(WebPayload::new(conn, port_id));
                match cycle.add(Player::new(Platform::Web), payload.clone()) {
                    Ok(id) => (id, payload),
                    Err(e) => {
                        warn!(conn = %conn.id(), port_id, error = %e, "dropping web player");
                        return;
                    }
                }
            }
        };
        let Some(mut player) = cycle.player(id) else {
            return;
        };

        if let Some(image) = self.buffers.take(conn.id(), port_id) {
            match self.covers.write(id, &image) {
                Ok(uri) => player.cover = uri,
                Err(e) => warn!(player = %id, error = %e, "could not write cover"),
            }
        }
        if let Some(new_port) = protocol::apply_fields(&mut player, fields) {
            payload.port_id.store(new_port, Ordering::Relaxed);
        }
        cycle.update(player);
        cycle.end();
    }

    fn handle_cover(&self, core: &Core, conn: &Arc<Connection>, data: &[u8]) {
        let (port, image) = match protocol::split_cover(data) {
            Ok(split) => split,
            Err(e) => {
                debug!(conn = %conn.id(), error = %e, "ignoring binary message");
                return;
            }
        };
        let port_id = i64::from(port);

        let mut cycle = core.registry().begin();
        let Some(id) = players_of(&cycle, conn.id(), Some(port_id)).first().copied() else {
            cycle.end();
            if self.buffers.push(conn.id(), port_id, image.to_vec()) {
                debug!(conn = %conn.id(), port_id, bytes = image.len(), "cover parked");
            }
            return;
        };

        match self.covers.write(id, image) {
            Ok(uri) => {
                if let Some(mut player) = cycle.player(id) {
                    player.cover = uri;
                    cycle.update(player);
                }
            }
            Err(e) => warn!(player = %id, error = %e, "could not write cover"),
        }
        cycle.end();
    }
}

impl Handler for WebHandler {
    fn on_open(&self, conn: &Arc<Connection>) {
        info!(conn = %conn.id(), peer = %conn.peer_addr(), "browser connected");
        if let Err(e) = conn.send_text(&protocol::greeting(&self.adapter_version)) {
            debug!(conn = %conn.id(), error = %e, "greeting failed");
        }
    }

    fn on_message(&self, conn: &Arc<Connection>, message: Message) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        match message {
            Message::Text(text) => self.handle_text(&core, conn, &text),
            Message::Binary(data) => self.handle_cover(&core, conn, &data),
        }
    }

    fn on_close(&self, conn: &Arc<Connection>) {
        info!(conn = %conn.id(), "browser disconnected");
        if let Some(core) = self.core.upgrade() {
            let mut cycle = core.registry().begin();
            for id in players_of(&cycle, conn.id(), None) {
                cycle.remove(id);
            }
            cycle.end();
        }
        self.buffers.purge(conn.id());
    }
}

struct Running {
    server: ServerHandle,
    addr: SocketAddr,
}

pub struct WebAdapter {
    server_config: ServerConfig,
    adapter_version: String,
    covers: CoverStore,
    core: Mutex<Weak<Core>>,
    running: Mutex<Option<Running>>,
}

impl WebAdapter {
    pub fn new(server_config: ServerConfig, adapter_version: impl Into<String>, covers: CoverStore) -> Self {
        Self {
            server_config,
            adapter_version: adapter_version.into(),
            covers,
            core: Mutex::new(Weak::new()),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address the server is listening on, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|r| r.addr)
    }

    /// Browser connections currently open.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.running()
            .as_ref()
            .map(|r| r.server.connections())
            .unwrap_or_default()
    }

    fn fail(&self, event_id: EventId) {
        let core = self.core.lock().unwrap_or_else(PoisonError::into_inner).upgrade();
        if let Some(core) = core {
            core.resolve_event(event_id, EventResult::Failed);
        }
    }
}

impl Adapter for WebAdapter {
    fn platform(&self) -> Platform {
        Platform::Web
    }

    fn init(&self, core: &Arc<Core>) -> Result<(), InitError> {
        let mut running = self.running();
        if running.is_some() {
            return Ok(());
        }
        *self.core.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(core);

        let handler = Arc::new(WebHandler {
            core: Arc::downgrade(core),
            adapter_version: self.adapter_version.clone(),
            covers: self.covers.clone(),
            buffers: CoverBuffers::default(),
        });
        let (server, addr) = start_server(self.server_config.clone(), handler).map_err(|e| {
            if e.kind() == io::ErrorKind::AddrInUse {
                InitError::WebPortInUse(self.server_config.port)
            } else {
                InitError::WebServer(e)
            }
        })?;
        info!(%addr, version = %self.adapter_version, "web adapter started");
        *running = Some(Running { server, addr });
        Ok(())
    }

    fn uninit(&self) {
        // Take the handle first: stopping runs `on_close` for every
        // connection, which must not find this lock held.
        let running = self.running().take();
        if let Some(running) = running {
            running.server.stop();
            info!(addr = %running.addr, "web adapter stopped");
        }
    }

    fn on_event(&self, player: &Player, payload: &Payload, kind: EventKind, event_id: EventId, data: i64) {
        let Some(web) = payload.downcast_ref::<WebPayload>() else {
            warn!(player = ?player.id, "web event for a player without a web payload");
            self.fail(event_id);
            return;
        };
        let Some(conn) = web.connection() else {
            debug!(player = ?player.id, event = %event_id, "connection gone");
            self.fail(event_id);
            return;
        };
        let text = protocol::format_event(web.port_id(), event_id, kind, data);
        if let Err(e) = conn.send_text(&text) {
            debug!(conn = %conn.id(), event = %event_id, error = %e, "event send failed");
            self.fail(event_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn adapter(port: u16) -> Arc<WebAdapter> {
        let config = ServerConfig {
            port,
            ..ServerConfig::default()
        };
        Arc::new(WebAdapter::new(config, "1.0.0", CoverStore::default()))
    }

    #[test]
    fn init_binds_and_uninit_releases() {
        let core = Arc::new(Core::new(None));
        let web = adapter(0);
        assert_eq!(web.local_addr(), None);
        web.init(&core).unwrap();
        let addr = web.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert!(web.connections().is_empty());

        web.uninit();
        assert_eq!(web.local_addr(), None);
        web.uninit();
    }

    #[test]
    fn busy_port_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let core = Arc::new(Core::new(None));
        let err = adapter(port).init(&core).unwrap_err();
        assert!(matches!(err, InitError::WebPortInUse(p) if p == port), "{err:?}");
    }

    #[test]
    fn event_without_web_payload_fails() {
        let core = Arc::new(Core::new(None));
        let web = adapter(0);
        web.init(&core).unwrap();
        let id = core.events().issue();
        let payload: Payload = Arc::new(());
        web.on_event(&Player::default(), &payload, EventKind::SkipNext, id, 0);
        assert_eq!(core.event_result(id), EventResult::Failed);
        web.uninit();
    }
}
