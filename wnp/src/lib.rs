// WebNowPlaying: one registry of "now playing" media from browser tabs and
// desktop players, with a control API to drive them.
//
// Crate layout:
// - `player`: the `Player` record, its enums, and display helpers.
// - `registry`: the fixed-capacity player table and `UpdateCycle`
//   transactions; the `Listener` callback trait.
// - `selector`: picks the active player after each cycle.
// - `events`: event ids, the result ring, and blocking waits.
// - `dispatch`: `Core` (registry + events + adapters), the `Adapter` trait,
//   and the dispatcher with optimistic updates.
// - `control`: `try_*` control actions on `Core`.
// - `protocol`: the browser sub-protocol codec.
// - `web`: the web adapter on top of `wnp_server`.
// - `cover`: cover image files and the early-cover pool.
// - `desktop`: the "desktop players disabled" marker file.
// - `config`: `WnpConfig`.
// - `error`: error enums.
//
// `WebNowPlaying` is the entry point. `start` validates the configuration,
// then initializes the web adapter and any native adapters in order; if one
// fails, those already started are shut down in reverse order and the error
// is returned. `stop` (or drop) uninitializes in reverse order and then
// removes every remaining player in a single update cycle, so listeners see
// a removal for each and the active player resets to none.
//
// The read and control API is on `Core`, reachable through `Deref`:
//
//   let wnp = WebNowPlaying::start(&WnpConfig::default(), None)?;
//   if let Some(player) = wnp.active_player() {
//       wnp.try_play_pause(player.id.unwrap());
//   }

pub mod config;
pub mod control;
pub mod cover;
pub mod desktop;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod player;
pub mod protocol;
pub mod registry;
pub mod selector;
pub mod web;

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use tracing::{info, warn};

pub use crate::config::WnpConfig;
pub use crate::desktop::{desktop_players_enabled, set_desktop_players_enabled};
pub use crate::dispatch::{Adapter, Core};
pub use crate::error::{ConfigError, InitError, ProtocolError, RegistryError};
pub use crate::events::{EventId, EventKind, EventResult, EventStore, MAX_EVENT_RESULTS};
pub use crate::player::{
    Capabilities, MAX_PLAYERS, PlaybackState, Platform, Player, PlayerId, RatingSystem, Repeat,
    RepeatModes, format_seconds,
};
pub use crate::registry::{Listener, Payload, Registry, UpdateCycle};
pub use crate::web::{WebAdapter, WebPayload};

/// A running library instance.
pub struct WebNowPlaying {
    core: Arc<Core>,
    started: Vec<Arc<dyn Adapter>>,
    web: Option<Arc<WebAdapter>>,
}

impl WebNowPlaying {
    /// Start with the web adapter only (if enabled).
    pub fn start(config: &WnpConfig, listener: Option<Arc<dyn Listener>>) -> Result<Self, InitError> {
        Self::start_with_adapters(config, listener, Vec::new())
    }

    /// Start with the web adapter plus `native` desktop adapters. The native
    /// adapters are skipped when desktop players are disabled.
    pub fn start_with_adapters(
        config: &WnpConfig,
        listener: Option<Arc<dyn Listener>>,
        native: Vec<Arc<dyn Adapter>>,
    ) -> Result<Self, InitError> {
        if !protocol::is_valid_adapter_version(&config.adapter_version) {
            return Err(InitError::InvalidAdapterVersion(config.adapter_version.clone()));
        }

        let core = Arc::new(Core::new(listener));
        let web = config.web_enabled.then(|| {
            Arc::new(WebAdapter::new(
                config.server_config(),
                config.adapter_version.clone(),
                config.cover_store(),
            ))
        });

        let mut adapters: Vec<Arc<dyn Adapter>> = Vec::new();
        if let Some(web) = &web {
            adapters.push(web.clone());
        }
        if config.desktop_players_enabled() {
            adapters.extend(native);
        } else if !native.is_empty() {
            info!(count = native.len(), "desktop players disabled; skipping native adapters");
        }

        let mut started = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            core.register_adapter(adapter.clone());
            if let Err(e) = adapter.init(&core) {
                warn!(platform = %adapter.platform(), error = %e, "adapter failed to start");
                core.unregister_adapter(&adapter);
                shutdown(&core, &mut started);
                return Err(e);
            }
            started.push(adapter);
        }

        info!(adapters = started.len(), version = %config.adapter_version, "started");
        Ok(Self { core, started, web })
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Where the web adapter listens, if it is running.
    pub fn web_addr(&self) -> Option<SocketAddr> {
        self.web.as_ref().and_then(|web| web.local_addr())
    }

    pub fn web_adapter(&self) -> Option<&Arc<WebAdapter>> {
        self.web.as_ref()
    }

    pub fn stop(mut self) {
        shutdown(&self.core, &mut self.started);
    }
}

/// Uninitialize `started` in reverse order, then clear the registry.
fn shutdown(core: &Core, started: &mut Vec<Arc<dyn Adapter>>) {
    if started.is_empty() && core.players().is_empty() {
        return;
    }
    while let Some(adapter) = started.pop() {
        adapter.uninit();
        core.unregister_adapter(&adapter);
    }
    let mut cycle = core.registry().begin();
    for id in cycle.players().into_iter().filter_map(|p| p.id) {
        cycle.remove(id);
    }
    cycle.end();
    info!("stopped");
}

impl Deref for WebNowPlaying {
    type Target = Core;

    fn deref(&self) -> &Core {
        &self.core
    }
}

impl Drop for WebNowPlaying {
    fn drop(&mut self) {
        shutdown(&self.core, &mut self.started);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log {
        lines: Mutex<Vec<String>>,
    }

    impl Listener for Log {
        fn on_player_added(&self, p: &Player) {
            self.lines.lock().unwrap().push(format!("added {}", p.name));
        }
        fn on_player_removed(&self, p: &Player) {
            self.lines.lock().unwrap().push(format!("removed {}", p.name));
        }
        fn on_active_player_changed(&self, p: Option<&Player>) {
            let name = p.map_or("none".to_string(), |p| p.name.clone());
            self.lines.lock().unwrap().push(format!("active {name}"));
        }
    }

    /// Native adapter that adds one player on init, or refuses to start.
    struct FakeDesktop {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Adapter for FakeDesktop {
        fn platform(&self) -> Platform {
            Platform::Linux
        }
        fn init(&self, core: &Arc<Core>) -> Result<(), InitError> {
            self.log.lock().unwrap().push(format!("init {}", self.name));
            if self.fail {
                return Err(InitError::AdapterFailed {
                    platform: "linux".into(),
                    reason: "no session bus".into(),
                });
            }
            let mut cycle = core.registry().begin();
            cycle
                .add(
                    Player {
                        name: self.name.into(),
                        state: PlaybackState::Playing,
                        ..Player::new(Platform::Linux)
                    },
                    Arc::new(()),
                )
                .unwrap();
            cycle.end();
            Ok(())
        }
        fn uninit(&self) {
            self.log.lock().unwrap().push(format!("uninit {}", self.name));
        }
        fn on_event(&self, _: &Player, _: &Payload, _: EventKind, _: EventId, _: i64) {}
    }

    fn offline_config() -> WnpConfig {
        WnpConfig {
            web_enabled: false,
            use_desktop_players: Some(true),
            ..WnpConfig::default()
        }
    }

    fn fake(name: &'static str, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Adapter> {
        Arc::new(FakeDesktop {
            name,
            fail,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn invalid_version_is_rejected_before_anything_starts() {
        let config = WnpConfig {
            adapter_version: "1.0".into(),
            ..offline_config()
        };
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = WebNowPlaying::start_with_adapters(&config, None, vec![fake("a", false, &log)])
            .err()
            .unwrap();
        assert!(matches!(err, InitError::InvalidAdapterVersion(v) if v == "1.0"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_adapter_unwinds_started_ones_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapters = vec![
            fake("a", false, &log),
            fake("b", false, &log),
            fake("c", true, &log),
        ];
        let err = WebNowPlaying::start_with_adapters(&offline_config(), None, adapters)
            .err()
            .unwrap();
        assert!(matches!(err, InitError::AdapterFailed { .. }));
        assert_eq!(
            *log.lock().unwrap(),
            ["init a", "init b", "init c", "uninit b", "uninit a"]
        );
    }

    #[test]
    fn stop_removes_every_player_and_clears_active() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(Log::default());
        let as_dyn: Arc<dyn Listener> = listener.clone();
        let wnp = WebNowPlaying::start_with_adapters(
            &offline_config(),
            Some(as_dyn),
            vec![fake("vlc", false, &log)],
        )
        .unwrap();
        assert_eq!(wnp.players().len(), 1);
        assert_eq!(wnp.active_player().unwrap().name, "vlc");
        assert_eq!(wnp.web_addr(), None);

        wnp.stop();
        assert_eq!(*log.lock().unwrap(), ["init vlc", "uninit vlc"]);
        assert_eq!(
            *listener.lines.lock().unwrap(),
            ["added vlc", "active vlc", "removed vlc", "active none"]
        );
    }

    #[test]
    fn disabled_desktop_players_skip_native_adapters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = WnpConfig {
            use_desktop_players: Some(false),
            ..offline_config()
        };
        let wnp =
            WebNowPlaying::start_with_adapters(&config, None, vec![fake("vlc", false, &log)]).unwrap();
        assert!(wnp.players().is_empty());
        drop(wnp);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn web_adapter_listens_on_requested_port() {
        let config = WnpConfig {
            web_port: 0,
            use_desktop_players: Some(false),
            ..WnpConfig::default()
        };
        let wnp = WebNowPlaying::start(&config, None).unwrap();
        let addr = wnp.web_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert!(wnp.web_adapter().is_some());
        wnp.stop();
    }
}
