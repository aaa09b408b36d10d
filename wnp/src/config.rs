// Startup configuration for `WebNowPlaying`.
//
// Every field has a default, so `WnpConfig::default()` is a working setup
// and a JSON file only needs the keys it changes:
//
//   { "web_port": 0, "adapter_version": "1.2.0" }
//
// `use_desktop_players` overrides the marker file in the home directory
// when set; `cover_dir` overrides the platform temp directory.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wnp_server::ServerConfig;

use crate::cover::CoverStore;
use crate::desktop;
use crate::error::ConfigError;
use crate::player::MAX_PLAYERS;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WnpConfig {
    /// Port the browser extension connects to. 0 lets the OS choose.
    pub web_port: u16,
    /// Run the web adapter at all.
    pub web_enabled: bool,
    /// Version of the embedding application, `MAJOR.MINOR.PATCH`. Sent to
    /// browsers in the greeting.
    pub adapter_version: String,
    /// Simultaneous browser connections.
    pub max_connections: usize,
    pub cover_dir: Option<PathBuf>,
    pub use_desktop_players: Option<bool>,
}

impl Default for WnpConfig {
    fn default() -> Self {
        Self {
            web_port: 1234,
            web_enabled: true,
            adapter_version: "0.0.0".into(),
            max_connections: MAX_PLAYERS,
            cover_dir: None,
            use_desktop_players: None,
        }
    }
}

impl WnpConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: self.web_port,
            max_connections: self.max_connections,
        }
    }

    pub fn cover_store(&self) -> CoverStore {
        match &self.cover_dir {
            Some(dir) => CoverStore::new(dir),
            None => CoverStore::default(),
        }
    }

    /// The explicit override, else the marker file.
    pub fn desktop_players_enabled(&self) -> bool {
        self.use_desktop_players
            .unwrap_or_else(desktop::desktop_players_enabled)
    }
}
