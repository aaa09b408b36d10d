// Error types for the `wnp` crate.
//
// Transport and frame errors live in `wnp_protocol` and never reach this
// layer as values: they end the connection inside the server worker. What
// surfaces here is what a caller or an adapter can act on:
//
// - `RegistryError`: the player table is full.
// - `ProtocolError`: a text message from a browser that could not be parsed.
// - `ConfigError`: reading or parsing a `WnpConfig` file.
// - `InitError`: `WebNowPlaying::start` failed; any adapter already started
//   has been shut down again before this is returned.
//
// Unknown player ids and disallowed actions are not errors in this sense;
// they show up as `None`/`false` or as an immediately-failed event id.

use std::io;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("player table is full ({capacity} players)")]
    Full { capacity: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownType(i64),
    #[error("message type {kind} is missing its {field}")]
    MissingField { kind: &'static str, field: &'static str },
    #[error("binary message of {0} bytes is too short to carry a port id")]
    ShortBinary(usize),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] io::Error),
    #[error("parsing config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("adapter version {0:?} is not of the form MAJOR.MINOR.PATCH")]
    InvalidAdapterVersion(String),
    #[error("web adapter port {0} is already in use")]
    WebPortInUse(u16),
    #[error("web adapter could not start: {0}")]
    WebServer(io::Error),
    #[error("{platform} adapter failed to start: {reason}")]
    AdapterFailed { platform: String, reason: String },
}
