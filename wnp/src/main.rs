// `wnp-debug`: run the library standalone and watch what browsers report.
//
// Starts `WebNowPlaying` with the web adapter, logs every listener callback
// through `tracing`, and prints the player table as JSON at a fixed
// interval. Useful for checking a browser extension against the protocol
// without a host application.
//
// Usage:
//   wnp-debug [OPTIONS]
//     --port <PORT>               Web adapter port (default: 1234)
//     --adapter-version <V>       Version sent in the greeting (default: 0.0.0)
//     --config <FILE>             JSON `WnpConfig`; flags override its fields
//     --interval <SECS>           Seconds between table dumps (default: 2)
//     --desktop-players <on|off>  Write the desktop-players marker and exit
//
// Log level comes from `RUST_LOG`, defaulting to `wnp=debug`.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use wnp::{Listener, Player, WebNowPlaying, WnpConfig, format_seconds};

#[derive(Parser)]
#[command(name = "wnp-debug")]
#[command(about = "Run the WebNowPlaying web adapter and print what it sees")]
struct Cli {
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(long)]
    adapter_version: Option<String>,
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, default_value_t = 2)]
    interval: u64,
    #[arg(long, value_enum)]
    desktop_players: Option<Toggle>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

/// Logs every callback at info level.
struct LogListener;

impl Listener for LogListener {
    fn on_player_added(&self, player: &Player) {
        info!(player = %describe(player), "added");
    }

    fn on_player_updated(&self, player: &Player) {
        info!(
            player = %describe(player),
            state = ?player.state,
            position = %format_seconds(player.position, false),
            duration = %format_seconds(player.duration, false),
            "updated"
        );
    }

    fn on_player_removed(&self, player: &Player) {
        info!(player = %describe(player), "removed");
    }

    fn on_active_player_changed(&self, player: Option<&Player>) {
        match player {
            Some(player) => info!(player = %describe(player), "active player changed"),
            None => info!("no active player"),
        }
    }
}

fn describe(player: &Player) -> String {
    let id = player.id.map_or_else(|| "-".to_string(), |id| id.to_string());
    format!("{id} [{}] {}: {} - {}", player.platform, player.name, player.artist, player.title)
}

fn load_config(cli: &Cli) -> Result<WnpConfig, wnp::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => WnpConfig::from_json_file(path)?,
        None => WnpConfig::default(),
    };
    if let Some(port) = cli.port {
        config.web_port = port;
    }
    if let Some(version) = &cli.adapter_version {
        config.adapter_version = version.clone();
    }
    Ok(config)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wnp=debug")),
        )
        .init();

    let cli = Cli::parse();

    if let Some(toggle) = cli.desktop_players {
        match wnp::set_desktop_players_enabled(matches!(toggle, Toggle::On)) {
            Ok(true) => println!("Desktop players enabled"),
            Ok(false) => println!("Desktop players disabled"),
            Err(e) => {
                eprintln!("Failed to update desktop players marker: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let wnp = match WebNowPlaying::start(&config, Some(Arc::new(LogListener))) {
        Ok(wnp) => wnp,
        Err(e) => {
            eprintln!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    if let Some(addr) = wnp.web_addr() {
        println!("Web adapter listening on {addr}");
    }
    println!("Press Ctrl+C to stop.");

    // Runs until killed; the process exit tears the server threads down.
    let interval = Duration::from_secs(cli.interval.max(1));
    loop {
        thread::sleep(interval);
        let players = wnp.players();
        match serde_json::to_string_pretty(&players) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Failed to serialize players: {e}"),
        }
        if let Some(active) = wnp.active_player() {
            println!("Active: {}", describe(&active));
        }
    }
}
