//! Headless client binary.
//!
//! Usage:
//!   cargo run -p peersync_client --bin client -- [--url ws://127.0.0.1:40080]
//!       [--config sync.json] [--script walk.json] [--tick-hz 60] [--presence-only]
//!
//! Joins the server as a bot. Input comes from `--script`, or a built-in
//! patrol when none is given.
//!
//! Console commands:
//!   status - Show connection and replication state
//!   peers  - List tracked peers
//!   quit   - Leave the session

use std::env;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use peersync_client::{input::InputScript, HeadlessScene, SessionEnd, SyncClient};
use peersync_shared::config::{SpawnPolicy, SyncConfig};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    url: Option<String>,
    script: Option<PathBuf>,
    tick_hz: Option<u32>,
    presence_only: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--url" if i + 1 < args.len() => {
                parsed.url = Some(args[i + 1].clone());
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                parsed.config = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--script" if i + 1 < args.len() => {
                parsed.script = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                let hz = args[i + 1].parse().context("parse --tick-hz")?;
                parsed.tick_hz = Some(hz);
                i += 2;
            }
            "--presence-only" => {
                parsed.presence_only = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(parsed)
}

fn load_config(args: &Args) -> anyhow::Result<SyncConfig> {
    let mut cfg = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(url) = &args.url {
        cfg.server_url = url.clone();
    }
    if let Some(hz) = args.tick_hz {
        cfg.tick_hz = hz;
    }
    if args.presence_only {
        cfg.spawn_policy = SpawnPolicy::PresenceOnly;
    }
    Ok(cfg)
}

fn load_script(path: Option<&Path>, jump_velocity: f32) -> anyhow::Result<InputScript> {
    match path {
        Some(path) => InputScript::from_path(path, jump_velocity),
        None => Ok(InputScript::patrol(jump_velocity)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let cfg = load_config(&args)?;
    let script = load_script(args.script.as_deref(), cfg.jump_velocity)?;
    info!(url = %cfg.server_url, tick_hz = cfg.tick_hz, policy = ?cfg.spawn_policy, "Starting client");

    let mut client = SyncClient::connect_websocket(cfg, HeadlessScene::with_script(script))
        .context("start session")?;

    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Client started. Type 'status' for info, 'quit' to exit.");
    println!();

    match client.run(Some(console_rx)).await {
        SessionEnd::Quit => info!("Client exiting"),
        SessionEnd::ConnectionLost { reason } => {
            println!("Disconnected from server: {reason}");
        }
    }
    Ok(())
}
