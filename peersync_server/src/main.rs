//! Standalone relay binary.
//!
//! Usage:
//!   cargo run -p peersync_server --bin server -- [--addr 127.0.0.1:40080] [--config sync.json]

use std::env;
use std::path::PathBuf;

use anyhow::Context;
use peersync_server::RelayServer;
use peersync_shared::config::SyncConfig;
use tracing::info;

fn parse_args() -> anyhow::Result<SyncConfig> {
    let args: Vec<String> = env::args().collect();
    let mut config: Option<PathBuf> = None;
    let mut addr: Option<String> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                config = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            _ => i += 1,
        }
    }

    let mut cfg = match config {
        Some(path) => SyncConfig::from_json_file(&path)?,
        None => SyncConfig::default(),
    };
    if let Some(addr) = addr {
        cfg.listen_addr = addr;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.listen_addr, "Starting relay");

    let server = RelayServer::bind(cfg).await.context("bind relay")?;
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
