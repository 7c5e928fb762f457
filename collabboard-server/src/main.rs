//! Standalone sync server.
//!
//! Configured through the environment:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `COLLABBOARD_BIND_ADDR` | `127.0.0.1:9090` |
//! | `COLLABBOARD_STORAGE_PATH` | unset (in-memory) |
//! | `COLLABBOARD_MAX_PEERS` | `100` |
//! | `COLLABBOARD_BROADCAST_CAPACITY` | `256` |
//! | `COLLABBOARD_HEARTBEAT_SECS` | `5` |
//! | `COLLABBOARD_LIVENESS_SECS` | `15` |
//! | `COLLABBOARD_AUTOSAVE_SECS` | `30` |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use collabboard_sync::server::{ServerConfig, SyncServer};
use log::{info, warn};
use std::path::PathBuf;
use std::str::FromStr;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {name}={raw:?}");
            default
        }),
        Err(_) => default,
    }
}

fn config_from_env() -> ServerConfig {
    let defaults = ServerConfig::default();
    ServerConfig {
        bind_addr: env_or("COLLABBOARD_BIND_ADDR", defaults.bind_addr),
        max_peers_per_room: env_or("COLLABBOARD_MAX_PEERS", defaults.max_peers_per_room),
        broadcast_capacity: env_or("COLLABBOARD_BROADCAST_CAPACITY", defaults.broadcast_capacity),
        heartbeat_interval_secs: env_or("COLLABBOARD_HEARTBEAT_SECS", defaults.heartbeat_interval_secs),
        liveness_timeout_secs: env_or("COLLABBOARD_LIVENESS_SECS", defaults.liveness_timeout_secs),
        autosave_interval_secs: env_or("COLLABBOARD_AUTOSAVE_SECS", defaults.autosave_interval_secs),
        storage_path: std::env::var("COLLABBOARD_STORAGE_PATH").ok().map(PathBuf::from),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env();
    info!(
        "Starting collabboard server (storage: {})",
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
    );
    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            let saved = server.hub().save_dirty_rooms().await;
            let stats = server.stats().await;
            info!(
                "Saved {saved} rooms; served {} connections",
                stats.total_connections
            );
        }
    }
    Ok(())
}
