use anyhow::Result;
use clap::Parser;
use clipsync::clipboard::{ArboardBackend, Monitor};
use clipsync::config::{Config, Mode, SyncMode};
use clipsync::hub::{Hub, HubEvent};
use clipsync::peer::{Peer, PeerEvent};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "clipsync", about = "Keep a text clipboard in sync across machines")]
struct Args {
    /// Run as the hub other machines connect to, or as a client dialing one
    #[arg(short, long, value_enum, env = "CLIPSYNC_MODE")]
    mode: Option<Mode>,

    /// Listen port for server mode
    #[arg(short, long, env = "CLIPSYNC_PORT")]
    port: Option<u16>,

    /// Hub address (host:port) for client mode
    #[arg(short, long, env = "CLIPSYNC_SERVER")]
    server: Option<String>,

    /// Which directions clipboard content flows
    #[arg(long, value_enum, env = "CLIPSYNC_SYNC_MODE")]
    sync_mode: Option<SyncMode>,

    #[arg(long, default_value = "500", env = "CLIPSYNC_POLL_MS")]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("clipsync=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut cfg = Config::load();
    if let Some(mode) = args.mode {
        cfg.mode = mode;
    }
    if let Some(port) = args.port {
        cfg.server_port = port;
    }
    if let Some(server) = args.server {
        cfg.server_address = server;
    }
    if let Some(sync_mode) = args.sync_mode {
        cfg.sync_mode = sync_mode;
    }

    info!(mode = ?cfg.mode, sync = ?cfg.sync_mode, "starting clipsync");

    let backend = ArboardBackend::new()?;
    let (monitor, mut changes) =
        Monitor::new(Box::new(backend), Duration::from_millis(args.poll_ms));
    monitor.start();

    let (hub, mut hub_events) = Hub::new();
    let (peer, mut peer_events) = Peer::new();

    match cfg.mode {
        Mode::Server => {
            hub.start(cfg.server_port).await?;
            match local_ip_address::local_ip() {
                Ok(ip) => info!("peers can connect to {}:{}", ip, cfg.server_port),
                Err(e) => warn!(error = %e, "could not determine LAN address"),
            }
        }
        Mode::Client => peer.connect(cfg.server_address.clone()).await,
    }

    // The last value pushed in either direction; echoes of it are dropped
    // before they can loop back onto the network.
    let mut last_copied = String::new();

    loop {
        tokio::select! {
            Some(content) = changes.recv() => {
                if content == last_copied {
                    continue;
                }
                last_copied = content.clone();
                if !cfg.sync_mode.sends() {
                    info!("receive-only mode, skipping outbound sync");
                    continue;
                }
                match cfg.mode {
                    Mode::Server if hub.is_running() => {
                        hub.broadcast_clipboard(&content, "server").await;
                    }
                    Mode::Client if peer.is_connected() => {
                        if let Err(e) = peer.send_clipboard(&content, "client").await {
                            warn!(error = %e, "failed to send clipboard");
                        }
                    }
                    _ => {}
                }
            }
            Some(event) = hub_events.recv() => match event {
                HubEvent::ClipboardReceived(content) => {
                    apply_remote(&monitor, &cfg, &mut last_copied, content).await;
                }
                HubEvent::ClientConnected(count) => info!(count, "client connected"),
                HubEvent::ClientDisconnected(count) => info!(count, "client disconnected"),
            },
            Some(event) = peer_events.recv() => match event {
                PeerEvent::ClipboardReceived(content) => {
                    apply_remote(&monitor, &cfg, &mut last_copied, content).await;
                }
                PeerEvent::Connected => info!("connected to hub"),
                PeerEvent::Disconnected => info!("disconnected from hub"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    monitor.stop();
    hub.stop().await;
    peer.disconnect();
    Ok(())
}

/// Write remote clipboard content locally, unless the sync mode or the echo
/// guard says otherwise.
async fn apply_remote(monitor: &Monitor, cfg: &Config, last_copied: &mut String, content: String) {
    if !cfg.sync_mode.receives() {
        info!("send-only mode, skipping clipboard write");
        return;
    }
    if content == *last_copied {
        return;
    }
    if let Err(e) = monitor.write(&content).await {
        error!(error = %e, "failed to write clipboard");
        return;
    }
    *last_copied = content;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_fall_back_to_the_environment() {
        std::env::set_var("CLIPSYNC_MODE", "client");
        std::env::set_var("CLIPSYNC_SERVER", "192.168.1.20:8765");
        let args = Args::parse_from(["clipsync"]);
        std::env::remove_var("CLIPSYNC_MODE");
        std::env::remove_var("CLIPSYNC_SERVER");

        assert_eq!(args.mode, Some(Mode::Client));
        assert_eq!(args.server, Some("192.168.1.20:8765".to_string()));
        assert_eq!(args.poll_ms, 500);
    }

    #[test]
    fn test_flags_override_the_environment() {
        std::env::set_var("CLIPSYNC_PORT", "9100");
        let args = Args::parse_from(["clipsync", "--port", "9200"]);
        std::env::remove_var("CLIPSYNC_PORT");
        assert_eq!(args.port, Some(9200));
    }
}
