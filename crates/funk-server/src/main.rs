use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::info;

mod auth;
mod config;
mod jitter;
mod registry;
mod relay;
mod state;
mod store;

use config::ServerConfig;
use state::ServerState;
use store::JsonStore;

#[derive(Parser)]
#[command(name = "funk-server", about = "Funk voice relay server")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// UDP port, overrides config
    #[arg(long)]
    port: Option<u16>,

    /// Path to the users file, overrides config
    #[arg(long)]
    users: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funk_server=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        ServerConfig::default()
    };

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(users) = args.users {
        config.users_path = users;
    }

    info!("funk server starting");
    info!(
        host = %config.host,
        port = config.port,
        stale_timeout = config.stale_timeout_secs,
        users = %config.users_path,
    );

    let store = JsonStore::open(
        &config.users_path,
        &config.connection_log_path,
        &config.traffic_log_path,
    )
    .with_context(|| format!("failed to open store at {}", config.users_path))?;

    let state = Arc::new(ServerState::new(
        Arc::new(store),
        Duration::from_secs(config.stale_timeout_secs),
        Duration::from_secs(config.auth_cache_ttl_secs),
    ));

    // Bind with enlarged buffers to absorb fan-out bursts.
    let socket = {
        let sock = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("failed to create UDP socket")?;
        let _ = sock.set_recv_buffer_size(1024 * 1024);
        let _ = sock.set_send_buffer_size(1024 * 1024);
        let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;
        sock.bind(&addr.into())
            .with_context(|| format!("failed to bind UDP on {}", addr))?;
        sock.set_nonblocking(true)
            .context("failed to set non-blocking")?;
        let std_sock: std::net::UdpSocket = sock.into();
        Arc::new(UdpSocket::from_std(std_sock).context("failed to wrap UDP socket in tokio")?)
    };

    info!("UDP socket bound on {}:{}", config.host, config.port);

    let relay_state = state.clone();
    let relay_socket = socket.clone();
    let relay_task = tokio::spawn(async move {
        relay::run(relay_socket, relay_state).await;
    });

    info!("server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down, flushing traffic counters");
    relay_task.abort();
    relay::flush_traffic_final(&state);

    Ok(())
}
