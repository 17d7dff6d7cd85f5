//! sprites-tcp-proxy: in-sandbox tunnel server.
//!
//! Accepts WebSocket clients speaking sprites-tcp-proxy-v1 and bridges each
//! one to a single TCP service on the sandbox loopback interface.

mod config;
mod handshake;
mod policy;
mod server;
mod session;
mod tls;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::TunnelServer;
use std::path::PathBuf;
use tracing::{error, info};

/// sprites-tcp-proxy — WebSocket to loopback TCP tunnel
#[derive(Parser, Debug)]
#[command(name = "sprites-tcp-proxy", version, about = "WebSocket to loopback TCP tunnel server")]
struct Cli {
    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Only allow tunnels to this target port
    #[arg(long)]
    allowed_port: Option<u16>,

    /// Watchdog for init plus target connect, in milliseconds
    #[arg(long)]
    init_timeout_ms: Option<u64>,

    /// Maximum concurrent client connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.sprites-proxy/server.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting sprites-tcp-proxy");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        listen: cli.listen,
        allowed_port: cli.allowed_port,
        init_timeout_ms: cli.init_timeout_ms,
        max_connections: cli.max_connections,
        cert: cli.cert,
        key: cli.key,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let tunnel_server = match TunnelServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    tokio::select! {
        result = tunnel_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("sprites-tcp-proxy stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
