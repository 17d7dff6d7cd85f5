//! sprites-proxy — operator CLI for sprites TCP tunnels.
//!
//! Bootstraps the tunnel server in the local environment, resolves
//! endpoint descriptors, and forwards local ports through a tunnel.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use sprites_proxy_core::Visibility;
use tracing::error;

use commands::forward::ForwardArgs;
use config::{Config, Overrides};

/// sprites-proxy — TCP tunnels into sandboxes
#[derive(Parser, Debug)]
#[command(name = "sprites-proxy", version, about = "TCP tunnels into sandboxes over WebSocket")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "~/.sprites-proxy/config.toml")]
    config: String,

    /// Tunnel server port inside the sandbox
    #[arg(long, global = true)]
    internal_port: Option<u16>,

    /// Install directory for the server binary, pidfile, and log
    #[arg(long, global = true)]
    install_dir: Option<String>,

    /// Local server binary to upload before launching
    #[arg(long, global = true)]
    payload: Option<String>,

    /// Routable base URL of the tunnel server
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the tunnel server if needed and print the endpoint as JSON
    Ensure {
        /// Target port inside the sandbox
        #[arg(short, long)]
        port: u16,
        /// Readiness budget in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Required visibility (public or private)
        #[arg(long)]
        visibility: Option<Visibility>,
    },

    /// Resolve the endpoint for a port without starting anything
    Endpoint {
        #[arg(short, long)]
        port: u16,
        #[arg(long)]
        visibility: Option<Visibility>,
    },

    /// Report whether the tunnel server is listening
    Probe,

    /// Stop the tunnel server
    Stop,

    /// Forward a local port through a tunnel endpoint
    Forward {
        /// Tunnel endpoint URL (ws, wss, http, https)
        #[arg(long)]
        url: String,
        /// Target port inside the sandbox
        #[arg(short, long)]
        port: u16,
        /// Target host inside the sandbox
        #[arg(long)]
        host: Option<String>,
        /// Local listen address (default 127.0.0.1:<port>)
        #[arg(long)]
        local: Option<String>,
        /// Extra upgrade header, Name=Value (repeatable)
        #[arg(long = "header")]
        headers: Vec<String>,
        /// Connect plus acknowledgement timeout in seconds
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let default_filter = if cli.verbose {
        "sprites_proxy_cli=debug,sprites_proxy_host=debug,sprites_proxy_core=debug"
    } else {
        "sprites_proxy_cli=warn,sprites_proxy_host=warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;
    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("sprites-proxy: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply(Overrides {
        internal_port: cli.internal_port,
        install_dir: cli.install_dir,
        payload: cli.payload,
        base_url: cli.base_url,
    });

    match cli.command {
        Command::Ensure {
            port,
            timeout,
            visibility,
        } => commands::ensure::run_ensure(&cfg, port, timeout, visibility).await,
        Command::Endpoint { port, visibility } => {
            commands::ensure::run_endpoint(&cfg, port, visibility).await
        }
        Command::Probe => commands::server::run_probe(&cfg).await,
        Command::Stop => commands::server::run_stop(&cfg).await,
        Command::Forward {
            url,
            port,
            host,
            local,
            headers,
            connect_timeout,
        } => {
            commands::forward::run(ForwardArgs {
                url,
                port,
                host,
                local,
                headers,
                connect_timeout_secs: connect_timeout,
            })
            .await
        }
    }
}
