//! `sprites-proxy probe` / `sprites-proxy stop` — inspect or stop the tunnel
//! server in the local environment.

use anyhow::{Context, Result};
use sprites_proxy_host::{LocalShell, ProxyBootstrap};

use crate::config::Config;

pub async fn run_probe(config: &Config) -> Result<()> {
    let bootstrap = ProxyBootstrap::new(LocalShell, config.bootstrap_config()?);
    let port = bootstrap.config().internal_port;
    let listening = bootstrap
        .is_listening()
        .await
        .context("listening probe failed")?;

    if listening {
        println!("tunnel server listening on port {port}");
    } else {
        println!("tunnel server not listening on port {port}");
    }
    Ok(())
}

pub async fn run_stop(config: &Config) -> Result<()> {
    let bootstrap = ProxyBootstrap::new(LocalShell, config.bootstrap_config()?);
    let stopped = bootstrap
        .stop()
        .await
        .context("failed to stop tunnel server")?;

    if stopped {
        println!("tunnel server stopped");
    } else {
        println!("no tunnel server running");
    }
    Ok(())
}
