//! `sprites-proxy ensure` / `sprites-proxy endpoint` — produce a connectable
//! endpoint descriptor for a sandbox port.

use anyhow::{Context, Result};
use sprites_proxy_core::Visibility;
use sprites_proxy_host::{LocalShell, TcpProxyOptions, TcpProxyProvider, TcpProxyResolver};
use tracing::info;

use crate::config::Config;

/// Bootstrap the tunnel server if needed and print the endpoint as JSON.
pub async fn run_ensure(
    config: &Config,
    port: u16,
    timeout_secs: Option<u64>,
    visibility: Option<Visibility>,
) -> Result<()> {
    let bootstrap = config.bootstrap_config()?;
    let backend = config.backend()?;
    info!(port, internal_port = bootstrap.internal_port, "ensure");

    let provider = TcpProxyProvider::new(LocalShell, backend, bootstrap);
    let info = provider
        .tcp_proxy(
            port,
            TcpProxyOptions {
                visibility,
                timeout_secs,
            },
        )
        .await
        .with_context(|| format!("failed to expose port {port}"))?;

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

/// Resolve the endpoint without touching the tunnel server.
pub async fn run_endpoint(config: &Config, port: u16, visibility: Option<Visibility>) -> Result<()> {
    let resolver = TcpProxyResolver::new(config.backend()?, config.bootstrap.internal_port);
    let info = resolver
        .resolve(port, visibility)
        .await
        .with_context(|| format!("failed to resolve endpoint for port {port}"))?;

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
