//! `sprites-proxy forward` — local port forwarder through a tunnel endpoint.
//!
//! Every connection accepted on the local address gets its own tunnel
//! connection to `host:port` inside the sandbox.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use sprites_proxy_core::{TcpProxyInfo, Visibility};
use sprites_proxy_host::{forward_local, to_websocket_url, TunnelClient};
use tokio::net::TcpListener;
use tracing::info;

pub struct ForwardArgs {
    pub url: String,
    pub port: u16,
    pub host: Option<String>,
    pub local: Option<String>,
    pub headers: Vec<String>,
    pub connect_timeout_secs: u64,
}

/// Parse a `Name=Value` (or `Name: Value`) header argument.
pub fn parse_header(arg: &str) -> Result<(String, String)> {
    let (name, value) = arg
        .split_once(['=', ':'])
        .with_context(|| format!("header '{arg}' must look like Name=Value"))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("empty header name in '{arg}'");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Build the descriptor for an explicitly given endpoint.
pub fn endpoint_info(url: &str, headers: &[String]) -> Result<TcpProxyInfo> {
    let url = to_websocket_url(url)?;
    let headers = headers
        .iter()
        .map(|h| parse_header(h))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let visibility = if headers.is_empty() {
        Visibility::Public
    } else {
        Visibility::Private
    };
    Ok(TcpProxyInfo::new(url.to_string(), Some(headers), visibility))
}

pub async fn run(args: ForwardArgs) -> Result<()> {
    let info = endpoint_info(&args.url, &args.headers)?;
    let local = args
        .local
        .unwrap_or_else(|| format!("127.0.0.1:{}", args.port));
    let listener = TcpListener::bind(&local)
        .await
        .with_context(|| format!("failed to bind {local}"))?;
    let bound = listener.local_addr()?;

    let target = format!(
        "{}:{}",
        args.host.as_deref().unwrap_or(&info.init.host_default),
        args.port
    );
    println!("Forwarding {bound} -> {target} via {}", info.url);
    info!(local = %bound, target = %target, "forwarder listening");

    let client = TunnelClient::new(Duration::from_secs(args.connect_timeout_secs));
    tokio::select! {
        result = forward_local(client, listener, info, args.host, args.port) => {
            result.context("forwarder stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }
    Ok(())
}
