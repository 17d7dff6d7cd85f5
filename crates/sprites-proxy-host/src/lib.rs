//! sprites-proxy-host: host-side half of the sprites TCP proxy.
//!
//! Bootstraps the in-sandbox tunnel server through a remote-exec primitive,
//! resolves a visibility-consistent endpoint descriptor, and opens tunnel
//! connections to it.
//!
//! # Quick Start
//!
//! ```no_run
//! use sprites_proxy_host::{
//!     BootstrapConfig, LocalShell, StaticBackend, TcpProxyOptions, TcpProxyProvider,
//!     TunnelClient, Visibility,
//! };
//!
//! # async fn example() -> sprites_proxy_host::ProxyResult<()> {
//! let backend = StaticBackend::new("sbx-1", "http://127.0.0.1:8765", Visibility::Public);
//! let provider = TcpProxyProvider::new(LocalShell, backend, BootstrapConfig::default());
//!
//! let info = provider.tcp_proxy(5432, TcpProxyOptions::default()).await?;
//! let tunnel = TunnelClient::default().connect(&info, None, 5432).await?;
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:15432").await?;
//! tunnel.bridge(stream).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bootstrap;
pub mod client;
pub mod exec;
pub mod payload;
pub mod proxy;
pub mod resolver;

// Re-export primary public types.
pub use backend::{MintedEndpoint, SandboxBackend, StaticBackend};
pub use bootstrap::{BootstrapConfig, BootstrapOutcome, ProxyBootstrap, ServerAuth};
pub use client::{forward_local, BridgeStats, TunnelClient, TunnelConnection};
pub use exec::{CommandOutput, LocalShell, RemoteExec};
pub use payload::TunnelPayload;
pub use proxy::{TcpProxyOptions, TcpProxyProvider};
pub use resolver::{to_websocket_url, TcpProxyResolver};

// Re-export core protocol types for convenience.
pub use sprites_proxy_core::{ProxyError, ProxyResult, TcpProxyInfo, Visibility};
