//! `tcp_proxy`: the single host-side entry point. Ensures the in-sandbox
//! tunnel server is running, then returns a connectable endpoint descriptor.

use sprites_proxy_core::{ProxyError, ProxyResult, TcpProxyInfo, Visibility};
use tracing::info;

use crate::backend::SandboxBackend;
use crate::bootstrap::{BootstrapConfig, BootstrapOutcome, ProxyBootstrap};
use crate::exec::RemoteExec;
use crate::resolver::TcpProxyResolver;

/// Caller options for [`TcpProxyProvider::tcp_proxy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpProxyOptions {
    /// Required access level. `None` accepts whatever the sandbox has.
    pub visibility: Option<Visibility>,
    /// Readiness budget in seconds, one probe per second.
    pub timeout_secs: Option<u64>,
}

/// Bootstrap plus resolution for one sandbox.
pub struct TcpProxyProvider<E, B> {
    bootstrap: ProxyBootstrap<E>,
    resolver: TcpProxyResolver<B>,
}

impl<E: RemoteExec, B: SandboxBackend> TcpProxyProvider<E, B> {
    pub fn new(exec: E, backend: B, config: BootstrapConfig) -> Self {
        let internal_port = config.internal_port;
        Self {
            bootstrap: ProxyBootstrap::new(exec, config),
            resolver: TcpProxyResolver::new(backend, internal_port),
        }
    }

    pub fn bootstrap(&self) -> &ProxyBootstrap<E> {
        &self.bootstrap
    }

    pub fn resolver(&self) -> &TcpProxyResolver<B> {
        &self.resolver
    }

    /// Expose `port` inside the sandbox through the tunnel server.
    ///
    /// A visibility conflict fails before anything is launched.
    pub async fn tcp_proxy(&self, port: u16, options: TcpProxyOptions) -> ProxyResult<TcpProxyInfo> {
        if port == 0 {
            return Err(ProxyError::InvalidInit("port must be in 1..=65535".into()));
        }
        let visibility = self.resolver.effective_visibility(options.visibility).await?;

        let outcome = self.bootstrap.ensure(port, options.timeout_secs).await?;
        if outcome == BootstrapOutcome::Launched {
            info!(
                sandbox = self.resolver.backend().sandbox_id(),
                port,
                internal_port = self.bootstrap.config().internal_port,
                "tunnel server started"
            );
        }

        self.resolver.resolve(port, Some(visibility)).await
    }
}
