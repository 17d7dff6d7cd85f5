//! Sandbox backends: the visibility and URL minting capability.
//!
//! Each backend derives the sandbox's actual visibility from its own
//! configuration and mints a routable URL (plus any auth material) for the
//! tunnel server port. The shared [`TcpProxyResolver`](crate::resolver::TcpProxyResolver)
//! composes these; backends never decide consistency themselves.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use sprites_proxy_core::{token, ProxyError, ProxyResult, Visibility};

/// Routable endpoint for one port, as minted by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedEndpoint {
    /// `http(s)://` or `ws(s)://` base URL.
    pub base_url: String,
    /// Headers a client must send on the upgrade request.
    pub headers: BTreeMap<String, String>,
    /// When the auth material stops being valid.
    pub expires_at: Option<Instant>,
}

impl MintedEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            headers: BTreeMap::new(),
            expires_at: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// One sandbox platform's view of a sandbox.
#[allow(async_fn_in_trait)]
pub trait SandboxBackend: Send + Sync {
    /// Stable identifier of the sandbox, used as a cache key.
    fn sandbox_id(&self) -> &str;

    /// Access level the sandbox is actually configured with.
    async fn resolve_visibility(&self) -> ProxyResult<Visibility>;

    /// Mint a routable endpoint for `port` at `visibility`.
    async fn mint_endpoint(&self, port: u16, visibility: Visibility)
        -> ProxyResult<MintedEndpoint>;
}

impl<T: SandboxBackend> SandboxBackend for &T {
    fn sandbox_id(&self) -> &str {
        (**self).sandbox_id()
    }

    async fn resolve_visibility(&self) -> ProxyResult<Visibility> {
        (**self).resolve_visibility().await
    }

    async fn mint_endpoint(
        &self,
        port: u16,
        visibility: Visibility,
    ) -> ProxyResult<MintedEndpoint> {
        (**self).mint_endpoint(port, visibility).await
    }
}

/// Backend with a fixed base URL and access configuration.
///
/// Private endpoints carry `Authorization: Bearer`, using either a fixed
/// bearer token or a short-lived HMAC connect token minted per call. Minted
/// tokens are bound to `<sandbox_id>:<port>` unless an audience is set.
#[derive(Debug, Clone)]
pub struct StaticBackend {
    pub sandbox_id: String,
    pub base_url: String,
    pub visibility: Visibility,
    pub bearer_token: Option<String>,
    pub token_secret: Option<Vec<u8>>,
    pub token_audience: Option<String>,
    pub token_ttl: Duration,
}

impl StaticBackend {
    pub fn new(
        sandbox_id: impl Into<String>,
        base_url: impl Into<String>,
        visibility: Visibility,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            base_url: base_url.into(),
            visibility,
            bearer_token: None,
            token_secret: None,
            token_audience: None,
            token_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_token_secret(mut self, secret: Vec<u8>, ttl: Duration) -> Self {
        self.token_secret = Some(secret);
        self.token_ttl = ttl;
        self
    }

    /// Audience connect tokens for `port` are bound to.
    pub fn audience_for(&self, port: u16) -> String {
        match &self.token_audience {
            Some(audience) => audience.clone(),
            None => format!("{}:{port}", self.sandbox_id),
        }
    }
}

impl SandboxBackend for StaticBackend {
    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    async fn resolve_visibility(&self) -> ProxyResult<Visibility> {
        Ok(self.visibility)
    }

    async fn mint_endpoint(
        &self,
        port: u16,
        visibility: Visibility,
    ) -> ProxyResult<MintedEndpoint> {
        let endpoint = MintedEndpoint::new(self.base_url.clone());
        if visibility == Visibility::Public {
            return Ok(endpoint);
        }

        if let Some(bearer) = &self.bearer_token {
            return Ok(endpoint.with_header("Authorization", format!("Bearer {bearer}")));
        }

        let Some(secret) = &self.token_secret else {
            return Err(ProxyError::ServiceNotReady(format!(
                "private endpoint for port {port} needs a bearer token or token secret"
            )));
        };
        let token = token::create_token(secret, &self.audience_for(port), self.token_ttl.as_secs());
        let mut endpoint = endpoint.with_header("Authorization", format!("Bearer {token}"));
        endpoint.expires_at = Some(Instant::now() + self.token_ttl);
        Ok(endpoint)
    }
}
