//! Visibility/auth resolution: map an abstract public/private request onto a
//! connectable [`TcpProxyInfo`].
//!
//! The requested visibility must match what the backend reports. A conflict
//! is always a `VisibilityMismatch`, on every call; the access level is
//! never coerced. Results are cached per `(sandbox, target port)`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use sprites_proxy_core::{ProxyError, ProxyResult, TcpProxyInfo, Visibility};
use tracing::debug;
use url::Url;

use crate::backend::{MintedEndpoint, SandboxBackend};

struct CachedEndpoint {
    info: TcpProxyInfo,
    expires_at: Option<Instant>,
}

pub struct TcpProxyResolver<B> {
    backend: B,
    /// Port the tunnel server listens on; this is what gets minted.
    internal_port: u16,
    cache: Mutex<HashMap<(String, u16), CachedEndpoint>>,
}

impl<B: SandboxBackend> TcpProxyResolver<B> {
    pub fn new(backend: B, internal_port: u16) -> Self {
        Self {
            backend,
            internal_port,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The visibility to use: the backend's, unless the caller asked for a
    /// different one, which is an error.
    pub async fn effective_visibility(
        &self,
        requested: Option<Visibility>,
    ) -> ProxyResult<Visibility> {
        let actual = self.backend.resolve_visibility().await?;
        match requested {
            Some(requested) if requested != actual => {
                Err(ProxyError::VisibilityMismatch { requested, actual })
            }
            _ => Ok(actual),
        }
    }

    /// Resolve the endpoint descriptor for `target_port`.
    pub async fn resolve(
        &self,
        target_port: u16,
        requested: Option<Visibility>,
    ) -> ProxyResult<TcpProxyInfo> {
        let visibility = self.effective_visibility(requested).await?;
        let key = (self.backend.sandbox_id().to_string(), target_port);

        if let Some(hit) = self.cached(&key, visibility) {
            debug!(sandbox = %key.0, target_port, "endpoint cache hit");
            return Ok(hit);
        }

        let minted = self
            .backend
            .mint_endpoint(self.internal_port, visibility)
            .await?;
        let expires_at = minted.expires_at;
        let info = endpoint_info(minted, visibility)?;
        debug!(sandbox = %key.0, target_port, url = %info.url, %visibility, "endpoint minted");

        self.lock_cache().insert(
            key,
            CachedEndpoint {
                info: info.clone(),
                expires_at,
            },
        );
        Ok(info)
    }

    /// Drop the cached endpoint for `target_port`.
    pub fn invalidate(&self, target_port: u16) {
        let key = (self.backend.sandbox_id().to_string(), target_port);
        self.lock_cache().remove(&key);
    }

    fn cached(&self, key: &(String, u16), visibility: Visibility) -> Option<TcpProxyInfo> {
        let cache = self.lock_cache();
        let entry = cache.get(key)?;
        let fresh = entry.expires_at.map_or(true, |at| Instant::now() < at);
        (entry.info.visibility == visibility && fresh).then(|| entry.info.clone())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<(String, u16), CachedEndpoint>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Rewrite an `http(s)` base URL to the matching `ws(s)` scheme.
pub fn to_websocket_url(base_url: &str) -> ProxyResult<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| ProxyError::Config(format!("invalid endpoint URL {base_url:?}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ProxyError::TunnelUnavailable(format!(
                "endpoint scheme {other:?} cannot carry a WebSocket tunnel"
            )))
        }
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| ProxyError::Config(format!("cannot rewrite {base_url:?} to {scheme}")))?;
    }
    Ok(url)
}

fn endpoint_info(minted: MintedEndpoint, visibility: Visibility) -> ProxyResult<TcpProxyInfo> {
    let url = to_websocket_url(&minted.base_url)?;
    Ok(TcpProxyInfo::new(
        url.to_string(),
        Some(minted.headers),
        visibility,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockBackend {
        visibility: Mutex<Visibility>,
        mints: AtomicUsize,
        ttl: Option<Duration>,
    }

    impl MockBackend {
        fn new(visibility: Visibility) -> Self {
            Self {
                visibility: Mutex::new(visibility),
                mints: AtomicUsize::new(0),
                ttl: None,
            }
        }

        fn set_visibility(&self, visibility: Visibility) {
            *self.visibility.lock().unwrap() = visibility;
        }

        fn mints(&self) -> usize {
            self.mints.load(Ordering::SeqCst)
        }
    }

    impl SandboxBackend for MockBackend {
        fn sandbox_id(&self) -> &str {
            "sbx-test"
        }

        async fn resolve_visibility(&self) -> ProxyResult<Visibility> {
            Ok(*self.visibility.lock().unwrap())
        }

        async fn mint_endpoint(
            &self,
            port: u16,
            visibility: Visibility,
        ) -> ProxyResult<MintedEndpoint> {
            let n = self.mints.fetch_add(1, Ordering::SeqCst);
            let mut endpoint = MintedEndpoint::new(format!("https://sbx-test-{port}.example.dev"));
            if visibility == Visibility::Private {
                endpoint = endpoint.with_header("Authorization", format!("Bearer t{n}"));
            }
            endpoint.expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
            Ok(endpoint)
        }
    }

    #[tokio::test]
    async fn defaults_to_backend_visibility() {
        let backend = MockBackend::new(Visibility::Private);
        let resolver = TcpProxyResolver::new(&backend, 8765);
        let info = resolver.resolve(5432, None).await.unwrap();
        assert_eq!(info.visibility, Visibility::Private);
        assert_eq!(info.url, "wss://sbx-test-8765.example.dev/");
        assert_eq!(info.protocol, "sprites-tcp-proxy-v1");
        assert_eq!(info.init.host_default, "localhost");
        assert!(!info.init.requires_host);
        assert_eq!(info.headers.unwrap()["Authorization"], "Bearer t0");
    }

    #[tokio::test]
    async fn mismatch_on_every_call() {
        let backend = MockBackend::new(Visibility::Private);
        let resolver = TcpProxyResolver::new(&backend, 8765);
        for _ in 0..3 {
            let err = resolver
                .resolve(5432, Some(Visibility::Public))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "visibility_mismatch");
        }
        // A cached private entry does not mask the conflict either.
        resolver.resolve(5432, None).await.unwrap();
        let err = resolver
            .resolve(5432, Some(Visibility::Public))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::VisibilityMismatch {
                requested: Visibility::Public,
                actual: Visibility::Private
            }
        ));
        assert_eq!(backend.mints(), 1);
    }

    #[tokio::test]
    async fn cache_hit_per_sandbox_and_port() {
        let backend = MockBackend::new(Visibility::Public);
        let resolver = TcpProxyResolver::new(&backend, 8765);
        let a = resolver.resolve(5432, Some(Visibility::Public)).await.unwrap();
        let b = resolver.resolve(5432, None).await.unwrap();
        assert_eq!(a, b);
        assert!(a.headers.is_none());
        assert_eq!(backend.mints(), 1);

        resolver.resolve(6379, None).await.unwrap();
        assert_eq!(backend.mints(), 2);
    }

    #[tokio::test]
    async fn visibility_change_invalidates() {
        let backend = MockBackend::new(Visibility::Public);
        let resolver = TcpProxyResolver::new(&backend, 8765);
        resolver.resolve(5432, None).await.unwrap();

        backend.set_visibility(Visibility::Private);
        let info = resolver.resolve(5432, None).await.unwrap();
        assert_eq!(info.visibility, Visibility::Private);
        assert_eq!(backend.mints(), 2);

        resolver.invalidate(5432);
        resolver.resolve(5432, None).await.unwrap();
        assert_eq!(backend.mints(), 3);
    }

    #[tokio::test]
    async fn expired_auth_is_reminted() {
        let mut backend = MockBackend::new(Visibility::Private);
        backend.ttl = Some(Duration::ZERO);
        let resolver = TcpProxyResolver::new(&backend, 8765);
        let first = resolver.resolve(5432, None).await.unwrap();
        let second = resolver.resolve(5432, None).await.unwrap();
        assert_ne!(first.headers, second.headers);
        assert_eq!(backend.mints(), 2);
    }

    #[test]
    fn websocket_schemes() {
        assert_eq!(
            to_websocket_url("http://10.0.0.1:8765").unwrap().as_str(),
            "ws://10.0.0.1:8765/"
        );
        assert_eq!(
            to_websocket_url("https://x.dev/tunnel").unwrap().as_str(),
            "wss://x.dev/tunnel"
        );
        assert_eq!(to_websocket_url("wss://x.dev/").unwrap().scheme(), "wss");
        assert_eq!(
            to_websocket_url("ftp://x.dev").unwrap_err().code(),
            "tunnel_unavailable"
        );
        assert!(to_websocket_url("not a url").is_err());
    }
}
