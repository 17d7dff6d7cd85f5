//! Accept loop: one spawned task per client connection.
//!
//! Each connection claims a slot from the policy enforcer, optionally
//! terminates TLS, completes the upgrade handshake, and then runs a
//! [`TunnelSession`] until it closes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sprites_proxy_core::{ProxyError, ProxyResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::handshake;
use crate::policy::TargetPolicyEnforcer;
use crate::session::TunnelSession;
use crate::tls;

/// The tunnel server instance.
pub struct TunnelServer {
    config: ServerConfig,
    policy: Arc<TargetPolicyEnforcer>,
    tls: Option<TlsAcceptor>,
    next_session_id: AtomicU64,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> ProxyResult<Self> {
        let tls = match &config.tls {
            Some((cert, key)) => Some(tls::load_acceptor(cert, key)?),
            None => None,
        };
        if config.auth.is_some() {
            info!("connect tokens required");
        }
        Ok(Self {
            policy: Arc::new(TargetPolicyEnforcer::new(config.policy())),
            config,
            tls,
            next_session_id: AtomicU64::new(1),
        })
    }

    pub async fn bind(&self) -> ProxyResult<TcpListener> {
        TcpListener::bind(self.config.listen).await.map_err(|e| {
            ProxyError::Transport(format!("bind {} failed: {e}", self.config.listen))
        })
    }

    /// Bind the configured address and serve until the task is cancelled.
    pub async fn run(self) -> ProxyResult<()> {
        let listener = self.bind().await?;
        Arc::new(self).serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> ProxyResult<()> {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            tls = self.tls.is_some(),
            allowed_port = ?self.config.allowed_port,
            "tunnel server listening"
        );

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, remote).await;
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, remote: SocketAddr) {
        let Some(_guard) = self.policy.try_acquire() else {
            warn!(
                remote = %remote,
                active = self.policy.active_connections(),
                "connection limit reached"
            );
            // Drain the request so closing does not reset the connection.
            let _ = timeout(
                Duration::from_millis(500),
                handshake::read_request_head(&mut stream),
            )
            .await;
            let _ = handshake::reject(&mut stream, 503, "Service Unavailable").await;
            return;
        };
        let _ = stream.set_nodelay(true);

        match &self.tls {
            Some(acceptor) => {
                match timeout(self.config.init_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => self.upgrade_and_run(tls_stream, remote).await,
                    Ok(Err(e)) => warn!(remote = %remote, error = %e, "TLS accept failed"),
                    Err(_) => warn!(remote = %remote, "TLS handshake timed out"),
                }
            }
            None => self.upgrade_and_run(stream, remote).await,
        }
    }

    async fn upgrade_and_run<S>(&self, mut stream: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handshake = handshake::accept(&mut stream, self.config.auth.as_ref());
        let upgraded = match timeout(self.config.init_timeout, handshake).await {
            Ok(Ok(upgraded)) => upgraded,
            Ok(Err(e)) => {
                warn!(remote = %remote, code = e.code(), error = %e, "handshake rejected");
                return;
            }
            Err(_) => {
                warn!(remote = %remote, "handshake timed out");
                return;
            }
        };

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, remote = %remote, path = %upgraded.request.path, "session started");

        let session = TunnelSession::new(
            id,
            stream,
            upgraded.leftover,
            self.policy.clone(),
            self.config.session(),
        );
        session.run().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeAuth;
    use futures_util::{SinkExt, StreamExt};
    use sprites_proxy_core::{token, ConnectedAck};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use std::path::Path;
    use tokio_tungstenite::tungstenite::Message;

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    async fn start_server(config: ServerConfig) -> SocketAddr {
        let server = TunnelServer::new(ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..config
        })
        .unwrap();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::new(server).serve(listener));
        addr
    }

    #[tokio::test]
    async fn test_websocket_client_echo() {
        let target = echo_server().await;
        let addr = start_server(ServerConfig::default()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        ws.send(Message::Text(format!(r#"{{"port":{target}}}"#)))
            .await
            .unwrap();

        let ack = match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str::<ConnectedAck>(&text).unwrap(),
            other => panic!("expected ack, got {other:?}"),
        };
        assert!(ack.is_connected());
        assert_eq!(ack.target, format!("localhost:{target}"));

        let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        ws.send(Message::Binary(payload.clone())).await.unwrap();
        let mut echoed = Vec::new();
        while echoed.len() < payload.len() {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => echoed.extend(data),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(echoed, payload);

        ws.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_disallowed_host_gets_no_ack() {
        let addr = start_server(ServerConfig::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        ws.send(Message::Text(
            r#"{"host":"evil.example.com","port":80}"#.into(),
        ))
        .await
        .unwrap();

        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(Message::Text(text)) => panic!("unexpected ack {text}"),
                Ok(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn test_missing_key_rejected_with_400() {
        let addr = start_server(ServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn test_connection_limit_returns_503() {
        let addr = start_server(ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        })
        .await;

        let (_held, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();

        match tokio_tungstenite::connect_async(format!("ws://{addr}/")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 503);
            }
            other => panic!("expected 503, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_token_enforced() {
        let secret = vec![9u8; 32];
        let addr = start_server(ServerConfig {
            auth: Some(HandshakeAuth {
                secret: secret.clone(),
                audience: "sbx-b:8765".into(),
            }),
            ..ServerConfig::default()
        })
        .await;

        match tokio_tungstenite::connect_async(format!("ws://{addr}/")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 401);
            }
            other => panic!("expected 401, got {other:?}"),
        }

        // Same secret, minted for another sandbox.
        let foreign = token::create_token(&secret, "sbx-a:8765", 60);
        match tokio_tungstenite::connect_async(format!("ws://{addr}/?token={foreign}")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 401);
            }
            other => panic!("expected 401 for foreign audience, got {other:?}"),
        }

        let token = token::create_token(&secret, "sbx-b:8765", 60);
        assert!(
            tokio_tungstenite::connect_async(format!("ws://{addr}/?token={token}"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_init_timeout_closes_websocket() {
        let addr = start_server(ServerConfig {
            init_timeout: Duration::from_millis(150),
            ..ServerConfig::default()
        })
        .await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();

        let closed = timeout(Duration::from_secs(5), async {
            while let Some(msg) = ws.next().await {
                if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                    return true;
                }
            }
            true
        })
        .await;
        assert!(matches!(closed, Ok(true)));
    }

    #[tokio::test]
    async fn test_idle_tls_client_releases_slot() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata");
        let server = Arc::new(
            TunnelServer::new(ServerConfig {
                max_connections: 1,
                init_timeout: Duration::from_millis(150),
                tls: Some((dir.join("cert.pem"), dir.join("key.pem"))),
                ..ServerConfig::default()
            })
            .unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Connects and never sends a ClientHello.
        let _idle = TcpStream::connect(addr).await.unwrap();
        let (stream, remote) = listener.accept().await.unwrap();

        let handling = tokio::spawn({
            let server = server.clone();
            async move { server.handle_connection(stream, remote).await }
        });
        timeout(Duration::from_secs(2), handling)
            .await
            .expect("idle TLS connection kept its slot")
            .unwrap();
        assert_eq!(server.policy.active_connections(), 0);
    }
}
