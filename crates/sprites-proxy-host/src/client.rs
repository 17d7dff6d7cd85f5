//! Tunnel client: open a sprites-tcp-proxy-v1 connection from a
//! [`TcpProxyInfo`] and bridge it to a local byte stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sprites_proxy_core::{ConnectedAck, InitRequest, ProxyError, ProxyResult, TcpProxyInfo, PROTOCOL_ID};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bytes moved by one bridged connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub to_remote: u64,
    pub to_local: u64,
}

/// Opens tunnel connections.
#[derive(Debug, Clone)]
pub struct TunnelClient {
    /// Bound on upgrade plus init acknowledgement.
    pub connect_timeout: Duration,
}

impl Default for TunnelClient {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TunnelClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connect to `info` and ask the tunnel server for `host:port`.
    ///
    /// `host` falls back to the endpoint's init hint.
    pub async fn connect(
        &self,
        info: &TcpProxyInfo,
        host: Option<&str>,
        port: u16,
    ) -> ProxyResult<TunnelConnection> {
        if info.protocol != PROTOCOL_ID {
            return Err(ProxyError::Protocol(format!(
                "unsupported tunnel protocol {:?}",
                info.protocol
            )));
        }
        if host.is_none() && info.init.requires_host {
            return Err(ProxyError::InvalidInit(
                "endpoint requires an explicit host".into(),
            ));
        }
        let init = InitRequest::new(host.unwrap_or(&info.init.host_default), port);

        tokio::time::timeout(self.connect_timeout, open(info, &init))
            .await
            .map_err(|_| {
                ProxyError::TunnelUnavailable(format!(
                    "no acknowledgement from {} within {:?}",
                    info.url, self.connect_timeout
                ))
            })?
    }
}

async fn open(info: &TcpProxyInfo, init: &InitRequest) -> ProxyResult<TunnelConnection> {
    // A no-op once a provider is installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut request = info
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::Config(format!("invalid tunnel URL {}: {e}", info.url)))?;
    for (name, value) in info.headers.iter().flatten() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::Config(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProxyError::Config(format!("invalid header value for {name}: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    let (mut ws, _response) = connect_async(request)
        .await
        .map_err(|e| ProxyError::Transport(format!("WebSocket connect error: {e}")))?;
    debug!(url = %info.url, target = %init.target(), "tunnel upgraded");

    ws.send(Message::Text(serde_json::to_string(init)?))
        .await
        .map_err(|e| ProxyError::Transport(format!("init send failed: {e}")))?;

    loop {
        let msg = ws.next().await.ok_or_else(|| {
            ProxyError::TunnelUnavailable(format!("{} closed before acknowledging", init.target()))
        })?;
        match msg.map_err(|e| ProxyError::Transport(format!("WebSocket read error: {e}")))? {
            Message::Text(text) => {
                let ack: ConnectedAck = serde_json::from_str(&text)?;
                if !ack.is_connected() {
                    return Err(ProxyError::Protocol(format!(
                        "unexpected status {:?}",
                        ack.status
                    )));
                }
                info!(target = %ack.target, "tunnel connected");
                return Ok(TunnelConnection {
                    ws,
                    target: ack.target,
                });
            }
            Message::Close(_) => {
                return Err(ProxyError::TunnelUnavailable(format!(
                    "tunnel server refused {}",
                    init.target()
                )));
            }
            Message::Binary(_) => {
                return Err(ProxyError::Protocol("binary frame before acknowledgement".into()));
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

/// An acknowledged tunnel, ready to carry bytes.
pub struct TunnelConnection {
    ws: WsStream,
    target: String,
}

impl TunnelConnection {
    /// `host:port` the server connected to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Relay bytes between `local` and the tunnel until either side ends.
    pub async fn bridge<S>(self, local: S) -> ProxyResult<BridgeStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = self.ws.split();
        let (mut local_read, mut local_write) = tokio::io::split(local);
        let mut stats = BridgeStats::default();
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            tokio::select! {
                read = local_read.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        debug!(target = %self.target, "local side closed");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    sink.send(Message::Binary(buf[..n].to_vec()))
                        .await
                        .map_err(|e| ProxyError::Transport(format!("WebSocket send failed: {e}")))?;
                    stats.to_remote += n as u64;
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            local_write.write_all(&data).await?;
                            stats.to_local += data.len() as u64;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(target = %self.target, "tunnel closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(ProxyError::Transport(format!("WebSocket read error: {e}")));
                        }
                    }
                }
            }
        }

        let _ = local_write.shutdown().await;
        Ok(stats)
    }
}

/// Accept local TCP clients and bridge each through its own tunnel to
/// `host:port`. Runs until the listener fails.
pub async fn forward_local(
    client: TunnelClient,
    listener: TcpListener,
    info: TcpProxyInfo,
    host: Option<String>,
    port: u16,
) -> ProxyResult<()> {
    let info = Arc::new(info);
    let local = listener.local_addr()?;
    info!(local = %local, url = %info.url, port, "forwarding");

    loop {
        let (stream, peer) = listener.accept().await?;
        let client = client.clone();
        let info = info.clone();
        let host = host.clone();
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let tunnel = match client.connect(&info, host.as_deref(), port).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    warn!(peer = %peer, code = e.code(), error = %e, "tunnel connect failed");
                    return;
                }
            };
            match tunnel.bridge(stream).await {
                Ok(stats) => debug!(
                    peer = %peer,
                    to_remote = stats.to_remote,
                    to_local = stats.to_local,
                    "forwarded connection closed"
                ),
                Err(e) => debug!(peer = %peer, error = %e, "forwarded connection failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprites_proxy_core::Visibility;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[derive(Default)]
    struct Seen {
        init: Option<InitRequest>,
        authorization: Option<String>,
    }

    /// Minimal tunnel server: acks the init (unless `refuse`) then echoes binary frames.
    async fn fake_server(refuse: bool) -> (String, Arc<Mutex<Seen>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Seen::default()));
        let seen_task = seen.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let seen_hdr = seen_task.clone();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                seen_hdr.lock().unwrap().authorization = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();

            let Some(Ok(Message::Text(text))) = ws.next().await else {
                return;
            };
            let init = InitRequest::parse(text.as_bytes()).unwrap();
            seen_task.lock().unwrap().init = Some(init.clone());
            if refuse {
                let _ = ws.close(None).await;
                return;
            }
            let ack = serde_json::to_string(&ConnectedAck::connected(&init)).unwrap();
            ws.send(Message::Text(ack)).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(data) => ws.send(Message::Binary(data)).await.unwrap(),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        (format!("ws://{addr}/"), seen)
    }

    fn info(url: &str, headers: Option<BTreeMap<String, String>>) -> TcpProxyInfo {
        TcpProxyInfo::new(url, headers, Visibility::Private)
    }

    #[tokio::test]
    async fn connect_sends_init_and_headers() {
        let (url, seen) = fake_server(false).await;
        let headers = BTreeMap::from([("Authorization".to_string(), "Bearer abc".to_string())]);
        let tunnel = TunnelClient::default()
            .connect(&info(&url, Some(headers)), None, 5432)
            .await
            .unwrap();
        assert_eq!(tunnel.target(), "localhost:5432");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.init, Some(InitRequest::new("localhost", 5432)));
        assert_eq!(seen.authorization.as_deref(), Some("Bearer abc"));
    }

    #[tokio::test]
    async fn bridge_relays_both_ways() {
        let (url, _) = fake_server(false).await;
        let tunnel = TunnelClient::default()
            .connect(&info(&url, None), Some("127.0.0.1"), 6379)
            .await
            .unwrap();

        let (mut app, local) = tokio::io::duplex(1024);
        let bridge = tokio::spawn(tunnel.bridge(local));

        app.write_all(b"PING\r\n").await.unwrap();
        let mut echoed = [0u8; 6];
        app.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"PING\r\n");

        drop(app);
        let stats = bridge.await.unwrap().unwrap();
        assert_eq!(stats.to_remote, 6);
        assert_eq!(stats.to_local, 6);
    }

    #[tokio::test]
    async fn refused_init_is_tunnel_unavailable() {
        let (url, _) = fake_server(true).await;
        let err = TunnelClient::default()
            .connect(&info(&url, None), Some("evil.example.com"), 80)
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err.code(), "tunnel_unavailable" | "transport_error"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn rejects_foreign_protocol_and_missing_host() {
        let mut foreign = info("ws://127.0.0.1:1/", None);
        foreign.protocol = "other-v2".into();
        let err = TunnelClient::default()
            .connect(&foreign, None, 80)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "protocol_error");

        let mut strict = info("ws://127.0.0.1:1/", None);
        strict.init.requires_host = true;
        let err = TunnelClient::default()
            .connect(&strict, None, 80)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "invalid_init");
    }

    #[tokio::test]
    async fn ack_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let err = TunnelClient::new(Duration::from_millis(200))
            .connect(&info(&format!("ws://{addr}/"), None), None, 80)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "tunnel_unavailable");
    }

    #[tokio::test]
    async fn forward_local_bridges_accepted_clients() {
        let (url, _) = fake_server(false).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        tokio::spawn(forward_local(
            TunnelClient::default(),
            listener,
            info(&url, None),
            None,
            5432,
        ));

        let mut conn = TcpStream::connect(local).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
