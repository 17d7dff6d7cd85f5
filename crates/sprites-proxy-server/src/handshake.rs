//! HTTP Upgrade handshake, implemented directly on the accepted socket.
//!
//! 1. Read the request head (bounded to [`MAX_REQUEST_HEAD`] bytes)
//! 2. Require `Sec-WebSocket-Key`, else answer `400` and stop
//! 3. If connect tokens are enabled, require a valid one, else answer `401`
//! 4. Answer `101 Switching Protocols` with `Sec-WebSocket-Accept`
//!
//! Bytes the client sent after the request head are returned to the caller so
//! a pipelined first frame is not lost.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1::{Digest, Sha1};
use sprites_proxy_core::{token, ProxyError, ProxyResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// GUID appended to the client key before hashing (RFC 6455 section 1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the request line plus headers.
pub const MAX_REQUEST_HEAD: usize = 8192;

/// Connect-token verification settings.
#[derive(Debug, Clone)]
pub struct HandshakeAuth {
    pub secret: Vec<u8>,
    pub audience: String,
}

/// A parsed upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
}

impl UpgradeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Value of a query parameter in the request target.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.path.split_once('?')?;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }

    /// Connect token from `Authorization: Bearer` or `?token=`.
    pub fn connect_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .or_else(|| self.query_param("token"))
    }
}

/// A completed upgrade.
#[derive(Debug)]
pub struct Upgraded {
    pub request: UpgradeRequest,
    /// Bytes received after the request head; the start of the frame stream.
    pub leftover: Vec<u8>,
}

/// Compute `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Parse an HTTP/1.1 request head (everything before the blank line).
pub fn parse_request_head(head: &[u8]) -> ProxyResult<UpgradeRequest> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::Handshake("request head is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::Handshake(format!(
            "malformed request line: {request_line:?}"
        )));
    };

    let mut headers = HashMap::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::Handshake(format!("malformed header: {line:?}")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok(UpgradeRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers,
    })
}

/// Read until the end of the request head. Returns `(head, leftover)`.
pub async fn read_request_head<R>(reader: &mut R) -> ProxyResult<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() >= MAX_REQUEST_HEAD {
            return Err(ProxyError::Handshake(format!(
                "request head exceeds {MAX_REQUEST_HEAD} bytes"
            )));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Handshake(
                "connection closed during handshake".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

pub fn switching_protocols_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

pub fn reject_response(status: u16, reason: &str) -> String {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Connection: close\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

/// Write a plain HTTP rejection and flush it.
pub async fn reject<W>(writer: &mut W, status: u16, reason: &str) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(reject_response(status, reason).as_bytes())
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Run the server side of the handshake on `stream`.
///
/// On any rejection the HTTP error response has already been written when
/// this returns `Err`.
pub async fn accept<S>(stream: &mut S, auth: Option<&HandshakeAuth>) -> ProxyResult<Upgraded>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = match read_request_head(stream).await {
        Ok(parts) => parts,
        Err(e) => {
            let _ = reject(stream, 400, "Bad Request").await;
            return Err(e);
        }
    };
    let request = match parse_request_head(&head) {
        Ok(request) => request,
        Err(e) => {
            let _ = reject(stream, 400, "Bad Request").await;
            return Err(e);
        }
    };

    let Some(key) = request.header("sec-websocket-key").map(str::to_string) else {
        reject(stream, 400, "Bad Request").await?;
        return Err(ProxyError::Handshake("missing Sec-WebSocket-Key".into()));
    };

    if let Some(auth) = auth {
        let verified = request
            .connect_token()
            .ok_or_else(|| ProxyError::Token("missing connect token".into()))
            .and_then(|t| token::verify_token(&auth.secret, &auth.audience, t));
        if let Err(e) = verified {
            reject(stream, 401, "Unauthorized").await?;
            return Err(e);
        }
    }

    debug!(
        path = %request.path,
        version = request.header("sec-websocket-version").unwrap_or("-"),
        "upgrade accepted"
    );

    stream
        .write_all(switching_protocols_response(&accept_key(&key)).as_bytes())
        .await?;
    stream.flush().await?;

    Ok(Upgraded { request, leftover })
}
