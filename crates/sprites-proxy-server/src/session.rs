//! One tunnel session: a single upgraded client bridged to a single TCP target.
//!
//! ```text
//! AwaitingInit ──init ok──▶ Connecting ──dial ok──▶ Bridging ──▶ Closed
//!      │                        │                      │
//!      └── bad init / policy / timeout / dial error ───┴──────────▶ Closed
//! ```
//!
//! A single watchdog covers both `AwaitingInit` and `Connecting`. Once the ack
//! is sent the session bridges in both directions until either side ends;
//! there is no idle timeout while bridging.

use std::sync::Arc;
use std::time::Duration;

use sprites_proxy_core::{
    encode, ConnectedAck, Frame, FrameDecoder, InitRequest, Opcode, ProxyError, ProxyResult,
    MAX_INIT_BYTES,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::policy::TargetPolicyEnforcer;

const READ_CHUNK: usize = 16 * 1024;

/// Close status codes (RFC 6455 section 7.4.1).
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_PROTOCOL_ERROR: u16 = 1002;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingInit,
    Connecting,
    Bridging,
    Closed,
}

/// How a bridge ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    /// The client sent a Close frame.
    ClientClosed,
    /// The client connection hit EOF without a Close frame.
    ClientGone,
    /// The target hit EOF; a Close frame was sent after the last data.
    TargetClosed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Watchdog covering init plus the target dial.
    pub init_timeout: Duration,
    /// Largest accepted inbound frame payload.
    pub max_frame_size: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_millis(5000),
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

/// What happened during a session, reported once it is closed.
#[derive(Debug)]
pub struct SessionSummary {
    pub id: u64,
    /// Last state before `Closed`.
    pub reached: SessionState,
    pub target: Option<String>,
    pub bytes_to_target: u64,
    pub bytes_to_client: u64,
    pub outcome: ProxyResult<BridgeEnd>,
}

/// Frame-level reader over the client half of the connection.
///
/// Frames are decoded one at a time so a payload limit change takes effect
/// on the very next frame, including bytes already buffered.
struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(inner: R, leftover: Vec<u8>, max_payload: u64) -> Self {
        let mut decoder = FrameDecoder::with_max_payload(max_payload);
        decoder.push(&leftover);
        Self {
            inner,
            decoder,
            buf: vec![0u8; READ_CHUNK],
        }
    }

    fn set_max_payload(&mut self, max_payload: u64) {
        self.decoder.set_max_payload(max_payload);
    }

    /// Next complete frame, or `None` on EOF.
    async fn next_frame(&mut self) -> ProxyResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.push(&self.buf[..n]);
        }
    }
}

async fn send_frame<W>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(opcode, payload)).await?;
    writer.flush().await?;
    Ok(())
}

fn close_payload(code: u16) -> [u8; 2] {
    code.to_be_bytes()
}

/// Status code for the final Close frame.
///
/// A session that never reached `Bridging` gets a bare Close: the teardown is
/// the only signal a rejected init receives.
fn close_code(reached: SessionState, outcome: &ProxyResult<BridgeEnd>) -> Option<u16> {
    if reached != SessionState::Bridging {
        return None;
    }
    Some(match outcome {
        Ok(_) => CLOSE_NORMAL,
        Err(ProxyError::Protocol(_)) => CLOSE_PROTOCOL_ERROR,
        Err(_) => CLOSE_INTERNAL_ERROR,
    })
}

pub struct TunnelSession<S> {
    id: u64,
    state: SessionState,
    reader: FrameReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    policy: Arc<TargetPolicyEnforcer>,
    config: SessionConfig,
    target: Option<String>,
    bytes_to_target: u64,
    bytes_to_client: u64,
}

impl<S> TunnelSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// `leftover` holds bytes the client sent right after the upgrade request.
    pub fn new(
        id: u64,
        client: S,
        leftover: Vec<u8>,
        policy: Arc<TargetPolicyEnforcer>,
        config: SessionConfig,
    ) -> Self {
        let (read_half, writer) = tokio::io::split(client);
        Self {
            id,
            state: SessionState::AwaitingInit,
            reader: FrameReader::new(
                read_half,
                leftover,
                config.max_frame_size.min(MAX_INIT_BYTES as u64),
            ),
            writer,
            policy,
            config,
            target: None,
            bytes_to_target: 0,
            bytes_to_client: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> SessionSummary {
        let init_timeout = self.config.init_timeout;
        let outcome = match timeout(init_timeout, self.establish()).await {
            Ok(Ok(target)) => self.bridge(target).await,
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProxyError::Protocol(format!(
                "no tunnel established within {}ms",
                init_timeout.as_millis()
            ))),
        };

        let reached = self.state;
        if !matches!(outcome, Ok(BridgeEnd::TargetClosed)) {
            let payload = close_code(reached, &outcome).map(close_payload);
            let payload = payload.as_ref().map_or(&[][..], |p| &p[..]);
            let _ = send_frame(&mut self.writer, Opcode::Close, payload).await;
        }
        let _ = self.writer.shutdown().await;
        self.state = SessionState::Closed;

        match &outcome {
            Ok(end) => info!(
                session = self.id,
                target = self.target.as_deref().unwrap_or("-"),
                to_target = self.bytes_to_target,
                to_client = self.bytes_to_client,
                ?end,
                "session closed"
            ),
            Err(e) => warn!(
                session = self.id,
                state = ?reached,
                code = e.code(),
                error = %e,
                "session failed"
            ),
        }

        SessionSummary {
            id: self.id,
            reached,
            target: self.target,
            bytes_to_target: self.bytes_to_target,
            bytes_to_client: self.bytes_to_client,
            outcome,
        }
    }

    /// AwaitingInit and Connecting. Returns the dialed target once the ack is out.
    async fn establish(&mut self) -> ProxyResult<TcpStream> {
        let init = self.await_init().await?;
        self.policy.check_target(&init)?;

        self.state = SessionState::Connecting;
        let target = init.target();
        debug!(session = self.id, %target, "dialing target");
        let stream = TcpStream::connect((init.host.as_str(), init.port))
            .await
            .map_err(|e| ProxyError::Transport(format!("connect {target}: {e}")))?;
        let _ = stream.set_nodelay(true);

        let ack = serde_json::to_vec(&ConnectedAck::connected(&init))?;
        send_frame(&mut self.writer, Opcode::Text, &ack).await?;

        self.state = SessionState::Bridging;
        self.reader.set_max_payload(self.config.max_frame_size);
        info!(session = self.id, %target, "tunnel connected");
        self.target = Some(target);
        Ok(stream)
    }

    async fn await_init(&mut self) -> ProxyResult<InitRequest> {
        loop {
            let frame = self
                .reader
                .next_frame()
                .await?
                .ok_or_else(|| ProxyError::Protocol("client closed before init".into()))?;
            if !frame.fin {
                return Err(ProxyError::Protocol("fragmented frame".into()));
            }
            match frame.opcode {
                Opcode::Ping => {
                    send_frame(&mut self.writer, Opcode::Pong, &frame.payload).await?;
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    return Err(ProxyError::Protocol("client closed before init".into()));
                }
                Opcode::Text => return InitRequest::parse(&frame.payload),
                Opcode::Binary | Opcode::Continuation => {
                    return Err(ProxyError::InvalidInit(
                        "first data frame must be a text init message".into(),
                    ));
                }
            }
        }
    }

    async fn bridge(&mut self, target: TcpStream) -> ProxyResult<BridgeEnd> {
        let (mut target_read, mut target_write) = target.into_split();
        let (pong_tx, mut pong_rx) = mpsc::channel::<Vec<u8>>(16);

        let end = tokio::select! {
            r = pump_client(&mut self.reader, &mut target_write, &pong_tx, &mut self.bytes_to_target) => r,
            r = pump_target(&mut target_read, &mut self.writer, &mut pong_rx, &mut self.bytes_to_client) => r,
        };

        let _ = target_write.shutdown().await;
        end
    }
}

/// Client frames to target bytes. Pings are handed to the outbound side.
async fn pump_client<R, W>(
    reader: &mut FrameReader<R>,
    target: &mut W,
    pong_tx: &mpsc::Sender<Vec<u8>>,
    bytes: &mut u64,
) -> ProxyResult<BridgeEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(frame) = reader.next_frame().await? else {
            return Ok(BridgeEnd::ClientGone);
        };
        if !frame.fin {
            return Err(ProxyError::Protocol("fragmented frame".into()));
        }
        match frame.opcode {
            Opcode::Binary => {
                target.write_all(&frame.payload).await?;
                *bytes += frame.payload.len() as u64;
            }
            Opcode::Ping => {
                if pong_tx.send(frame.payload).await.is_err() {
                    return Ok(BridgeEnd::TargetClosed);
                }
            }
            Opcode::Close => return Ok(BridgeEnd::ClientClosed),
            Opcode::Text | Opcode::Pong | Opcode::Continuation => {
                debug!(opcode = ?frame.opcode, "ignoring frame while bridging");
            }
        }
    }
}

/// Target bytes to binary frames, interleaved with queued pongs.
async fn pump_target<R, W>(
    target: &mut R,
    client: &mut W,
    pong_rx: &mut mpsc::Receiver<Vec<u8>>,
    bytes: &mut u64,
) -> ProxyResult<BridgeEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = target.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    send_frame(client, Opcode::Close, &close_payload(CLOSE_NORMAL)).await?;
                    return Ok(BridgeEnd::TargetClosed);
                }
                send_frame(client, Opcode::Binary, &buf[..n]).await?;
                *bytes += n as u64;
            }
            Some(payload) = pong_rx.recv() => {
                send_frame(client, Opcode::Pong, &payload).await?;
            }
        }
    }
}
