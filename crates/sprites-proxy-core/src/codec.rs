//! RFC 6455 frame codec for the sprites-tcp-proxy-v1 wire.
//!
//! Wire format: `[FIN|RSV|opcode][MASK|len7][ext len 16/64][mask key 4?][payload]`
//!
//! Server-to-client frames are never masked. Client-to-server frames are
//! unmasked on decode. Fragmentation is not part of this protocol version:
//! the decoder reports `fin` as received and the session layer closes on any
//! frame with FIN unset.

use crate::error::{ProxyError, ProxyResult};

/// Largest payload length a frame header may carry (the 64-bit length MSB must be zero).
pub const MAX_PAYLOAD_LEN: u64 = i64::MAX as u64;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProxyError;

    fn try_from(value: u8) -> ProxyResult<Self> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProxyError::Protocol(format!(
                "reserved opcode 0x{other:x}"
            ))),
        }
    }
}

/// A decoded frame. `payload` is always unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// Encode a single unmasked, FIN-set frame.
///
/// Header is 2 bytes for payloads under 126 bytes, 4 bytes under 65536,
/// and 10 bytes otherwise.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(10 + len);
    frame.push(0x80 | opcode.as_u8());

    if len < 126 {
        frame.push(len as u8);
    } else if len < 65536 {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}

/// Encode a masked frame, as a client would send it.
pub fn encode_masked(opcode: Opcode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut frame = encode(opcode, payload);
    let header_len = frame.len() - payload.len();
    frame[1] |= 0x80;
    let mut body = frame.split_off(header_len);
    apply_mask(&mut body, mask, 0);
    frame.extend_from_slice(&mask);
    frame.extend(body);
    frame
}

/// XOR `data` in place with `mask`, where `data[0]` sits at payload position `offset`.
///
/// Masking is an involution: applying the same key at the same offset twice
/// restores the input.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) % 4];
    }
}

/// Parsed fixed + extended header of one frame.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

impl FrameHeader {
    fn total_len(&self) -> usize {
        self.header_len + self.payload_len
    }
}

/// Parse a frame header, returning `Ok(None)` if more bytes are needed.
fn parse_header(buf: &[u8], max_payload: u64) -> ProxyResult<Option<FrameHeader>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(ProxyError::Protocol(
            "non-zero RSV bits without extension".into(),
        ));
    }
    let opcode = Opcode::try_from(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;

    let (mut header_len, payload_len) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (4, u64::from(u16::from_be_bytes([buf[2], buf[3]])))
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            (10, u64::from_be_bytes(len))
        }
        n => (2, u64::from(n)),
    };

    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProxyError::Protocol(format!(
            "frame length {payload_len} exceeds 63 bits"
        )));
    }
    if payload_len > max_payload {
        return Err(ProxyError::Protocol(format!(
            "frame length {payload_len} exceeds limit {max_payload}"
        )));
    }
    let payload_len = usize::try_from(payload_len).map_err(|_| {
        ProxyError::Protocol(format!("frame length {payload_len} not addressable"))
    })?;

    let mask = if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let key = [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ];
        header_len += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(FrameHeader {
        fin,
        opcode,
        mask,
        header_len,
        payload_len,
    }))
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `Ok(None)` if
/// `buf` does not yet hold a complete frame.
pub fn decode_frame(buf: &[u8], max_payload: u64) -> ProxyResult<Option<(Frame, usize)>> {
    let Some(header) = parse_header(buf, max_payload)? else {
        return Ok(None);
    };
    let total = header.total_len();
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[header.header_len..total].to_vec();
    if let Some(mask) = header.mask {
        apply_mask(&mut payload, mask, 0);
    }

    Ok(Some((
        Frame {
            fin: header.fin,
            opcode: header.opcode,
            masked: header.mask.is_some(),
            payload,
        },
        total,
    )))
}

/// Decode every complete frame in `buf`, returning them with the unconsumed tail.
///
/// A trailing partial frame is left in `remaining` so the caller can prepend
/// it to the next read.
pub fn decode(buf: &[u8]) -> ProxyResult<(Vec<Frame>, &[u8])> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while let Some((frame, used)) = decode_frame(&buf[offset..], MAX_PAYLOAD_LEN)? {
        frames.push(frame);
        offset += used;
    }
    Ok((frames, &buf[offset..]))
}

/// Streaming decoder: accumulates bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_payload: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_LEN)
    }

    /// Decoder that rejects any frame whose declared payload exceeds `max_payload` bytes.
    pub fn with_max_payload(max_payload: u64) -> Self {
        Self {
            buffer: Vec::new(),
            max_payload: max_payload.min(MAX_PAYLOAD_LEN),
        }
    }

    /// Feed bytes into the decoder and return all complete frames.
    pub fn feed(&mut self, data: &[u8]) -> ProxyResult<Vec<Frame>> {
        self.push(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Buffer bytes without decoding them.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next complete frame under the current payload limit.
    ///
    /// Frames still buffered are checked against whatever limit is in force
    /// when they are pulled, so a limit change applies to them too.
    pub fn next_frame(&mut self) -> ProxyResult<Option<Frame>> {
        let Some((frame, used)) = decode_frame(&self.buffer, self.max_payload)? else {
            return Ok(None);
        };
        self.buffer.drain(..used);
        Ok(Some(frame))
    }

    pub fn set_max_payload(&mut self, max_payload: u64) {
        self.max_payload = max_payload.min(MAX_PAYLOAD_LEN);
    }

    /// Number of bytes buffered toward an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
