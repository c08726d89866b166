// =============================================================================
// WebSocket frame encode/decode for the client-facing server.
// =============================================================================
//
// Grounded in `WebSocketServer.cpp::sendFrame`/`sessionLoop`: manual header
// parsing with the 126/127 extended-length escape, mandatory client-to-server
// masking, and the 1 MiB payload cap. Unlike the outbound exchange client
// (`exchange/ws.rs`, which delegates wire handling to tokio-tungstenite),
// this side of the protocol is explicitly in scope for a hand-rolled
// implementation.
// =============================================================================

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_byte(byte: u8) -> Option<Opcode> {
        Some(match byte {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => return None,
        })
    }

    fn to_byte(self) -> u8 {
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

#[derive(Debug)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Reads exactly one frame off `reader`. Unmasked client frames and frames
/// whose declared length exceeds [`MAX_PAYLOAD_LEN`] are rejected outright —
/// callers must close the session on either error, not attempt to resync.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let opcode_bits = header[0] & 0x0F;
    let Some(opcode) = Opcode::from_byte(opcode_bits) else {
        bail!("unsupported opcode {opcode_bits:#x}");
    };

    let masked = header[1] & 0x80 != 0;
    if !masked {
        bail!("client frame must be masked");
    }

    let len_bits = header[1] & 0x7F;
    let payload_len: usize = match len_bits {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };

    if payload_len > MAX_PAYLOAD_LEN {
        bail!("frame payload {payload_len} exceeds cap {MAX_PAYLOAD_LEN}");
    }

    let mut mask_key = [0u8; 4];
    reader.read_exact(&mut mask_key).await?;

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }

    Ok(Frame { opcode, payload })
}

/// Encodes a server-to-client frame. Server frames are never masked.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode.to_byte()); // FIN=1, single-frame messages only

    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

pub fn encode_text(payload: &str) -> Vec<u8> {
    encode_frame(Opcode::Text, payload.as_bytes())
}

pub fn encode_pong(payload: &[u8]) -> Vec<u8> {
    encode_frame(Opcode::Pong, payload)
}

pub fn encode_ping(payload: &[u8]) -> Vec<u8> {
    encode_frame(Opcode::Ping, payload)
}

/// Close frame body is a 2-byte code followed by a UTF-8 reason, truncated to
/// 123 bytes so the whole payload stays under the 125-byte control-frame cap.
pub fn encode_close(code: u16, reason: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + reason.len().min(123));
    body.extend_from_slice(&code.to_be_bytes());
    let truncated = truncate_utf8(reason, 123);
    body.extend_from_slice(truncated.as_bytes());
    encode_frame(Opcode::Close, &body)
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await?;
    Ok(())
}
