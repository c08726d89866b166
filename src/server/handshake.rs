// =============================================================================
// RFC 6455 opening handshake for the client-facing WebSocket endpoint.
// =============================================================================
//
// Grounded in `WebSocketServer.cpp::performHandshake`/`computeAcceptKey`. The
// magic GUID and accept-key formula are fixed by RFC 6455 §1.3.
// =============================================================================

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Debug)]
pub struct HandshakeRequest {
    pub path: String,
    pub key: String,
}

/// `base64(SHA1(clientKey + GUID))`.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Parses an HTTP/1.1 upgrade request, requiring `Upgrade: websocket`,
/// a `Connection` header mentioning `upgrade`, and a non-empty
/// `Sec-WebSocket-Key`.
pub fn parse_handshake(request: &str) -> Result<HandshakeRequest> {
    let mut lines = request.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("/").to_string();

    let mut has_upgrade = false;
    let mut has_connection_upgrade = false;
    let mut key = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        match name.as_str() {
            "upgrade" => has_upgrade = value.eq_ignore_ascii_case("websocket"),
            "connection" => has_connection_upgrade = value.to_ascii_lowercase().contains("upgrade"),
            "sec-websocket-key" => {
                if !value.is_empty() {
                    key = Some(value.to_string());
                }
            }
            _ => {}
        }
    }

    if !has_upgrade || !has_connection_upgrade {
        bail!("missing or invalid Upgrade/Connection header");
    }
    let Some(key) = key else {
        bail!("missing Sec-WebSocket-Key header");
    };

    Ok(HandshakeRequest { path, key })
}

/// Reads the HTTP request line-by-line off `stream` until the blank line
/// terminator, replies with a 101 Switching Protocols response (or a 400 on
/// any handshake failure, closing the connection either way on error).
pub async fn perform_handshake(stream: &mut TcpStream) -> Result<HandshakeRequest> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    loop {
        if buf.len() > MAX_REQUEST_BYTES {
            bail!("handshake request exceeds {MAX_REQUEST_BYTES} bytes");
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed during handshake");
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let parsed = match parse_handshake(&request) {
        Ok(req) => req,
        Err(err) => {
            let response = "HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
            let _ = stream.write_all(response.as_bytes()).await;
            return Err(err);
        }
    };

    let accept_key = compute_accept_key(&parsed.key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_known_rfc_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parse_handshake_extracts_path_and_key() {
        let request = "GET /ws HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let parsed = parse_handshake(request).unwrap();
        assert_eq!(parsed.path, "/ws");
        assert_eq!(parsed.key, "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn parse_handshake_rejects_missing_upgrade_header() {
        let request = "GET /ws HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade\r\nSec-WebSocket-Key: abc\r\n\r\n";
        assert!(parse_handshake(request).is_err());
    }

    #[test]
    fn parse_handshake_rejects_empty_key() {
        let request = "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: \r\n\r\n";
        assert!(parse_handshake(request).is_err());
    }
}
