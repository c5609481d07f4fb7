//! HTTP upgrade plumbing shared by the server and client adapters
//!
//! Request/response parsing is `httparse`-based; the accept digest is
//! `Base64(SHA-1(key + GUID))` per RFC 6455 §4.2.2.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::WS_GUID;

/// Maximum HTTP header block size accepted on either side
pub const MAX_HTTP_HEADER_SIZE: usize = 8192;

/// A parsed WebSocket upgrade request (server side)
#[derive(Debug)]
pub struct UpgradeRequest<'a> {
    /// Request path
    pub path: &'a str,
    /// `Sec-WebSocket-Key` value
    pub key: &'a str,
    /// `Sec-WebSocket-Protocol` value, if present
    pub protocol: Option<&'a str>,
    /// `Sec-WebSocket-Extensions` value, if present
    pub extensions: Option<&'a str>,
    /// `Origin` value, if present
    pub origin: Option<&'a str>,
}

/// Parse and validate a WebSocket upgrade request
///
/// Returns the parsed request and the number of bytes consumed, or `None`
/// while the header block is still incomplete. The key is checked to
/// Base64-decode to exactly 16 bytes.
pub fn parse_request(buf: &[u8]) -> Result<Option<(UpgradeRequest<'_>, usize)>> {
    if buf.len() > MAX_HTTP_HEADER_SIZE {
        return Err(Error::Handshake("request too large"));
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::Handshake("malformed HTTP request")),
    };

    if req.method != Some("GET") {
        return Err(Error::Handshake("method must be GET"));
    }

    let mut key = None;
    let mut version = None;
    let mut protocol = None;
    let mut extensions = None;
    let mut origin = None;
    let mut upgrade = false;
    let mut connection_upgrade = false;

    for header in req.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::Handshake("invalid header value"))?;

        if header.name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value);
        } else if header.name.eq_ignore_ascii_case("sec-websocket-version") {
            version = Some(value);
        } else if header.name.eq_ignore_ascii_case("sec-websocket-protocol") {
            protocol = Some(value);
        } else if header.name.eq_ignore_ascii_case("sec-websocket-extensions") {
            extensions = Some(value);
        } else if header.name.eq_ignore_ascii_case("origin") {
            origin = Some(value);
        } else if header.name.eq_ignore_ascii_case("upgrade") {
            upgrade = value.to_ascii_lowercase().contains("websocket");
        } else if header.name.eq_ignore_ascii_case("connection") {
            connection_upgrade = value.to_ascii_lowercase().contains("upgrade");
        }
    }

    if !upgrade {
        return Err(Error::Handshake("missing Upgrade: websocket"));
    }
    if !connection_upgrade {
        return Err(Error::Handshake("missing Connection: Upgrade"));
    }

    let version = version.ok_or(Error::Handshake("missing Sec-WebSocket-Version"))?;
    if version.trim() != "13" {
        return Err(Error::Handshake("unsupported WebSocket version"));
    }

    let key = key.ok_or(Error::Handshake("missing Sec-WebSocket-Key"))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key.trim())
        .map_err(|_| Error::Handshake("Sec-WebSocket-Key is not Base64"))?;
    if decoded.len() != 16 {
        return Err(Error::Handshake("Sec-WebSocket-Key must decode to 16 bytes"));
    }

    let path = req.path.unwrap_or("/");

    Ok(Some((
        UpgradeRequest {
            path,
            key,
            protocol,
            extensions,
            origin,
        },
        len,
    )))
}

/// Compute the `Sec-WebSocket-Accept` digest for a key
#[inline]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generate a random 16-byte client key, Base64-encoded
pub fn generate_key() -> String {
    let raw: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// Whether an extensions header offers `permessage-deflate`
pub fn offers_deflate(extensions: Option<&str>) -> bool {
    extensions
        .map(|value| {
            value
                .split(',')
                .any(|offer| offer.trim().split(';').next().map(str::trim) == Some("permessage-deflate"))
        })
        .unwrap_or(false)
}

/// Case-insensitive origin allow-list check; an empty list admits all
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match origin {
        Some(origin) => allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)),
        None => false,
    }
}

/// Build the `101 Switching Protocols` upgrade response
pub fn build_response(accept: &str, protocol: Option<&str>, deflate: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(protocol) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(protocol.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if deflate {
        buf.put_slice(b"Sec-WebSocket-Extensions: permessage-deflate\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build a `403 Forbidden` response for an origin mismatch
pub fn build_forbidden() -> Bytes {
    Bytes::from_static(b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
}

/// Build the client upgrade request
pub fn build_request(
    host: &str,
    path: &str,
    key: &str,
    deflate: bool,
    extra_headers: &[(String, String)],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");

    if deflate {
        buf.put_slice(b"Sec-WebSocket-Extensions: permessage-deflate\r\n");
    }

    for (name, value) in extra_headers {
        // Host is emitted above, honoring any override the caller applied.
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// A parsed upgrade response (client side)
#[derive(Debug)]
pub struct UpgradeResponse {
    /// Whether the response negotiated `permessage-deflate`
    pub deflate: bool,
}

/// Parse and validate the server's upgrade response
///
/// `expected_accept` is the digest computed from the key we sent. Exact
/// (case-insensitive) matches are required for `Connection`, `Upgrade`
/// and `Sec-WebSocket-Accept`; a duplicate occurrence of any of the three
/// fails. A status of 400 or above surfaces as a refusal carrying the
/// numeric code.
pub fn parse_response(
    buf: &[u8],
    expected_accept: &str,
) -> Result<Option<(UpgradeResponse, usize)>> {
    if buf.len() > MAX_HTTP_HEADER_SIZE {
        return Err(Error::Handshake("response too large"));
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);

    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::Handshake("malformed HTTP response")),
    };

    let status = res.code.unwrap_or(0);
    if status >= 400 {
        return Err(Error::HandshakeRefused { status });
    }
    if status != 101 {
        return Err(Error::Handshake("expected 101 Switching Protocols"));
    }

    let mut connection = None;
    let mut upgrade = None;
    let mut accept = None;
    let mut extensions = None;

    for header in res.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::Handshake("invalid header value"))?;

        if header.name.eq_ignore_ascii_case("connection") {
            if connection.replace(value).is_some() {
                return Err(Error::Handshake("duplicate Connection header"));
            }
        } else if header.name.eq_ignore_ascii_case("upgrade") {
            if upgrade.replace(value).is_some() {
                return Err(Error::Handshake("duplicate Upgrade header"));
            }
        } else if header.name.eq_ignore_ascii_case("sec-websocket-accept") {
            if accept.replace(value).is_some() {
                return Err(Error::Handshake("duplicate Sec-WebSocket-Accept header"));
            }
        } else if header.name.eq_ignore_ascii_case("sec-websocket-extensions") {
            extensions = Some(value);
        }
    }

    match connection {
        Some(value) if value.trim().eq_ignore_ascii_case("upgrade") => {}
        Some(_) => return Err(Error::Handshake("Connection header is not Upgrade")),
        None => return Err(Error::Handshake("missing Connection header")),
    }

    match upgrade {
        Some(value) if value.trim().eq_ignore_ascii_case("websocket") => {}
        Some(_) => return Err(Error::Handshake("Upgrade header is not websocket")),
        None => return Err(Error::Handshake("missing Upgrade header")),
    }

    match accept {
        Some(value) if value.trim() == expected_accept => {}
        Some(_) => return Err(Error::Handshake("Sec-WebSocket-Accept mismatch")),
        None => return Err(Error::Handshake("missing Sec-WebSocket-Accept header")),
    }

    Ok(Some((
        UpgradeResponse {
            deflate: offers_deflate(extensions),
        },
        len,
    )))
}
