//! Client-side upgrade adapter
//!
//! [`connect`] resolves the host, opens a TCP connection with `NODELAY`
//! (wrapping it in TLS for `wss`), performs the `Sec-WebSocket-Key`
//! exchange and hands the stream to a client-side [`Connection`].
//! [`connect_stream`] runs the same handshake over a caller-provided
//! stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use crate::connection::{Connection, Flags};
use crate::error::{Error, Result};
use crate::handshake::{
    accept_key, build_request, generate_key, parse_response, MAX_HTTP_HEADER_SIZE,
};
use crate::socket::Duplex;
use crate::Options;

/// A client transport: plain TCP or TLS over TCP
pub enum MaybeTlsStream {
    /// Plain TCP (`ws`)
    Plain(TcpStream),
    /// TLS over TCP (`wss`)
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

struct ParsedUrl {
    secure: bool,
    host: String,
    port: u16,
    path: String,
}

fn parse_url(url: &str) -> Result<ParsedUrl> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or(Error::Handshake("URL missing scheme"))?;

    let (secure, default_port) = match scheme {
        "ws" => (false, 80),
        "wss" => (true, 443),
        _ => return Err(Error::Handshake("URL scheme must be ws or wss")),
    };

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::Handshake("invalid port in URL"))?;
            (host, port)
        }
        None => (authority, default_port),
    };

    if host.is_empty() {
        return Err(Error::Handshake("URL missing host"));
    }

    Ok(ParsedUrl {
        secure,
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Resolve the host and try each address in order
async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let addrs = lookup_host((host, port)).await.map_err(Error::Io)?;

    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(Error::Io)?;
                return Ok(stream);
            }
            Err(err) => {
                debug!(%addr, error = %err, "address attempt failed");
                last = Some(err);
            }
        }
    }

    Err(Error::NoUsableAddress { last })
}

#[cfg(feature = "tls")]
async fn wrap_tls(stream: TcpStream, host: &str) -> Result<MaybeTlsStream> {
    use std::sync::Arc;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::Handshake("host is not a valid TLS server name"))?;

    let tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(Error::Io)?;

    Ok(MaybeTlsStream::Tls(Box::new(tls)))
}

#[cfg(not(feature = "tls"))]
async fn wrap_tls(_stream: TcpStream, _host: &str) -> Result<MaybeTlsStream> {
    Err(Error::Handshake("wss requires the `tls` feature"))
}

/// Connect to a `ws://` or `wss://` URL with default options
pub async fn connect(url: &str) -> Result<Connection<MaybeTlsStream>> {
    connect_with_options(url, Options::default()).await
}

/// Connect to a `ws://` or `wss://` URL
pub async fn connect_with_options(
    url: &str,
    options: Options,
) -> Result<Connection<MaybeTlsStream>> {
    let parsed = parse_url(url)?;

    let tcp = connect_tcp(&parsed.host, parsed.port).await?;

    let stream = if parsed.secure {
        wrap_tls(tcp, &parsed.host).await?
    } else {
        MaybeTlsStream::Plain(tcp)
    };

    let default_port = if parsed.secure { 443 } else { 80 };
    let host_header = match &options.host {
        Some(host) => host.clone(),
        None if parsed.port == default_port => parsed.host.clone(),
        None => format!("{}:{}", parsed.host, parsed.port),
    };

    connect_stream(stream, &host_header, &parsed.path, options).await
}

/// Perform the client handshake over an already-connected stream
///
/// Emits the upgrade request (mandatory headers, optional
/// `permessage-deflate` offer, user headers), validates the response —
/// status 101, exact `Connection`/`Upgrade`/`Sec-WebSocket-Accept` values
/// with duplicates refused, a status of 400 or above surfacing as
/// [`Error::HandshakeRefused`] — and returns a client-side connection.
pub async fn connect_stream<S>(
    mut stream: S,
    host: &str,
    path: &str,
    options: Options,
) -> Result<Connection<S>>
where
    S: Duplex + 'static,
{
    let key = generate_key();
    let request = build_request(
        host,
        path,
        &key,
        options.enable_message_compression,
        &options.headers,
    );

    stream.write_all(&request).await?;
    stream.flush().await?;

    let expected = accept_key(&key);
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if buf.len() > MAX_HTTP_HEADER_SIZE {
            return Err(Error::Handshake("response too large"));
        }

        let read = stream.read_buf(&mut buf).await?;
        if read == 0 {
            return Err(Error::Handshake("stream closed during handshake"));
        }

        let (response, consumed) = match parse_response(&buf, &expected)? {
            Some(parsed) => parsed,
            None => continue,
        };

        let deflate = options.enable_message_compression && response.deflate;
        debug!(host, path, deflate, "websocket handshake complete");

        let leftover = if consumed < buf.len() {
            buf.split_off(consumed).freeze()
        } else {
            Bytes::new()
        };

        return Ok(Connection::from_upgraded(
            stream,
            Flags {
                server: false,
                deflate,
            },
            options.max_message_size,
            leftover,
            None,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Acceptor;

    #[test]
    fn url_parsing() {
        let parsed = parse_url("ws://example.com/chat").unwrap();
        assert!(!parsed.secure);
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.path, "/chat");

        let parsed = parse_url("wss://example.com:8443").unwrap();
        assert!(parsed.secure);
        assert_eq!(parsed.port, 8443);
        assert_eq!(parsed.path, "/");

        assert!(parse_url("http://example.com/").is_err());
        assert!(parse_url("example.com").is_err());
        assert!(parse_url("ws:///nohost").is_err());
    }

    #[tokio::test]
    async fn handshake_against_acceptor() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let acceptor = Acceptor::new(Options::default());
        let server_task =
            tokio::spawn(async move { acceptor.accept(server_io, None).await });

        let conn = connect_stream(client_io, "example.com", "/chat", Options::default())
            .await
            .unwrap();
        assert!(!conn.flags().server);
        assert!(!conn.flags().deflate);

        let server_conn = server_task.await.unwrap().unwrap();
        assert!(server_conn.flags().server);
    }

    #[tokio::test]
    async fn handshake_negotiates_deflate() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let options = Options::builder().enable_message_compression(true).build();
        let acceptor = Acceptor::new(options.clone());
        let server_task =
            tokio::spawn(async move { acceptor.accept(server_io, None).await });

        let conn = connect_stream(client_io, "example.com", "/", options)
            .await
            .unwrap();
        assert!(conn.flags().deflate);
        assert!(server_task.await.unwrap().unwrap().flags().deflate);
    }

    #[tokio::test]
    async fn origin_rejection_surfaces_status() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let acceptor = Acceptor::new(
            Options::builder()
                .allowed_origin("https://www.websocket.org")
                .build(),
        );
        tokio::spawn(async move {
            let _ = acceptor.accept(server_io, None).await;
        });

        let options = Options::builder()
            .header("Origin", "https://evil.example")
            .build();
        let err = connect_stream(client_io, "example.com", "/", options)
            .await
            .unwrap_err();

        match err {
            Error::HandshakeRefused { status } => assert_eq!(status, 403),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connects_over_tcp_loopback() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let acceptor = Acceptor::new(Options::default());
            let (stream, peer) = listener.accept().await.unwrap();
            if let Ok(conn) = acceptor.accept(stream, Some(peer)).await {
                while let Ok(Some(msg)) = conn.recv().await {
                    conn.send_binary(msg.as_bytes()).await;
                }
            }
        });

        let conn = connect(&format!("ws://{}/echo", addr)).await.unwrap();
        assert!(conn.send_text("over tcp").await);
        let msg = conn.recv().await.unwrap().unwrap();
        assert_eq!(msg.as_bytes(), b"over tcp");
    }
}
