//! Server-side upgrade adapter
//!
//! [`Acceptor::accept`] performs the HTTP/1.1 WebSocket upgrade on an
//! incoming stream: request validation, origin allow-list enforcement,
//! `permessage-deflate` negotiation and the `Sec-WebSocket-Accept` digest,
//! then hands the stream to a server-side [`Connection`].

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::connection::{Connection, Flags};
use crate::error::{Error, Result};
use crate::handshake::{
    accept_key, build_forbidden, build_response, offers_deflate, origin_allowed, parse_request,
    MAX_HTTP_HEADER_SIZE,
};
use crate::socket::Duplex;
use crate::Options;

/// Accepts WebSocket upgrades on incoming streams
///
/// # Example
///
/// ```ignore
/// use riptide_ws::{Acceptor, Options};
/// use tokio::net::TcpListener;
///
/// let listener = TcpListener::bind("0.0.0.0:9001").await?;
/// let acceptor = Acceptor::new(Options::default());
///
/// while let Ok((stream, peer)) = listener.accept().await {
///     let conn = acceptor.accept(stream, Some(peer)).await?;
///     // drive conn...
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Acceptor {
    options: Options,
}

impl Acceptor {
    /// Create an acceptor with the given options
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    /// The acceptor's options
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Accept a WebSocket upgrade on `stream`
    ///
    /// Validates the request (GET, `Connection: Upgrade`,
    /// `Upgrade: websocket`, version 13, a key decoding to 16 bytes),
    /// enforces the origin allow-list (a mismatch answers `403 Forbidden`
    /// and fails the accept), negotiates `permessage-deflate` when offered
    /// and permitted, and answers `101` with the accept digest.
    pub async fn accept<S>(&self, mut stream: S, peer: Option<SocketAddr>) -> Result<Connection<S>>
    where
        S: Duplex + 'static,
    {
        use tokio::io::AsyncWriteExt;

        let mut buf = BytesMut::with_capacity(4096);

        loop {
            if buf.len() > MAX_HTTP_HEADER_SIZE {
                return Err(Error::Handshake("request too large"));
            }

            let read = stream.read_buf(&mut buf).await?;
            if read == 0 {
                return Err(Error::Handshake("stream closed during handshake"));
            }

            let (request, consumed) = match parse_request(&buf)? {
                Some(parsed) => parsed,
                None => continue,
            };

            if !origin_allowed(&self.options.allowed_origins, request.origin) {
                debug!(origin = ?request.origin, "origin not allowed, refusing upgrade");
                stream.write_all(&build_forbidden()).await?;
                stream.flush().await?;
                return Err(Error::Handshake("origin not allowed"));
            }

            let deflate =
                self.options.enable_message_compression && offers_deflate(request.extensions);
            let accept = accept_key(request.key);

            debug!(
                path = request.path,
                deflate,
                peer = ?peer,
                "accepting websocket upgrade"
            );

            let response = build_response(&accept, request.protocol, deflate);
            stream.write_all(&response).await?;
            stream.flush().await?;

            // Frames may already trail the request bytes.
            let leftover = if consumed < buf.len() {
                buf.split_off(consumed).freeze()
            } else {
                Bytes::new()
            };

            return Ok(Connection::from_upgraded(
                stream,
                Flags {
                    server: true,
                    deflate,
                },
                self.options.max_message_size,
                leftover,
                peer,
            ));
        }
    }

    /// Serve WebSocket connections from a TCP listener
    ///
    /// Accepts connections, performs the upgrade and spawns `handler` for
    /// each successful one. Failed upgrades are logged and dropped.
    ///
    /// # Example
    ///
    /// ```ignore
    /// acceptor.serve(listener, |conn| async move {
    ///     while let Ok(Some(msg)) = conn.recv().await {
    ///         conn.send_binary(msg.as_bytes()).await;
    ///     }
    /// }).await;
    /// ```
    pub async fn serve<F, Fut>(&self, listener: tokio::net::TcpListener, handler: F)
    where
        F: Fn(Connection<tokio::net::TcpStream>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(addr = ?listener.local_addr().ok(), "websocket listener started");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    debug!(error = %err, "listener accept failed");
                    continue;
                }
            };

            match self.accept(stream, Some(peer)).await {
                Ok(conn) => {
                    tokio::spawn(handler(conn));
                }
                Err(err) => {
                    debug!(%peer, error = %err, "upgrade failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const UPGRADE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n";

    async fn read_response_head(
        stream: &mut (impl tokio::io::AsyncRead + Unpin),
    ) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn accept_computes_rfc_digest() {
        let (server_io, mut client_io) = tokio::io::duplex(64 * 1024);
        let acceptor = Acceptor::new(Options::default());

        let accept_task =
            tokio::spawn(async move { acceptor.accept(server_io, None).await });

        client_io
            .write_all(format!("{}\r\n", UPGRADE_REQUEST).as_bytes())
            .await
            .unwrap();

        let response = read_response_head(&mut client_io).await;
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(!response.contains("Sec-WebSocket-Extensions"));

        let conn = accept_task.await.unwrap().unwrap();
        assert!(conn.flags().server);
        assert!(!conn.flags().deflate);
    }

    #[tokio::test]
    async fn accept_negotiates_deflate_when_enabled() {
        let (server_io, mut client_io) = tokio::io::duplex(64 * 1024);
        let acceptor = Acceptor::new(
            Options::builder()
                .enable_message_compression(true)
                .build(),
        );

        let accept_task =
            tokio::spawn(async move { acceptor.accept(server_io, None).await });

        client_io
            .write_all(
                format!(
                    "{}Sec-WebSocket-Extensions: permessage-deflate\r\n\r\n",
                    UPGRADE_REQUEST
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let response = read_response_head(&mut client_io).await;
        assert!(response.contains("Sec-WebSocket-Extensions: permessage-deflate"));

        let conn = accept_task.await.unwrap().unwrap();
        assert!(conn.flags().deflate);
    }

    #[tokio::test]
    async fn deflate_offer_ignored_when_disabled() {
        let (server_io, mut client_io) = tokio::io::duplex(64 * 1024);
        let acceptor = Acceptor::new(Options::default());

        let accept_task =
            tokio::spawn(async move { acceptor.accept(server_io, None).await });

        client_io
            .write_all(
                format!(
                    "{}Sec-WebSocket-Extensions: permessage-deflate\r\n\r\n",
                    UPGRADE_REQUEST
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let response = read_response_head(&mut client_io).await;
        assert!(!response.contains("Sec-WebSocket-Extensions"));

        let conn = accept_task.await.unwrap().unwrap();
        assert!(!conn.flags().deflate);
    }

    #[tokio::test]
    async fn origin_mismatch_answers_403() {
        let (server_io, mut client_io) = tokio::io::duplex(64 * 1024);
        let acceptor = Acceptor::new(
            Options::builder()
                .allowed_origin("https://www.websocket.org")
                .build(),
        );

        let accept_task =
            tokio::spawn(async move { acceptor.accept(server_io, None).await });

        client_io
            .write_all(
                format!("{}Origin: https://evil.example\r\n\r\n", UPGRADE_REQUEST).as_bytes(),
            )
            .await
            .unwrap();

        let response = read_response_head(&mut client_io).await;
        assert!(response.starts_with("HTTP/1.1 403"));

        assert!(accept_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn allowed_origin_upgrades() {
        let (server_io, mut client_io) = tokio::io::duplex(64 * 1024);
        let acceptor = Acceptor::new(
            Options::builder()
                .allowed_origin("https://www.websocket.org")
                .build(),
        );

        let accept_task =
            tokio::spawn(async move { acceptor.accept(server_io, None).await });

        client_io
            .write_all(
                format!("{}Origin: https://WWW.websocket.ORG\r\n\r\n", UPGRADE_REQUEST).as_bytes(),
            )
            .await
            .unwrap();

        let response = read_response_head(&mut client_io).await;
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(accept_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn invalid_key_rejected() {
        let (server_io, mut client_io) = tokio::io::duplex(64 * 1024);
        let acceptor = Acceptor::new(Options::default());

        let accept_task =
            tokio::spawn(async move { acceptor.accept(server_io, None).await });

        client_io
            .write_all(
                b"GET / HTTP/1.1\r\n\
                Host: x\r\n\
                Upgrade: websocket\r\n\
                Connection: Upgrade\r\n\
                Sec-WebSocket-Key: c2hvcnQ=\r\n\
                Sec-WebSocket-Version: 13\r\n\
                \r\n",
            )
            .await
            .unwrap();

        assert!(accept_task.await.unwrap().is_err());
    }
}
