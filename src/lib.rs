//! # Riptide-WS: WebSocket protocol engine
//!
//! An RFC 6455 WebSocket endpoint library built around a zero-copy protocol
//! engine, with optional `permessage-deflate` (RFC 7692) message compression
//! in context-takeover mode.
//!
//! ## Design
//!
//! - **Pooled buffers**: outgoing messages are assembled into chains of
//!   pooled 8KB segments with the frame header written in place into a
//!   reserved prefix, so a send is framed without copying the payload.
//! - **Streaming compression**: user bytes are pushed through a single
//!   per-connection deflate stream; the RFC 7692 `00 00 FF FF` trailer is
//!   stripped on send and re-appended on receive.
//! - **Serialized sends**: each connection serializes sends through a FIFO
//!   async lock, so bytes of two messages never interleave on the wire.
//! - **Upgrade adapters**: a server-side [`Acceptor`] validating the HTTP
//!   upgrade (origin allow-list included) and a client-side [`connect`]
//!   performing the `Sec-WebSocket-Key` exchange.
//!
//! ## Example
//!
//! ```ignore
//! use riptide_ws::{Acceptor, Options};
//! use tokio::net::TcpListener;
//!
//! let listener = TcpListener::bind("0.0.0.0:9001").await?;
//! let acceptor = Acceptor::new(Options::builder().enable_message_compression(true).build());
//!
//! while let Ok((stream, peer)) = listener.accept().await {
//!     let conn = acceptor.accept(stream, Some(peer)).await?;
//!     tokio::spawn(async move {
//!         while let Ok(Some(msg)) = conn.recv().await {
//!             conn.send_binary(msg.as_bytes()).await;
//!         }
//!     });
//! }
//! ```

pub mod client;
pub mod connection;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod handshake;
mod id;
pub mod mask;
pub mod pool;
pub mod recv;
pub mod send;
pub mod server;
pub mod socket;

pub use client::{connect, connect_with_options};
pub use connection::{Connection, ConnectionState, Flags, Message};
pub use error::{CloseCode, Error, Result};
pub use frame::{FrameHeader, OpCode};
pub use server::Acceptor;

/// Pooled segment size. Rents sized for user hints are raised to
/// `max(SEGMENT_SIZE, hint + MAX_HEADER_SIZE)`.
pub const SEGMENT_SIZE: usize = 8192;

/// Maximum WebSocket frame header size (2 base + 8 extended length + 4 mask)
pub const MAX_HEADER_SIZE: usize = 14;

/// Largest payload encodable with a 7-bit length (2-byte header)
pub const SMALL_PAYLOAD_MAX: usize = 125;

/// Largest payload encodable with a 16-bit extended length (4-byte header)
pub const MEDIUM_PAYLOAD_MAX: usize = 65535;

/// Maximum control frame payload per RFC 6455 §5.5
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket GUID for the accept-key digest
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Configuration for WebSocket endpoints
///
/// Shared by the server [`Acceptor`] and the client [`connect`] call; the
/// `headers` and `host` fields only apply to the client side.
///
/// # Example
///
/// ```
/// use riptide_ws::Options;
///
/// let options = Options::builder()
///     .enable_message_compression(true)
///     .allowed_origin("https://www.websocket.org")
///     .max_message_size(16 * 1024 * 1024)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Negotiate `permessage-deflate` (default: false)
    pub enable_message_compression: bool,
    /// Case-insensitive Origin allow-list; empty means allow all
    pub allowed_origins: Vec<String>,
    /// Maximum assembled message size (default: `i32::MAX`)
    pub max_message_size: usize,
    /// Extra request headers (client only, case-insensitive keys)
    pub headers: Vec<(String, String)>,
    /// Host header override (client only)
    pub host: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable_message_compression: false,
            allowed_origins: Vec::new(),
            max_message_size: i32::MAX as usize,
            headers: Vec::new(),
            host: None,
        }
    }
}

impl Options {
    /// Create a new options builder
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }
}

/// Builder for endpoint [`Options`]
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self {
            options: Options::default(),
        }
    }

    /// Negotiate `permessage-deflate` when the peer offers it
    pub fn enable_message_compression(mut self, enabled: bool) -> Self {
        self.options.enable_message_compression = enabled;
        self
    }

    /// Add an allowed Origin value; an empty allow-list admits every origin
    pub fn allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.options.allowed_origins.push(origin.into());
        self
    }

    /// Set the maximum assembled message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.options.max_message_size = size;
        self
    }

    /// Append an extra handshake request header (client only)
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.push((name.into(), value.into()));
        self
    }

    /// Override the Host header (client only)
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.options.host = Some(host.into());
        self
    }

    /// Build the options
    pub fn build(self) -> Options {
        self.options
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{Connection, Message};
    pub use crate::error::{CloseCode, Error, Result};
    pub use crate::server::Acceptor;
    pub use crate::Options;
}
