//! wsbridge - TCP relay tunneled over pooled, reusable WebSocket sessions.
//!
//! A local HTTPS proxy accepts TCP connections, binds each one to a
//! WebSocket session taken from a pool, and a remote server terminates the
//! session onto a CONNECT endpoint. Sessions are returned to the pool after
//! a clean `unbind` handshake, so one WebSocket carries many TCP connections
//! over its lifetime.
//!
//! # Architecture
//!
//! - **Client (local end)**: proxy listener, [`SessionPool`], local relays
//! - **Server (remote end)**: WebSocket acceptor, remote relays, CONNECT endpoint
//! - **Browser mode**: a device connects a control channel to the client and
//!   opens relay sessions to the server on the client's behalf
//!
//! Key design principles:
//!
//! - Each [`Relay`] is confined to the task that owns its TCP stream
//! - A session is bound to at most one relay at a time
//! - Backpressure pauses TCP reads between two watermarks
//!
//! # Quick Start
//!
//! ```no_run
//! use wsbridge::{Client, ClientConfig, Result, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::start(ServerConfig::new().with_listen("127.0.0.1", 0)).await?;
//!
//!     let url: url::Url = format!("ws://{}", server.ws_addr()).parse()?;
//!     let client = Client::start(ClientConfig::direct(url)).await?;
//!     let proxy = client.ready().await?;
//!     println!("HTTPS proxy listening on {proxy}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Client, server, pool and relay settings |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Log-correlation signatures |
//! | [`protocol`] | WebSocket framing and control messages |
//! | [`relay`] | TCP-to-session binding |
//! | [`transport`] | Sessions, pool, acceptor and connector |
//! | [`tunnel`] | Client and server endpoints |

// ============================================================================
// Modules
// ============================================================================

/// Client, server, pool and relay settings.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Signatures used to correlate log lines.
pub mod identifiers;

/// WebSocket wire protocol.
///
/// Frame codec, opening handshake and the text control messages.
pub mod protocol;

/// Binding of TCP streams to sessions.
pub mod relay;

/// WebSocket transport layer.
///
/// Session handles, the session pool, and the inbound and outbound
/// connection machinery.
pub mod transport;

/// Tunnel client and server.
pub mod tunnel;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{ClientConfig, Mode, PoolConfig, RelayConfig, ServerConfig};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::Signature;

// Relay types
pub use relay::{Backpressure, CloseReason, Completion, Relay, Side, Transition};

// Transport types
pub use transport::{
    ClientSession, CloseInfo, Session, SessionEvent, SessionPool, SessionState,
};

// Tunnel types
pub use tunnel::{
    Client, ClientHandle, ConnectEndpoint, ControlChannel, Server, ServerHandle,
};
