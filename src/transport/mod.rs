//! WebSocket transport layer.
//!
//! Everything that produces, holds or pools [`Session`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   outbound (hand-rolled)   ┌──────────────────┐
//! │  ClientSession   │───────────────────────────►│  remote server   │
//! └────────┬─────────┘                            └──────────────────┘
//!          │ Session
//!          ▼
//! ┌──────────────────┐        acquire/release      ┌──────────────────┐
//! │   SessionPool    │◄───────────────────────────►│      Relay       │
//! └────────▲─────────┘                             └──────────────────┘
//!          │ Session
//! ┌────────┴─────────┐   inbound (tokio-tungstenite)
//! │     Acceptor     │◄──────────────────────────── browser / client
//! └──────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `client` | Outbound sessions over TCP or TLS |
//! | `pool` | Idle session pool with FIFO waiters |
//! | `server` | Inbound acceptor with one-shot dispatch |
//! | `session` | The session handle shared by both backends |

// ============================================================================
// Submodules
// ============================================================================

/// Outbound WebSocket client sessions.
pub mod client;

/// Session pool.
pub mod pool;

/// Inbound WebSocket acceptor.
pub mod server;

/// Session handle.
pub mod session;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::ClientSession;
pub use pool::{DemandReceiver, SessionPool};
pub use server::{Acceptor, Handler, RequestHead, Route};
pub use session::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_PROXY_ERROR, CloseInfo, Session, SessionEvent,
    SessionState,
};
