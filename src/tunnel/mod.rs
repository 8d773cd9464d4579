//! Tunnel endpoints: the client with its local proxy, and the server.
//!
//! # Paths
//!
//! | Path | Listener | Purpose |
//! |------|----------|---------|
//! | `/`, `/healthcheck` | server | `200 OK` |
//! | `/ws/rem/relay` | server | relay sessions from clients or browsers |
//! | `/ws/loc/control` | client (browser mode) | the device's control channel |
//! | `/ws/loc/relay` | client (browser mode) | relay sessions opened by the device |
//!
//! # Data Flow
//!
//! ```text
//! proxy client ─► local Relay ─► Session ─► remote Relay ─► CONNECT endpoint ─► destination
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Tunnel client.
pub mod client;

/// Minimal CONNECT endpoint.
pub mod connect;

/// Browser-mode control channel.
pub mod control;

/// Tunnel server.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{Client, ClientHandle};
pub use connect::ConnectEndpoint;
pub use control::ControlChannel;
pub use server::{Server, ServerHandle};

// ============================================================================
// Paths
// ============================================================================

/// Server root, answered as a healthcheck.
pub const ROOT_PATH: &str = "/";

/// Server healthcheck.
pub const HEALTHCHECK_PATH: &str = "/healthcheck";

/// Relay sessions accepted by the server.
pub const REMOTE_RELAY_PATH: &str = "/ws/rem/relay";

/// Control channel accepted by a browser-mode client.
pub const LOCAL_CONTROL_PATH: &str = "/ws/loc/control";

/// Relay sessions accepted by a browser-mode client.
pub const LOCAL_RELAY_PATH: &str = "/ws/loc/relay";

// ============================================================================
// Tests
// ============================================================================
