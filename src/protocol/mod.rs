//! WebSocket wire protocol for the tunnel.
//!
//! This module holds the pieces of RFC 6455 that the crate implements by
//! hand (the client role) plus the text control messages exchanged on top.
//!
//! # Protocol Overview
//!
//! | Piece | Direction | Purpose |
//! |-------|-----------|---------|
//! | Upgrade request | Client → Server | Opening handshake |
//! | Masked frames | Client → Server | Relay bytes and control text |
//! | Unmasked frames | Server → Client | Relay bytes and control text |
//! | `unbind` | both | Release a session for reuse |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `control` | Text control messages |
//! | `frame` | Frame encoding, decoding and masking |
//! | `handshake` | Upgrade request and response verification |

// ============================================================================
// Submodules
// ============================================================================

/// Text control messages.
pub mod control;

/// Frame codec.
pub mod frame;

/// Opening handshake.
pub mod handshake;

// ============================================================================
// Re-exports
// ============================================================================

pub use control::{ControlMessage, UNBIND};
pub use frame::{
    Frame, OpCode, apply_mask, apply_mask_bytewise, decode_frame, encode_frame,
    encode_frame_with_mask,
};
pub use handshake::{
    ResponseHead, accept_key, generate_key, parse_response, upgrade_request,
    verify_handshake_response,
};
