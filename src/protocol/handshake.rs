//! WebSocket opening handshake (RFC 6455 section 4).
//!
//! The client side is hand-rolled: key generation, the upgrade request,
//! incremental parsing of the response head and verification of the
//! `Sec-WebSocket-Accept` value. The accept computation is shared with the
//! inbound acceptor, which answers upgrades itself.

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// GUID appended to the key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol version sent in `Sec-WebSocket-Version`.
pub const WEBSOCKET_VERSION: u8 = 13;

/// Maximum number of response headers accepted.
const MAX_HEADERS: usize = 32;

/// Maximum size of a response head before giving up.
pub const MAX_HEAD_SIZE: usize = 8192;

// ============================================================================
// ResponseHead
// ============================================================================

/// Parsed HTTP response head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status code.
    pub status: u16,
    /// Headers in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Returns the first header value whose name matches case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// ============================================================================
// Key Handling
// ============================================================================

/// Generates a `Sec-WebSocket-Key`: base64 of 16 random bytes.
#[must_use]
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::rng().fill_bytes(&mut nonce);
    BASE64_STANDARD.encode(nonce)
}

/// Computes `base64(SHA1(key + GUID))`.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

// ============================================================================
// Request
// ============================================================================

/// Builds the minimal upgrade request.
#[must_use]
pub fn upgrade_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         \r\n"
    )
}

// ============================================================================
// Response
// ============================================================================

/// Parses a response head from the front of `buf`.
///
/// Returns `Ok(None)` until the head is complete, then the head and the
/// number of bytes it used. Bytes after that belong to the WebSocket stream.
///
/// # Errors
///
/// Returns [`Error::HttpParse`] on a malformed head and
/// [`Error::Handshake`] if the head exceeds [`MAX_HEAD_SIZE`].
pub fn parse_response(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(buf)? {
        httparse::Status::Complete(used) => {
            let head = ResponseHead {
                status: response.code.unwrap_or_default(),
                headers: response
                    .headers
                    .iter()
                    .filter(|h| !h.name.is_empty())
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect(),
            };
            Ok(Some((head, used)))
        }
        httparse::Status::Partial if buf.len() >= MAX_HEAD_SIZE => {
            Err(Error::handshake("response head too large"))
        }
        httparse::Status::Partial => Ok(None),
    }
}

/// Verifies the server's handshake response against the request key.
///
/// Requires status `101`, `Connection` containing the `upgrade` token,
/// `Upgrade: websocket` (both case-insensitive), and an exact
/// `Sec-WebSocket-Accept` match.
///
/// # Errors
///
/// Returns [`Error::Handshake`] describing the first mismatch.
pub fn verify_handshake_response(request_key: &str, head: &ResponseHead) -> Result<()> {
    if head.status != 101 {
        return Err(Error::handshake(format!(
            "unexpected status {}",
            head.status
        )));
    }

    let connection_ok = head.header("Connection").is_some_and(|value| {
        value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    });
    if !connection_ok {
        return Err(Error::handshake("missing Connection: Upgrade"));
    }

    let upgrade_ok = head
        .header("Upgrade")
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));
    if !upgrade_ok {
        return Err(Error::handshake("missing Upgrade: websocket"));
    }

    let expected = accept_key(request_key);
    match head.header("Sec-WebSocket-Accept") {
        Some(value) if value.trim() == expected => Ok(()),
        Some(_) => Err(Error::handshake("Sec-WebSocket-Accept mismatch")),
        None => Err(Error::handshake("missing Sec-WebSocket-Accept")),
    }
}

// ============================================================================
// Tests
// ============================================================================
