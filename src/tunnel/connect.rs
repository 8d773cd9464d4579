//! Minimal HTTP CONNECT endpoint used by the tunnel server.
//!
//! Each remote relay connects here and forwards the proxy client's own
//! `CONNECT host:port` request. The endpoint resolves the target, refuses
//! non-public destinations by closing without a response, and otherwise
//! answers `200 Connection Established` and copies bytes both ways.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Time allowed to reach the destination.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest accepted request head.
const MAX_HEAD_SIZE: usize = 8192;

/// Maximum number of request headers.
const MAX_HEADERS: usize = 32;

// ============================================================================
// ConnectEndpoint
// ============================================================================

/// A bound CONNECT listener.
pub struct ConnectEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
    allow_private: bool,
}

impl ConnectEndpoint {
    /// Binds the endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(host: &str, port: u16, allow_private: bool) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, allow_private, "CONNECT endpoint bound");
        Ok(Self {
            listener,
            local_addr,
            allow_private,
        })
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, _)) => {
                        let allow_private = self.allow_private;
                        tokio::spawn(async move {
                            if let Err(e) = handle(stream, allow_private).await {
                                debug!(error = %e, "CONNECT request failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "CONNECT accept failed"),
                }
            }
        })
    }
}

// ============================================================================
// Request Handling
// ============================================================================

async fn handle(mut client: TcpStream, allow_private: bool) -> Result<()> {
    // No head timeout: relays parked on idle sessions hold their
    // connection here until the next CONNECT arrives.
    let (method, target, leftover) = read_request(&mut client).await?;

    if method != "CONNECT" {
        warn!(method = %method, "CONNECT endpoint got a non-CONNECT request");
        client
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        return Ok(());
    }

    let Some((host, port)) = split_authority(&target) else {
        client
            .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        return Ok(());
    };

    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    let refused = addrs.is_empty() || (!allow_private && addrs.iter().any(|a| !is_public(a.ip())));
    if refused {
        // No response: the proxy client only sees a closed connection.
        warn!(target = %target, "CONNECT destination refused");
        return Ok(());
    }

    let mut upstream = match timeout(DIAL_TIMEOUT, TcpStream::connect(addrs.as_slice())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(target = %target, error = %e, "CONNECT destination unreachable");
            client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
            return Ok(());
        }
        Err(_) => {
            warn!(target = %target, "CONNECT destination timed out");
            client
                .write_all(b"HTTP/1.1 504 Gateway Timeout\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
            return Ok(());
        }
    };
    upstream.set_nodelay(true)?;

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    if !leftover.is_empty() {
        upstream.write_all(&leftover).await?;
    }
    info!(target = %target, "CONNECT established");

    let (sent, received) = copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(target = %target, sent, received, "CONNECT finished");
    Ok(())
}

/// Reads one request head; returns method, target and any bytes after it.
async fn read_request(stream: &mut TcpStream) -> Result<(String, String, Vec<u8>)> {
    let mut buf = Vec::with_capacity(512);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::connection("closed before request head"));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf)? {
            httparse::Status::Complete(used) => {
                let method = request.method.unwrap_or_default().to_string();
                let target = request.path.unwrap_or_default().to_string();
                return Ok((method, target, buf.split_off(used)));
            }
            httparse::Status::Partial if buf.len() >= MAX_HEAD_SIZE => {
                return Err(Error::protocol("request head too large"));
            }
            httparse::Status::Partial => {}
        }
    }
}

/// Splits `host:port`, accepting bracketed IPv6 literals.
fn split_authority(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Returns `true` for addresses reachable on the public internet.
fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public(IpAddr::V4(v4)),
            None => {
                !(v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_unique_local()
                    || v6.is_unicast_link_local())
            }
        },
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn endpoint(allow_private: bool) -> SocketAddr {
        let endpoint = ConnectEndpoint::bind("127.0.0.1", 0, allow_private)
            .await
            .unwrap();
        let addr = endpoint.local_addr();
        endpoint.spawn();
        addr
    }

    async fn exchange(addr: SocketAddr, request: &str) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        response
    }

    #[test]
    fn test_is_public() {
        let refused = [
            "127.0.0.1",
            "10.1.2.3",
            "192.168.0.1",
            "172.16.5.5",
            "169.254.1.1",
            "0.0.0.0",
            "::1",
            "fe80::1",
            "fd00::1",
            "::ffff:127.0.0.1",
        ];
        for ip in refused {
            assert!(!is_public(ip.parse().unwrap()), "{ip} should be refused");
        }
        for ip in ["1.1.1.1", "93.184.216.34", "2606:4700::1111"] {
            assert!(is_public(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[test]
    fn test_split_authority() {
        assert_eq!(split_authority("example.com:443"), Some(("example.com", 443)));
        assert_eq!(split_authority("[::1]:8080"), Some(("::1", 8080)));
        assert_eq!(split_authority("example.com"), None);
        assert_eq!(split_authority(":443"), None);
    }

    #[tokio::test]
    async fn test_loopback_destination_closed_without_response() {
        let addr = endpoint(false).await;
        let response = exchange(
            addr,
            "CONNECT localhost:22 HTTP/1.1\r\nHost: localhost:22\r\n\r\n",
        )
        .await;
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_non_connect_method_gets_405() {
        let addr = endpoint(false).await;
        let response = exchange(addr, "GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(response.starts_with(b"HTTP/1.1 405"));
    }

    #[tokio::test]
    async fn test_connect_to_allowed_destination() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let addr = endpoint(true).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("CONNECT {target_addr} HTTP/1.1\r\n\r\nping").as_bytes())
            .await
            .unwrap();

        let mut response = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, b"HTTP/1.1 200 Connection Established\r\n\r\nping");
    }
}
