//! Direct-mode tunnel on one machine.
//!
//! Demonstrates:
//! - Starting a tunnel server with its CONNECT endpoint
//! - Starting a direct-mode client and waiting for its proxy
//! - Tunneling two requests and observing session reuse
//!
//! Usage:
//!   cargo run --example direct_tunnel
//!   cargo run --example direct_tunnel -- --no-wait
//!   cargo run --example direct_tunnel -- --debug

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;
use url::Url;
use wsbridge::{Client, ClientConfig, Error, Result, Server, ServerConfig};

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let debug = args.iter().any(|a| a == "--debug");
    let no_wait = args.iter().any(|a| a == "--no-wait");

    let filter = if debug { "wsbridge=debug" } else { "wsbridge=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    if let Err(e) = run(no_wait).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(no_wait: bool) -> Result<()> {
    println!("=== Direct Tunnel ===\n");

    // ========================================================================
    // Destination
    // ========================================================================

    let target = spawn_echo().await?;
    println!("[Setup] Echo destination on {target}");

    // ========================================================================
    // Server and Client
    // ========================================================================

    let server = Server::start(
        ServerConfig::new()
            .with_listen("127.0.0.1", 0)
            .with_private_destinations(true),
    )
    .await?;
    println!("[Server] WebSocket on {}", server.ws_addr());
    println!("         CONNECT endpoint on {}", server.connect_addr());

    let url: Url = format!("ws://{}", server.ws_addr()).parse()?;
    let client = Client::start(ClientConfig::direct(url).with_proxy_port(0)).await?;
    let proxy = client.ready().await?;
    println!("[Client] HTTPS proxy on {proxy}\n");

    // ========================================================================
    // Requests
    // ========================================================================

    for i in 1..=2 {
        let reply = tunnel(proxy, target, format!("hello #{i}").as_bytes()).await?;
        println!("[Request {i}] echoed {:?}", String::from_utf8_lossy(&reply));

        // Give the unbind handshake a moment to return the session.
        tokio::time::sleep(Duration::from_millis(100)).await;
        println!(
            "            idle={} opened={}",
            client.pool().idle_count(),
            client.pool().added_count()
        );
    }

    if no_wait {
        println!("\n[--no-wait] Skipping wait");
    } else {
        println!("\nPress Ctrl+C to exit");
        tokio::signal::ctrl_c().await?;
    }

    client.shutdown();
    server.shutdown();
    println!("\n=== Done ===");
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

async fn spawn_echo() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    Ok(addr)
}

async fn tunnel(proxy: SocketAddr, target: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await?;

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        if stream.read(&mut byte).await? == 0 {
            return Err(Error::connection("proxy closed before CONNECT reply"));
        }
        head.push(byte[0]);
    }
    if !head.starts_with(b"HTTP/1.1 200") {
        return Err(Error::protocol(String::from_utf8_lossy(&head).trim().to_string()));
    }

    stream.write_all(payload).await?;
    let mut reply = vec![0u8; payload.len()];
    stream.read_exact(&mut reply).await?;
    Ok(reply)
}
