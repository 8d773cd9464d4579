//! Configuration for relays, pools, the tunnel client and the tunnel server.
//!
//! All option structs follow the same pattern: `Default`, `new()`, chained
//! `with_*` builders, and a `validate()` that rejects nonsense values.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use wsbridge::{ClientConfig, PoolConfig};
//!
//! let config = ClientConfig::direct("wss://tunnel.example.com".parse()?)
//!     .with_proxy_port(3128)
//!     .with_pool(PoolConfig::new().with_max_size(8))
//!     .with_inactivity_timeout(Duration::from_secs(30));
//! config.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Buffered bytes at or below which a paused relay resumes (8 MiB).
pub const DEFAULT_LOW_WATERMARK: usize = 1 << 23;

/// Buffered bytes at or above which a relay pauses (16 MiB).
pub const DEFAULT_HIGH_WATERMARK: usize = 1 << 24;

/// Interval between backpressure re-checks while paused.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum idle sessions kept by a pool.
pub const DEFAULT_POOL_SIZE: usize = 20;

/// Sessions requested per demand signal.
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// How long an acquisition waits for a session.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle period after which a local relay is closed.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default local proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 3128;

/// Default port of the browser-mode WebSocket listener.
pub const DEFAULT_BROWSER_PORT: u16 = 8080;

/// Default port of the tunnel server.
pub const DEFAULT_SERVER_PORT: u16 = 10000;

// ============================================================================
// RelayConfig
// ============================================================================

/// Backpressure and timeout settings for a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Resume reading once buffered bytes fall to this value.
    pub low_watermark: usize,

    /// Pause reading once buffered bytes reach this value.
    pub high_watermark: usize,

    /// Re-check interval while paused.
    pub drain_interval: Duration,

    /// Close after this long without bytes in either direction.
    pub inactivity_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayConfig {
    /// Creates relay settings with default watermarks and no inactivity timeout.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            inactivity_timeout: None,
        }
    }

    /// Sets both watermarks.
    #[inline]
    #[must_use]
    pub fn with_watermarks(mut self, low: usize, high: usize) -> Self {
        self.low_watermark = low;
        self.high_watermark = high;
        self
    }

    /// Sets the drain re-check interval.
    #[inline]
    #[must_use]
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Sets the inactivity timeout.
    #[inline]
    #[must_use]
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }

    /// Validates the relay settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the low watermark is not strictly below
    /// the high watermark or an interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.low_watermark >= self.high_watermark {
            return Err(Error::config(format!(
                "low watermark ({}) must be below high watermark ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        if self.drain_interval.is_zero() {
            return Err(Error::config("drain interval must be greater than zero"));
        }
        if self.inactivity_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("inactivity timeout must be greater than zero"));
        }
        Ok(())
    }
}

// ============================================================================
// PoolConfig
// ============================================================================

/// Session pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle sessions; extra released sessions are purged.
    pub max_size: usize,

    /// Sessions requested per demand signal.
    pub batch_size: usize,

    /// How long an acquisition waits before failing.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfig {
    /// Creates pool settings with defaults.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Sets the maximum idle size.
    #[inline]
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the batch size.
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the acquisition timeout.
    #[inline]
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Validates the pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a zero size, batch or timeout.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("pool size must be greater than zero"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch size must be greater than zero"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(Error::config("pool timeout must be greater than zero"));
        }
        Ok(())
    }
}

// ============================================================================
// Mode
// ============================================================================

/// Where a tunnel client gets its sessions from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Opens sessions to the server itself.
    #[default]
    Direct,
    /// Borrows a browser's egress: the browser opens the sessions and
    /// registers them through a local WebSocket listener.
    Browser,
}

impl Mode {
    /// Returns the lowercase mode name.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Browser => "browser",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ClientConfig
// ============================================================================

/// Tunnel client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Session source.
    pub mode: Mode,

    /// Tunnel server base URL (`ws://` or `wss://`).
    pub server_url: Url,

    /// Browser-mode WebSocket listener host.
    pub host: String,

    /// Browser-mode WebSocket listener port (0 picks a free port).
    pub port: u16,

    /// Local proxy listener host.
    pub proxy_host: String,

    /// Local proxy listener port (0 picks a free port).
    pub proxy_port: u16,

    /// Idle period after which a bound local relay is closed.
    pub inactivity_timeout: Duration,

    /// Pool settings.
    pub pool: PoolConfig,

    /// Relay settings; the inactivity timeout above overrides its own.
    pub relay: RelayConfig,
}

impl ClientConfig {
    /// Creates a client configuration for the given mode and server.
    #[must_use]
    pub fn new(mode: Mode, server_url: Url) -> Self {
        Self {
            mode,
            server_url,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_BROWSER_PORT,
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            pool: PoolConfig::new(),
            relay: RelayConfig::new(),
        }
    }

    /// Creates a direct-mode configuration.
    #[inline]
    #[must_use]
    pub fn direct(server_url: Url) -> Self {
        Self::new(Mode::Direct, server_url)
    }

    /// Creates a browser-mode configuration.
    #[inline]
    #[must_use]
    pub fn browser(server_url: Url) -> Self {
        Self::new(Mode::Browser, server_url)
    }

    /// Sets the browser-mode listener address.
    #[inline]
    #[must_use]
    pub fn with_listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Sets the local proxy host.
    #[inline]
    #[must_use]
    pub fn with_proxy_host(mut self, host: impl Into<String>) -> Self {
        self.proxy_host = host.into();
        self
    }

    /// Sets the local proxy port.
    #[inline]
    #[must_use]
    pub fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = port;
        self
    }

    /// Sets the local relay inactivity timeout.
    #[inline]
    #[must_use]
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Sets the pool settings.
    #[inline]
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the relay settings.
    #[inline]
    #[must_use]
    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Returns the relay settings used for local relays.
    #[must_use]
    pub fn local_relay(&self) -> RelayConfig {
        self.relay
            .clone()
            .with_inactivity_timeout(self.inactivity_timeout)
    }

    /// Returns `<server_url>/ws/rem/relay`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] if the server URL cannot be a base.
    pub fn relay_url(&self) -> Result<Url> {
        Ok(self.server_url.join("/ws/rem/relay")?)
    }

    /// Validates the client settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a non-WebSocket server URL or invalid
    /// pool or relay settings.
    pub fn validate(&self) -> Result<()> {
        match self.server_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::config(format!(
                    "server URL must be ws:// or wss://, got {other}://"
                )));
            }
        }
        if self.server_url.host_str().is_none() {
            return Err(Error::config("server URL has no host"));
        }
        self.pool.validate()?;
        self.local_relay().validate()
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

/// Tunnel server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// WebSocket listener host.
    pub host: String,

    /// WebSocket listener port (0 picks a free port).
    pub port: u16,

    /// CONNECT endpoint host.
    pub connect_host: String,

    /// CONNECT endpoint port (0 picks a free port).
    pub connect_port: u16,

    /// Let the CONNECT endpoint reach loopback, private and link-local hosts.
    pub allow_private_destinations: bool,

    /// Relay settings for remote relays.
    pub relay: RelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    /// Creates server settings with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
            connect_host: "127.0.0.1".to_string(),
            connect_port: 0,
            allow_private_destinations: false,
            relay: RelayConfig::new(),
        }
    }

    /// Sets the WebSocket listener address.
    #[inline]
    #[must_use]
    pub fn with_listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Sets the CONNECT endpoint address.
    #[inline]
    #[must_use]
    pub fn with_connect_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.connect_host = host.into();
        self.connect_port = port;
        self
    }

    /// Allows or refuses CONNECT targets on non-public addresses.
    #[inline]
    #[must_use]
    pub fn with_private_destinations(mut self, allow: bool) -> Self {
        self.allow_private_destinations = allow;
        self
    }

    /// Sets the relay settings.
    #[inline]
    #[must_use]
    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Validates the server settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on invalid relay settings.
    pub fn validate(&self) -> Result<()> {
        self.relay.validate()
    }
}

// ============================================================================
// Tests
// ============================================================================
