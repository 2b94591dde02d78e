//! Bayeux hub configuration
//!
//! Everything comes from environment variables; unset variables fall back to
//! the defaults below.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `BAYEUX_LISTEN` | `127.0.0.1:8080` |
//! | `BAYEUX_PATH` | `/cometd` |
//! | `BAYEUX_CONNECT_INTERVAL_MS` | `60000` |
//! | `BAYEUX_POLL_TIMEOUT_MS` | `30000` |
//! | `BAYEUX_POLL_IDLE_MULTIPLIER` | `3` (`0` never expires poll sessions) |
//! | `BAYEUX_DISPATCH_WORKERS` | unset (one task per unit of work) |

use std::net::SocketAddr;
use std::time::Duration;

/// Hub configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address
    pub listen: SocketAddr,
    /// Route serving both the WebSocket upgrade and long-polling
    pub path: String,
    /// Interval advertised in connect advice, in milliseconds
    pub connect_interval_ms: u64,
    /// How long a poll request is held open before answering `[]`
    pub poll_timeout: Duration,
    /// A poll session with no request for this many poll timeouts is closed
    pub poll_idle_multiplier: u32,
    /// Worker pool size; `None` spawns a task per unit of work
    pub dispatch_workers: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            path: "/cometd".to_string(),
            connect_interval_ms: 60_000,
            poll_timeout: Duration::from_secs(30),
            poll_idle_multiplier: 3,
            dispatch_workers: None,
        }
    }
}

impl Config {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(listen) = lookup("BAYEUX_LISTEN") {
            config.listen = listen
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("BAYEUX_LISTEN", "expected host:port"))?;
        }

        if let Some(path) = lookup("BAYEUX_PATH") {
            let path = path.trim();
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidEnv("BAYEUX_PATH", "expected absolute path"));
            }
            config.path = path.to_string();
        }

        if let Some(interval) = lookup("BAYEUX_CONNECT_INTERVAL_MS") {
            config.connect_interval_ms = interval
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("BAYEUX_CONNECT_INTERVAL_MS", "expected u64"))?;
        }

        if let Some(timeout) = lookup("BAYEUX_POLL_TIMEOUT_MS") {
            let ms: u64 = timeout
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("BAYEUX_POLL_TIMEOUT_MS", "expected u64"))?;
            config.poll_timeout = Duration::from_millis(ms);
        }

        if let Some(multiplier) = lookup("BAYEUX_POLL_IDLE_MULTIPLIER") {
            config.poll_idle_multiplier = multiplier
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("BAYEUX_POLL_IDLE_MULTIPLIER", "expected u32"))?;
        }

        if let Some(workers) = lookup("BAYEUX_DISPATCH_WORKERS")
            && !workers.trim().is_empty()
        {
            let n: usize = workers
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("BAYEUX_DISPATCH_WORKERS", "expected usize"))?;
            // 0 keeps the spawn-per-unit strategy
            config.dispatch_workers = (n > 0).then_some(n);
        }

        Ok(config)
    }

    /// How long a poll session may go without a request before it expires
    pub fn poll_idle_timeout(&self) -> Option<Duration> {
        (self.poll_idle_multiplier > 0).then(|| self.poll_timeout * self.poll_idle_multiplier)
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}
