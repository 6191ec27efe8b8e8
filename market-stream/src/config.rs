//! Stream client configuration.
//!
//! [`StreamConfig`] is the resolved configuration every component reads. It is built either
//! directly (defaults plus `with_*` setters) or from a [`StreamOptions`] overlay, where every
//! field is optional and an unset field never overrides an explicitly supplied one. The
//! environment is just another overlay, see [`StreamOptions::from_env`].

use crate::error::ConfigError;
use std::time::Duration;
use tracing::warn;
use url::Url;

pub const DEFAULT_STREAM_URL: &str = "ws://127.0.0.1:8000/ws";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(2_000);
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_millis(30_000);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(90_000);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(3_000);
pub const DEFAULT_PROBE_CACHE_TTL: Duration = Duration::from_millis(30_000);

/// Environment variable names recognised by [`StreamOptions::from_env`].
pub mod env {
    pub const URL: &str = "MARKET_STREAM_URL";
    pub const AUTO_CONNECT: &str = "MARKET_STREAM_AUTO_CONNECT";
    pub const RECONNECT: &str = "MARKET_STREAM_RECONNECT";
    pub const MAX_RECONNECT_ATTEMPTS: &str = "MARKET_STREAM_MAX_RECONNECT_ATTEMPTS";
    pub const RECONNECT_BASE_MS: &str = "MARKET_STREAM_RECONNECT_BASE_MS";
    pub const RECONNECT_MAX_MS: &str = "MARKET_STREAM_RECONNECT_MAX_MS";
    pub const HEARTBEAT_MS: &str = "MARKET_STREAM_HEARTBEAT_MS";
    pub const IDLE_TIMEOUT_MS: &str = "MARKET_STREAM_IDLE_TIMEOUT_MS";
    pub const PROBE_BACKEND: &str = "MARKET_STREAM_PROBE_BACKEND";
    pub const PROBE_TIMEOUT_MS: &str = "MARKET_STREAM_PROBE_TIMEOUT_MS";
    pub const PROBE_CACHE_TTL_MS: &str = "MARKET_STREAM_PROBE_CACHE_TTL_MS";
    pub const SILENT_DEGRADED: &str = "MARKET_STREAM_SILENT_DEGRADED";
}

/// Resolved configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// WebSocket endpoint of the quote/bar feed
    pub url: String,
    /// Issue `connect()` as soon as the manager is created
    pub auto_connect: bool,
    /// Schedule reconnects after an unexpected close or error
    pub reconnect_on_error: bool,
    /// Retry budget before the manager gives up and enters degraded mode
    pub max_reconnect_attempts: u32,
    /// First backoff delay, doubled on every attempt
    pub reconnect_base_delay: Duration,
    /// Backoff cap (before jitter)
    pub reconnect_max_delay: Duration,
    /// Keep-alive ping interval while open
    pub heartbeat_interval: Duration,
    /// Treat the socket as dead if nothing arrives for this long
    pub idle_timeout: Option<Duration>,
    /// Check `/health` before the first socket attempt
    pub probe_backend: bool,
    /// Timeout for the health check request
    pub probe_timeout: Duration,
    /// How long a probe verdict stays valid
    pub probe_cache_ttl: Duration,
    /// Log degraded-mode transitions at debug instead of warn
    pub silent_degraded: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            auto_connect: true,
            reconnect_on_error: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            probe_backend: true,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_cache_ttl: DEFAULT_PROBE_CACHE_TTL,
            silent_degraded: false,
        }
    }
}

impl StreamConfig {
    /// Create a new configuration with custom URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Resolve an options overlay onto the defaults and validate the result.
    pub fn from_options(options: StreamOptions) -> Result<Self, ConfigError> {
        options.apply(Self::default()).validated()
    }

    /// Resolve configuration from `MARKET_STREAM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_options(StreamOptions::from_env())
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_reconnect(mut self, reconnect_on_error: bool) -> Self {
        self.reconnect_on_error = reconnect_on_error;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the backoff base delay and cap together
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_probe(mut self, probe_backend: bool) -> Self {
        self.probe_backend = probe_backend;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_silent_degraded(mut self, silent: bool) -> Self {
        self.silent_degraded = silent;
        self
    }

    /// Check the configuration is usable, returning it unchanged if so.
    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl);
        }

        let url = Url::parse(&self.url).map_err(|error| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: error.to_string(),
        })?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }

        if self.reconnect_base_delay > self.reconnect_max_delay {
            return Err(ConfigError::BackoffInverted {
                base_ms: self.reconnect_base_delay.as_millis() as u64,
                max_ms: self.reconnect_max_delay.as_millis() as u64,
            });
        }

        Ok(self)
    }

    /// Replace values the runtime cannot honour: a zero heartbeat falls back to the default,
    /// an inverted backoff is capped at its maximum and a zero idle timeout disables it.
    pub fn sanitized(mut self) -> Self {
        if self.heartbeat_interval.is_zero() {
            warn!(
                default_ms = DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
                "zero heartbeat interval, using default"
            );
            self.heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL;
        }
        if self.reconnect_base_delay > self.reconnect_max_delay {
            warn!(
                base_ms = self.reconnect_base_delay.as_millis() as u64,
                max_ms = self.reconnect_max_delay.as_millis() as u64,
                "reconnect base delay above cap, clamping"
            );
            self.reconnect_base_delay = self.reconnect_max_delay;
        }
        if self.idle_timeout.is_some_and(|timeout| timeout.is_zero()) {
            self.idle_timeout = None;
        }
        self
    }
}

/// Partial configuration. `None` means "not specified here".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOptions {
    pub url: Option<String>,
    pub auto_connect: Option<bool>,
    pub reconnect_on_error: Option<bool>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_base_delay: Option<Duration>,
    pub reconnect_max_delay: Option<Duration>,
    pub heartbeat_interval: Option<Duration>,
    /// `Some(Duration::ZERO)` disables idle detection
    pub idle_timeout: Option<Duration>,
    pub probe_backend: Option<bool>,
    pub probe_timeout: Option<Duration>,
    pub probe_cache_ttl: Option<Duration>,
    pub silent_degraded: Option<bool>,
}

impl StreamOptions {
    /// Read options from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read options through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let read_bool = |key: &str| read(key).and_then(|raw| parse_flag(key, &raw));
        let read_u32 = |key: &str| read(key).and_then(|raw| parse_number::<u32>(key, &raw));
        let read_ms = |key: &str| {
            read(key)
                .and_then(|raw| parse_number::<u64>(key, &raw))
                .map(Duration::from_millis)
        };

        Self {
            url: read(env::URL),
            auto_connect: read_bool(env::AUTO_CONNECT),
            reconnect_on_error: read_bool(env::RECONNECT),
            max_reconnect_attempts: read_u32(env::MAX_RECONNECT_ATTEMPTS),
            reconnect_base_delay: read_ms(env::RECONNECT_BASE_MS),
            reconnect_max_delay: read_ms(env::RECONNECT_MAX_MS),
            heartbeat_interval: read_ms(env::HEARTBEAT_MS),
            idle_timeout: read_ms(env::IDLE_TIMEOUT_MS),
            probe_backend: read_bool(env::PROBE_BACKEND),
            probe_timeout: read_ms(env::PROBE_TIMEOUT_MS),
            probe_cache_ttl: read_ms(env::PROBE_CACHE_TTL_MS),
            silent_degraded: read_bool(env::SILENT_DEGRADED),
        }
    }

    /// Combine two overlays; fields set on `self` win over `fallback`.
    pub fn or(self, fallback: StreamOptions) -> Self {
        Self {
            url: self.url.or(fallback.url),
            auto_connect: self.auto_connect.or(fallback.auto_connect),
            reconnect_on_error: self.reconnect_on_error.or(fallback.reconnect_on_error),
            max_reconnect_attempts: self
                .max_reconnect_attempts
                .or(fallback.max_reconnect_attempts),
            reconnect_base_delay: self.reconnect_base_delay.or(fallback.reconnect_base_delay),
            reconnect_max_delay: self.reconnect_max_delay.or(fallback.reconnect_max_delay),
            heartbeat_interval: self.heartbeat_interval.or(fallback.heartbeat_interval),
            idle_timeout: self.idle_timeout.or(fallback.idle_timeout),
            probe_backend: self.probe_backend.or(fallback.probe_backend),
            probe_timeout: self.probe_timeout.or(fallback.probe_timeout),
            probe_cache_ttl: self.probe_cache_ttl.or(fallback.probe_cache_ttl),
            silent_degraded: self.silent_degraded.or(fallback.silent_degraded),
        }
    }

    /// Write every specified field onto `config`.
    pub fn apply(self, mut config: StreamConfig) -> StreamConfig {
        if let Some(url) = self.url {
            config.url = url;
        }
        if let Some(auto_connect) = self.auto_connect {
            config.auto_connect = auto_connect;
        }
        if let Some(reconnect) = self.reconnect_on_error {
            config.reconnect_on_error = reconnect;
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(base) = self.reconnect_base_delay {
            config.reconnect_base_delay = base;
        }
        if let Some(max) = self.reconnect_max_delay {
            config.reconnect_max_delay = max;
        }
        if let Some(interval) = self.heartbeat_interval {
            config.heartbeat_interval = interval;
        }
        if let Some(timeout) = self.idle_timeout {
            config.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(probe) = self.probe_backend {
            config.probe_backend = probe;
        }
        if let Some(timeout) = self.probe_timeout {
            config.probe_timeout = timeout;
        }
        if let Some(ttl) = self.probe_cache_ttl {
            config.probe_cache_ttl = ttl;
        }
        if let Some(silent) = self.silent_degraded {
            config.silent_degraded = silent;
        }
        config
    }
}

fn parse_flag(key: &str, raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = raw, "ignoring unrecognised boolean option");
            None
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring non-numeric option");
            None
        }
    }
}
