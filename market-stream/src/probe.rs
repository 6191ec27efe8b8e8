//! Backend availability probe.
//!
//! Before opening a socket the client can ask "is the streaming backend even up?" with a cheap
//! HTTP GET against `/health` on the stream host. Verdicts are cached in an injected
//! [`AvailabilityCache`] so many managers sharing one cache do not hammer the backend. Every
//! failure mode (timeout, DNS, refused, non-2xx, unusable URL) is reported as "unavailable".

use crate::config::StreamConfig;
use crate::error::StreamError;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Path of the health endpoint on the stream host.
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone, Copy)]
struct CachedVerdict {
    available: bool,
    checked_at: Instant,
}

/// Time-boxed cache of probe verdicts, keyed by health URL.
///
/// Share one instance (behind an `Arc`) between every manager that should reuse verdicts.
#[derive(Debug)]
pub struct AvailabilityCache {
    ttl: Duration,
    verdicts: Mutex<FnvHashMap<String, CachedVerdict>>,
}

impl AvailabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            verdicts: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Convenience constructor returning a shareable handle.
    pub fn shared(ttl: Duration) -> Arc<Self> {
        Arc::new(Self::new(ttl))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached verdict for `key` if it is still within the TTL.
    pub fn get(&self, key: &str) -> Option<bool> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<bool> {
        self.verdicts
            .lock()
            .get(key)
            .filter(|verdict| now.saturating_duration_since(verdict.checked_at) < self.ttl)
            .map(|verdict| verdict.available)
    }

    pub fn store(&self, key: &str, available: bool) {
        self.store_at(key, available, Instant::now());
    }

    pub fn store_at(&self, key: &str, available: bool, checked_at: Instant) {
        self.verdicts.lock().insert(
            key.to_string(),
            CachedVerdict {
                available,
                checked_at,
            },
        );
    }

    /// Forget every verdict so the next check issues a fresh request.
    pub fn reset(&self) {
        self.verdicts.lock().clear();
    }
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PROBE_CACHE_TTL)
    }
}

/// HTTP reachability check for the streaming backend.
#[derive(Debug, Clone)]
pub struct BackendProbe {
    client: Client,
    cache: Arc<AvailabilityCache>,
    timeout: Duration,
}

impl BackendProbe {
    pub fn new(cache: Arc<AvailabilityCache>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            cache,
            timeout,
        }
    }

    /// Build a probe using the timeout from `config` and the shared `cache`.
    pub fn from_config(config: &StreamConfig, cache: Arc<AvailabilityCache>) -> Self {
        Self::new(cache, config.probe_timeout)
    }

    pub fn cache(&self) -> &Arc<AvailabilityCache> {
        &self.cache
    }

    /// Clear cached verdicts, e.g. ahead of a user-initiated retry.
    pub fn reset(&self) {
        self.cache.reset();
    }

    /// Whether the backend behind `stream_url` answers its health check with a 2xx.
    pub async fn check_available(&self, stream_url: &str) -> bool {
        let health = match health_url(stream_url) {
            Ok(url) => url,
            Err(error) => {
                warn!(%error, "cannot derive health url, treating backend as unavailable");
                return false;
            }
        };

        if let Some(available) = self.cache.get(health.as_str()) {
            debug!(url = %health, available, "using cached backend availability");
            return available;
        }

        let available = self.request(&health).await;
        self.cache.store(health.as_str(), available);
        available
    }

    async fn request(&self, health: &Url) -> bool {
        match self
            .client
            .get(health.clone())
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(url = %health, status = %response.status(), "market data backend available");
                true
            }
            Ok(response) => {
                info!(url = %health, status = %response.status(), "market data backend unhealthy");
                false
            }
            Err(error) => {
                debug!(url = %health, %error, "market data backend unreachable");
                false
            }
        }
    }
}

/// Derive the health check URL from a stream URL: same host and port, `ws→http`,
/// `wss→https`, path [`HEALTH_PATH`].
pub fn health_url(stream_url: &str) -> Result<Url, StreamError> {
    let invalid = |reason: &str| StreamError::InvalidUrl {
        url: stream_url.to_string(),
        reason: reason.to_string(),
    };

    let mut url = Url::parse(stream_url).map_err(|error| invalid(&error.to_string()))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return Err(invalid("unsupported scheme")),
    };
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }

    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch scheme"))?;
    url.set_path(HEALTH_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_probe(timeout: Duration) -> BackendProbe {
        BackendProbe::new(AvailabilityCache::shared(Duration::from_secs(30)), timeout)
    }

    fn stream_url(server: &mockito::ServerGuard) -> String {
        format!("{}/ws", server.url().replacen("http://", "ws://", 1))
    }

    #[test]
    fn test_health_url_derivation() {
        struct TestCase {
            input: &'static str,
            expected: Result<&'static str, ()>,
        }

        let tests = vec![
            TestCase {
                // TC0: plain ws
                input: "ws://host/ws",
                expected: Ok("http://host/health"),
            },
            TestCase {
                // TC1: tls with port and query
                input: "wss://feed.example.com:8443/stream?token=abc",
                expected: Ok("https://feed.example.com:8443/health"),
            },
            TestCase {
                // TC2: explicit port kept
                input: "ws://127.0.0.1:8000/ws",
                expected: Ok("http://127.0.0.1:8000/health"),
            },
            TestCase {
                // TC3: unsupported scheme
                input: "ftp://host/ws",
                expected: Err(()),
            },
            TestCase {
                // TC4: garbage
                input: "not a url",
                expected: Err(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = health_url(test.input)
                .map(|url| url.to_string())
                .map_err(|_| ());
            let expected = test.expected.map(str::to_string);
            assert_eq!(actual, expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let cache = AvailabilityCache::new(Duration::from_secs(30));
        let start = Instant::now();
        cache.store_at("http://host/health", false, start);

        assert_eq!(cache.get_at("http://host/health", start), Some(false));
        assert_eq!(
            cache.get_at("http://host/health", start + Duration::from_secs(29)),
            Some(false)
        );
        assert_eq!(
            cache.get_at("http://host/health", start + Duration::from_secs(30)),
            None
        );
        assert_eq!(cache.get_at("http://other/health", start), None);

        cache.reset();
        assert_eq!(cache.get_at("http://host/health", start), None);
    }

    #[tokio::test]
    async fn test_probe_available_on_2xx_and_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"ok"}"#)
            .expect(1)
            .create_async()
            .await;

        let probe = fresh_probe(Duration::from_secs(3));
        let url = stream_url(&server);

        assert!(probe.check_available(&url).await);
        // Second call inside the TTL is served from cache
        assert!(probe.check_available(&url).await);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_probe_unavailable_on_503() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let probe = fresh_probe(Duration::from_secs(3));

        assert!(!probe.check_available(&stream_url(&server)).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_reset_forces_fresh_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let probe = fresh_probe(Duration::from_secs(3));
        let url = stream_url(&server);

        assert!(!probe.check_available(&url).await);
        probe.reset();
        assert!(!probe.check_available(&url).await);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_shared_cache_spans_probes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let cache = AvailabilityCache::shared(Duration::from_secs(30));
        let first = BackendProbe::new(Arc::clone(&cache), Duration::from_secs(3));
        let second = BackendProbe::new(Arc::clone(&cache), Duration::from_secs(3));
        let url = stream_url(&server);

        assert!(first.check_available(&url).await);
        assert!(second.check_available(&url).await);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let probe = fresh_probe(Duration::from_millis(500));
        assert!(!probe.check_available("ws://127.0.0.1:1/ws").await);
        assert!(!probe.check_available("mailto:ops@example.com").await);
    }
}
