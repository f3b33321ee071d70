//! Backend TSDB handle
//!
//! One [`Backend`] per configured TSDB instance: its base URL, the
//! retention horizon it declares, a liveness bit flipped by the health
//! probe, and the active-connection count used for least-connections
//! tie-breaking.

use axum::body::Bytes;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("invalid proxied request: {0}")]
    BadRequest(String),
    #[error("transport failure talking to {0}: {1}")]
    Transport(Url, #[source] reqwest::Error),
}

/// An inbound request captured for forwarding. The body is buffered so a
/// retry can replay it against another backend.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: String,
    pub path_and_query: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

pub struct Backend {
    url: Url,
    retention_period: Duration,
    alive: AtomicBool,
    active_connections: AtomicU64,
    client: Client,
}

impl Backend {
    /// A backend starts alive; the first probe cycle corrects that if
    /// needed.
    pub fn new(url: Url, retention_period: Duration, client: Client) -> Self {
        Self {
            url,
            retention_period,
            alive: AtomicBool::new(true),
            active_connections: AtomicU64::new(0),
            client,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn retention_period(&self) -> Duration {
        self.retention_period
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Simulate in-flight requests without a live backend.
    #[cfg(test)]
    pub(crate) fn add_connections_for_test(&self, n: u64) {
        self.active_connections.fetch_add(n, Ordering::Relaxed);
    }

    /// Replay the captured request against this backend.
    ///
    /// The connection count is incremented for the duration of the call
    /// and restored on every exit path, including errors and
    /// cancellation.
    pub async fn forward(&self, request: &ProxiedRequest) -> Result<reqwest::Response, ForwardError> {
        let _connection = ConnectionGuard::acquire(&self.active_connections);

        let target = build_target(&self.url, &request.path_and_query);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ForwardError::BadRequest(format!("bad method: {}", request.method)))?;

        let mut builder = self
            .client
            .request(method, target)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_slice());
        }

        builder
            .send()
            .await
            .map_err(|e| ForwardError::Transport(self.url.clone(), e))
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("url", &self.url.as_str())
            .field("retention_period", &self.retention_period)
            .field("alive", &self.is_alive())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

/// RAII active-connection counter.
struct ConnectionGuard<'a>(&'a AtomicU64);

impl<'a> ConnectionGuard<'a> {
    fn acquire(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Graft the inbound path and query onto the backend's base URL,
/// preserving any path prefix the backend is mounted under.
pub(crate) fn build_target(base: &Url, path_and_query: &str) -> Url {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let mut target = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    target.set_path(&joined);
    target.set_query(query);
    target
}

/// Headers that describe the inbound hop rather than the request itself.
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: &str, retention: Duration) -> Backend {
        Backend::new(Url::parse(url).unwrap(), retention, Client::new())
    }

    #[test]
    fn test_build_target_preserves_base_prefix() {
        let base = Url::parse("http://tsdb:9090/prom").unwrap();
        let target = build_target(&base, "/api/v1/query_range?start=1&end=2");
        assert_eq!(
            target.as_str(),
            "http://tsdb:9090/prom/api/v1/query_range?start=1&end=2"
        );

        let bare = Url::parse("http://tsdb:9090").unwrap();
        let target = build_target(&bare, "/api/v1/query");
        assert_eq!(target.as_str(), "http://tsdb:9090/api/v1/query");
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("Host"));
        assert!(!is_hop_by_hop("authorization"));
        assert!(!is_hop_by_hop("accept"));
    }

    #[tokio::test]
    async fn test_forward_failure_restores_connection_count() {
        // Port 1 refuses connections immediately.
        let backend = backend("http://127.0.0.1:1", Duration::from_secs(3600));
        let request = ProxiedRequest {
            method: "GET".to_string(),
            path_and_query: "/api/v1/query".to_string(),
            headers: vec![],
            body: Bytes::new(),
        };

        let result = backend.forward(&request).await;
        assert!(matches!(result, Err(ForwardError::Transport(_, _))));
        assert_eq!(backend.active_connections(), 0);
    }

    #[test]
    fn test_liveness_bit() {
        let backend = backend("http://tsdb:9090", Duration::from_secs(3600));
        assert!(backend.is_alive());
        backend.set_alive(false);
        assert!(!backend.is_alive());
    }
}
