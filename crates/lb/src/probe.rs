//! Periodic backend health probe
//!
//! Sweeps every backend on a fixed cadence, hitting the TSDB's health
//! endpoint, and flips the liveness bit the router reads. Transitions are
//! logged; steady state is quiet.

use crate::backend::{build_target, Backend};
use crate::pool::ServerPool;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const HEALTH_PATH: &str = "/-/healthy";

pub struct HealthProbe {
    pool: Arc<ServerPool>,
    client: Client,
    interval: Duration,
}

impl HealthProbe {
    pub fn new(pool: Arc<ServerPool>, client: Client, interval: Duration) -> Self {
        Self {
            pool,
            client,
            interval,
        }
    }

    /// Run forever; spawn this on its own task.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// One probe pass over every backend in the pool.
    pub async fn sweep(&self) {
        for backend in self.pool.all_backends() {
            let healthy = self.check(&backend).await;
            if healthy != backend.is_alive() {
                if healthy {
                    info!(backend = %backend.url(), "backend is back");
                } else {
                    warn!(backend = %backend.url(), "backend went away");
                }
            }
            backend.set_alive(healthy);
        }
    }

    async fn check(&self, backend: &Backend) -> bool {
        let url = build_target(backend.url(), HEALTH_PATH);
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use std::net::SocketAddr;
    use url::Url;

    /// Fake TSDB that answers its health endpoint.
    async fn spawn_fake_backend() -> SocketAddr {
        let app = Router::new().route("/-/healthy", get(|| async { "OK" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_sweep_marks_reachable_backend_alive_and_dead_one_down() {
        let addr = spawn_fake_backend().await;

        let pool = Arc::new(ServerPool::new());
        let up = Arc::new(Backend::new(
            Url::parse(&format!("http://{addr}")).unwrap(),
            Duration::from_secs(3600),
            Client::new(),
        ));
        let down = Arc::new(Backend::new(
            Url::parse("http://127.0.0.1:1").unwrap(),
            Duration::from_secs(3600),
            Client::new(),
        ));
        down.set_alive(true);
        pool.add("hpc", Arc::clone(&up));
        pool.add("hpc", Arc::clone(&down));

        let probe = HealthProbe::new(Arc::clone(&pool), Client::new(), Duration::from_secs(30));
        probe.sweep().await;

        assert!(up.is_alive());
        assert!(!down.is_alive());
    }
}
