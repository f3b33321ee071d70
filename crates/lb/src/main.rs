//! Retention-aware TSDB load balancer
//!
//! Routes read queries across a pool of TSDB backends with different
//! retention horizons: each query goes to the cheapest backend whose
//! retention still covers the query's time window.

use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

mod backend;
mod config;
mod duration;
mod frontend;
mod pool;
mod probe;
mod router;

use backend::Backend;
use frontend::FrontendState;
use pool::ServerPool;
use probe::HealthProbe;

#[derive(Parser, Debug)]
#[command(name = "tsdb-lb", about = "Retention-aware TSDB load balancer")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, short, env = "LB_CONFIG_FILE", default_value = "lb.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = config::LbConfig::load(&args.config)?;

    // Forwarded queries may legitimately run long; only bound the connect
    // phase here. The probe gets its own short-fused client.
    let forward_client = Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("failed to build forwarding client")?;
    let probe_client = Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build probe client")?;

    let pool = Arc::new(ServerPool::new());
    for cluster in &config.clusters {
        for backend in &cluster.backends {
            let url = Url::parse(&backend.url)
                .with_context(|| format!("invalid backend url: {}", backend.url))?;
            info!(
                cluster = %cluster.id,
                backend = %url,
                retention = %duration::format_duration(backend.retention_period),
                "registering backend"
            );
            pool.add(
                cluster.id.clone(),
                Arc::new(Backend::new(
                    url,
                    backend.retention_period,
                    forward_client.clone(),
                )),
            );
        }
    }

    let probe = HealthProbe::new(Arc::clone(&pool), probe_client, config.probe_interval);
    tokio::spawn(probe.run());

    let state = Arc::new(FrontendState::new(pool, config.retry_count));
    let serve_handle = tokio::spawn(frontend::serve(config.port, state));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    serve_handle.abort();

    Ok(())
}
