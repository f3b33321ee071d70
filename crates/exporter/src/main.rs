//! Compute-unit exporter
//!
//! Runs on every compute node, discovering resource-manager cgroups and
//! exposing per-unit resource metrics for scraping.

use anyhow::{Context, Result};
use exporter_lib::{
    health::{components, HealthRegistry},
    CgroupManager, ExporterMetrics, ResourceManager, UnitCollector,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = config::ExporterConfig::load()?;

    // Unknown manager names and bad forced versions are fatal here.
    let resource_manager = ResourceManager::from_name(&config.resource_manager)
        .context("invalid resource manager in configuration")?;
    let forced_mode = config.forced_mode()?;

    let manager = CgroupManager::new(
        resource_manager,
        &config.cgroup_root,
        forced_mode,
        Some(config.active_controller.clone()),
    );
    info!(
        manager = resource_manager.name(),
        mode = ?manager.mode,
        mount_point = %manager.mount_point.display(),
        "exporter configured"
    );

    let collector = Arc::new(
        UnitCollector::new(
            manager,
            &config.procfs_root,
            config.stats_flags(),
            Duration::from_secs(config.scrape_timeout_secs),
        )
        .await
        .context("failed to initialize collector")?,
    );

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let metrics = Arc::new(
        ExporterMetrics::new(resource_manager.name(), host, config.stats_flags())
            .context("failed to register metrics")?,
    );

    let health = HealthRegistry::new();
    health.register(components::DISCOVERER).await;
    health.register(components::COLLECTOR).await;
    health.set_ready(true).await;

    let state = Arc::new(api::AppState::new(
        collector,
        metrics,
        health,
        Duration::from_secs(config.scrape_timeout_secs),
    ));
    let api_handle = tokio::spawn(api::serve(config.port, state));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    api_handle.abort();

    Ok(())
}
