//! Exporter configuration

use anyhow::{bail, Result};
use exporter_lib::collector::StatsFlags;
use exporter_lib::CgroupMode;
use serde::Deserialize;

/// Exporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Cgroup filesystem root
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: String,

    /// Procfs root, overridable for tests
    #[serde(default = "default_procfs_root")]
    pub procfs_root: String,

    /// Resource manager whose units are accounted ("slurm" or "libvirt")
    #[serde(default = "default_resource_manager")]
    pub resource_manager: String,

    /// Force "v1" or "v2" instead of detecting the mounted hierarchy.
    /// Test-only; leave unset in production.
    #[serde(default)]
    pub forced_cgroup_version: Option<String>,

    /// v1 controller hierarchy the discovery walk is anchored in
    #[serde(default = "default_active_controller")]
    pub active_controller: String,

    /// Collect swap metrics
    #[serde(default = "default_enabled")]
    pub collect_swap: bool,

    /// Collect per-device block-IO metrics
    #[serde(default = "default_enabled")]
    pub collect_blkio: bool,

    /// Collect pressure-stall metrics (unified hierarchy only)
    #[serde(default = "default_enabled")]
    pub collect_psi: bool,

    /// Listen port for /metrics and the probe endpoints
    #[serde(default = "default_port")]
    pub port: u16,

    /// Default scrape deadline when the request carries none
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout_secs: u64,
}

fn default_cgroup_root() -> String {
    exporter_lib::cgroup::DEFAULT_CGROUP_ROOT.to_string()
}

fn default_procfs_root() -> String {
    "/proc".to_string()
}

fn default_resource_manager() -> String {
    "slurm".to_string()
}

fn default_active_controller() -> String {
    exporter_lib::cgroup::DEFAULT_V1_CONTROLLER.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    9010
}

fn default_scrape_timeout() -> u64 {
    10
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            cgroup_root: default_cgroup_root(),
            procfs_root: default_procfs_root(),
            resource_manager: default_resource_manager(),
            forced_cgroup_version: None,
            active_controller: default_active_controller(),
            collect_swap: default_enabled(),
            collect_blkio: default_enabled(),
            collect_psi: default_enabled(),
            port: default_port(),
            scrape_timeout_secs: default_scrape_timeout(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from the environment (`EXPORTER_` prefix).
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("EXPORTER"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    pub fn stats_flags(&self) -> StatsFlags {
        StatsFlags {
            swap: self.collect_swap,
            blkio: self.collect_blkio,
            psi: self.collect_psi,
        }
    }

    pub fn forced_mode(&self) -> Result<Option<CgroupMode>> {
        match self.forced_cgroup_version.as_deref() {
            None => Ok(None),
            Some("v1") => Ok(Some(CgroupMode::Legacy)),
            Some("v2") => Ok(Some(CgroupMode::Unified)),
            Some(other) => bail!("invalid forced cgroup version: {other} (expected v1 or v2)"),
        }
    }
}
