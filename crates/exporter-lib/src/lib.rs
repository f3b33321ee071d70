//! Compute-unit accounting library
//!
//! This crate provides the core of the exporter:
//! - Cgroup layout description and resource-manager policy
//! - Compute-unit discovery over the cgroup filesystem
//! - Per-unit stats reading for both hierarchy flavours
//! - Prometheus exposition and health checks

pub mod cgroup;
pub mod collector;
pub mod health;
pub mod metrics;
pub mod procfs;

pub use cgroup::{Cgroup, CgroupManager, CgroupMode, CgroupPath, ManagerError, ResourceManager};
pub use collector::{CgroupDiscoverer, CgroupMetric, StatsFlags, UnitCollector};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use metrics::ExporterMetrics;
