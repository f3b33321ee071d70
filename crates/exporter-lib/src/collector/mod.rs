//! Per-scrape metrics collection from the cgroup filesystem
//!
//! A scrape is one discovery pass followed by an embarrassingly parallel
//! fan-out of stats reads, one task per discovered unit. The stats
//! implementation is chosen once at construction from the hierarchy
//! flavour; the two readers share no state.

mod discover;
mod stats;
mod v1;
mod v2;

#[cfg(test)]
mod tests;

pub use discover::{CgroupDiscoverer, DiscoverError};
pub use stats::{
    format_cpuset, parse_cpuset, BlkioDevice, CgroupMetric, RdmaDevice, StatsFlags, StatsReader,
};
pub use v1::LegacyStatsReader;
pub use v2::UnifiedStatsReader;

use crate::cgroup::{CgroupManager, CgroupMode};
use crate::procfs::{DiskMap, HostMemInfo, ProcfsError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Orchestrates discovery and the per-unit stats fan-out.
pub struct UnitCollector {
    discoverer: CgroupDiscoverer,
    reader: Arc<dyn StatsReader>,
    scrape_timeout: Duration,
}

impl UnitCollector {
    /// Build the collector, reading the host snapshots (`/proc/meminfo`,
    /// `/proc/diskstats`) exactly once.
    pub async fn new(
        manager: CgroupManager,
        procfs_root: impl Into<PathBuf>,
        flags: StatsFlags,
        scrape_timeout: Duration,
    ) -> Result<Self, ProcfsError> {
        let procfs_root = procfs_root.into();
        let mem = HostMemInfo::read(&procfs_root).await?;
        let disks = DiskMap::read(&procfs_root).await?;

        let reader: Arc<dyn StatsReader> = match manager.mode {
            CgroupMode::Unified => {
                info!("using unified hierarchy stats reader");
                Arc::new(UnifiedStatsReader::new(manager.root.clone(), mem, disks, flags))
            }
            CgroupMode::Legacy => {
                info!("using legacy hierarchy stats reader");
                Arc::new(LegacyStatsReader::new(manager.root.clone(), mem, disks, flags))
            }
        };

        Ok(Self {
            discoverer: CgroupDiscoverer::new(manager, procfs_root),
            reader,
            scrape_timeout,
        })
    }

    /// Collector with an externally built reader, for tests.
    pub fn with_reader(
        discoverer: CgroupDiscoverer,
        reader: Arc<dyn StatsReader>,
        scrape_timeout: Duration,
    ) -> Self {
        Self {
            discoverer,
            reader,
            scrape_timeout,
        }
    }

    pub fn manager(&self) -> &CgroupManager {
        self.discoverer.manager()
    }

    /// One scrape with the configured deadline.
    pub async fn collect(&self) -> Result<Vec<CgroupMetric>, DiscoverError> {
        self.collect_with_timeout(self.scrape_timeout).await
    }

    /// One scrape: discover units, read each one's stats concurrently,
    /// return the metric records in unit order.
    ///
    /// A discovery failure fails the whole scrape. When the deadline
    /// fires first, pending reads are cancelled and their units are
    /// emitted with the error flag raised. The deadline usually comes
    /// from the scrape request's timeout header.
    pub async fn collect_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Vec<CgroupMetric>, DiscoverError> {
        let units = self.discoverer.discover().await?;

        let mut slots: Vec<Option<CgroupMetric>> = units.iter().map(|_| None).collect();
        let mut workers = JoinSet::new();
        for (index, unit) in units.iter().enumerate() {
            let reader = Arc::clone(&self.reader);
            let unit = unit.clone();
            workers.spawn(async move {
                let mut metric =
                    CgroupMetric::new(unit.path.abs.display().to_string(), unit.uuid.clone());
                reader.read(&unit, &mut metric).await;
                (index, metric)
            });
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok((index, metric))) => slots[index] = Some(metric),
                    Some(Err(_)) => {}
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        timeout_secs = timeout.as_secs_f64(),
                        "scrape deadline reached, emitting partial results"
                    );
                    workers.abort_all();
                    while let Some(joined) = workers.join_next().await {
                        if let Ok((index, metric)) = joined {
                            slots[index] = Some(metric);
                        }
                    }
                    break;
                }
            }
        }

        Ok(units
            .into_iter()
            .zip(slots)
            .map(|(unit, slot)| {
                slot.unwrap_or_else(|| {
                    let mut metric =
                        CgroupMetric::new(unit.path.abs.display().to_string(), unit.uuid);
                    metric.err = true;
                    metric
                })
            })
            .collect())
    }
}
