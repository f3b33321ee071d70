//! Stats reader for the legacy cgroup v1 hierarchies
//!
//! Every controller mounts its own tree, so each stat group is read from
//! `<root>/<controller>/<unit>`:
//! - `cpuacct` for CPU time (nanoseconds)
//! - `memory` for memory, swap, and failcnt
//! - `blkio` for the recursive per-device service counters
//! - `rdma` and `cpuset` for device handles and the effective CPU list
//!
//! PSI is a unified-hierarchy feature; those fields stay zero here.

use super::stats::{
    is_unlimited, parse_rdma_current, read_flat_keyed, read_u64, CgroupMetric, StatsError,
    StatsFlags, StatsReader,
};
use crate::cgroup::Cgroup;
use crate::collector::stats::parse_cpuset;
use crate::procfs::{DiskMap, HostMemInfo};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

pub struct LegacyStatsReader {
    root: PathBuf,
    mem: HostMemInfo,
    disks: DiskMap,
    flags: StatsFlags,
}

impl LegacyStatsReader {
    pub fn new(root: impl Into<PathBuf>, mem: HostMemInfo, disks: DiskMap, flags: StatsFlags) -> Self {
        Self {
            root: root.into(),
            mem,
            disks,
            flags,
        }
    }

    fn controller_dir(&self, controller: &str, unit: &Cgroup) -> PathBuf {
        let rel = unit.path.rel.strip_prefix("/").unwrap_or(&unit.path.rel);
        self.root.join(controller).join(rel)
    }

    async fn read_cpu(&self, dir: &Path, metric: &mut CgroupMetric) {
        match read_u64(&dir.join("cpuacct.usage_user")).await {
            Ok(ns) => metric.cpu_user_secs = ns as f64 / NANOS_PER_SEC,
            Err(e) => metric.record_failure(&e),
        }
        match read_u64(&dir.join("cpuacct.usage_sys")).await {
            Ok(ns) => metric.cpu_system_secs = ns as f64 / NANOS_PER_SEC,
            Err(e) => metric.record_failure(&e),
        }
        match read_u64(&dir.join("cpuacct.usage")).await {
            Ok(ns) => metric.cpu_total_secs = ns as f64 / NANOS_PER_SEC,
            Err(e) => metric.record_failure(&e),
        }
    }

    async fn read_cpuset(&self, dir: &Path, metric: &mut CgroupMetric) {
        let path = dir.join("cpuset.cpus");
        match fs::read_to_string(&path).await {
            Ok(list) => match parse_cpuset(&list) {
                Ok(cpus) => metric.cpus = cpus.len(),
                Err(e) => metric.record_failure(&StatsError::UnexpectedContent(path, e)),
            },
            Err(e) => metric.record_failure(&StatsError::Io(path, e)),
        }
    }

    async fn read_memory(&self, dir: &Path, metric: &mut CgroupMetric) {
        match read_flat_keyed(&dir.join("memory.stat")).await {
            Ok(stat) => {
                metric.memory_rss_bytes = stat.get("total_rss").copied().unwrap_or(0);
                metric.memory_cache_bytes = stat.get("total_cache").copied().unwrap_or(0);
            }
            Err(e) => metric.record_failure(&e),
        }
        match read_u64(&dir.join("memory.usage_in_bytes")).await {
            Ok(v) => metric.memory_used_bytes = v,
            Err(e) => metric.record_failure(&e),
        }
        match read_u64(&dir.join("memory.limit_in_bytes")).await {
            Ok(v) => {
                metric.memory_total_bytes = if is_unlimited(v) { self.mem.mem_total } else { v }
            }
            Err(e) => metric.record_failure(&e),
        }
        match read_u64(&dir.join("memory.failcnt")).await {
            Ok(v) => metric.memory_fail_count = v,
            Err(e) => metric.record_failure(&e),
        }

        if self.flags.swap {
            match read_u64(&dir.join("memory.memsw.usage_in_bytes")).await {
                Ok(v) => metric.memsw_used_bytes = v,
                Err(e) => metric.record_failure(&e),
            }
            match read_u64(&dir.join("memory.memsw.limit_in_bytes")).await {
                Ok(v) => metric.memsw_total_bytes = self.swap_total_or_host(v),
                Err(e) => metric.record_failure(&e),
            }
            match read_u64(&dir.join("memory.memsw.failcnt")).await {
                Ok(v) => metric.memsw_fail_count = v,
                Err(e) => metric.record_failure(&e),
            }
        }
    }

    fn swap_total_or_host(&self, v: u64) -> u64 {
        if !is_unlimited(v) {
            return v;
        }
        if self.mem.swap_total > 0 {
            self.mem.swap_total
        } else if self.mem.mem_total > 0 {
            self.mem.mem_total
        } else {
            v
        }
    }

    async fn read_blkio(&self, dir: &Path, metric: &mut CgroupMetric) {
        match fs::read_to_string(dir.join("blkio.io_service_bytes_recursive")).await {
            Ok(content) => {
                for (device, op, value) in parse_blkio_recursive(&content, &self.disks) {
                    let entry = metric.blkio.entry(device).or_default();
                    match op {
                        BlkioOp::Read => entry.read_bytes = value,
                        BlkioOp::Write => entry.write_bytes = value,
                    }
                }
            }
            Err(e) => metric.record_failure(&StatsError::Io(
                dir.join("blkio.io_service_bytes_recursive"),
                e,
            )),
        }
        match fs::read_to_string(dir.join("blkio.io_serviced_recursive")).await {
            Ok(content) => {
                for (device, op, value) in parse_blkio_recursive(&content, &self.disks) {
                    let entry = metric.blkio.entry(device).or_default();
                    match op {
                        BlkioOp::Read => entry.read_requests = value,
                        BlkioOp::Write => entry.write_requests = value,
                    }
                }
            }
            Err(e) => metric.record_failure(&StatsError::Io(
                dir.join("blkio.io_serviced_recursive"),
                e,
            )),
        }
    }

    async fn read_rdma(&self, dir: &Path, metric: &mut CgroupMetric) {
        let path = dir.join("rdma.current");
        if !path.exists() {
            return;
        }
        match fs::read_to_string(&path).await {
            Ok(content) => metric.rdma = parse_rdma_current(&content),
            Err(e) => metric.record_failure(&StatsError::Io(path, e)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlkioOp {
    Read,
    Write,
}

/// Parse the recursive blkio counter format: one `MAJ:MIN Op value` line
/// per device and operation, closed by a `Total` line. Only `Read` and
/// `Write` rows are kept.
fn parse_blkio_recursive(content: &str, disks: &DiskMap) -> Vec<(String, BlkioOp, u64)> {
    let mut rows = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        if fields.len() != 3 {
            continue;
        }
        let Some((major, minor)) = fields[0]
            .split_once(':')
            .and_then(|(a, b)| Some((a.parse::<u32>().ok()?, b.parse::<u32>().ok()?)))
        else {
            continue;
        };
        let op = match fields[1] {
            "Read" => BlkioOp::Read,
            "Write" => BlkioOp::Write,
            _ => continue,
        };
        let Ok(value) = fields[2].parse::<u64>() else {
            continue;
        };
        rows.push((disks.label(major, minor), op, value));
    }
    rows
}

#[async_trait]
impl StatsReader for LegacyStatsReader {
    async fn read(&self, unit: &Cgroup, metric: &mut CgroupMetric) {
        self.read_cpu(&self.controller_dir("cpuacct", unit), metric).await;
        self.read_cpuset(&self.controller_dir("cpuset", unit), metric).await;
        self.read_memory(&self.controller_dir("memory", unit), metric).await;
        if self.flags.blkio {
            self.read_blkio(&self.controller_dir("blkio", unit), metric).await;
        }
        self.read_rdma(&self.controller_dir("rdma", unit), metric).await;
    }
}
