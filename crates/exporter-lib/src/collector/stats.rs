//! Per-unit stats record and the parsers shared by both hierarchy flavours

use crate::cgroup::Cgroup;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// The kernel reports "no limit" as `max` (v2) or a page-aligned i64::MAX
/// (v1 PAGE_COUNTER_MAX). Anything at or above the v1 constant is treated
/// as the unlimited sentinel.
const UNLIMITED_FLOOR: u64 = 0x7FFF_FFFF_FFFF_F000;

pub fn is_unlimited(v: u64) -> bool {
    v >= UNLIMITED_FLOOR
}

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("unexpected content in {0}: {1}")]
    UnexpectedContent(PathBuf, String),
}

/// Which optional metric groups this host collects.
#[derive(Debug, Clone, Copy)]
pub struct StatsFlags {
    pub swap: bool,
    pub blkio: bool,
    pub psi: bool,
}

impl Default for StatsFlags {
    fn default() -> Self {
        Self {
            swap: true,
            blkio: true,
            psi: true,
        }
    }
}

/// Per-device block-IO totals, bytes and request counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlkioDevice {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_requests: u64,
    pub write_requests: u64,
}

/// Per-device RDMA resource counts from `rdma.current`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RdmaDevice {
    pub hca_handles: u64,
    pub hca_objects: u64,
}

/// One unit's resource statistics for a single scrape.
///
/// Constructed with `{path, uuid}` at discovery time, populated by one
/// stats-read attempt, consumed by exposition, then discarded. Fields a
/// read could not populate stay zero and `err` is raised.
#[derive(Debug, Clone, Default)]
pub struct CgroupMetric {
    pub uuid: String,
    pub path: String,

    pub cpu_user_secs: f64,
    pub cpu_system_secs: f64,
    pub cpu_total_secs: f64,
    pub cpus: usize,
    pub cpu_psi_secs: f64,

    pub memory_rss_bytes: u64,
    pub memory_cache_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_fail_count: u64,
    pub memory_psi_secs: f64,

    pub memsw_used_bytes: u64,
    pub memsw_total_bytes: u64,
    pub memsw_fail_count: u64,

    pub blkio: BTreeMap<String, BlkioDevice>,
    pub blkio_psi_secs: f64,

    pub rdma: BTreeMap<String, RdmaDevice>,

    /// Raised when any stats file was missing, unreadable, or malformed.
    pub err: bool,
}

impl CgroupMetric {
    pub fn new(path: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Record a partial read failure: log it, raise the error flag, leave
    /// the affected fields at zero.
    pub(crate) fn record_failure(&mut self, err: &StatsError) {
        tracing::error!(uuid = %self.uuid, error = %err, "partial cgroup stats read failure");
        self.err = true;
    }
}

/// One stats-read pass over a unit. Implemented once per hierarchy
/// flavour; the implementation is picked at collector construction and the
/// two share no state.
#[async_trait]
pub trait StatsReader: Send + Sync {
    async fn read(&self, unit: &Cgroup, metric: &mut CgroupMetric);
}

/// Read a file holding one unsigned integer.
pub(crate) async fn read_u64(path: &Path) -> Result<u64, StatsError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| StatsError::Io(path.to_path_buf(), e))?;
    content
        .trim()
        .parse()
        .map_err(|_| StatsError::UnexpectedContent(path.to_path_buf(), content.trim().to_string()))
}

/// Read a limit file holding one unsigned integer or the literal `max`,
/// which maps to the unlimited sentinel.
pub(crate) async fn read_u64_or_max(path: &Path) -> Result<u64, StatsError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| StatsError::Io(path.to_path_buf(), e))?;
    let trimmed = content.trim();
    if trimmed == "max" {
        return Ok(u64::MAX);
    }
    trimmed
        .parse()
        .map_err(|_| StatsError::UnexpectedContent(path.to_path_buf(), trimmed.to_string()))
}

/// Parse a flat keyed stat file (`cpu.stat`, `memory.stat`,
/// `memory.events`): one `name value` pair per line. Unparseable lines are
/// skipped, matching how the kernel extends these files over time.
pub(crate) async fn read_flat_keyed(path: &Path) -> Result<BTreeMap<String, u64>, StatsError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| StatsError::Io(path.to_path_buf(), e))?;
    Ok(parse_flat_keyed(&content))
}

pub(crate) fn parse_flat_keyed(content: &str) -> BTreeMap<String, u64> {
    let mut stats = BTreeMap::new();
    for line in content.lines() {
        let mut parts = line.split_ascii_whitespace();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if let Ok(value) = value.parse::<u64>() {
                stats.insert(key.to_string(), value);
            }
        }
    }
    stats
}

/// Extract the `full ... total=<microseconds>` counter from a PSI pressure
/// file. Kernels without full-pressure accounting for the resource yield
/// `None`.
pub(crate) fn parse_psi_full_total(content: &str) -> Option<u64> {
    for line in content.lines() {
        let mut parts = line.split_ascii_whitespace();
        if parts.next() != Some("full") {
            continue;
        }
        for field in parts {
            if let Some(total) = field.strip_prefix("total=") {
                return total.parse().ok();
            }
        }
    }
    None
}

/// Parse a cpuset list (`0-3,7,9-11`) into the set of logical CPU indices.
pub fn parse_cpuset(list: &str) -> Result<BTreeSet<u32>, String> {
    let mut cpus = BTreeSet::new();
    let trimmed = list.trim();
    if trimmed.is_empty() {
        return Ok(cpus);
    }
    for part in trimmed.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.parse().map_err(|_| format!("bad range start: {part}"))?;
                let hi: u32 = hi.parse().map_err(|_| format!("bad range end: {part}"))?;
                if lo > hi {
                    return Err(format!("inverted range: {part}"));
                }
                cpus.extend(lo..=hi);
            }
            None => {
                cpus.insert(part.parse().map_err(|_| format!("bad cpu index: {part}"))?);
            }
        }
    }
    Ok(cpus)
}

/// Format a CPU set back into the kernel's list syntax. Inverse of
/// [`parse_cpuset`].
pub fn format_cpuset(cpus: &BTreeSet<u32>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut iter = cpus.iter().copied();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for cpu in iter {
        if cpu == end + 1 {
            end = cpu;
        } else {
            parts.push(range_repr(start, end));
            start = cpu;
            end = cpu;
        }
    }
    parts.push(range_repr(start, end));
    parts.join(",")
}

fn range_repr(start: u32, end: u32) -> String {
    if start == end {
        format!("{start}")
    } else {
        format!("{start}-{end}")
    }
}

/// Parse `rdma.current`: one `device hca_handle=N hca_object=M` line per
/// device. Both counters come from the same record.
pub(crate) fn parse_rdma_current(content: &str) -> BTreeMap<String, RdmaDevice> {
    let mut devices = BTreeMap::new();
    for line in content.lines() {
        let mut parts = line.split_ascii_whitespace();
        let Some(device) = parts.next() else { continue };
        let mut stat = RdmaDevice::default();
        for field in parts {
            match field.split_once('=') {
                Some(("hca_handle", v)) => stat.hca_handles = v.parse().unwrap_or(0),
                Some(("hca_object", v)) => stat.hca_objects = v.parse().unwrap_or(0),
                _ => {}
            }
        }
        devices.insert(device.to_string(), stat);
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_keyed_skips_garbage() {
        let stats = parse_flat_keyed("usage_usec 5000000\nuser_usec 3000000\nbogus\nother x\n");
        assert_eq!(stats.get("usage_usec"), Some(&5000000));
        assert_eq!(stats.get("user_usec"), Some(&3000000));
        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn test_parse_psi_full_total() {
        let content = "some avg10=0.00 avg60=0.12 avg300=0.00 total=123456\n\
                       full avg10=0.00 avg60=0.00 avg300=0.00 total=45678\n";
        assert_eq!(parse_psi_full_total(content), Some(45678));
    }

    #[test]
    fn test_parse_psi_without_full_line() {
        let content = "some avg10=0.00 avg60=0.00 avg300=0.00 total=123456\n";
        assert_eq!(parse_psi_full_total(content), None);
    }

    #[test]
    fn test_parse_cpuset_lists_and_ranges() {
        let cpus = parse_cpuset("0-3,7,9-11").unwrap();
        assert_eq!(
            cpus.iter().copied().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 7, 9, 10, 11]
        );
        assert_eq!(parse_cpuset("").unwrap().len(), 0);
        assert_eq!(parse_cpuset("5").unwrap().len(), 1);
        assert!(parse_cpuset("3-1").is_err());
        assert!(parse_cpuset("a-b").is_err());
    }

    #[test]
    fn test_cpuset_round_trip() {
        for list in ["0-3,7,9-11", "0", "2-5", "0,2,4,6"] {
            let parsed = parse_cpuset(list).unwrap();
            assert_eq!(format_cpuset(&parsed), list);
            assert_eq!(parse_cpuset(&format_cpuset(&parsed)).unwrap(), parsed);
        }
    }

    #[test]
    fn test_parse_rdma_current_reads_both_columns() {
        let devices = parse_rdma_current("mlx5_0 hca_handle=2 hca_object=2000\nmlx5_1 hca_handle=3 hca_object=3000\n");
        assert_eq!(devices["mlx5_0"].hca_handles, 2);
        assert_eq!(devices["mlx5_0"].hca_objects, 2000);
        assert_eq!(devices["mlx5_1"].hca_handles, 3);
        assert_eq!(devices["mlx5_1"].hca_objects, 3000);
    }

    #[test]
    fn test_unlimited_sentinel() {
        assert!(is_unlimited(u64::MAX));
        assert!(is_unlimited(0x7FFF_FFFF_FFFF_F000));
        assert!(!is_unlimited(8 * 1024 * 1024 * 1024));
    }
}
