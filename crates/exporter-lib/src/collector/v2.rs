//! Stats reader for the cgroup v2 unified hierarchy
//!
//! All counters for a unit live under a single directory:
//! - `cpu.stat` / `cpu.pressure` for CPU time and PSI
//! - `memory.*` for memory, swap, and OOM events
//! - `io.stat` / `io.pressure` for block devices
//! - `rdma.current` and `cpuset.cpus.effective`

use super::stats::{
    is_unlimited, parse_psi_full_total, parse_rdma_current, read_flat_keyed, read_u64,
    read_u64_or_max, BlkioDevice, CgroupMetric, StatsError, StatsFlags, StatsReader,
};
use crate::cgroup::Cgroup;
use crate::collector::stats::parse_cpuset;
use crate::procfs::{DiskMap, HostMemInfo};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

const MICROS_PER_SEC: f64 = 1_000_000.0;

pub struct UnifiedStatsReader {
    root: PathBuf,
    mem: HostMemInfo,
    disks: DiskMap,
    flags: StatsFlags,
}

impl UnifiedStatsReader {
    pub fn new(root: impl Into<PathBuf>, mem: HostMemInfo, disks: DiskMap, flags: StatsFlags) -> Self {
        Self {
            root: root.into(),
            mem,
            disks,
            flags,
        }
    }

    fn unit_dir(&self, unit: &Cgroup) -> PathBuf {
        let rel = unit.path.rel.strip_prefix("/").unwrap_or(&unit.path.rel);
        self.root.join(rel)
    }

    async fn read_cpu(&self, dir: &Path, metric: &mut CgroupMetric) {
        match read_flat_keyed(&dir.join("cpu.stat")).await {
            Ok(stat) => {
                metric.cpu_user_secs =
                    stat.get("user_usec").copied().unwrap_or(0) as f64 / MICROS_PER_SEC;
                metric.cpu_system_secs =
                    stat.get("system_usec").copied().unwrap_or(0) as f64 / MICROS_PER_SEC;
                metric.cpu_total_secs =
                    stat.get("usage_usec").copied().unwrap_or(0) as f64 / MICROS_PER_SEC;
            }
            Err(e) => metric.record_failure(&e),
        }

        match fs::read_to_string(dir.join("cpuset.cpus.effective")).await {
            Ok(list) => match parse_cpuset(&list) {
                Ok(cpus) => metric.cpus = cpus.len(),
                Err(e) => metric.record_failure(&StatsError::UnexpectedContent(
                    dir.join("cpuset.cpus.effective"),
                    e,
                )),
            },
            Err(e) => {
                metric.record_failure(&StatsError::Io(dir.join("cpuset.cpus.effective"), e))
            }
        }

        if self.flags.psi {
            match self.read_psi(dir, "cpu.pressure").await {
                Ok(v) => metric.cpu_psi_secs = v,
                Err(e) => metric.record_failure(&e),
            }
        }
    }

    async fn read_memory(&self, dir: &Path, metric: &mut CgroupMetric) {
        match read_u64(&dir.join("memory.current")).await {
            Ok(v) => metric.memory_used_bytes = v,
            Err(e) => metric.record_failure(&e),
        }

        match read_u64_or_max(&dir.join("memory.max")).await {
            Ok(v) => {
                metric.memory_total_bytes = if is_unlimited(v) { self.mem.mem_total } else { v }
            }
            Err(e) => metric.record_failure(&e),
        }

        match read_flat_keyed(&dir.join("memory.stat")).await {
            Ok(stat) => {
                metric.memory_cache_bytes = stat.get("file").copied().unwrap_or(0);
                metric.memory_rss_bytes = stat.get("anon").copied().unwrap_or(0);
            }
            Err(e) => metric.record_failure(&e),
        }

        // The v1 failcnt counted allocation failures; the v2 oom event
        // counts kills. The metric name is shared for compatibility.
        match read_flat_keyed(&dir.join("memory.events")).await {
            Ok(events) => metric.memory_fail_count = events.get("oom").copied().unwrap_or(0),
            Err(e) => metric.record_failure(&e),
        }

        if self.flags.swap {
            match read_u64(&dir.join("memory.swap.current")).await {
                Ok(v) => metric.memsw_used_bytes = v,
                Err(e) => metric.record_failure(&e),
            }
            match read_u64_or_max(&dir.join("memory.swap.max")).await {
                Ok(v) => metric.memsw_total_bytes = self.swap_total_or_host(v),
                Err(e) => metric.record_failure(&e),
            }
        }

        if self.flags.psi {
            match self.read_psi(dir, "memory.pressure").await {
                Ok(v) => metric.memory_psi_secs = v,
                Err(e) => metric.record_failure(&e),
            }
        }
    }

    /// Unlimited swap falls back to host SwapTotal, then MemTotal on
    /// swapless hosts, then the raw sentinel.
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
        let path = dir.join("io.stat");
        match fs::read_to_string(&path).await {
            Ok(content) => metric.blkio = self.parse_io_stat(&content),
            Err(e) => metric.record_failure(&StatsError::Io(path, e)),
        }

        if self.flags.psi {
            match self.read_psi(dir, "io.pressure").await {
                Ok(v) => metric.blkio_psi_secs = v,
                Err(e) => metric.record_failure(&e),
            }
        }
    }

    /// `io.stat` carries one `MAJ:MIN key=value...` line per device.
    fn parse_io_stat(&self, content: &str) -> BTreeMap<String, BlkioDevice> {
        let mut devices = BTreeMap::new();
        for line in content.lines() {
            let mut parts = line.split_ascii_whitespace();
            let Some(device) = parts.next() else { continue };
            let Some((major, minor)) = parse_dev_key(device) else {
                continue;
            };
            let mut stat = BlkioDevice::default();
            for field in parts {
                match field.split_once('=') {
                    Some(("rbytes", v)) => stat.read_bytes = v.parse().unwrap_or(0),
                    Some(("wbytes", v)) => stat.write_bytes = v.parse().unwrap_or(0),
                    Some(("rios", v)) => stat.read_requests = v.parse().unwrap_or(0),
                    Some(("wios", v)) => stat.write_requests = v.parse().unwrap_or(0),
                    _ => {}
                }
            }
            devices.insert(self.disks.label(major, minor), stat);
        }
        devices
    }

    async fn read_rdma(&self, dir: &Path, metric: &mut CgroupMetric) {
        // The rdma controller is absent on most hosts; only a present but
        // unreadable file is a failure.
        let path = dir.join("rdma.current");
        if !path.exists() {
            return;
        }
        match fs::read_to_string(&path).await {
            Ok(content) => metric.rdma = parse_rdma_current(&content),
            Err(e) => metric.record_failure(&StatsError::Io(path, e)),
        }
    }

    async fn read_psi(&self, dir: &Path, file: &str) -> Result<f64, StatsError> {
        let path = dir.join(file);
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| StatsError::Io(path, e))?;
        Ok(parse_psi_full_total(&content).unwrap_or(0) as f64 / MICROS_PER_SEC)
    }
}

fn parse_dev_key(key: &str) -> Option<(u32, u32)> {
    let (major, minor) = key.split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[async_trait]
impl StatsReader for UnifiedStatsReader {
    async fn read(&self, unit: &Cgroup, metric: &mut CgroupMetric) {
        let dir = self.unit_dir(unit);
        self.read_cpu(&dir, metric).await;
        self.read_memory(&dir, metric).await;
        if self.flags.blkio {
            self.read_blkio(&dir, metric).await;
        }
        self.read_rdma(&dir, metric).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupPath;
    use tempfile::TempDir;

    fn host_mem() -> HostMemInfo {
        HostMemInfo {
            mem_total: 32 * 1024 * 1024 * 1024,
            swap_total: 8 * 1024 * 1024 * 1024,
        }
    }

    fn unit_for(rel: &str, abs: PathBuf) -> Cgroup {
        Cgroup {
            id: "42".into(),
            uuid: "42".into(),
            path: CgroupPath {
                abs,
                rel: PathBuf::from(rel),
            },
            children: vec![],
            procs: vec![],
        }
    }

    async fn write_unit_files(dir: &Path) {
        fs::create_dir_all(dir).await.unwrap();
        fs::write(
            dir.join("cpu.stat"),
            "usage_usec 5000000\nuser_usec 3000000\nsystem_usec 2000000\n",
        )
        .await
        .unwrap();
        fs::write(dir.join("cpuset.cpus.effective"), "0-3\n").await.unwrap();
        fs::write(
            dir.join("cpu.pressure"),
            "some avg10=0.00 avg60=0.00 avg300=0.00 total=100000\nfull avg10=0.00 avg60=0.00 avg300=0.00 total=50000\n",
        )
        .await
        .unwrap();
        fs::write(dir.join("memory.current"), "1048576\n").await.unwrap();
        fs::write(dir.join("memory.max"), "2097152\n").await.unwrap();
        fs::write(dir.join("memory.stat"), "anon 524288\nfile 262144\n")
            .await
            .unwrap();
        fs::write(dir.join("memory.events"), "low 0\nhigh 0\nmax 0\noom 3\noom_kill 1\n")
            .await
            .unwrap();
        fs::write(dir.join("memory.swap.current"), "4096\n").await.unwrap();
        fs::write(dir.join("memory.swap.max"), "max\n").await.unwrap();
        fs::write(
            dir.join("memory.pressure"),
            "some avg10=0.00 avg60=0.00 avg300=0.00 total=2000\nfull avg10=0.00 avg60=0.00 avg300=0.00 total=1000\n",
        )
        .await
        .unwrap();
        fs::write(
            dir.join("io.stat"),
            "8:0 rbytes=180224 wbytes=4096 rios=3 wios=1 dbytes=0 dios=0\n",
        )
        .await
        .unwrap();
        fs::write(
            dir.join("io.pressure"),
            "some avg10=0.00 avg60=0.00 avg300=0.00 total=800\nfull avg10=0.00 avg60=0.00 avg300=0.00 total=400\n",
        )
        .await
        .unwrap();
        fs::write(dir.join("rdma.current"), "mlx5_0 hca_handle=2 hca_object=2000\n")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_unit_read() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("system.slice/slurmstepd.scope/job_42");
        write_unit_files(&dir).await;

        let reader = UnifiedStatsReader::new(
            root.path(),
            host_mem(),
            DiskMap::default(),
            StatsFlags::default(),
        );
        let unit = unit_for("system.slice/slurmstepd.scope/job_42", dir);
        let mut metric = CgroupMetric::new(unit.path.abs.display().to_string(), "42");
        reader.read(&unit, &mut metric).await;

        assert!(!metric.err);
        assert!((metric.cpu_total_secs - 5.0).abs() < 1e-9);
        assert!((metric.cpu_user_secs - 3.0).abs() < 1e-9);
        assert!((metric.cpu_system_secs - 2.0).abs() < 1e-9);
        assert!(metric.cpu_user_secs + metric.cpu_system_secs <= metric.cpu_total_secs + 1e-3);
        assert_eq!(metric.cpus, 4);
        assert!((metric.cpu_psi_secs - 0.05).abs() < 1e-9);
        assert_eq!(metric.memory_used_bytes, 1048576);
        assert_eq!(metric.memory_total_bytes, 2097152);
        assert_eq!(metric.memory_rss_bytes, 524288);
        assert_eq!(metric.memory_cache_bytes, 262144);
        assert_eq!(metric.memory_fail_count, 3);
        assert_eq!(metric.memsw_used_bytes, 4096);
        // Unlimited swap limit is replaced by the host SwapTotal.
        assert_eq!(metric.memsw_total_bytes, 8 * 1024 * 1024 * 1024);
        let blkio = &metric.blkio["8:0"];
        assert_eq!(blkio.read_bytes, 180224);
        assert_eq!(blkio.write_bytes, 4096);
        assert_eq!(blkio.read_requests, 3);
        assert_eq!(blkio.write_requests, 1);
        assert_eq!(metric.rdma["mlx5_0"].hca_handles, 2);
        assert_eq!(metric.rdma["mlx5_0"].hca_objects, 2000);
    }

    #[tokio::test]
    async fn test_missing_memory_stat_sets_err_and_keeps_cpu() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("system.slice/slurmstepd.scope/job_7");
        write_unit_files(&dir).await;
        fs::remove_file(dir.join("memory.stat")).await.unwrap();

        let reader = UnifiedStatsReader::new(
            root.path(),
            host_mem(),
            DiskMap::default(),
            StatsFlags::default(),
        );
        let unit = unit_for("system.slice/slurmstepd.scope/job_7", dir);
        let mut metric = CgroupMetric::new(unit.path.abs.display().to_string(), "7");
        reader.read(&unit, &mut metric).await;

        assert!(metric.err);
        assert!((metric.cpu_total_secs - 5.0).abs() < 1e-9);
        assert_eq!(metric.memory_rss_bytes, 0);
        assert_eq!(metric.memory_cache_bytes, 0);
        // Fields from other files are still populated.
        assert_eq!(metric.memory_used_bytes, 1048576);
    }

    #[tokio::test]
    async fn test_unlimited_memory_uses_host_total() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("machine.slice/unit");
        write_unit_files(&dir).await;
        fs::write(dir.join("memory.max"), "max\n").await.unwrap();

        let reader = UnifiedStatsReader::new(
            root.path(),
            host_mem(),
            DiskMap::default(),
            StatsFlags::default(),
        );
        let unit = unit_for("machine.slice/unit", dir);
        let mut metric = CgroupMetric::new(unit.path.abs.display().to_string(), "u");
        reader.read(&unit, &mut metric).await;

        assert_eq!(metric.memory_total_bytes, host_mem().mem_total);
    }

    #[tokio::test]
    async fn test_flags_gate_optional_groups() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("machine.slice/unit");
        write_unit_files(&dir).await;
        // Remove optional files; with the groups disabled their absence
        // must not raise the error flag.
        fs::remove_file(dir.join("memory.swap.current")).await.unwrap();
        fs::remove_file(dir.join("memory.swap.max")).await.unwrap();
        fs::remove_file(dir.join("io.stat")).await.unwrap();
        fs::remove_file(dir.join("cpu.pressure")).await.unwrap();
        fs::remove_file(dir.join("memory.pressure")).await.unwrap();
        fs::remove_file(dir.join("io.pressure")).await.unwrap();

        let flags = StatsFlags {
            swap: false,
            blkio: false,
            psi: false,
        };
        let reader = UnifiedStatsReader::new(root.path(), host_mem(), DiskMap::default(), flags);
        let unit = unit_for("machine.slice/unit", dir);
        let mut metric = CgroupMetric::new(unit.path.abs.display().to_string(), "u");
        reader.read(&unit, &mut metric).await;

        assert!(!metric.err);
        assert_eq!(metric.memsw_used_bytes, 0);
        assert!(metric.blkio.is_empty());
        assert_eq!(metric.cpu_psi_secs, 0.0);
    }

    #[tokio::test]
    async fn test_device_names_resolved_through_disk_map() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("machine.slice/unit");
        write_unit_files(&dir).await;

        let proc_dir = TempDir::new().unwrap();
        fs::write(proc_dir.path().join("diskstats"), "   8       0 sda 1 2 3\n")
            .await
            .unwrap();
        let disks = DiskMap::read(proc_dir.path()).await.unwrap();

        let reader =
            UnifiedStatsReader::new(root.path(), host_mem(), disks, StatsFlags::default());
        let unit = unit_for("machine.slice/unit", dir);
        let mut metric = CgroupMetric::new(unit.path.abs.display().to_string(), "u");
        reader.read(&unit, &mut metric).await;

        assert!(metric.blkio.contains_key("sda"));
    }
}
