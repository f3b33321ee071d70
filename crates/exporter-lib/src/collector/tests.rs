//! End-to-end collection tests over a mock cgroup filesystem
//!
//! These build a fake cgroup tree and procfs in a temp directory and run
//! the full discover-then-read pipeline against them.

use crate::cgroup::{CgroupManager, CgroupMode, ResourceManager};
use crate::collector::{CgroupDiscoverer, CgroupMetric, StatsFlags, StatsReader, UnitCollector};
use crate::metrics::ExporterMetrics;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;

async fn write_mock_procfs(procfs: &Path) {
    fs::write(
        procfs.join("meminfo"),
        "MemTotal:       16777216 kB\nSwapTotal:       4194304 kB\n",
    )
    .await
    .unwrap();
    fs::write(procfs.join("diskstats"), "   8       0 sda 1 2 3\n")
        .await
        .unwrap();
}

async fn write_mock_proc_entry(procfs: &Path, pid: u32, comm: &str) {
    let dir = procfs.join(pid.to_string());
    fs::create_dir_all(&dir).await.unwrap();
    fs::write(dir.join("comm"), format!("{comm}\n")).await.unwrap();
    fs::write(dir.join("cmdline"), format!("{comm}\0").into_bytes())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_slurm_v2_single_job_end_to_end() {
    let root = TempDir::new().unwrap();
    let procfs = TempDir::new().unwrap();
    write_mock_procfs(procfs.path()).await;
    write_mock_proc_entry(procfs.path(), 101, "python3").await;
    write_mock_proc_entry(procfs.path(), 102, "srun").await;

    let job = root.path().join("system.slice/slurmstepd.scope/job_42");
    fs::create_dir_all(&job).await.unwrap();
    fs::write(job.join("cgroup.procs"), "101\n102\n").await.unwrap();
    fs::write(job.join("cpu.stat"), "usage_usec 5000000\n").await.unwrap();
    fs::write(job.join("memory.current"), "1048576\n").await.unwrap();
    fs::write(job.join("cpuset.cpus.effective"), "0-3\n").await.unwrap();

    let manager = CgroupManager::new(
        ResourceManager::Slurm,
        root.path(),
        Some(CgroupMode::Unified),
        None,
    );
    let collector = UnitCollector::new(
        manager,
        procfs.path(),
        StatsFlags::default(),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let metrics = collector.collect().await.unwrap();
    assert_eq!(metrics.len(), 1);
    let metric = &metrics[0];
    assert_eq!(metric.uuid, "42");
    assert!((metric.cpu_total_secs - 5.0).abs() < 1e-9);
    assert_eq!(metric.memory_used_bytes, 1048576);
    assert_eq!(metric.cpus, 4);
    // Most stat files are absent in this minimal tree.
    assert!(metric.err);
}

#[tokio::test]
async fn test_libvirt_v1_two_vms_end_to_end() {
    let root = TempDir::new().unwrap();
    let procfs = TempDir::new().unwrap();
    write_mock_procfs(procfs.path()).await;

    for (n, hex) in [(1, "0000000a"), (2, "0000000b")] {
        let scope = root
            .path()
            .join("cpuacct/machine.slice")
            .join(format!("machine-qemu\\x2d{n}\\x2dinstance-{hex}.scope"));
        fs::create_dir_all(&scope).await.unwrap();
        fs::write(scope.join("cpuacct.usage_user"), "1000000000\n").await.unwrap();
        fs::write(scope.join("cpuacct.usage_sys"), "500000000\n").await.unwrap();
        fs::write(scope.join("cpuacct.usage"), "1500000000\n").await.unwrap();
    }
    // Sub-scopes are children, not units of their own.
    fs::create_dir_all(
        root.path()
            .join("cpuacct/machine.slice/machine-qemu\\x2d1\\x2dinstance-0000000a.scope/libvirt"),
    )
    .await
    .unwrap();

    let manager = CgroupManager::new(
        ResourceManager::Libvirt,
        root.path(),
        Some(CgroupMode::Legacy),
        None,
    );
    let collector = UnitCollector::new(
        manager,
        procfs.path(),
        StatsFlags::default(),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let metrics = collector.collect().await.unwrap();
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].uuid, "instance-0000000a");
    assert_eq!(metrics[1].uuid, "instance-0000000b");
    assert!((metrics[0].cpu_user_secs - 1.0).abs() < 1e-9);
    assert!((metrics[0].cpu_system_secs - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_unreadable_stat_file_still_emits_metric() {
    let root = TempDir::new().unwrap();
    let procfs = TempDir::new().unwrap();
    write_mock_procfs(procfs.path()).await;

    let job = root.path().join("system.slice/slurmstepd.scope/job_9");
    fs::create_dir_all(&job).await.unwrap();
    fs::write(job.join("cpu.stat"), "usage_usec 2000000\nuser_usec 1500000\nsystem_usec 500000\n")
        .await
        .unwrap();
    fs::write(job.join("cpuset.cpus.effective"), "0-1\n").await.unwrap();
    // memory.stat intentionally absent.
    fs::write(job.join("memory.current"), "2048\n").await.unwrap();

    let manager = CgroupManager::new(
        ResourceManager::Slurm,
        root.path(),
        Some(CgroupMode::Unified),
        None,
    );
    let collector = UnitCollector::new(
        manager,
        procfs.path(),
        StatsFlags::default(),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let metrics = collector.collect().await.unwrap();
    assert_eq!(metrics.len(), 1);
    let metric = &metrics[0];
    assert!(metric.err);
    assert!((metric.cpu_total_secs - 2.0).abs() < 1e-9);
    assert_eq!(metric.memory_rss_bytes, 0);

    // The error surfaces as compute_collect_error=1 in the exposition.
    let exposition = ExporterMetrics::new("slurm", "node0", StatsFlags::default()).unwrap();
    exposition.record(&metrics);
    let text = String::from_utf8(exposition.encode().unwrap()).unwrap();
    assert!(text.contains("compute_collect_error{hostname=\"node0\",manager=\"slurm\",uuid=\"9\"} 1"));
}

/// Reader that never finishes, for exercising the scrape deadline.
struct StuckReader;

#[async_trait::async_trait]
impl StatsReader for StuckReader {
    async fn read(&self, _unit: &crate::cgroup::Cgroup, _metric: &mut CgroupMetric) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[tokio::test]
async fn test_scrape_deadline_yields_partial_results() {
    let root = TempDir::new().unwrap();
    let procfs = TempDir::new().unwrap();

    let job = root.path().join("system.slice/slurmstepd.scope/job_1");
    fs::create_dir_all(&job).await.unwrap();

    let manager = CgroupManager::new(
        ResourceManager::Slurm,
        root.path(),
        Some(CgroupMode::Unified),
        None,
    );
    let discoverer = CgroupDiscoverer::new(manager, procfs.path());
    let collector = UnitCollector::with_reader(
        discoverer,
        Arc::new(StuckReader),
        Duration::from_millis(50),
    );

    let metrics = collector.collect().await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].uuid, "1");
    // The read was cancelled; the unit is emitted with the error flag.
    assert!(metrics[0].err);
}
