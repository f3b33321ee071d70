//! Host procfs snapshots
//!
//! Memory totals, the block-device name map, and the v1 controller list are
//! read once at startup and treated as immutable configuration afterwards.
//! Per-pid resolution is the only procfs access on the hot path.

use crate::cgroup::Process;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("unexpected line in {0}: {1}")]
    UnexpectedLine(PathBuf, String),
    #[error("missing MemTotal in {0}")]
    MissingMemTotal(PathBuf),
}

/// Host memory totals from `/proc/meminfo`, in bytes.
///
/// Used to substitute the kernel "max" sentinel when a cgroup has no
/// memory or swap limit of its own.
#[derive(Debug, Clone, Copy)]
pub struct HostMemInfo {
    pub mem_total: u64,
    pub swap_total: u64,
}

impl HostMemInfo {
    pub async fn read(procfs_root: &Path) -> Result<Self, ProcfsError> {
        let path = procfs_root.join("meminfo");
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ProcfsError::Io(path.clone(), e))?;

        let mut mem_total = 0u64;
        let mut swap_total = 0u64;
        for line in content.lines() {
            let target = if line.starts_with("MemTotal:") {
                &mut mem_total
            } else if line.starts_with("SwapTotal:") {
                &mut swap_total
            } else {
                continue;
            };
            // "MemTotal:       32658724 kB"
            let fields: Vec<&str> = line.split_ascii_whitespace().collect();
            if fields.len() != 3 || fields[2] != "kB" {
                return Err(ProcfsError::UnexpectedLine(path, line.to_string()));
            }
            let kb: u64 = fields[1]
                .parse()
                .map_err(|_| ProcfsError::UnexpectedLine(path.clone(), line.to_string()))?;
            *target = kb * 1024;
        }

        if mem_total == 0 {
            return Err(ProcfsError::MissingMemTotal(path));
        }
        Ok(Self {
            mem_total,
            swap_total,
        })
    }
}

/// `(major, minor) -> device name` map from `/proc/diskstats`.
#[derive(Debug, Clone, Default)]
pub struct DiskMap {
    devices: HashMap<(u32, u32), String>,
}

impl DiskMap {
    pub async fn read(procfs_root: &Path) -> Result<Self, ProcfsError> {
        let path = procfs_root.join("diskstats");
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ProcfsError::Io(path.clone(), e))?;

        let mut devices = HashMap::new();
        for line in content.lines() {
            // "   8       0 sda 4173 2219 ..."
            let fields: Vec<&str> = line.split_ascii_whitespace().collect();
            if fields.len() < 3 {
                continue;
            }
            let (Ok(major), Ok(minor)) = (fields[0].parse::<u32>(), fields[1].parse::<u32>())
            else {
                continue;
            };
            devices.insert((major, minor), fields[2].to_string());
        }
        Ok(Self { devices })
    }

    pub fn name(&self, major: u32, minor: u32) -> Option<&str> {
        self.devices.get(&(major, minor)).map(String::as_str)
    }

    /// Device name for exposition labels; unknown devices fall back to
    /// the raw `major:minor` key.
    pub fn label(&self, major: u32, minor: u32) -> String {
        self.name(major, minor)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{major}:{minor}"))
    }
}

/// v1 controller names from `/proc/cgroups`.
pub async fn v1_controllers(procfs_root: &Path) -> Result<Vec<String>, ProcfsError> {
    let path = procfs_root.join("cgroups");
    let content = fs::read_to_string(&path)
        .await
        .map_err(|e| ProcfsError::Io(path.clone(), e))?;

    Ok(content
        .lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_ascii_whitespace().next())
        .map(str::to_string)
        .collect())
}

/// Resolve a pid into a process descriptor.
///
/// Returns `None` when the process has exited between the `cgroup.procs`
/// read and now; callers drop such pids silently.
pub async fn resolve_process(procfs_root: &Path, pid: u32) -> Option<Process> {
    let comm = fs::read_to_string(procfs_root.join(pid.to_string()).join("comm"))
        .await
        .ok()?;
    let raw_cmdline = fs::read(procfs_root.join(pid.to_string()).join("cmdline"))
        .await
        .ok()?;

    // cmdline is NUL-separated argv; kernel threads leave it empty.
    let cmdline = String::from_utf8_lossy(&raw_cmdline)
        .split('\0')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Some(Process {
        pid,
        comm: comm.trim().to_string(),
        cmdline,
    })
}
