//! Compute-unit discovery
//!
//! Walks the manager's mount point, recognises unit cgroups by their path
//! shape, and assembles one [`Cgroup`] record per live unit. The walk
//! allocates its own maps; there is no shared mutable state between passes.

use crate::cgroup::{unescape_path, Cgroup, CgroupManager, CgroupMode, CgroupPath, Process};
use crate::procfs::resolve_process;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("failed to walk cgroup tree at {0}: {1}")]
    Walk(PathBuf, #[source] std::io::Error),
}

pub struct CgroupDiscoverer {
    manager: CgroupManager,
    procfs_root: PathBuf,
}

impl CgroupDiscoverer {
    pub fn new(manager: CgroupManager, procfs_root: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            procfs_root: procfs_root.into(),
        }
    }

    pub fn manager(&self) -> &CgroupManager {
        &self.manager
    }

    /// One discovery pass. Units whose cgroups vanish mid-walk simply
    /// contribute nothing; any other filesystem error aborts the pass.
    pub async fn discover(&self) -> Result<Vec<Cgroup>, DiscoverError> {
        let mut dirs = Vec::new();
        // An absent mount point means no units have been started yet.
        if fs::metadata(&self.manager.mount_point).await.is_ok() {
            walk(&self.manager.mount_point, &mut dirs).await?;
        }

        let mut roots: BTreeMap<String, Cgroup> = BTreeMap::new();
        let mut children: BTreeMap<String, Vec<CgroupPath>> = BTreeMap::new();
        let mut procs: BTreeMap<String, BTreeMap<u32, Process>> = BTreeMap::new();

        for dir in dirs {
            let sanitized = unescape_path(&dir.to_string_lossy());
            let Some(id) = self.manager.unit_id(&sanitized) else {
                continue;
            };
            if id.is_empty() {
                warn!(path = %dir.display(), "unit id pattern matched an empty id, skipping");
                continue;
            }

            let path = CgroupPath {
                rel: self.rel_of(&dir),
                abs: dir.clone(),
            };

            let unit_procs = procs.entry(id.clone()).or_default();
            for pid in read_pids(&dir).await {
                if let Some(process) = resolve_process(&self.procfs_root, pid).await {
                    if !self.manager.ignore_proc(&process.cmdline) {
                        unit_procs.insert(pid, process);
                    }
                }
            }

            children.entry(id.clone()).or_default().push(path.clone());
            if !self.manager.is_child(&sanitized) {
                roots.entry(id.clone()).or_insert_with(|| Cgroup {
                    uuid: id.clone(),
                    id,
                    path,
                    children: Vec::new(),
                    procs: Vec::new(),
                });
            }
        }

        // A root may be seen before or after its children; join by id once
        // the walk is complete.
        let units: Vec<Cgroup> = roots
            .into_values()
            .map(|mut unit| {
                unit.children = children.remove(&unit.id).unwrap_or_default();
                unit.procs = procs
                    .remove(&unit.id)
                    .map(|m| m.into_values().collect())
                    .unwrap_or_default();
                unit
            })
            .collect();

        debug!(
            manager = self.manager.manager.name(),
            units = units.len(),
            "discovery pass complete"
        );
        Ok(units)
    }

    /// Path relative to the hierarchy root: the cgroup root for unified
    /// mode, the active controller mount for legacy mode.
    fn rel_of(&self, abs: &Path) -> PathBuf {
        let base = match self.manager.mode {
            CgroupMode::Unified => self.manager.root.clone(),
            CgroupMode::Legacy => self.manager.root.join(&self.manager.active_controller),
        };
        abs.strip_prefix(&base)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| abs.to_path_buf())
    }
}

/// Recursively collect every directory below `dir`. Directories removed
/// between listing and descent are skipped.
async fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DiscoverError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(DiscoverError::Walk(dir.to_path_buf(), e)),
    };

    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    out.push(path.clone());
                    Box::pin(walk(&path, out)).await?;
                }
            }
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(DiscoverError::Walk(dir.to_path_buf(), e)),
        }
    }
}

/// Pids from a `cgroup.procs` file. A vanished cgroup yields none.
async fn read_pids(dir: &Path) -> Vec<u32> {
    match fs::read_to_string(dir.join("cgroup.procs")).await {
        Ok(content) => content.lines().filter_map(|l| l.trim().parse().ok()).collect(),
        Err(_) => Vec::new(),
    }
}
