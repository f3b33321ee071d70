//! Cgroup layout description and resource-manager policy
//!
//! A [`CgroupManager`] captures everything that is host- and
//! resource-manager-specific about the cgroup filesystem: which hierarchy
//! flavour is mounted, where unit cgroups live under it, and how a
//! compute-unit ID is recognised in a path. The rest of the collector is
//! generic over this value.

use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default cgroup filesystem root on Linux hosts.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Default v1 controller used to anchor discovery walks.
pub const DEFAULT_V1_CONTROLLER: &str = "cpuacct";

/// Slurm job ID pattern, applied to unescaped paths.
const SLURM_ID_PATTERN: &str = r"^.*/slurm(?:.*?)/job_([0-9]+)(?:.*$)";

/// libvirt instance pattern, applied to unescaped paths.
const LIBVIRT_ID_PATTERN: &str = r"^.*/(?:.+?)-qemu-(?:[0-9]+)-(instance-[0-9a-f]+)(?:.*$)";

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("unknown resource manager: {0}")]
    UnknownManager(String),
}

/// Which cgroup hierarchy flavour the host mounts.
///
/// Hybrid setups (v1 controllers with a `unified` sub-mount) are treated
/// as legacy: the per-controller hierarchies carry the accounting data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupMode {
    /// cgroup v1, one hierarchy per controller
    Legacy,
    /// cgroup v2 unified hierarchy
    Unified,
}

impl CgroupMode {
    /// Probe the filesystem for the mounted hierarchy flavour.
    pub fn detect(root: &Path) -> CgroupMode {
        if root.join("cgroup.controllers").is_file() {
            CgroupMode::Unified
        } else {
            CgroupMode::Legacy
        }
    }
}

/// The resource manager whose cgroups we account.
///
/// Adding a manager means adding a variant and its policy methods below;
/// the discoverer and stats readers stay untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceManager {
    Slurm,
    Libvirt,
}

impl ResourceManager {
    pub fn from_name(name: &str) -> Result<Self, ManagerError> {
        match name {
            "slurm" => Ok(ResourceManager::Slurm),
            "libvirt" => Ok(ResourceManager::Libvirt),
            other => Err(ManagerError::UnknownManager(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResourceManager::Slurm => "slurm",
            ResourceManager::Libvirt => "libvirt",
        }
    }

    fn id_pattern(&self) -> &'static str {
        match self {
            ResourceManager::Slurm => SLURM_ID_PATTERN,
            ResourceManager::Libvirt => LIBVIRT_ID_PATTERN,
        }
    }

    /// Directory under which unit cgroups live, for the given mode.
    ///
    /// Slurm v2 keeps jobs under the slurmstepd scope in the system slice;
    /// v1 anchors them in the controller hierarchy. libvirt scopes live in
    /// the machine slice in both flavours.
    fn mount_point(&self, root: &Path, mode: CgroupMode, controller: &str) -> PathBuf {
        match (self, mode) {
            (ResourceManager::Slurm, CgroupMode::Unified) => {
                root.join("system.slice").join("slurmstepd.scope")
            }
            (ResourceManager::Slurm, CgroupMode::Legacy) => root.join(controller).join("slurm"),
            (ResourceManager::Libvirt, CgroupMode::Unified) => root.join("machine.slice"),
            (ResourceManager::Libvirt, CgroupMode::Legacy) => {
                root.join(controller).join("machine.slice")
            }
        }
    }

    /// Whether an unescaped path is a child cgroup of its unit rather than
    /// the unit root.
    pub fn is_child(&self, path: &str) -> bool {
        match self {
            // Anything below job_<N> is a step cgroup.
            ResourceManager::Slurm => {
                let mut segments = path.split('/');
                segments.any(|s| is_job_segment(s)) && !is_job_segment(last_segment(path))
            }
            // The emulator/vcpu*/libvirt sub-scopes sit below the machine scope.
            ResourceManager::Libvirt => path.contains(".scope/"),
        }
    }

    /// Whether a process should be excluded from the unit's process list.
    pub fn ignore_proc(&self, cmdline: &str) -> bool {
        match self {
            // Step management shims, not user workload.
            ResourceManager::Slurm => {
                cmdline.starts_with("slurmstepd") || cmdline.contains("sleep infinity")
            }
            ResourceManager::Libvirt => false,
        }
    }
}

fn is_job_segment(s: &str) -> bool {
    s.strip_prefix("job_")
        .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Host- and manager-specific cgroup configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    pub mode: CgroupMode,
    pub root: PathBuf,
    pub manager: ResourceManager,
    /// v1 controller hierarchy the discovery walk is anchored in.
    pub active_controller: String,
    /// Directory under which unit cgroups live.
    pub mount_point: PathBuf,
    id_regex: Regex,
}

impl CgroupManager {
    /// Build the manager configuration.
    ///
    /// `forced_mode` bypasses filesystem detection and exists for tests
    /// exercising one layout on a host running the other.
    pub fn new(
        manager: ResourceManager,
        root: impl Into<PathBuf>,
        forced_mode: Option<CgroupMode>,
        active_controller: Option<String>,
    ) -> Self {
        let root = root.into();
        let mode = forced_mode.unwrap_or_else(|| CgroupMode::detect(&root));
        let active_controller =
            active_controller.unwrap_or_else(|| DEFAULT_V1_CONTROLLER.to_string());
        let mount_point = manager.mount_point(&root, mode, &active_controller);
        let id_regex = Regex::new(manager.id_pattern()).expect("id pattern is a valid regex");
        Self {
            mode,
            root,
            manager,
            active_controller,
            mount_point,
            id_regex,
        }
    }

    /// Extract the compute-unit ID from an unescaped cgroup path.
    pub fn unit_id(&self, path: &str) -> Option<String> {
        self.id_regex
            .captures(path)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub fn is_child(&self, path: &str) -> bool {
        self.manager.is_child(path)
    }

    pub fn ignore_proc(&self, cmdline: &str) -> bool {
        self.manager.ignore_proc(cmdline)
    }
}

/// A cgroup directory as both the host filesystem path and the path
/// relative to the hierarchy root (v1: relative to the controller mount).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupPath {
    pub abs: PathBuf,
    pub rel: PathBuf,
}

/// A process resolved from a unit's `cgroup.procs` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: u32,
    pub comm: String,
    pub cmdline: String,
}

/// One compute unit (Slurm job, libvirt VM) and the cgroups that make it up.
#[derive(Debug, Clone)]
pub struct Cgroup {
    /// Resource-manager-internal identifier extracted from the path.
    pub id: String,
    /// User-visible identifier; defaults to `id`.
    pub uuid: String,
    /// Root cgroup of the unit.
    pub path: CgroupPath,
    /// Child cgroups (Slurm steps, libvirt sub-scopes), root included.
    pub children: Vec<CgroupPath>,
    /// Live processes in the unit at discovery time.
    pub procs: Vec<Process>,
}

/// Decode systemd-style `\xNN` escapes as libvirt writes them into scope
/// names (`machine-qemu\x2d1\x2d...`). Invalid escapes pass through verbatim.
pub fn unescape_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1] == b'x'
            && bytes[i + 2].is_ascii_hexdigit()
            && bytes[i + 3].is_ascii_hexdigit()
        {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).expect("hex digits are ascii");
            let byte = u8::from_str_radix(hex, 16).expect("validated hex digits");
            out.push(byte);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Re-encode the characters systemd escapes in unit-name payloads. Inverse
/// of [`unescape_path`] for names whose specials all came from escapes.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for b in path.bytes() {
        match b {
            b'/' | b'.' | b'_' => out.push(b as char),
            b if b.is_ascii_alphanumeric() => out.push(b as char),
            b => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}
