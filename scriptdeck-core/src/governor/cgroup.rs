use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use super::{ResourceGovernor, ResourceGroup};
use crate::BlockId;
use crate::config::ResourceLimits;
use crate::error::GovernorError;

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const CPU_PERIOD_US: u64 = 100_000;
const RMDIR_ATTEMPTS: u32 = 20;
const RMDIR_BACKOFF: Duration = Duration::from_millis(50);

/// cgroup v2 backend: one child cgroup per block under a delegated root.
#[derive(Debug, Clone)]
pub struct CgroupGovernor {
    root: PathBuf,
}

impl CgroupGovernor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Use our own cgroup as the parent, but only if we may create children
    /// there and the memory controller reaches them.
    pub fn detect() -> Option<Self> {
        let mount = Path::new(CGROUP_MOUNT);
        if !mount.join("cgroup.controllers").exists() {
            return None;
        }

        let own = fs::read_to_string("/proc/self/cgroup").ok()?;
        let relative = own.lines().find_map(|l| l.strip_prefix("0::"))?;
        let root = mount.join(relative.trim_start_matches('/'));

        let probe = root.join(format!("scriptdeck-probe-{}", std::process::id()));
        if fs::create_dir(&probe).is_err() {
            return None;
        }
        let usable = probe.join("memory.max").exists();
        let _ = fs::remove_dir(&probe);

        usable.then(|| Self::new(root))
    }
}

impl ResourceGovernor for CgroupGovernor {
    fn backend(&self) -> &'static str {
        "cgroup-v2"
    }

    fn create_group(
        &self,
        block: BlockId,
        limits: &ResourceLimits,
    ) -> Result<Arc<dyn ResourceGroup>, GovernorError> {
        let path = self.root.join(format!("scriptdeck-{block}"));
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(source) => {
                return Err(GovernorError::Io {
                    action: "create cgroup",
                    path,
                    source,
                });
            }
        }

        let group = CgroupGroup {
            path,
            closed: AtomicBool::new(false),
        };
        if let Err(e) = group.write_limits(limits) {
            group.close();
            return Err(e);
        }
        Ok(Arc::new(group))
    }
}

#[derive(Debug)]
pub struct CgroupGroup {
    path: PathBuf,
    closed: AtomicBool,
}

impl CgroupGroup {
    fn write(&self, file: &'static str, value: &str) -> Result<(), GovernorError> {
        let path = self.path.join(file);
        fs::write(&path, value).map_err(|source| GovernorError::Io {
            action: "write",
            path,
            source,
        })
    }

    fn write_limits(&self, limits: &ResourceLimits) -> Result<(), GovernorError> {
        self.write("memory.max", &limits.effective_memory_bytes().to_string())?;

        // A missing cpu controller only costs us the CPU ceiling.
        if let Err(e) = self.write("cpu.max", &cpu_max(limits.effective_cpu_percent())) {
            tracing::warn!(path = %self.path.display(), "CPU ceiling not applied: {}", e);
        }
        Ok(())
    }

    fn kill_members(&self) {
        if fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return;
        }
        // Kernels before 5.14 have no cgroup.kill.
        let Ok(procs) = fs::read_to_string(self.path.join("cgroup.procs")) else {
            return;
        };
        for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(pid, "failed to kill cgroup member: {}", e),
            }
        }
    }
}

impl ResourceGroup for CgroupGroup {
    fn assign(&self, pid: u32) -> Result<(), GovernorError> {
        if self.is_closed() {
            return Err(GovernorError::Closed);
        }
        self.write("cgroup.procs", &pid.to_string())
    }

    fn update_limits(&self, limits: &ResourceLimits) -> Result<(), GovernorError> {
        if self.is_closed() {
            return Err(GovernorError::Closed);
        }
        self.write_limits(limits)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.kill_members();

        if fs::remove_dir(&self.path).is_ok() {
            return;
        }
        // Killed members may not be reaped yet; retry off the caller's thread.
        let path = self.path.clone();
        std::thread::spawn(move || {
            for _ in 0..RMDIR_ATTEMPTS {
                std::thread::sleep(RMDIR_BACKOFF);
                if fs::remove_dir(&path).is_ok() || !path.exists() {
                    return;
                }
            }
            tracing::warn!(path = %path.display(), "could not remove cgroup");
        });
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// `cpu.max` value: a share of the whole machine, like a job-object CPU rate.
fn cpu_max(percent: u32) -> String {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get()) as u64;
    let quota = (CPU_PERIOD_US * cpus * u64::from(percent) / 100).max(1_000);
    format!("{quota} {CPU_PERIOD_US}")
}
