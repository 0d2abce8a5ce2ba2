use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;

use super::{ResourceGovernor, ResourceGroup};
use crate::BlockId;
use crate::config::ResourceLimits;
use crate::error::GovernorError;

/// Process-group backend.
///
/// Scripts are spawned as process-group leaders, so a member pid doubles as
/// its pgid. The memory ceiling is an address-space rlimit, which children
/// inherit on fork. There is no per-group CPU percentage primitive here.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupGovernor;

impl ProcessGroupGovernor {
    pub fn new() -> Self {
        Self
    }
}

impl ResourceGovernor for ProcessGroupGovernor {
    fn backend(&self) -> &'static str {
        "process-group"
    }

    fn create_group(
        &self,
        block: BlockId,
        limits: &ResourceLimits,
    ) -> Result<Arc<dyn ResourceGroup>, GovernorError> {
        tracing::debug!(
            %block,
            cpu_percent = limits.effective_cpu_percent(),
            "process-group backend does not enforce a CPU ceiling"
        );
        Ok(Arc::new(ProcessGroupSet {
            block,
            limits: Mutex::new(*limits),
            members: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
pub struct ProcessGroupSet {
    block: BlockId,
    limits: Mutex<ResourceLimits>,
    members: Mutex<Vec<u32>>,
    closed: AtomicBool,
}

impl ResourceGroup for ProcessGroupSet {
    fn assign(&self, pid: u32) -> Result<(), GovernorError> {
        if self.is_closed() {
            return Err(GovernorError::Closed);
        }

        let limits = *self.limits.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
            members.retain(|&m| is_alive(m));
            members.push(pid);
        }

        apply_memory_limit(pid, limits.effective_memory_bytes()).map_err(|source| {
            GovernorError::Limit {
                resource: "memory",
                pid,
                source,
            }
        })
    }

    fn update_limits(&self, limits: &ResourceLimits) -> Result<(), GovernorError> {
        *self.limits.lock().unwrap_or_else(|e| e.into_inner()) = *limits;
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let members = std::mem::take(&mut *self.members.lock().unwrap_or_else(|e| e.into_inner()));
        for pgid in members {
            match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                Ok(()) => tracing::debug!(block = %self.block, pgid, "killed leftover process group"),
                Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(block = %self.block, pgid, "killpg failed: {}", e),
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Lower the soft address-space limit of a running process. The hard limit
/// is left alone so a later, larger ceiling can still be applied.
#[cfg(target_os = "linux")]
fn apply_memory_limit(pid: u32, bytes: u64) -> std::io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let pid = pid as libc::pid_t;

    // SAFETY: `current` is a live `rlimit`; a null new limit makes this a pure query.
    let rc = unsafe { libc::prlimit(pid, libc::RLIMIT_AS, std::ptr::null(), &mut current) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let wanted = bytes as libc::rlim_t;
    let soft = if current.rlim_max == libc::RLIM_INFINITY {
        wanted
    } else {
        wanted.min(current.rlim_max)
    };
    let next = libc::rlimit {
        rlim_cur: soft,
        rlim_max: current.rlim_max,
    };

    // SAFETY: `next` is a live `rlimit`; the old value is not requested.
    let rc = unsafe { libc::prlimit(pid, libc::RLIMIT_AS, &next, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_memory_limit(pid: u32, _bytes: u64) -> std::io::Result<()> {
    tracing::debug!(pid, "memory ceiling cannot be applied to a running process on this platform");
    Ok(())
}
